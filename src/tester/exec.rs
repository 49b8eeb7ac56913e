//! The evaluation pipeline: compile → per-test execute → per-test judge →
//! aggregate.
//!
//! Every stage is one sandbox run. Failure policy: a sandbox error during
//! compilation fails the whole submission as compile-error-equivalent; a
//! sandbox error on a single test marks that test `SE` and the pipeline
//! moves on. Nothing recoverable escapes this module; the caller always
//! gets a reportable [`SubmissionResult`].

use std::path::Path;
use std::time::Duration;

use tokio::fs;
use tracing::debug;

use super::{SubmissionResult, TestResult, Verdict};
use crate::client::Submission;
use crate::config::WorkerConfig;
use crate::log_sink::LogSink;
use crate::prelude::Shutdown;
use crate::runner::{
    wall_timeout_for, BindMount, Limits, RunOutcome, Sandbox, SandboxProfile,
    SandboxProfileBuilder,
};
use crate::script::TestSpec;
use crate::workspace::Workspace;

const BOX_SRC: &str = "/box/src";
const BOX_LIB: &str = "/box/lib";
const BOX_BUILD: &str = "/box/build";
const BOX_RUN: &str = "/box/run";
const BOX_PROBLEM: &str = "/box/problem";

/// Compiler output kept in `SubmissionResult.info`.
const COMPILE_INFO_LIMIT: usize = 10_000;
/// Stdout larger than this is an output-limit-exceeded verdict.
const OUTPUT_LIMIT_BYTES: u64 = 32 * 1024 * 1024;

const EXEC_PIDS_LIMIT: i64 = 50;
const EXEC_OPEN_FILES_LIMIT: u64 = 1024;

pub struct Evaluator<'a> {
    sandbox: &'a dyn Sandbox,
    cfg: &'a WorkerConfig,
    sink: &'a LogSink,
    shutdown: &'a Shutdown,
}

/// A finished pipeline run. `completed` is false when a shutdown signal
/// stopped the pipeline before every test ran; such results must not be
/// reported, since the UI will re-deliver the submission.
pub struct Evaluation {
    pub result: SubmissionResult,
    pub completed: bool,
}

impl<'a> Evaluator<'a> {
    pub fn new(
        sandbox: &'a dyn Sandbox,
        cfg: &'a WorkerConfig,
        sink: &'a LogSink,
        shutdown: &'a Shutdown,
    ) -> Evaluator<'a> {
        Evaluator {
            sandbox,
            cfg,
            sink,
            shutdown,
        }
    }

    pub async fn run(&self, ws: &Workspace, sub: &Submission) -> Evaluation {
        let spec = &sub.problem_specification;

        self.sink
            .info(format!("compiling with image {}", sub.comp_image))
            .await;
        let compile = match self.compile(ws, sub).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.sink
                    .error(format!("sandbox failure during compilation: {}", e))
                    .await;
                return Evaluation {
                    result: SubmissionResult::compile_error(
                        spec,
                        Some(format!("Compilation could not run: {}", e)),
                    ),
                    completed: true,
                };
            }
        };
        let compile_log = stage_log_text(&compile);
        self.write_stage_log(ws, "compile", &compile_log).await;
        let compile_info = capped(&compile_log, COMPILE_INFO_LIMIT);

        if compile.exit_code != 0 || compile.timed_out || !has_build_artifact(ws).await {
            self.sink
                .error(format!(
                    "compilation failed (exit code {})",
                    compile.exit_code
                ))
                .await;
            return Evaluation {
                result: SubmissionResult::compile_error(spec, Some(compile_info)),
                completed: true,
            };
        }
        self.sink.info("compilation succeeded").await;

        let mut results = Vec::with_capacity(spec.tests.len());
        let mut completed = true;
        for test in &spec.tests {
            if self.shutdown.is_triggered() {
                self.sink
                    .warn(format!("shutdown requested, test {} not run", test.test_name))
                    .await;
                completed = false;
                break;
            }
            results.push(self.run_test(ws, sub, test).await);
        }

        let points = results.iter().filter(|t| t.grade).count() as i64;
        Evaluation {
            result: SubmissionResult {
                points,
                info: Some(compile_info),
                debug: None,
                test_results: results,
            },
            completed,
        }
    }

    async fn compile(&self, ws: &Workspace, sub: &Submission) -> Result<RunOutcome, crate::runner::SandboxError> {
        let mut env = vec![
            ("SRC".to_string(), BOX_SRC.to_string()),
            ("LIB".to_string(), BOX_LIB.to_string()),
            ("BUILD".to_string(), BOX_BUILD.to_string()),
        ];
        if let Some(mainfile) = &sub.mainfile {
            env.push(("MAINFILE".to_string(), mainfile.clone()));
        }
        let profile = SandboxProfileBuilder::default()
            .image(sub.comp_image.clone())
            .env(env)
            .mounts(vec![
                BindMount::read_only(ws.submission_dir(), BOX_SRC),
                BindMount::read_only(ws.lib_dir(), BOX_LIB),
                BindMount::read_write(ws.build_dir(), BOX_BUILD),
            ])
            .limits(Limits {
                cpu_time_limit: self.cfg.compile_timeout,
                ..Limits::default()
            })
            .wall_timeout(Duration::from_secs_f64(self.cfg.compile_timeout))
            .containment_root(ws.root().to_path_buf())
            .tag("compile")
            .build()
            .expect("complete compile profile");
        self.sandbox.run(&profile).await
    }

    async fn run_test(&self, ws: &Workspace, sub: &Submission, test: &TestSpec) -> TestResult {
        match self.execute_and_judge(ws, sub, test).await {
            Ok(result) => result,
            Err(e) => {
                self.sink
                    .error(format!("test {}: sandbox failure: {:#}", test.test_name, e))
                    .await;
                TestResult::failed(&test.test_name, Verdict::SandboxError)
            }
        }
    }

    async fn execute_and_judge(
        &self,
        ws: &Workspace,
        sub: &Submission,
        test: &TestSpec,
    ) -> anyhow::Result<TestResult> {
        let name = &test.test_name;
        let run_dir = ws.test_run_dir(name)?;
        fs::create_dir_all(&run_dir).await?;

        let input = ws.resolve("problem", &format!("{}.in", name)).await?;
        if fs::metadata(&input).await.is_err() {
            self.sink
                .error(format!("test {}: input file {}.in is missing", name, name))
                .await;
            return Ok(TestResult::failed(name, Verdict::SandboxError));
        }
        fs::copy(&input, run_dir.join("stdin")).await?;
        fs::write(
            run_dir.join("judge.json"),
            serde_json::to_vec_pretty(&serde_json::json!({
                "test_name": name,
                "kind": test.judge.kind.as_str(),
                "args": test.judge.args,
            }))?,
        )
        .await?;

        self.sink.info(format!("running test {}", name)).await;
        let exec_outcome = self.sandbox.run(&self.exec_profile(ws, sub, test, &run_dir)).await?;
        self.write_stage_log(ws, &format!("{}.exec", name), &stage_log_text(&exec_outcome))
            .await;

        let stdout_len = fs::metadata(run_dir.join("stdout")).await.ok().map(|m| m.len());
        let verdict = classify_execution(&exec_outcome, test, stdout_len);
        debug!(test = %name, verdict = %verdict, "execution classified");

        let mut result = TestResult {
            test_name: name.clone(),
            grade: false,
            ret_code: Some(exec_outcome.exit_code),
            time: exec_outcome.cpu_time.or(Some(exec_outcome.wall_time)),
            memory: exec_outcome.peak_memory.map(|m| m as f64),
            info: Some(verdict.code().to_string()),
        };
        if verdict != Verdict::Ok {
            self.sink
                .info(format!("test {}: {}", name, verdict.describe()))
                .await;
            return Ok(result);
        }

        let judge_outcome = self.sandbox.run(&self.judge_profile(ws, test, &run_dir)).await?;
        self.write_stage_log(ws, &format!("{}.judge", name), &stage_log_text(&judge_outcome))
            .await;

        if judge_outcome.succeeded() {
            result.grade = true;
            result.info = Some(Verdict::Ok.code().to_string());
            self.sink.info(format!("test {}: passed", name)).await;
        } else {
            result.info = Some(Verdict::WrongAnswer.code().to_string());
            self.sink
                .info(format!("test {}: wrong answer", name))
                .await;
        }
        Ok(result)
    }

    fn exec_profile(
        &self,
        ws: &Workspace,
        sub: &Submission,
        test: &TestSpec,
        run_dir: &Path,
    ) -> SandboxProfile {
        let mut env = vec![
            ("TEST_NAME".to_string(), test.test_name.clone()),
            ("BUILD".to_string(), BOX_BUILD.to_string()),
            ("RUN".to_string(), BOX_RUN.to_string()),
            ("TIME_LIMIT".to_string(), test.time_limit.to_string()),
            ("MEMORY_LIMIT".to_string(), test.total_memory_limit.to_string()),
        ];
        if let Some(stack) = test.stack_size_limit {
            env.push(("STACK_LIMIT".to_string(), stack.to_string()));
        }
        if let Some(mainfile) = &sub.mainfile {
            env.push(("MAINFILE".to_string(), mainfile.clone()));
        }
        SandboxProfileBuilder::default()
            .image(self.cfg.exec_image.clone())
            .env(env)
            .mounts(vec![
                BindMount::read_only(ws.build_dir(), BOX_BUILD),
                BindMount::read_write(run_dir.to_path_buf(), BOX_RUN),
            ])
            .limits(Limits {
                cpu_time_limit: test.time_limit,
                memory_limit: test.total_memory_limit,
                pids_limit: EXEC_PIDS_LIMIT,
                open_files_limit: EXEC_OPEN_FILES_LIMIT,
                stack_size_limit: test.stack_size_limit,
                ..Limits::default()
            })
            .wall_timeout(wall_timeout_for(test.time_limit))
            .containment_root(ws.root().to_path_buf())
            .tag(format!("exec-{}", test.test_name))
            .build()
            .expect("complete execute profile")
    }

    fn judge_profile(&self, ws: &Workspace, test: &TestSpec, run_dir: &Path) -> SandboxProfile {
        let env = vec![
            ("TEST_NAME".to_string(), test.test_name.clone()),
            ("OUT".to_string(), format!("{}/stdout", BOX_RUN)),
            (
                "ANS".to_string(),
                format!("{}/{}.out", BOX_PROBLEM, test.test_name),
            ),
            ("CONF".to_string(), format!("{}/judge.json", BOX_RUN)),
            ("JUDGE_KIND".to_string(), test.judge.kind.as_str().to_string()),
            ("JUDGE_ARGS".to_string(), test.judge.args.join(" ")),
        ];
        SandboxProfileBuilder::default()
            .image(self.cfg.judge_image.clone())
            .env(env)
            .mounts(vec![
                BindMount::read_only(run_dir.to_path_buf(), BOX_RUN),
                BindMount::read_only(ws.problem_dir(), BOX_PROBLEM),
            ])
            .limits(Limits {
                cpu_time_limit: self.cfg.judge_timeout,
                ..Limits::default()
            })
            .wall_timeout(Duration::from_secs_f64(self.cfg.judge_timeout))
            .containment_root(ws.root().to_path_buf())
            .tag(format!("judge-{}", test.test_name))
            .build()
            .expect("complete judge profile")
    }

    async fn write_stage_log(&self, ws: &Workspace, stage: &str, text: &str) {
        let path = ws.logs_dir().join(format!("{}.log", stage));
        if let Err(e) = fs::write(&path, text).await {
            self.sink
                .warn(format!("cannot write stage log {}: {}", stage, e))
                .await;
        }
    }
}

/// Preliminary per-test classification from the raw run outcome.
fn classify_execution(outcome: &RunOutcome, test: &TestSpec, stdout_len: Option<u64>) -> Verdict {
    let cpu_exhausted = outcome
        .cpu_time
        .map(|t| t >= test.time_limit)
        .unwrap_or(false);
    if outcome.timed_out || cpu_exhausted {
        return Verdict::TimeLimitExceeded;
    }
    let peak_exceeded = outcome
        .peak_memory
        .map(|m| m >= test.total_memory_limit)
        .unwrap_or(false);
    if outcome.oom_killed || peak_exceeded {
        return Verdict::MemoryLimitExceeded;
    }
    if outcome.exit_code != 0 {
        return Verdict::RuntimeError;
    }
    if stdout_len.map(|len| len > OUTPUT_LIMIT_BYTES).unwrap_or(false) {
        return Verdict::OutputLimitExceeded;
    }
    Verdict::Ok
}

fn stage_log_text(outcome: &RunOutcome) -> String {
    format!(
        "exit code: {}\nwall time: {:.3}s\n--- stdout ---\n{}\n--- stderr ---\n{}\n",
        outcome.exit_code, outcome.wall_time, outcome.stdout, outcome.stderr
    )
}

fn capped(text: &str, cap: usize) -> String {
    if text.chars().count() <= cap {
        text.to_string()
    } else {
        let mut s: String = text.chars().take(cap).collect();
        s.push_str("\n... truncated ...\n");
        s
    }
}

async fn has_build_artifact(ws: &Workspace) -> bool {
    let mut dir = match fs::read_dir(ws.build_dir()).await {
        Ok(dir) => dir,
        Err(_) => return false,
    };
    while let Ok(Some(entry)) = dir.next_entry().await {
        if entry.file_type().await.map(|t| t.is_file()).unwrap_or(false) {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use crate::runner::SandboxError;
    use crate::script::parse_script;

    type Handler = Box<dyn Fn(&SandboxProfile) -> Result<RunOutcome, SandboxError> + Send + Sync>;

    /// Sandbox double: runs the handler instead of a container and records
    /// every stage tag in order.
    struct StubSandbox {
        calls: Mutex<Vec<String>>,
        handler: Handler,
    }

    impl StubSandbox {
        fn new(handler: Handler) -> StubSandbox {
            StubSandbox {
                calls: Mutex::new(Vec::new()),
                handler,
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Sandbox for StubSandbox {
        async fn run(&self, profile: &SandboxProfile) -> Result<RunOutcome, SandboxError> {
            self.calls
                .lock()
                .unwrap()
                .push(profile.tag.clone().unwrap_or_default());
            (self.handler)(profile)
        }
    }

    fn mount_host<'p>(profile: &'p SandboxProfile, container_path: &str) -> &'p std::path::Path {
        &profile
            .mounts
            .iter()
            .find(|m| m.container_path == container_path)
            .expect("mount present")
            .host_path
    }

    fn ok_outcome() -> RunOutcome {
        RunOutcome {
            exit_code: 0,
            cpu_time: Some(0.1),
            peak_memory: Some(1024),
            wall_time: 0.2,
            ..Default::default()
        }
    }

    fn test_config() -> WorkerConfig {
        serde_json::from_value(serde_json::json!({
            "gui_url": "http://gui.local",
            "queue_names": ["cpp"],
            "exec_image": "stos/exec:latest",
            "judge_image": "stos/judge:latest",
            "queue_compiler_map": { "cpp": "stos/gcc:latest" },
            "workspace_root": "/tmp/unused"
        }))
        .unwrap()
    }

    fn submission(script: &str) -> Submission {
        Submission {
            id: "s-1".into(),
            comp_image: "stos/gcc:latest".into(),
            mainfile: Some("main.c".into()),
            submitted_by: Some("alice".into()),
            problem_specification: parse_script(script, "p-1").unwrap(),
        }
    }

    async fn workspace_with_inputs(tests: &[&str]) -> (tempfile::TempDir, Workspace) {
        let tmp = tempfile::tempdir().unwrap();
        let ws = Workspace::acquire(tmp.path(), "s-1").await.unwrap();
        for name in tests {
            fs::write(ws.problem_dir().join(format!("{}.in", name)), b"input")
                .await
                .unwrap();
            fs::write(ws.problem_dir().join(format!("{}.out", name)), b"expected")
                .await
                .unwrap();
        }
        (tmp, ws)
    }

    async fn evaluate(stub: &StubSandbox, ws: &Workspace, sub: &Submission) -> Evaluation {
        let cfg = test_config();
        let sink = LogSink::memory_only();
        let shutdown = Shutdown::new();
        Evaluator::new(stub, &cfg, &sink, &shutdown).run(ws, sub).await
    }

    #[tokio::test]
    async fn happy_path_scores_every_test() {
        let (_tmp, ws) = workspace_with_inputs(&["1", "2"]).await;
        let sub = submission("TST 1\nT 1\nTN 67108864\nTST 2\nT 1\nTN 67108864\n");

        let stub = StubSandbox::new(Box::new(|profile| {
            let tag = profile.tag.as_deref().unwrap_or("");
            if tag == "compile" {
                std::fs::write(mount_host(profile, BOX_BUILD).join("program"), b"elf").unwrap();
            } else if tag.starts_with("exec-") {
                std::fs::write(mount_host(profile, BOX_RUN).join("stdout"), b"expected").unwrap();
            }
            Ok(ok_outcome())
        }));

        let eval = evaluate(&stub, &ws, &sub).await;
        assert!(eval.completed);
        assert_eq!(eval.result.points, 2);
        assert!(eval.result.test_results.iter().all(|t| t.grade));
        assert_eq!(
            stub.calls(),
            vec!["compile", "exec-1", "judge-1", "exec-2", "judge-2"]
        );
    }

    #[tokio::test]
    async fn compile_error_skips_every_container_after_stage_one() {
        let (_tmp, ws) = workspace_with_inputs(&["1", "2"]).await;
        let sub = submission("TST 1\nTST 2\n");

        let stub = StubSandbox::new(Box::new(|_profile| {
            Ok(RunOutcome {
                exit_code: 1,
                stderr: "main.c:3: expected `;`".into(),
                ..Default::default()
            })
        }));

        let eval = evaluate(&stub, &ws, &sub).await;
        assert_eq!(eval.result.points, 0);
        assert_eq!(eval.result.test_results.len(), 2);
        assert!(eval
            .result
            .test_results
            .iter()
            .all(|t| t.info.as_deref() == Some("CE")));
        assert!(eval.result.info.as_deref().unwrap().contains("expected `;`"));
        assert_eq!(stub.calls(), vec!["compile"]);
    }

    #[tokio::test]
    async fn missing_artifact_is_a_compile_error_too() {
        let (_tmp, ws) = workspace_with_inputs(&["1"]).await;
        let sub = submission("TST 1\n");

        // exit code 0 but nothing lands in build/
        let stub = StubSandbox::new(Box::new(|_profile| Ok(ok_outcome())));
        let eval = evaluate(&stub, &ws, &sub).await;
        assert_eq!(eval.result.points, 0);
        assert_eq!(eval.result.test_results[0].info.as_deref(), Some("CE"));
    }

    #[tokio::test]
    async fn timed_out_test_skips_its_judge() {
        let (_tmp, ws) = workspace_with_inputs(&["1", "2"]).await;
        let sub = submission("TST 1\nT 1\nTST 2\nT 1\n");

        let stub = StubSandbox::new(Box::new(|profile| {
            let tag = profile.tag.as_deref().unwrap_or("");
            match tag {
                "compile" => {
                    std::fs::write(mount_host(profile, BOX_BUILD).join("program"), b"elf").unwrap();
                    Ok(ok_outcome())
                }
                "exec-1" => Ok(RunOutcome {
                    exit_code: 137,
                    timed_out: true,
                    wall_time: 3.0,
                    ..Default::default()
                }),
                tag if tag.starts_with("exec-") => {
                    std::fs::write(mount_host(profile, BOX_RUN).join("stdout"), b"expected").unwrap();
                    Ok(ok_outcome())
                }
                _ => Ok(ok_outcome()),
            }
        }));

        let eval = evaluate(&stub, &ws, &sub).await;
        assert_eq!(eval.result.points, 1);
        let t1 = &eval.result.test_results[0];
        assert!(!t1.grade);
        assert_eq!(t1.info.as_deref(), Some("TLE"));
        assert_eq!(
            stub.calls(),
            vec!["compile", "exec-1", "exec-2", "judge-2"],
            "no judge container for the timed-out test"
        );
    }

    #[tokio::test]
    async fn rejected_output_is_a_wrong_answer() {
        let (_tmp, ws) = workspace_with_inputs(&["1"]).await;
        let sub = submission("TST 1\n");

        let stub = StubSandbox::new(Box::new(|profile| {
            let tag = profile.tag.as_deref().unwrap_or("");
            match tag {
                "compile" => {
                    std::fs::write(mount_host(profile, BOX_BUILD).join("program"), b"elf").unwrap();
                    Ok(ok_outcome())
                }
                tag if tag.starts_with("exec-") => {
                    std::fs::write(mount_host(profile, BOX_RUN).join("stdout"), b"42").unwrap();
                    Ok(ok_outcome())
                }
                // judge rejects
                _ => Ok(RunOutcome {
                    exit_code: 1,
                    ..Default::default()
                }),
            }
        }));

        let eval = evaluate(&stub, &ws, &sub).await;
        let t1 = &eval.result.test_results[0];
        assert!(!t1.grade);
        assert_eq!(t1.info.as_deref(), Some("WA"));
        assert_eq!(t1.ret_code, Some(0));
        assert_eq!(eval.result.points, 0);
    }

    #[tokio::test]
    async fn sandbox_error_marks_only_that_test() {
        let (_tmp, ws) = workspace_with_inputs(&["1", "2"]).await;
        let sub = submission("TST 1\nTST 2\n");

        let stub = StubSandbox::new(Box::new(|profile| {
            let tag = profile.tag.as_deref().unwrap_or("");
            match tag {
                "compile" => {
                    std::fs::write(mount_host(profile, BOX_BUILD).join("program"), b"elf").unwrap();
                    Ok(ok_outcome())
                }
                "exec-1" => Err(SandboxError::Wait("engine hiccup".into())),
                tag if tag.starts_with("exec-") => {
                    std::fs::write(mount_host(profile, BOX_RUN).join("stdout"), b"expected").unwrap();
                    Ok(ok_outcome())
                }
                _ => Ok(ok_outcome()),
            }
        }));

        let eval = evaluate(&stub, &ws, &sub).await;
        assert_eq!(eval.result.test_results[0].info.as_deref(), Some("SE"));
        assert!(eval.result.test_results[1].grade);
        assert_eq!(eval.result.points, 1);
        assert!(eval.result.anomalous());
    }

    #[test]
    fn classification_covers_every_limit() {
        let test = parse_script("TST 1\nT 1\nTN 1048576\n", "p").unwrap().tests[0].clone();

        let tle = RunOutcome { timed_out: true, ..Default::default() };
        assert_eq!(classify_execution(&tle, &test, None), Verdict::TimeLimitExceeded);

        let cpu = RunOutcome { cpu_time: Some(1.2), ..Default::default() };
        assert_eq!(classify_execution(&cpu, &test, None), Verdict::TimeLimitExceeded);

        let oom = RunOutcome { oom_killed: true, exit_code: 137, ..Default::default() };
        assert_eq!(classify_execution(&oom, &test, None), Verdict::MemoryLimitExceeded);

        let peak = RunOutcome { peak_memory: Some(2 * 1024 * 1024), ..Default::default() };
        assert_eq!(classify_execution(&peak, &test, None), Verdict::MemoryLimitExceeded);

        let re = RunOutcome { exit_code: 11, ..Default::default() };
        assert_eq!(classify_execution(&re, &test, None), Verdict::RuntimeError);

        let ole = RunOutcome::default();
        assert_eq!(
            classify_execution(&ole, &test, Some(OUTPUT_LIMIT_BYTES + 1)),
            Verdict::OutputLimitExceeded
        );
        assert_eq!(
            classify_execution(&RunOutcome::default(), &test, Some(OUTPUT_LIMIT_BYTES)),
            Verdict::Ok
        );
    }

    #[tokio::test]
    async fn shutdown_stops_the_pipeline_between_tests() {
        let (_tmp, ws) = workspace_with_inputs(&["1", "2"]).await;
        let sub = submission("TST 1\nTST 2\n");
        let cfg = test_config();
        let sink = LogSink::memory_only();
        let shutdown = Shutdown::new();
        shutdown.trigger();

        let stub = StubSandbox::new(Box::new(|profile| {
            if profile.tag.as_deref() == Some("compile") {
                std::fs::write(mount_host(profile, BOX_BUILD).join("program"), b"elf").unwrap();
            }
            Ok(ok_outcome())
        }));

        let eval = Evaluator::new(&stub, &cfg, &sink, &shutdown).run(&ws, &sub).await;
        assert!(!eval.completed);
        assert!(eval.result.test_results.is_empty());
        assert_eq!(stub.calls(), vec!["compile"]);
    }
}
