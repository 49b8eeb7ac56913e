//! Orchestration between the UI client and the workspace: pulling
//! submissions, assembling problems, reporting verdicts.

use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context};
use tokio::fs;
use tracing::warn;

use crate::client::{PollResult, Submission, UiClient};
use crate::config::WorkerConfig;
use crate::format;
use crate::log_sink::LogSink;
use crate::script::{parse_script, ProblemSpec, TestSpec};
use crate::tester::SubmissionResult;
use crate::util::path_security;
use crate::workspace::Workspace;

const REPORT_ATTEMPTS: u32 = 3;
const REPORT_BACKOFF_BASE: Duration = Duration::from_secs(1);

pub struct Adapter<'a> {
    client: &'a UiClient,
    cfg: &'a WorkerConfig,
    sink: &'a LogSink,
}

impl<'a> Adapter<'a> {
    pub fn new(client: &'a UiClient, cfg: &'a WorkerConfig, sink: &'a LogSink) -> Adapter<'a> {
        Adapter { client, cfg, sink }
    }

    /// Polls every configured queue in order. On the first hit the archive is
    /// unpacked into `submission/` and a submission shell (problem not yet
    /// fetched) is returned. `None` means every queue was empty.
    pub async fn fetch_submission(&self, ws: &Workspace) -> anyhow::Result<Option<Submission>> {
        let archive_path = ws.root().join("submission.zip");
        for queue in &self.cfg.queue_names {
            let hit = match self.client.poll_queue(queue, &archive_path).await {
                Ok(PollResult::Empty) => continue,
                Ok(PollResult::Hit(hit)) => hit,
                Err(e) => {
                    warn!(queue, "queue poll failed: {}, trying the next queue", e);
                    continue;
                }
            };

            let comp_image = self
                .cfg
                .compiler_for_queue(queue)
                .ok_or_else(|| anyhow!("queue `{}` has no compile image configured", queue))?
                .to_string();

            let dest = ws.submission_dir();
            let archive = hit.archive_path.clone();
            let mainfile = tokio::task::spawn_blocking(move || extract_archive(&archive, &dest))
                .await
                .context("archive extraction task died")??;

            self.sink
                .info(format!(
                    "fetched submission {} for problem {} from queue {}",
                    hit.submission_id, hit.problem_id, queue
                ))
                .await;

            return Ok(Some(Submission {
                id: hit.submission_id,
                comp_image,
                mainfile,
                submitted_by: (!hit.student_id.is_empty()).then(|| hit.student_id.clone()),
                problem_specification: ProblemSpec::empty(hit.problem_id),
            }));
        }
        Ok(None)
    }

    /// Downloads a problem's files into the workspace, parses its script and
    /// stages auxiliary files for compilation.
    pub async fn fetch_problem(
        &self,
        problem_id: &str,
        ws: &Workspace,
    ) -> anyhow::Result<ProblemSpec> {
        let files = self.client.list_problem_files(problem_id).await?;
        let script_path = ws.root().join("script.txt");
        let mut have_script = false;

        for name in &files {
            if name == "script.txt" {
                self.client
                    .get_problem_file(problem_id, name, &script_path)
                    .await?;
                have_script = true;
            } else if name.ends_with(".in") || name.ends_with(".out") {
                let dest = ws.resolve("problem", name).await?;
                self.client.get_problem_file(problem_id, name, &dest).await?;
            } else {
                let dest = ws.resolve("lib", name).await?;
                self.client.get_problem_file(problem_id, name, &dest).await?;
            }
        }

        let spec = if have_script {
            let text = fs::read_to_string(&script_path).await?;
            parse_script(&text, problem_id).context("problem script rejected")?
        } else {
            self.sink
                .warn("problem has no script.txt, deriving test defaults from input files")
                .await;
            default_spec_from_inputs(&ws.problem_dir(), problem_id).await?
        };

        self.stage_aux_files(ws, &spec).await?;
        fs::write(
            ws.root().join("problem_spec.json"),
            serde_json::to_vec_pretty(&spec)?,
        )
        .await?;
        if !spec.compile_directives.is_empty() {
            fs::write(
                ws.lib_dir().join("compile.conf"),
                spec.compile_directives.join("\n") + "\n",
            )
            .await?;
        }

        self.sink
            .info(format!(
                "problem {} prepared with {} test(s)",
                problem_id,
                spec.tests.len()
            ))
            .await;
        Ok(spec)
    }

    /// Copies the script-declared auxiliary headers and sources from `lib/`
    /// next to the student sources, where the compile stage picks them up.
    async fn stage_aux_files(&self, ws: &Workspace, spec: &ProblemSpec) -> anyhow::Result<()> {
        for aux in &spec.aux_files {
            let source = ws.resolve("lib", &aux.name).await?;
            if fs::metadata(&source).await.is_err() {
                self.sink
                    .warn(format!("declared auxiliary file {} was not downloaded", aux.name))
                    .await;
                continue;
            }
            let target = ws.resolve("submission", &aux.name).await?;
            fs::copy(&source, &target).await?;
        }
        Ok(())
    }

    /// Formats and posts a verdict, with bounded retries on transport
    /// failures. After the retries are exhausted the result is dropped;
    /// the UI re-queues stale submissions on its own.
    pub async fn report_result(
        &self,
        submission_id: &str,
        result: &SubmissionResult,
    ) -> anyhow::Result<()> {
        let payload = format::format_payload(result);
        for attempt in 1..=REPORT_ATTEMPTS {
            match self.client.post_result(submission_id, &payload).await {
                Ok(_) => {
                    self.sink
                        .info(format!("result for submission {} reported", submission_id))
                        .await;
                    return Ok(());
                }
                Err(e) if e.is_transport() && attempt < REPORT_ATTEMPTS => {
                    let backoff = REPORT_BACKOFF_BASE * 2u32.pow(attempt - 1);
                    self.sink
                        .warn(format!(
                            "reporting attempt {}/{} failed: {}, retrying in {}s",
                            attempt,
                            REPORT_ATTEMPTS,
                            e,
                            backoff.as_secs()
                        ))
                        .await;
                    tokio::time::sleep(backoff).await;
                }
                Err(e) if e.is_transport() => {
                    self.sink
                        .error(format!(
                            "reporting failed after {} attempts: {}, dropping the result",
                            REPORT_ATTEMPTS, e
                        ))
                        .await;
                    warn!(submission_id, "result dropped after failed reporting attempts");
                    return Ok(());
                }
                Err(e) => return Err(e).context("reporting rejected by the UI"),
            }
        }
        unreachable!("every attempt path returns");
    }

    /// Best-effort progress message; never fails the submission.
    pub async fn notify_status(&self, submission_id: &str, message: &str) {
        if let Err(e) = self.client.post_status(submission_id, message).await {
            tracing::debug!(submission_id, "status notification failed: {}", e);
        }
    }
}

/// Unpacks the submission archive, refusing entries that would escape the
/// destination. Returns the first file entry's name, used as the main-file
/// hint for languages that need one.
fn extract_archive(archive: &Path, dest: &Path) -> anyhow::Result<Option<String>> {
    let file = std::fs::File::open(archive).context("opening submission archive")?;
    let mut zip = zip::ZipArchive::new(file).context("reading submission archive")?;
    let mut mainfile = None;

    for i in 0..zip.len() {
        let mut entry = zip.by_index(i)?;
        let rel = entry
            .enclosed_name()
            .ok_or_else(|| anyhow!("archive entry `{}` escapes the extraction root", entry.name()))?;
        path_security::assert_relative_inside(&rel)?;
        let target = dest.join(&rel);

        if entry.is_dir() {
            std::fs::create_dir_all(&target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if mainfile.is_none() {
            mainfile = Some(entry.name().to_string());
        }
        let mut out = std::fs::File::create(&target)?;
        std::io::copy(&mut entry, &mut out)?;
    }
    Ok(mainfile)
}

/// Fallback when a problem carries no script: every `.in` file becomes a
/// test with default limits, ordered numerically where the names allow it.
async fn default_spec_from_inputs(
    problem_dir: &Path,
    problem_id: &str,
) -> anyhow::Result<ProblemSpec> {
    let mut names = Vec::new();
    let mut dir = fs::read_dir(problem_dir).await?;
    while let Some(entry) = dir.next_entry().await? {
        let file_name = entry.file_name();
        let file_name = file_name.to_string_lossy();
        if let Some(stem) = file_name.strip_suffix(".in") {
            names.push(stem.to_string());
        }
    }
    names.sort_by_key(|name| test_order_key(name));

    let mut spec = ProblemSpec::empty(problem_id);
    spec.tests = names.into_iter().map(TestSpec::named).collect();
    Ok(spec)
}

fn test_order_key(name: &str) -> (u8, u64, String) {
    match name.parse::<u64>() {
        Ok(n) => (0, n, String::new()),
        Err(_) => (1, 0, name.to_string()),
    }
}
