//! Worker entry point: configuration, startup checks and the polling loop.
//!
//! One worker processes one submission at a time; scaling is horizontal.
//! Submission-scoped failures are logged and reported, never fatal; the
//! loop only ends on SIGINT/SIGTERM. Startup failures (bad configuration,
//! unreachable container engine, unwritable workspace root) exit non-zero.

mod adapter;
mod client;
mod config;
mod format;
mod log_sink;
mod opt;
mod prelude;
mod runner;
mod script;
mod tester;
mod util;
mod workspace;

use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use names::{Generator, Name};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::adapter::Adapter;
use crate::client::UiClient;
use crate::config::WorkerConfig;
use crate::log_sink::LogSink;
use crate::opt::Opts;
use crate::prelude::Shutdown;
use crate::runner::DockerSandbox;
use crate::tester::{Evaluator, SubmissionResult};
use crate::workspace::Workspace;

/// Characters of the submission log kept in the `debug` payload.
const DEBUG_LOG_LIMIT: usize = 20_000;

#[tokio::main]
async fn main() -> ExitCode {
    let opts = Opts::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match run(opts).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("fatal: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(opts: Opts) -> anyhow::Result<()> {
    let verbose = opts.verbose;
    let cfg = WorkerConfig::load(&opts)?;
    workspace::assert_writable_root(cfg.workspace_root())
        .await
        .context("workspace root is unusable")?;

    let worker_name = Generator::with_naming(Name::Plain)
        .next()
        .unwrap_or_else(|| "worker".into());

    let sandbox = DockerSandbox::connect(&cfg.docker_socket, &worker_name)?;
    sandbox
        .ping()
        .await
        .context("container engine is unreachable")?;
    for image in stage_images(&cfg) {
        sandbox
            .ensure_image(image)
            .await
            .with_context(|| format!("image `{}` is not available", image))?;
    }

    let client = UiClient::new(&cfg)?;
    let shutdown = Shutdown::new();
    shutdown.listen_for_signals()?;

    info!(worker = %worker_name, queues = ?cfg.queue_names, "worker ready");
    main_loop(&cfg, &client, &sandbox, &shutdown, &worker_name, verbose).await;
    info!("clean shutdown");
    Ok(())
}

fn stage_images(cfg: &WorkerConfig) -> impl Iterator<Item = &str> {
    [cfg.exec_image.as_str(), cfg.judge_image.as_str()]
        .into_iter()
        .chain(cfg.queue_compiler_map.values().map(String::as_str))
}

async fn main_loop(
    cfg: &WorkerConfig,
    client: &UiClient,
    sandbox: &DockerSandbox,
    shutdown: &Shutdown,
    worker_name: &str,
    verbose: bool,
) {
    let mut serial: u64 = 0;
    while !shutdown.is_triggered() {
        serial += 1;
        let transient_id = format!("{}-{:06}", worker_name, serial);
        let should_wait = match process_one(
            cfg,
            client,
            sandbox,
            shutdown,
            worker_name,
            &transient_id,
            verbose,
        )
        .await
        {
            Ok(processed) => !processed,
            Err(e) => {
                error!("submission iteration failed: {:#}", e);
                true
            }
        };
        if should_wait && !shutdown.is_triggered() {
            tokio::time::sleep(Duration::from_secs_f64(cfg.poll_interval)).await;
        }
    }
}

/// One iteration: acquire a workspace, try to process a submission in it,
/// release the workspace whatever happened. Returns `true` when a submission
/// was processed (skip the poll sleep).
#[allow(clippy::too_many_arguments)]
async fn process_one(
    cfg: &WorkerConfig,
    client: &UiClient,
    sandbox: &DockerSandbox,
    shutdown: &Shutdown,
    worker_name: &str,
    transient_id: &str,
    verbose: bool,
) -> anyhow::Result<bool> {
    let ws = Workspace::acquire(cfg.workspace_root(), transient_id).await?;
    match process_submission(cfg, client, sandbox, shutdown, worker_name, &ws, verbose).await {
        Ok(None) => {
            ws.release(false).await?;
            Ok(false)
        }
        Ok(Some(anomalous)) => {
            ws.release(cfg.debug_mode && anomalous).await?;
            Ok(true)
        }
        Err(e) => {
            ws.release(cfg.debug_mode).await?;
            Err(e)
        }
    }
}

/// The submission pipeline: fetch → prepare → evaluate → report.
/// `Ok(None)` means every queue was empty; `Ok(Some(anomalous))` means a
/// submission ran to the end of its pipeline.
async fn process_submission(
    cfg: &WorkerConfig,
    client: &UiClient,
    sandbox: &DockerSandbox,
    shutdown: &Shutdown,
    worker_name: &str,
    ws: &Workspace,
    verbose: bool,
) -> anyhow::Result<Option<bool>> {
    let log_path = ws.logs_dir().join("worker.log");
    let sink = if verbose {
        LogSink::with_stderr(&log_path).await?
    } else {
        LogSink::file_only(&log_path).await?
    };
    let adapter = Adapter::new(client, cfg, &sink);

    let mut sub = match adapter.fetch_submission(ws).await? {
        Some(sub) => sub,
        None => return Ok(None),
    };
    info!(
        submission = %sub.id,
        problem = %sub.problem_specification.id,
        student = sub.submitted_by.as_deref().unwrap_or("unknown"),
        "processing submission"
    );
    sink.info(format!(
        "{} is starting submission processing workflow",
        LogSink::bold(worker_name)
    ))
    .await;
    adapter.notify_status(&sub.id, "Processing submission...").await;

    adapter.notify_status(&sub.id, "Fetching problem...").await;
    let problem_id = sub.problem_specification.id.clone();
    match adapter.fetch_problem(&problem_id, ws).await {
        Ok(problem) => sub.problem_specification = problem,
        Err(e) => {
            sink.error(format!("cannot prepare problem {}: {:#}", problem_id, e))
                .await;
            let mut result = SubmissionResult {
                points: 0,
                info: Some(format!("Cannot prepare problem: {:#}", e)),
                debug: None,
                test_results: Vec::new(),
            };
            result.debug = Some(sink.contents_capped(DEBUG_LOG_LIMIT));
            adapter.notify_status(&sub.id, "Reporting result...").await;
            adapter.report_result(&sub.id, &result).await?;
            return Ok(Some(true));
        }
    }

    adapter.notify_status(&sub.id, "Evaluating...").await;
    let evaluation = Evaluator::new(sandbox, cfg, &sink, shutdown)
        .run(ws, &sub)
        .await;
    let mut result = evaluation.result;
    sink.raw(result.to_string()).await;
    result.debug = Some(sink.contents_capped(DEBUG_LOG_LIMIT));

    if !evaluation.completed {
        info!(
            submission = %sub.id,
            "shutdown interrupted the evaluation, result not reported; the UI will re-queue"
        );
        return Ok(Some(true));
    }

    adapter.notify_status(&sub.id, "Reporting result...").await;
    if let Err(e) = adapter.report_result(&sub.id, &result).await {
        error!(submission = %sub.id, "reporting failed: {:#}", e);
        return Ok(Some(true));
    }
    info!(submission = %sub.id, points = result.points, "submission finished");
    Ok(Some(result.anomalous()))
}
