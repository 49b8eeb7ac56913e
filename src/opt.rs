use clap::Parser;
use std::path::PathBuf;

/// Evaluation worker for the STOS online judge.
#[derive(Parser, Debug, Clone)]
#[command(name = "stos-worker", version, about)]
pub struct Opts {
    /// Path of the worker configuration file.
    #[arg(long, short, default_value = "worker.json")]
    pub config: PathBuf,

    /// Override the UI base URL from the configuration file.
    #[arg(long)]
    pub gui_url: Option<String>,

    /// Override the workspace root directory.
    #[arg(long)]
    pub workspace_root: Option<PathBuf>,

    /// Keep workspaces of anomalous submissions for inspection.
    #[arg(long)]
    pub debug: bool,

    /// Mirror the per-submission log to stderr.
    #[arg(long)]
    pub verbose: bool,
}
