//! Worker configuration.
//!
//! A worker starts from a JSON configuration file plus a handful of CLI
//! overrides. Validation happens once at startup; a bad configuration is
//! fatal and the process exits non-zero.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use err_derive::Error;
use serde::{Deserialize, Serialize};

use crate::opt::Opts;

fn default_docker_socket() -> PathBuf {
    PathBuf::from("/var/run/docker.sock")
}

fn default_poll_interval() -> f64 {
    1.0
}

fn default_connect_timeout() -> f64 {
    5.0
}

fn default_read_timeout() -> f64 {
    15.0
}

fn default_stage_timeout() -> f64 {
    60.0
}

fn default_max_file_bytes() -> u64 {
    1024 * 1024 * 1024
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Base URL of the UI, e.g. `http://gui.example.edu`.
    pub gui_url: String,
    /// Queues polled for work, in priority order.
    pub queue_names: Vec<String>,
    /// Image used for the execute stage.
    pub exec_image: String,
    /// Image used for the judge stage.
    pub judge_image: String,
    /// Compile image per queue name.
    pub queue_compiler_map: HashMap<String, String>,
    #[serde(default = "default_docker_socket")]
    pub docker_socket: PathBuf,
    /// Host directory that holds per-submission workspaces.
    pub workspace_root: PathBuf,
    /// Sleep between polls when every queue is empty, in seconds.
    #[serde(default = "default_poll_interval")]
    pub poll_interval: f64,
    #[serde(default = "default_connect_timeout")]
    pub http_connect_timeout: f64,
    #[serde(default = "default_read_timeout")]
    pub http_read_timeout: f64,
    /// Wall-clock limit for the compile container, in seconds.
    #[serde(default = "default_stage_timeout")]
    pub compile_timeout: f64,
    /// Wall-clock limit for each judge container, in seconds.
    #[serde(default = "default_stage_timeout")]
    pub judge_timeout: f64,
    /// Preserve workspaces of anomalous submissions instead of deleting them.
    #[serde(default)]
    pub debug_mode: bool,
    /// Hard cap on any single downloaded file.
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(display = "cannot read configuration file {}: {}", path, source)]
    Unreadable {
        path: String,
        #[error(source)]
        source: std::io::Error,
    },

    #[error(display = "malformed configuration: {}", _0)]
    Malformed(#[error(source)] serde_json::Error),

    #[error(display = "invalid configuration: {}", _0)]
    Invalid(String),
}

impl WorkerConfig {
    /// Loads the configuration file named by `opts`, applies CLI overrides
    /// and validates the result.
    pub fn load(opts: &Opts) -> Result<WorkerConfig, ConfigError> {
        let raw = std::fs::read_to_string(&opts.config).map_err(|e| ConfigError::Unreadable {
            path: opts.config.display().to_string(),
            source: e,
        })?;
        let mut cfg: WorkerConfig = serde_json::from_str(&raw)?;

        if let Some(url) = &opts.gui_url {
            cfg.gui_url = url.clone();
        }
        if let Some(root) = &opts.workspace_root {
            cfg.workspace_root = root.clone();
        }
        if opts.debug {
            cfg.debug_mode = true;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.gui_url.starts_with("http://") && !self.gui_url.starts_with("https://") {
            return Err(ConfigError::Invalid(format!(
                "gui_url must be an http(s) URL, got `{}`",
                self.gui_url
            )));
        }
        if self.queue_names.is_empty() {
            return Err(ConfigError::Invalid("queue_names is empty".into()));
        }
        for queue in &self.queue_names {
            if !self.queue_compiler_map.contains_key(queue) {
                return Err(ConfigError::Invalid(format!(
                    "queue `{}` has no entry in queue_compiler_map",
                    queue
                )));
            }
        }
        if self.exec_image.is_empty() || self.judge_image.is_empty() {
            return Err(ConfigError::Invalid(
                "exec_image and judge_image must be set".into(),
            ));
        }
        for (name, value) in [
            ("poll_interval", self.poll_interval),
            ("http_connect_timeout", self.http_connect_timeout),
            ("http_read_timeout", self.http_read_timeout),
            ("compile_timeout", self.compile_timeout),
            ("judge_timeout", self.judge_timeout),
        ] {
            if !(value > 0.0) {
                return Err(ConfigError::Invalid(format!("{} must be positive", name)));
            }
        }
        if self.max_file_bytes == 0 {
            return Err(ConfigError::Invalid("max_file_bytes must be positive".into()));
        }
        Ok(())
    }

    /// The UI base URL without a trailing slash.
    pub fn gui_base(&self) -> &str {
        self.gui_url.trim_end_matches('/')
    }

    pub fn compiler_for_queue(&self, queue: &str) -> Option<&str> {
        self.queue_compiler_map.get(queue).map(String::as_str)
    }

    pub fn workspace_root(&self) -> &Path {
        &self.workspace_root
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn sample() -> WorkerConfig {
        serde_json::from_value(serde_json::json!({
            "gui_url": "http://gui.local/",
            "queue_names": ["cpp", "python"],
            "exec_image": "stos/exec:latest",
            "judge_image": "stos/judge:latest",
            "queue_compiler_map": {
                "cpp": "stos/gcc:latest",
                "python": "stos/python:latest"
            },
            "workspace_root": "/var/lib/stos-worker"
        }))
        .unwrap()
    }

    #[test]
    fn defaults_are_applied() {
        let cfg = sample();
        assert_eq!(cfg.poll_interval, 1.0);
        assert_eq!(cfg.http_connect_timeout, 5.0);
        assert_eq!(cfg.http_read_timeout, 15.0);
        assert_eq!(cfg.max_file_bytes, 1024 * 1024 * 1024);
        assert!(!cfg.debug_mode);
        cfg.validate().unwrap();
    }

    #[test]
    fn queue_without_compiler_is_rejected() {
        let mut cfg = sample();
        cfg.queue_names.push("rust".into());
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn non_positive_timeouts_are_rejected() {
        let mut cfg = sample();
        cfg.poll_interval = 0.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn base_url_strips_trailing_slash() {
        assert_eq!(sample().gui_base(), "http://gui.local");
    }
}
