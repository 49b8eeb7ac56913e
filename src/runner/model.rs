//! Data model at the sandbox boundary.
//!
//! Everything here is engine-neutral; translating limits and mounts into
//! Docker's resource knobs happens in [`super::exec`] and nowhere else.

use std::path::PathBuf;
use std::time::Duration;

use bytes::BytesMut;
use derive_builder::Builder;

/// Resource limits applied to one container run.
#[derive(Debug, Clone)]
pub struct Limits {
    /// CPU time budget in seconds; also drives the wall-clock timeout.
    pub cpu_time_limit: f64,
    /// Total memory cap in bytes (swap is not allowed on top).
    pub memory_limit: u64,
    pub pids_limit: i64,
    /// Largest file the contained process may create, in bytes.
    pub file_size_limit: u64,
    pub open_files_limit: u64,
    pub stack_size_limit: Option<u64>,
}

impl Default for Limits {
    fn default() -> Limits {
        Limits {
            cpu_time_limit: 60.0,
            memory_limit: 512 * 1024 * 1024,
            pids_limit: 64,
            file_size_limit: 5 * 1024 * 1024 * 1024,
            open_files_limit: 1024,
            stack_size_limit: None,
        }
    }
}

/// A single host-to-container bind mount.
#[derive(Debug, Clone)]
pub struct BindMount {
    pub host_path: PathBuf,
    pub container_path: String,
    pub read_only: bool,
}

impl BindMount {
    pub fn read_only(host_path: impl Into<PathBuf>, container_path: impl Into<String>) -> BindMount {
        BindMount {
            host_path: host_path.into(),
            container_path: container_path.into(),
            read_only: true,
        }
    }

    pub fn read_write(host_path: impl Into<PathBuf>, container_path: impl Into<String>) -> BindMount {
        BindMount {
            host_path: host_path.into(),
            container_path: container_path.into(),
            read_only: false,
        }
    }
}

/// Everything needed to launch one sandboxed stage.
#[derive(Debug, Clone, Builder)]
#[builder(setter(into, strip_option))]
pub struct SandboxProfile {
    /// Image the container is created from.
    pub image: String,

    /// Command override; `None` lets the image entrypoint decide.
    #[builder(default)]
    pub command: Option<Vec<String>>,

    /// Environment passed to the container.
    #[builder(default)]
    pub env: Vec<(String, String)>,

    #[builder(default)]
    pub mounts: Vec<BindMount>,

    #[builder(default)]
    pub limits: Limits,

    /// Hard wall-clock budget, independent of in-container CPU accounting.
    pub wall_timeout: Duration,

    /// When set, every mount's host path must resolve under this directory.
    #[builder(default)]
    pub containment_root: Option<PathBuf>,

    /// Label used in container names and logs.
    #[builder(default)]
    pub tag: Option<String>,
}

/// What came out of one container run.
#[derive(Debug, Clone, Default)]
pub struct RunOutcome {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
    /// Peak memory in bytes, where the engine reports it.
    pub peak_memory: Option<u64>,
    /// CPU time in seconds, where the engine reports it.
    pub cpu_time: Option<f64>,
    pub wall_time: f64,
    pub timed_out: bool,
    pub oom_killed: bool,
}

impl RunOutcome {
    pub fn succeeded(&self) -> bool {
        self.exit_code == 0 && !self.timed_out && !self.oom_killed
    }
}

/// Byte buffer that stops growing at a fixed cap; keeps log capture bounded
/// no matter what the container prints.
pub struct CappedBuffer {
    cap: usize,
    bytes: BytesMut,
}

impl CappedBuffer {
    pub fn new(cap: usize) -> CappedBuffer {
        CappedBuffer {
            cap,
            bytes: BytesMut::new(),
        }
    }

    pub fn append(&mut self, chunk: &[u8]) {
        if self.bytes.len() >= self.cap {
            return;
        }
        let room = self.cap - self.bytes.len();
        self.bytes.extend_from_slice(&chunk[..chunk.len().min(room)]);
    }

    pub fn is_truncated(&self) -> bool {
        self.bytes.len() >= self.cap
    }

    pub fn into_string(self) -> String {
        let truncated = self.is_truncated();
        let mut s = String::from_utf8_lossy(&self.bytes).into_owned();
        if truncated {
            s.push_str("\n--- output capped at ");
            s.push_str(&self.cap.to_string());
            s.push_str(" bytes ---\n");
        }
        s
    }
}
