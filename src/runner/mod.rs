//! Sandboxed execution of pipeline stages.
//!
//! Each compile, execute and judge stage is one container run with resource
//! limits, bind mounts into the workspace and network disabled. The runner
//! guarantees the container is removed on every exit path.

use std::time::Duration;

use async_trait::async_trait;
use err_derive::Error;

pub mod exec;
pub mod model;

pub use exec::DockerSandbox;
pub use model::{BindMount, CappedBuffer, Limits, RunOutcome, SandboxProfile, SandboxProfileBuilder};

/// Wall-clock budget per execute stage: `cpu_time_limit × factor + overhead`,
/// so a wedged container cannot stall the worker even when in-container
/// accounting fails.
pub const WALL_CLOCK_SAFETY_FACTOR: f64 = 2.0;
pub const WALL_CLOCK_OVERHEAD: Duration = Duration::from_secs(1);

pub fn wall_timeout_for(cpu_time_limit: f64) -> Duration {
    Duration::from_secs_f64(cpu_time_limit * WALL_CLOCK_SAFETY_FACTOR) + WALL_CLOCK_OVERHEAD
}

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error(display = "container engine error: {}", _0)]
    Engine(#[error(source)] bollard::errors::Error),

    #[error(display = "image not available: {}", _0)]
    MissingImage(String),

    #[error(display = "mount {} escapes the workspace", _0)]
    MountEscape(String),

    #[error(display = "container wait ended unexpectedly: {}", _0)]
    Wait(String),

    #[error(display = "filesystem error at the sandbox boundary: {}", _0)]
    Io(#[error(source)] std::io::Error),
}

/// The one primitive every stage is built from.
#[async_trait]
pub trait Sandbox: Send + Sync {
    async fn run(&self, profile: &SandboxProfile) -> Result<RunOutcome, SandboxError>;
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn wall_timeout_has_headroom() {
        assert_eq!(wall_timeout_for(1.0), Duration::from_secs(3));
        assert_eq!(wall_timeout_for(2.5), Duration::from_secs(6));
        assert!(wall_timeout_for(0.1) >= Duration::from_secs(1));
    }
}
