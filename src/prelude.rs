//! Small primitives shared by every component.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::signal::unix::{signal, SignalKind};
use tracing::info;

/// Cooperative shutdown flag, set by SIGINT/SIGTERM.
///
/// The main loop checks it before fetching new work, the evaluator checks it
/// between pipeline stages. In-flight containers are allowed to finish their
/// current stage; nothing new is started once the flag is up.
#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    flag: Arc<AtomicBool>,
}

impl Shutdown {
    pub fn new() -> Shutdown {
        Shutdown::default()
    }

    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Spawns a task that trips the flag on the first SIGINT or SIGTERM.
    pub fn listen_for_signals(&self) -> std::io::Result<()> {
        let mut interrupt = signal(SignalKind::interrupt())?;
        let mut terminate = signal(SignalKind::terminate())?;
        let flag = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = interrupt.recv() => info!("received SIGINT, shutting down after the current submission"),
                _ = terminate.recv() => info!("received SIGTERM, shutting down after the current submission"),
            }
            flag.trigger();
        });
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn trigger_is_sticky() {
        let s = Shutdown::new();
        assert!(!s.is_triggered());
        s.trigger();
        assert!(s.is_triggered());
        assert!(s.clone().is_triggered());
    }
}
