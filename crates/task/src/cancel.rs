//! Build-wide cancellation

use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Shared cancellation signal for one or more invocations.
///
/// Clones observe the same signal; cancelling is idempotent and may happen
/// from any thread.
#[derive(Debug, Clone)]
pub struct CancellationHandle {
    sender: Arc<watch::Sender<bool>>,
}

impl CancellationHandle {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn cancel(&self) {
        if !self.sender.send_replace(true) {
            info!("Build cancellation requested");
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.sender.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.sender.subscribe()
    }

    /// Cancel when the process receives Ctrl-C
    pub fn cancel_on_ctrl_c(&self) -> JoinHandle<()> {
        let handle = self.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => handle.cancel(),
                Err(e) => warn!("Failed to listen for Ctrl-C: {e}"),
            }
        })
    }
}

impl Default for CancellationHandle {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cancel_wakes_subscribers() {
        let handle = CancellationHandle::new();
        let mut receiver = handle.subscribe();
        assert!(!handle.is_cancelled());

        let remote = handle.clone();
        tokio::spawn(async move { remote.cancel() });

        receiver.changed().await.unwrap();
        assert!(*receiver.borrow());
        assert!(handle.is_cancelled());

        // Idempotent
        handle.cancel();
        assert!(handle.is_cancelled());
    }
}
