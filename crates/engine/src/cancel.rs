//! Cooperative cancellation
//!
//! Every blocking call inside a segment takes a [`CancelToken`] rooted at the
//! segment budget. The token is clonable and cheap; cancellation is
//! broadcast to all clones.

use std::time::Duration;
use tokio::sync::watch;

/// Fires a cancellation signal to all interested parties.
#[derive(Debug)]
pub struct CancelSource {
    sender: watch::Sender<bool>,
}

/// Observes a cancellation signal.
#[derive(Debug, Clone)]
pub struct CancelToken {
    receiver: watch::Receiver<bool>,
}

impl CancelSource {
    pub fn new() -> (Self, CancelToken) {
        let (sender, receiver) = watch::channel(false);
        (Self { sender }, CancelToken { receiver })
    }

    /// Signal cancellation. Idempotent.
    pub fn cancel(&self) {
        let _ = self.sender.send(true);
    }

    /// Spawn a timer that cancels after `delay`. The returned handle can be
    /// aborted if the segment finishes early.
    pub fn cancel_after(self, delay: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            self.cancel();
        })
    }
}

impl CancelToken {
    /// A token that never fires.
    pub fn never() -> Self {
        let (_, token) = CancelSource::new();
        token
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Resolve when cancellation is requested. If the source is dropped
    /// without cancelling, this pends forever.
    pub async fn cancelled(&self) {
        let mut receiver = self.receiver.clone();
        if *receiver.borrow() {
            return;
        }
        loop {
            if receiver.changed().await.is_err() {
                // Source dropped without firing; never resolve.
                std::future::pending::<()>().await;
            }
            if *receiver.borrow() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cancel_propagates_to_clones() {
        let (source, token) = CancelSource::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        source.cancel();
        clone.cancelled().await;
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancel_after_fires() {
        let (source, token) = CancelSource::new();
        source.cancel_after(Duration::from_millis(10));
        tokio::time::timeout(Duration::from_millis(200), token.cancelled())
            .await
            .expect("cancellation should fire");
    }

    #[tokio::test]
    async fn test_never_token_pends() {
        let token = CancelToken::never();
        let result =
            tokio::time::timeout(Duration::from_millis(20), token.cancelled()).await;
        assert!(result.is_err());
    }
}
