//! Single-slot, first-wins delivery of terminating errors.
//!
//! Every handler spawned by one forwarding call shares a reporter. The first
//! report occupies the slot; later reports are dropped instead of blocking the
//! reporting task.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::ForwardError;
use crate::forwarder::ForwarderStats;

/// Create a connected reporter/receiver pair backed by a capacity-one channel.
pub(crate) fn error_slot(stats: Arc<ForwarderStats>) -> (ErrorReporter, ErrorReceiver) {
    let (tx, rx) = mpsc::channel(1);
    (ErrorReporter { tx, stats }, ErrorReceiver { rx })
}

/// Sending half, cloned into every handler.
#[derive(Clone)]
pub(crate) struct ErrorReporter {
    tx: mpsc::Sender<ForwardError>,
    stats: Arc<ForwarderStats>,
}

impl ErrorReporter {
    /// Try to deliver `err`. Returns false when the slot was already taken or
    /// nobody is waiting any more.
    pub(crate) fn report(&self, err: ForwardError) -> bool {
        match self.tx.try_send(err) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(err))
            | Err(mpsc::error::TrySendError::Closed(err)) => {
                self.stats.errors_dropped.fetch_add(1, Ordering::Relaxed);
                debug!(error = %err, "Dropping error report, slot already resolved");
                false
            }
        }
    }
}

/// Receiving half, owned by the waiting entry point.
pub(crate) struct ErrorReceiver {
    rx: mpsc::Receiver<ForwardError>,
}

impl ErrorReceiver {
    /// Race the slot against cancellation and return whichever resolves first.
    pub(crate) async fn wait(mut self, cancel: &CancellationToken) -> ForwardError {
        tokio::select! {
            received = self.rx.recv() => match received {
                Some(err) => err,
                // Every reporter is gone without reporting; only cancellation is left.
                None => {
                    cancel.cancelled().await;
                    ForwardError::Cancelled
                }
            },
            _ = cancel.cancelled() => ForwardError::Cancelled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_first_report_wins() {
        let stats = Arc::new(ForwarderStats::default());
        let (reporter, receiver) = error_slot(Arc::clone(&stats));

        assert!(reporter.report(ForwardError::Accept(std::io::Error::other("first"))));
        assert!(!reporter.clone().report(ForwardError::Accept(std::io::Error::other("second"))));
        assert_eq!(stats.errors_dropped.load(Ordering::Relaxed), 1);

        let cancel = CancellationToken::new();
        let err = receiver.wait(&cancel).await;
        assert!(err.to_string().contains("first"));
    }

    #[tokio::test]
    async fn test_cancellation_resolves_wait() {
        let stats = Arc::new(ForwarderStats::default());
        let (_reporter, receiver) = error_slot(stats);

        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(receiver.wait(&cancel).await.is_cancelled());
    }

    #[tokio::test]
    async fn test_report_after_receiver_dropped() {
        let stats = Arc::new(ForwarderStats::default());
        let (reporter, receiver) = error_slot(Arc::clone(&stats));
        drop(receiver);

        assert!(!reporter.report(ForwardError::Cancelled));
        assert_eq!(stats.errors_dropped.load(Ordering::Relaxed), 1);
    }
}
