//! Single-delivery process exit notification.
//!
//! The supervisor's waiter task is the only producer and delivers exactly one
//! [`ProcessExit`]. Any number of [`ExitSignal`] clones may wait, but only the
//! first reader receives the value; later readers wait forever.
//!
//! Separately, the waiter records that the child has been reaped. The
//! shutdown path observes that record so it cannot be starved by another
//! reader consuming the value first.

use std::sync::Arc;

use tokio::sync::{mpsc, watch, Mutex};

use crate::ExitError;

/// Outcome of the emulator process: `Ok(())` on a clean exit.
pub type ProcessExit = Result<(), ExitError>;

/// Producer half, consumed on delivery.
#[derive(Debug)]
pub(crate) struct ExitNotifier {
    tx: mpsc::Sender<ProcessExit>,
    reaped: watch::Sender<Option<ProcessExit>>,
}

impl ExitNotifier {
    pub(crate) fn deliver(self, exit: ProcessExit) {
        // Capacity 1 and a single send: this cannot be full.
        if self.tx.try_send(exit.clone()).is_err() {
            tracing::debug!("exit signal dropped before delivery");
        }
        self.reaped.send_replace(Some(exit));
    }
}

/// Consumer handle on the emulator's termination.
#[derive(Debug, Clone)]
pub struct ExitSignal {
    rx: Arc<Mutex<mpsc::Receiver<ProcessExit>>>,
    reaped: watch::Receiver<Option<ProcessExit>>,
}

/// Create a connected notifier/signal pair.
pub(crate) fn exit_channel() -> (ExitNotifier, ExitSignal) {
    let (tx, rx) = mpsc::channel(1);
    let (reaped_tx, reaped_rx) = watch::channel(None);
    (
        ExitNotifier {
            tx,
            reaped: reaped_tx,
        },
        ExitSignal {
            rx: Arc::new(Mutex::new(rx)),
            reaped: reaped_rx,
        },
    )
}

impl ExitSignal {
    /// Wait for the process outcome.
    ///
    /// # Cancel Safety
    /// Cancel safe: dropping the future before it completes leaves the value
    /// in place for the next reader.
    pub async fn recv(&self) -> ProcessExit {
        let mut rx = self.rx.lock().await;
        match rx.recv().await {
            Some(exit) => exit,
            // Already consumed by another reader; nothing will ever arrive.
            None => std::future::pending().await,
        }
    }

    /// Take the outcome if it has been delivered and not yet consumed.
    #[must_use]
    pub fn try_recv(&self) -> Option<ProcessExit> {
        let mut rx = self.rx.try_lock().ok()?;
        rx.try_recv().ok()
    }

    /// Whether the child has been reaped.
    #[must_use]
    pub fn has_exited(&self) -> bool {
        self.reaped.borrow().is_some()
    }

    /// Wait until the child is reaped and return its outcome.
    ///
    /// Consumes the delivered value when it is still available. Completes even
    /// if another reader took it first.
    pub(crate) async fn observe(&self) -> ProcessExit {
        let mut reaped = self.reaped.clone();
        tokio::select! {
            biased;
            exit = self.recv() => exit,
            seen = reaped.wait_for(Option::is_some) => match seen {
                Ok(exit) => exit.clone().unwrap_or(Ok(())),
                Err(_) => Err(ExitError::Wait("exit waiter went away".to_owned())),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn first_reader_gets_the_value() {
        let (tx, rx) = exit_channel();
        tx.deliver(Ok(()));
        let got = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await;
        assert!(matches!(got, Ok(Ok(()))), "first reader must see the exit");
    }

    #[tokio::test]
    async fn second_reader_never_gets_a_value() {
        let (tx, rx) = exit_channel();
        let other = rx.clone();
        tx.deliver(Err(ExitError::Wait("boom".to_owned())));

        let first = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await;
        assert!(matches!(first, Ok(Err(ExitError::Wait(_)))));

        let second = tokio::time::timeout(Duration::from_millis(100), other.recv()).await;
        assert!(second.is_err(), "second read must block: single delivery");
    }

    #[tokio::test]
    async fn cancelled_reader_leaves_value_for_next() {
        let (tx, rx) = exit_channel();
        let early = tokio::time::timeout(Duration::from_millis(20), rx.recv()).await;
        assert!(early.is_err(), "nothing delivered yet");

        tx.deliver(Ok(()));
        assert!(matches!(rx.try_recv(), Some(Ok(()))));
        assert!(rx.try_recv().is_none(), "value is consumed once");
    }

    #[tokio::test]
    async fn observe_completes_after_another_reader_consumed() {
        let (tx, rx) = exit_channel();
        let other = rx.clone();
        tx.deliver(Err(ExitError::Wait("killed".to_owned())));

        assert!(matches!(other.try_recv(), Some(Err(_))));
        assert!(rx.has_exited());
        let seen = tokio::time::timeout(Duration::from_secs(1), rx.observe()).await;
        assert!(matches!(seen, Ok(Err(ExitError::Wait(_)))), "got {seen:?}");
    }

    #[tokio::test]
    async fn observe_consumes_the_value_when_available() {
        let (tx, rx) = exit_channel();
        tx.deliver(Ok(()));
        let seen = tokio::time::timeout(Duration::from_secs(1), rx.observe()).await;
        assert!(matches!(seen, Ok(Ok(()))));
        assert!(rx.try_recv().is_none(), "observe took the single value");
    }
}
