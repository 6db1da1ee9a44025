//! Progress signals from a running agent invocation
//!
//! The lifecycle controller's stall watchdog treats every signal as proof of
//! life. Cost signals also carry the attempt's cumulative spend so far.

use tokio::sync::mpsc;

/// One observable progress signal
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Progress {
    /// Output, tool use or a coordination write
    Heartbeat,
    /// Cumulative cost of the current attempt
    Cost(f64),
}

/// Receiving end handed to the watchdog
pub type ProgressReceiver = mpsc::UnboundedReceiver<Progress>;

/// Cloneable sender handed to the agent capability
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    tx: Option<mpsc::UnboundedSender<Progress>>,
}

impl ProgressReporter {
    pub fn channel() -> (Self, ProgressReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// A reporter whose signals go nowhere
    pub fn noop() -> Self {
        Self { tx: None }
    }

    pub fn heartbeat(&self) {
        self.send(Progress::Heartbeat);
    }

    pub fn cost(&self, cumulative_usd: f64) {
        self.send(Progress::Cost(cumulative_usd));
    }

    fn send(&self, progress: Progress) {
        if let Some(tx) = &self.tx {
            // the watchdog may already be gone
            let _ = tx.send(progress);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_signals_arrive_in_order() {
        let (reporter, mut rx) = ProgressReporter::channel();
        reporter.heartbeat();
        reporter.clone().cost(0.42);

        assert_eq!(rx.recv().await, Some(Progress::Heartbeat));
        assert_eq!(rx.recv().await, Some(Progress::Cost(0.42)));
    }

    #[test]
    fn test_noop_and_dropped_receiver_are_silent() {
        ProgressReporter::noop().heartbeat();

        let (reporter, rx) = ProgressReporter::channel();
        drop(rx);
        reporter.cost(1.0);
    }
}
