//! Teardown plumbing for long-lived tasks.
use tokio::sync::{broadcast, mpsc};

/// Held by a task for as long as it runs.
///
/// A lifeline bundles the two halves of orderly teardown: `stopped()`
/// completes once the supervisor announces shutdown (or goes away), and
/// dropping the lifeline releases the supervisor's completion drain, so
/// tasks carrying one are waited for before the process exits.
///
/// Tasks whose work needs no draining (timer loops, reconnect loops that
/// close their own socket) take a lifeline without a drain half.
pub struct Lifeline {
    notify: broadcast::Receiver<()>,
    _drain: Option<mpsc::Sender<()>>,
}

impl std::fmt::Debug for Lifeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lifeline")
            .field("drain", &self._drain.is_some())
            .finish()
    }
}

impl Lifeline {
    /// A lifeline that only listens for the shutdown announcement.
    pub fn new(notify: &broadcast::Sender<()>) -> Lifeline {
        Lifeline {
            notify: notify.subscribe(),
            _drain: None,
        }
    }

    /// A lifeline whose drop also counts towards the supervisor's drain.
    pub fn with_drain(notify: &broadcast::Sender<()>, drain: &mpsc::Sender<()>) -> Lifeline {
        Lifeline {
            notify: notify.subscribe(),
            _drain: Some(drain.clone()),
        }
    }

    /// Completes when shutdown is announced. Also completes immediately
    /// once the announcing side has been dropped, so a task can keep
    /// selecting on this during and after teardown.
    pub async fn stopped(&mut self) {
        // Only one value is ever sent, and a dropped sender surfaces as
        // an immediate error; either way the task should wind down.
        let _ = self.notify.recv().await;
    }
}
