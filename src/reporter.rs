//! Monotonic counters drained periodically by the statistics component.
use std::sync::atomic::{AtomicU64, Ordering};

/// A single monotonic counter, reset on drain.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn increment(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    /// Read and reset in one step.
    pub fn take(&self) -> u64 {
        self.0.swap(0, Ordering::Relaxed)
    }
}

/// Anything that counts things and wants those counts surfaced.
pub trait Reporter: Send + Sync {
    /// Identifies the reporter in log lines and metric keys, e.g.
    /// `"connect/tcp://localhost:2003"`.
    fn label(&self) -> String;

    /// `true` iff any counter is currently non-zero.
    fn report_some(&self) -> bool;

    /// Drain every counter to zero, returning `(name, count)` pairs.
    fn drain(&self) -> Vec<(&'static str, u64)>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_resets_the_counter() {
        let c = Counter::default();
        c.increment(3);
        c.increment(2);
        assert_eq!(c.get(), 5);
        assert_eq!(c.take(), 5);
        assert_eq!(c.get(), 0);
    }
}
