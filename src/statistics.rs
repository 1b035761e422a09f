//! Periodic draining of registered reporters.
use crate::event::Metric;
use crate::plugin_channel::PluginChannel;
use crate::reporter::Reporter;
use crate::shutdown::Lifeline;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{self, Instant};
use tokio_stream::wrappers::IntervalStream;
use tokio_stream::StreamExt;
use tracing::info;

/// Drains every active reporter once per interval.
///
/// Each drain writes one structured log line per reporter and, when a
/// prefix is configured, feeds the counts back into the input channel as
/// metrics so they travel the same pipeline as everything else.
pub struct Statistics {
    interval: Duration,
    prefix: Option<String>,
    reporters: Vec<Arc<dyn Reporter>>,
}

impl Statistics {
    pub fn new(
        interval: Duration,
        prefix: Option<String>,
        reporters: Vec<Arc<dyn Reporter>>,
    ) -> Self {
        Statistics {
            interval,
            prefix,
            reporters,
        }
    }

    /// Arm the reporting timer.
    pub fn start(self, input: Arc<PluginChannel>, notify: &broadcast::Sender<()>) {
        let mut lifeline = Lifeline::new(notify);
        tokio::spawn(async move {
            // The first drain happens one full interval in.
            let mut ticks = IntervalStream::new(time::interval_at(
                Instant::now() + self.interval,
                self.interval,
            ));
            loop {
                tokio::select! {
                    _ = ticks.next() => self.report_once(&input),
                    _ = lifeline.stopped() => return,
                }
            }
        });
    }

    /// One full drain of the active reporters.
    pub fn report_once(&self, input: &PluginChannel) {
        for reporter in &self.reporters {
            if !reporter.report_some() {
                continue;
            }

            let label = reporter.label();
            let counts = reporter.drain();
            info!(reporter = %label, counts = ?counts, "statistics");

            if let Some(prefix) = &self.prefix {
                for (name, count) in counts {
                    let key = format!("{prefix}.{label}.{name}");
                    input.metric(&Metric::new(key, count as f64));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reporter::Counter;
    use std::sync::Mutex;

    struct FakeReporter {
        hits: Counter,
    }

    impl Reporter for FakeReporter {
        fn label(&self) -> String {
            "fake".to_string()
        }

        fn report_some(&self) -> bool {
            self.hits.get() > 0
        }

        fn drain(&self) -> Vec<(&'static str, u64)> {
            vec![("hits", self.hits.take())]
        }
    }

    #[test]
    fn drains_active_reporters_into_the_input_channel() {
        let reporter = Arc::new(FakeReporter {
            hits: Counter::default(),
        });
        reporter.hits.increment(3);

        let input = PluginChannel::new("input");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        std::mem::forget(input.subscribe_metrics(move |m| {
            sink.lock().unwrap().push((m.key.clone(), m.value));
            Ok(())
        }));

        let reporters: Vec<Arc<dyn Reporter>> = vec![reporter.clone()];
        let statistics = Statistics::new(
            Duration::from_secs(600),
            Some("ffwd".to_string()),
            reporters,
        );
        statistics.report_once(&input);

        assert_eq!(
            *seen.lock().unwrap(),
            vec![("ffwd.fake.hits".to_string(), 3.0)]
        );

        // The drain reset the counter, so a second pass is quiet.
        statistics.report_once(&input);
        assert_eq!(seen.lock().unwrap().len(), 1);
    }
}
