//! The `count` processor: running per-key sums.
use super::Processor;
use crate::config::ProcessorOptions;
use crate::emitter::CoreEmitter;
use crate::event::Metric;
use crate::reporter::{Counter, Reporter};
use std::collections::HashMap;
use std::sync::Arc;

pub fn factory(options: &ProcessorOptions) -> Box<dyn Processor> {
    Box::new(CountProcessor::new(options.cache_limit))
}

/// Accumulates every routed metric into a per-key sum and emits the
/// running total immediately.
///
/// The key space is bounded by `cache_limit`: once the cache is full, new
/// keys are dropped (and counted), while known keys keep accumulating.
/// There is no time windowing; sums grow for the lifetime of the process.
pub struct CountProcessor {
    cache: HashMap<String, f64>,
    cache_limit: usize,
    emitter: Option<CoreEmitter>,
    stats: Arc<CountStats>,
}

#[derive(Default)]
struct CountStats {
    dropped_keys: Counter,
}

impl CountProcessor {
    pub fn new(cache_limit: usize) -> Self {
        CountProcessor {
            cache: HashMap::new(),
            cache_limit,
            emitter: None,
            stats: Arc::new(CountStats::default()),
        }
    }
}

impl Processor for CountProcessor {
    fn name(&self) -> &'static str {
        "count"
    }

    fn start(&mut self, emitter: CoreEmitter) {
        self.emitter = Some(emitter);
    }

    fn process(&mut self, metric: &Metric) {
        let Some(emitter) = &self.emitter else {
            return;
        };

        let cache_len = self.cache.len();
        let total = match self.cache.get_mut(&metric.key) {
            Some(sum) => {
                *sum += metric.value;
                *sum
            }
            None if cache_len >= self.cache_limit => {
                self.stats.dropped_keys.increment(1);
                return;
            }
            None => {
                self.cache.insert(metric.key.clone(), metric.value);
                metric.value
            }
        };

        let mut derived = metric.clone();
        derived.value = total;
        derived.proc = None;
        emitter.emit_metric(&derived);
    }

    fn reporter(&self) -> Option<Arc<dyn Reporter>> {
        Some(self.stats.clone())
    }
}

impl Reporter for CountStats {
    fn label(&self) -> String {
        "processor/count".to_string()
    }

    fn report_some(&self) -> bool {
        self.dropped_keys.get() > 0
    }

    fn drain(&self) -> Vec<(&'static str, u64)> {
        vec![("dropped_keys", self.dropped_keys.take())]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoreConfig;
    use crate::plugin_channel::PluginChannel;
    use std::sync::Mutex;

    fn started(cache_limit: usize) -> (CountProcessor, Arc<Mutex<Vec<(String, f64)>>>) {
        let output = Arc::new(PluginChannel::new("output"));
        let emitted = Arc::new(Mutex::new(Vec::new()));

        let sink = emitted.clone();
        // Leak the subscription for the lifetime of the test channel.
        std::mem::forget(output.subscribe_metrics(move |m| {
            sink.lock().unwrap().push((m.key.clone(), m.value));
            Ok(())
        }));

        let mut processor = CountProcessor::new(cache_limit);
        processor.start(CoreEmitter::new(CoreConfig::default(), output));
        (processor, emitted)
    }

    #[test]
    fn emits_running_sums_per_key() {
        let (mut processor, emitted) = started(10);

        for (key, value) in [("x", 1.0), ("x", 2.0), ("y", 5.0), ("x", 3.0)] {
            processor.process(&Metric::new(key, value));
        }

        assert_eq!(
            *emitted.lock().unwrap(),
            vec![
                ("x".to_string(), 1.0),
                ("x".to_string(), 3.0),
                ("y".to_string(), 5.0),
                ("x".to_string(), 6.0),
            ]
        );
    }

    #[test]
    fn new_keys_beyond_capacity_are_dropped() {
        let (mut processor, emitted) = started(2);

        processor.process(&Metric::new("a", 1.0));
        processor.process(&Metric::new("b", 1.0));
        processor.process(&Metric::new("c", 1.0));
        // Known keys keep accumulating at capacity.
        processor.process(&Metric::new("a", 1.0));

        let emitted = emitted.lock().unwrap();
        assert_eq!(emitted.len(), 3);
        assert_eq!(emitted[2], ("a".to_string(), 2.0));

        let reporter = processor.reporter().unwrap();
        assert!(reporter.report_some());
        assert_eq!(reporter.drain(), vec![("dropped_keys", 1)]);
    }

    #[test]
    fn process_before_start_is_a_noop() {
        let mut processor = CountProcessor::new(10);
        processor.process(&Metric::new("x", 1.0));
        assert!(processor.cache.is_empty());
    }
}
