//! The `rate` processor: windowed per-second rates.
use super::Processor;
use crate::config::ProcessorOptions;
use crate::emitter::CoreEmitter;
use crate::event::Metric;
use crate::reporter::{Counter, Reporter};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time;

pub fn factory(options: &ProcessorOptions) -> Box<dyn Processor> {
    Box::new(RateProcessor::new(
        options.cache_limit,
        Duration::from_secs(options.period),
    ))
}

/// Accumulates routed metrics per key and, once per period, emits
/// `<key>.rate` carrying the accumulated value divided by the period.
///
/// The window is emptied on every emission; keys that stay quiet simply
/// disappear until they are seen again. The key space between emissions is
/// bounded by `cache_limit` like the other processors.
pub struct RateProcessor {
    shared: Arc<RateShared>,
    period: Duration,
    timer: Option<JoinHandle<()>>,
}

struct RateShared {
    cache: Mutex<HashMap<String, f64>>,
    cache_limit: usize,
    stats: RateStats,
}

#[derive(Default)]
struct RateStats {
    dropped_keys: Counter,
}

impl RateProcessor {
    pub fn new(cache_limit: usize, period: Duration) -> Self {
        RateProcessor {
            shared: Arc::new(RateShared {
                cache: Mutex::new(HashMap::new()),
                cache_limit,
                stats: RateStats::default(),
            }),
            period,
            timer: None,
        }
    }
}

impl Processor for RateProcessor {
    fn name(&self) -> &'static str {
        "rate"
    }

    fn start(&mut self, emitter: CoreEmitter) {
        let shared = self.shared.clone();
        let period = self.period;
        self.timer = Some(tokio::spawn(async move {
            loop {
                time::sleep(period).await;

                let drained: Vec<(String, f64)> = {
                    let mut cache = shared.cache.lock().unwrap();
                    std::mem::take(&mut *cache).into_iter().collect()
                };

                for (key, sum) in drained {
                    let rate = sum / period.as_secs_f64();
                    emitter.emit_metric(&Metric::new(format!("{key}.rate"), rate));
                }
            }
        }));
    }

    fn process(&mut self, metric: &Metric) {
        let mut cache = self.shared.cache.lock().unwrap();
        let cache_len = cache.len();
        match cache.get_mut(&metric.key) {
            Some(sum) => *sum += metric.value,
            None if cache_len >= self.shared.cache_limit => {
                self.shared.stats.dropped_keys.increment(1);
            }
            None => {
                cache.insert(metric.key.clone(), metric.value);
            }
        }
    }

    fn stop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }

    fn reporter(&self) -> Option<Arc<dyn Reporter>> {
        Some(self.shared.clone())
    }
}

impl Reporter for RateShared {
    fn label(&self) -> String {
        "processor/rate".to_string()
    }

    fn report_some(&self) -> bool {
        self.stats.dropped_keys.get() > 0
    }

    fn drain(&self) -> Vec<(&'static str, u64)> {
        vec![("dropped_keys", self.stats.dropped_keys.take())]
    }
}
