//! Output plugin that writes items to the structured log.
//!
//! Useful as a terminal sink when no downstream fabric is available, and
//! as a way to watch a pipeline without extra tooling.
use super::{OutputInstance, OutputSink, PluginDescriptor, PluginInstance, SubscriptionSet};
use crate::config::PluginConfig;
use crate::plugin_channel::PluginChannel;
use crate::reporter::{Counter, Reporter};
use crate::Result;
use std::sync::Arc;
use tracing::info;

pub fn descriptor() -> PluginDescriptor {
    PluginDescriptor {
        name: "log",
        setup_input: None,
        setup_output: Some(setup_output),
        setup_tunnel: None,
        source: module_path!(),
    }
}

fn setup_output(_config: &PluginConfig) -> Result<PluginInstance> {
    Ok(PluginInstance::Output(OutputInstance::new(
        "log",
        OutputSink::Log(LogSink::new()),
    )))
}

pub struct LogSink {
    subscriptions: SubscriptionSet,
    stats: Arc<LogStats>,
}

#[derive(Default)]
struct LogStats {
    sent_events: Counter,
    sent_metrics: Counter,
}

impl LogSink {
    pub fn new() -> Self {
        LogSink {
            subscriptions: SubscriptionSet::new(),
            stats: Arc::new(LogStats::default()),
        }
    }

    pub fn start(&self, output: &PluginChannel) {
        let stats = self.stats.clone();
        self.subscriptions.push(output.subscribe_events(move |event| {
            stats.sent_events.increment(1);
            info!(key = %event.key, state = ?event.state, value = ?event.value, "event");
            Ok(())
        }));

        let stats = self.stats.clone();
        self.subscriptions.push(output.subscribe_metrics(move |metric| {
            stats.sent_metrics.increment(1);
            info!(key = %metric.key, value = %metric.value, "metric");
            Ok(())
        }));
    }

    pub fn reporter(&self) -> Arc<dyn Reporter> {
        self.stats.clone()
    }
}

impl Default for LogSink {
    fn default() -> Self {
        Self::new()
    }
}

impl Reporter for LogStats {
    fn label(&self) -> String {
        "log".to_string()
    }

    fn report_some(&self) -> bool {
        self.sent_events.get() > 0 || self.sent_metrics.get() > 0
    }

    fn drain(&self) -> Vec<(&'static str, u64)> {
        vec![
            ("sent_events", self.sent_events.take()),
            ("sent_metrics", self.sent_metrics.take()),
        ]
    }
}
