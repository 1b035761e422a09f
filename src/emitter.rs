//! Stamps core defaults onto outgoing items.
use crate::config::CoreConfig;
use crate::event::{unix_now, Event, Metric};
use crate::plugin_channel::PluginChannel;
use std::sync::Arc;

/// Fills in whatever an item is missing from the `core` configuration and
/// publishes it onto the output channel. Cheap to clone; processors each
/// hold one.
#[derive(Clone)]
pub struct CoreEmitter {
    inner: Arc<Inner>,
}

struct Inner {
    config: CoreConfig,
    output: Arc<PluginChannel>,
}

impl std::fmt::Debug for CoreEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreEmitter")
            .field("output", &self.inner.output.id())
            .finish()
    }
}

impl CoreEmitter {
    pub fn new(config: CoreConfig, output: Arc<PluginChannel>) -> Self {
        CoreEmitter {
            inner: Arc::new(Inner { config, output }),
        }
    }

    pub fn emit_event(&self, event: &Event) {
        let config = &self.inner.config;
        let mut event = event.clone();
        if event.time.is_none() {
            event.time = Some(unix_now());
        }
        if event.host.is_none() {
            event.host = config.host.clone();
        }
        if event.tags.is_empty() {
            event.tags = config.tags.clone();
        }
        if event.attributes.is_empty() {
            event.attributes = config.attributes.clone();
        }
        if event.ttl.is_none() {
            event.ttl = config.ttl;
        }
        self.inner.output.event(&event);
    }

    pub fn emit_metric(&self, metric: &Metric) {
        let config = &self.inner.config;
        let mut metric = metric.clone();
        if metric.time.is_none() {
            metric.time = Some(unix_now());
        }
        if metric.host.is_none() {
            metric.host = config.host.clone();
        }
        if metric.tags.is_empty() {
            metric.tags = config.tags.clone();
        }
        if metric.attributes.is_empty() {
            metric.attributes = config.attributes.clone();
        }
        self.inner.output.metric(&metric);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn emitter_with_sink() -> (CoreEmitter, Arc<Mutex<Vec<Metric>>>, Arc<Mutex<Vec<Event>>>) {
        let output = Arc::new(PluginChannel::new("output"));
        let metrics = Arc::new(Mutex::new(Vec::new()));
        let events = Arc::new(Mutex::new(Vec::new()));

        let sink = metrics.clone();
        std::mem::forget(output.subscribe_metrics(move |m| {
            sink.lock().unwrap().push(m.clone());
            Ok(())
        }));
        let sink = events.clone();
        std::mem::forget(output.subscribe_events(move |e| {
            sink.lock().unwrap().push(e.clone());
            Ok(())
        }));

        let config = CoreConfig {
            host: Some("agent-host".to_string()),
            tags: ["ffwd"].iter().map(|s| s.to_string()).collect(),
            attributes: [("dc".to_string(), "eu-1".to_string())].into_iter().collect(),
            ttl: Some(300),
        };
        (CoreEmitter::new(config, output), metrics, events)
    }

    #[test]
    fn missing_fields_take_core_defaults() {
        let (emitter, metrics, events) = emitter_with_sink();

        emitter.emit_metric(&Metric::new("m", 1.0));
        emitter.emit_event(&Event::new("e"));

        let metric = &metrics.lock().unwrap()[0];
        assert_eq!(metric.host.as_deref(), Some("agent-host"));
        assert!(metric.tags.contains("ffwd"));
        assert!(metric.time.is_some());

        let event = &events.lock().unwrap()[0];
        assert_eq!(event.host.as_deref(), Some("agent-host"));
        assert_eq!(event.ttl, Some(300));
        assert_eq!(event.attributes.get("dc").map(String::as_str), Some("eu-1"));
    }

    #[test]
    fn present_fields_are_preserved() {
        let (emitter, metrics, _) = emitter_with_sink();

        let mut metric = Metric::new("m", 1.0);
        metric.host = Some("origin".to_string());
        metric.time = Some(1_700_000_000);
        emitter.emit_metric(&metric);

        let seen = &metrics.lock().unwrap()[0];
        assert_eq!(seen.host.as_deref(), Some("origin"));
        assert_eq!(seen.time, Some(1_700_000_000));
    }
}
