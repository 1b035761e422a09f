//! Routes inbound items between processors and the emitter.
use crate::channel::Subscription;
use crate::emitter::CoreEmitter;
use crate::event::Metric;
use crate::plugin_channel::PluginChannel;
use crate::processor::Processor;
use crate::reporter::Reporter;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

/// The core dispatcher.
///
/// Subscribed to both input topics: events always pass straight through to
/// the emitter; a metric whose `proc` tag names a loaded processor is
/// handed to it, anything else passes through unchanged.
pub struct CoreProcessor {
    emitter: CoreEmitter,
    processors: Arc<BTreeMap<String, Mutex<Box<dyn Processor>>>>,
    reporters: Vec<Arc<dyn Reporter>>,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl CoreProcessor {
    pub fn new(emitter: CoreEmitter, processors: BTreeMap<String, Box<dyn Processor>>) -> Self {
        let reporters = processors
            .values()
            .filter_map(|p| p.reporter())
            .collect();
        let processors = processors
            .into_iter()
            .map(|(name, processor)| (name, Mutex::new(processor)))
            .collect();

        CoreProcessor {
            emitter,
            processors: Arc::new(processors),
            reporters,
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    /// Start every processor, then subscribe to the input channel.
    pub fn start(&self, input: &PluginChannel) {
        for processor in self.processors.values() {
            processor.lock().unwrap().start(self.emitter.clone());
        }

        let mut subscriptions = self.subscriptions.lock().unwrap();

        let emitter = self.emitter.clone();
        let processors = self.processors.clone();
        subscriptions.push(input.subscribe_metrics(move |metric| {
            route(&processors, &emitter, metric);
            Ok(())
        }));

        let emitter = self.emitter.clone();
        subscriptions.push(input.subscribe_events(move |event| {
            emitter.emit_event(event);
            Ok(())
        }));
    }

    pub fn stop(&self) {
        for processor in self.processors.values() {
            processor.lock().unwrap().stop();
        }
    }

    /// Counters collected from the loaded processors.
    pub fn reporters(&self) -> &[Arc<dyn Reporter>] {
        &self.reporters
    }

    pub fn processor_count(&self) -> usize {
        self.processors.len()
    }
}

fn route(
    processors: &BTreeMap<String, Mutex<Box<dyn Processor>>>,
    emitter: &CoreEmitter,
    metric: &Metric,
) {
    let processor = metric
        .proc
        .as_deref()
        .and_then(|name| processors.get(name));

    match processor {
        Some(processor) => processor.lock().unwrap().process(metric),
        // Unknown or absent proc tags are not an error.
        None => emitter.emit_metric(metric),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CoreConfig, ProcessorOptions};
    use crate::event::Event;
    use crate::processor::ProcessorRegistry;

    fn pipeline() -> (Arc<PluginChannel>, CoreProcessor, Arc<Mutex<Vec<Metric>>>) {
        let input = Arc::new(PluginChannel::new("input"));
        let output = Arc::new(PluginChannel::new("output"));

        let emitted = Arc::new(Mutex::new(Vec::new()));
        let sink = emitted.clone();
        std::mem::forget(output.subscribe_metrics(move |m| {
            sink.lock().unwrap().push(m.clone());
            Ok(())
        }));

        let emitter = CoreEmitter::new(CoreConfig::default(), output);
        let processors =
            ProcessorRegistry::builtin().create_all(&[("count".to_string(), ProcessorOptions::default())].into_iter().collect());
        let dispatcher = CoreProcessor::new(emitter, processors);
        dispatcher.start(&input);
        (input, dispatcher, emitted)
    }

    #[tokio::test]
    async fn routes_by_proc_tag() {
        let (input, dispatcher, emitted) = pipeline();

        input.metric(&Metric::new("x", 1.0).with_proc("count"));
        input.metric(&Metric::new("x", 2.0).with_proc("count"));

        let emitted = emitted.lock().unwrap();
        assert_eq!(emitted.len(), 2);
        assert_eq!(emitted[0].value, 1.0);
        assert_eq!(emitted[1].value, 3.0);
        dispatcher.stop();
    }

    #[tokio::test]
    async fn unknown_proc_passes_through_unchanged() {
        let (input, dispatcher, emitted) = pipeline();

        input.metric(&Metric::new("y", 7.0).with_proc("median"));

        let emitted = emitted.lock().unwrap();
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].key, "y");
        assert_eq!(emitted[0].value, 7.0);
        dispatcher.stop();
    }

    #[tokio::test]
    async fn events_always_pass_through() {
        let input = Arc::new(PluginChannel::new("input"));
        let output = Arc::new(PluginChannel::new("output"));

        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        std::mem::forget(output.subscribe_events(move |e| {
            sink.lock().unwrap().push(e.clone());
            Ok(())
        }));

        let emitter = CoreEmitter::new(CoreConfig::default(), output);
        let dispatcher = CoreProcessor::new(emitter, BTreeMap::new());
        dispatcher.start(&input);

        input.event(&Event::new("deploy"));
        assert_eq!(events.lock().unwrap().len(), 1);
        dispatcher.stop();
    }
}
