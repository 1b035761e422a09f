//! Named metric aggregation.
//!
//! A processor is a stateful transform fed by the core dispatcher with the
//! metrics whose `proc` tag names it. Whatever a processor derives goes
//! back out through the emitter it was started with.
use crate::config::ProcessorOptions;
use crate::emitter::CoreEmitter;
use crate::event::Metric;
use crate::reporter::Reporter;
use crate::{Error, Result};
use std::collections::BTreeMap;
use std::sync::Arc;

pub mod count;
pub mod rate;

pub use count::CountProcessor;
pub use rate::RateProcessor;

pub trait Processor: Send {
    /// The name this processor is registered under.
    fn name(&self) -> &'static str;

    /// Hand over the emitter. Windowed processors arm their timers here.
    fn start(&mut self, emitter: CoreEmitter);

    /// Consume one routed metric.
    fn process(&mut self, metric: &Metric);

    /// Tear down anything `start` armed.
    fn stop(&mut self) {}

    /// Counters to surface through the statistics pipeline, if any.
    fn reporter(&self) -> Option<Arc<dyn Reporter>> {
        None
    }
}

pub type ProcessorFactory = fn(&ProcessorOptions) -> Box<dyn Processor>;

/// Name-keyed processor factories, fixed after startup.
pub struct ProcessorRegistry {
    entries: BTreeMap<&'static str, ProcessorFactory>,
}

impl ProcessorRegistry {
    /// The registry with every bundled processor.
    pub fn builtin() -> Self {
        let mut entries = BTreeMap::new();
        entries.insert("count", count::factory as ProcessorFactory);
        entries.insert("rate", rate::factory as ProcessorFactory);
        ProcessorRegistry { entries }
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.entries.keys().copied()
    }

    pub fn create(&self, name: &str, options: &ProcessorOptions) -> Result<Box<dyn Processor>> {
        let factory = self
            .entries
            .get(name)
            .ok_or_else(|| Error::UnknownProcessor(name.to_string()))?;
        Ok(factory(options))
    }

    /// Instantiate every registered processor, applying per-name options
    /// where configured and the defaults everywhere else.
    pub fn create_all(
        &self,
        options: &BTreeMap<String, ProcessorOptions>,
    ) -> BTreeMap<String, Box<dyn Processor>> {
        self.entries
            .iter()
            .map(|(name, factory)| {
                let opts = options.get(*name).cloned().unwrap_or_default();
                (name.to_string(), factory(&opts))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_registry_has_the_reference_processors() {
        let registry = ProcessorRegistry::builtin();
        let names: Vec<_> = registry.names().collect();
        assert_eq!(names, vec!["count", "rate"]);

        assert!(registry
            .create("count", &ProcessorOptions::default())
            .is_ok());
        assert!(matches!(
            registry.create("median", &ProcessorOptions::default()),
            Err(Error::UnknownProcessor(_))
        ));
    }

    #[test]
    fn create_all_applies_per_name_options() {
        let registry = ProcessorRegistry::builtin();
        let mut options = BTreeMap::new();
        options.insert(
            "count".to_string(),
            ProcessorOptions {
                cache_limit: 3,
                ..Default::default()
            },
        );

        let processors = registry.create_all(&options);
        assert_eq!(processors.len(), 2);
        assert!(processors.contains_key("count"));
        assert!(processors.contains_key("rate"));
    }
}
