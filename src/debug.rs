//! Debug taps on the core channels.
use crate::channel::Subscription;
use crate::plugin_channel::PluginChannel;
use std::sync::Mutex;
use tracing::debug;

/// Subscribes a logging monitor to each attached channel.
pub struct DebugMonitor {
    subscriptions: Mutex<Vec<Subscription>>,
}

impl DebugMonitor {
    pub fn new() -> Self {
        DebugMonitor {
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    /// Log every item the channel publishes, tagged with its id.
    pub fn attach(&self, channel: &PluginChannel) {
        let mut subscriptions = self.subscriptions.lock().unwrap();

        let id = channel.id().to_string();
        subscriptions.push(channel.subscribe_events(move |event| {
            debug!(channel = %id, event = ?event, "monitor");
            Ok(())
        }));

        let id = channel.id().to_string();
        subscriptions.push(channel.subscribe_metrics(move |metric| {
            debug!(channel = %id, metric = ?metric, "monitor");
            Ok(())
        }));
    }
}

impl Default for DebugMonitor {
    fn default() -> Self {
        Self::new()
    }
}
