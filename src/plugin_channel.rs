//! Paired event/metric channels with a start/stop lifecycle.
use crate::channel::{Channel, Subscription};
use crate::event::{Event, Metric};
use crate::Result;
use std::sync::Mutex;
use tracing::error;

/// Lifecycle states of a [`PluginChannel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Initial,
    Starting,
    Started,
    Stopping,
    Stopped,
}

type Hook = Box<dyn FnOnce() -> Result<()> + Send>;

struct Hooks {
    state: Lifecycle,
    starting: Vec<Hook>,
    stopping: Vec<Hook>,
}

/// The in-process bus between inputs, the core pipeline, and outputs.
///
/// Two single-topic channels (events, metrics) plus one-shot lifecycle
/// hooks. After `stop()` all subscriptions are dropped and further
/// publishes on either topic are no-ops.
pub struct PluginChannel {
    id: String,
    events: Channel<Event>,
    metrics: Channel<Metric>,
    hooks: Mutex<Hooks>,
}

impl std::fmt::Debug for PluginChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginChannel")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

impl PluginChannel {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        PluginChannel {
            events: Channel::new(format!("{id}-events")),
            metrics: Channel::new(format!("{id}-metrics")),
            id,
            hooks: Mutex::new(Hooks {
                state: Lifecycle::Initial,
                starting: Vec::new(),
                stopping: Vec::new(),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> Lifecycle {
        self.hooks.lock().unwrap().state
    }

    /// The event topic.
    pub fn events(&self) -> &Channel<Event> {
        &self.events
    }

    /// The metric topic.
    pub fn metrics(&self) -> &Channel<Metric> {
        &self.metrics
    }

    /// Publish one event.
    pub fn event(&self, event: &Event) {
        self.events.publish(event);
    }

    /// Publish one metric.
    pub fn metric(&self, metric: &Metric) {
        self.metrics.publish(metric);
    }

    /// Subscribe to the event topic.
    pub fn subscribe_events<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&Event) -> Result<()> + Send + Sync + 'static,
    {
        self.events.subscribe(callback)
    }

    /// Subscribe to the metric topic.
    pub fn subscribe_metrics<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&Metric) -> Result<()> + Send + Sync + 'static,
    {
        self.metrics.subscribe(callback)
    }

    /// Register a one-shot hook to run when the channel starts.
    ///
    /// If the channel has already started, the hook runs immediately; on a
    /// stopping or stopped channel it is discarded.
    pub fn starting<F>(&self, hook: F)
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        let state = {
            let mut hooks = self.hooks.lock().unwrap();
            match hooks.state {
                Lifecycle::Initial | Lifecycle::Starting => {
                    hooks.starting.push(Box::new(hook));
                    return;
                }
                state => state,
            }
        };
        if state == Lifecycle::Started {
            self.run_hook(hook(), "starting");
        }
    }

    /// Register a one-shot hook to run when the channel stops.
    ///
    /// If the channel has already stopped, the hook runs immediately.
    pub fn stopping<F>(&self, hook: F)
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        {
            let mut hooks = self.hooks.lock().unwrap();
            if hooks.state != Lifecycle::Stopped {
                hooks.stopping.push(Box::new(hook));
                return;
            }
        }
        self.run_hook(hook(), "stopping");
    }

    /// Walk the starting hooks in registration order and mark the channel
    /// started. Hook failures are isolated like subscriber failures; hooks
    /// registered by a running hook are picked up in the same pass.
    pub fn start(&self) {
        {
            let mut hooks = self.hooks.lock().unwrap();
            if hooks.state != Lifecycle::Initial {
                return;
            }
            hooks.state = Lifecycle::Starting;
        }

        loop {
            let pending = {
                let mut hooks = self.hooks.lock().unwrap();
                if hooks.starting.is_empty() {
                    hooks.state = Lifecycle::Started;
                    return;
                }
                std::mem::take(&mut hooks.starting)
            };
            for hook in pending {
                self.run_hook(hook(), "starting");
            }
        }
    }

    /// Walk the stopping hooks in reverse registration order, then drop
    /// every subscription. Later publishes are no-ops.
    pub fn stop(&self) {
        {
            let mut hooks = self.hooks.lock().unwrap();
            match hooks.state {
                Lifecycle::Stopping | Lifecycle::Stopped => return,
                _ => hooks.state = Lifecycle::Stopping,
            }
        }

        // Teardown unwinds in the opposite order of setup.
        loop {
            let pending = {
                let mut hooks = self.hooks.lock().unwrap();
                if hooks.stopping.is_empty() {
                    break;
                }
                std::mem::take(&mut hooks.stopping)
            };
            for hook in pending.into_iter().rev() {
                self.run_hook(hook(), "stopping");
            }
        }

        self.events.close();
        self.metrics.close();
        self.hooks.lock().unwrap().state = Lifecycle::Stopped;
    }

    fn run_hook(&self, result: Result<()>, phase: &str) {
        if let Err(e) = result {
            error!(error = %e, "{}: {} hook failed", self.id, phase);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn start_runs_hooks_in_registration_order() {
        let chan = PluginChannel::new("input");
        let order = Arc::new(Mutex::new(Vec::new()));

        let a = order.clone();
        chan.starting(move || {
            a.lock().unwrap().push(1);
            Ok(())
        });
        let b = order.clone();
        chan.starting(move || {
            b.lock().unwrap().push(2);
            Ok(())
        });

        chan.start();
        assert_eq!(chan.state(), Lifecycle::Started);
        assert_eq!(*order.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn stop_runs_hooks_in_reverse_order_and_drops_subscribers() {
        let chan = PluginChannel::new("output");
        let order = Arc::new(Mutex::new(Vec::new()));

        let a = order.clone();
        chan.stopping(move || {
            a.lock().unwrap().push(1);
            Ok(())
        });
        let b = order.clone();
        chan.stopping(move || {
            b.lock().unwrap().push(2);
            Ok(())
        });

        let delivered = Arc::new(AtomicUsize::new(0));
        let count = delivered.clone();
        let _sub = chan.subscribe_metrics(move |_| {
            count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        chan.start();
        chan.stop();
        assert_eq!(chan.state(), Lifecycle::Stopped);
        assert_eq!(*order.lock().unwrap(), vec![2, 1]);

        chan.metric(&Metric::new("x", 1.0));
        assert_eq!(delivered.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn failing_hook_does_not_block_the_rest() {
        let chan = PluginChannel::new("input");
        let ran = Arc::new(AtomicUsize::new(0));

        chan.starting(|| Err(Error::Subscriber("nope".into())));
        let count = ran.clone();
        chan.starting(move || {
            count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        chan.start();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn hook_registered_after_start_runs_immediately() {
        let chan = PluginChannel::new("input");
        chan.start();

        let ran = Arc::new(AtomicUsize::new(0));
        let count = ran.clone();
        chan.starting(move || {
            count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn topics_are_independent() {
        let chan = PluginChannel::new("input");
        let events = Arc::new(AtomicUsize::new(0));
        let metrics = Arc::new(AtomicUsize::new(0));

        let e = events.clone();
        let _se = chan.subscribe_events(move |_| {
            e.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let m = metrics.clone();
        let _sm = chan.subscribe_metrics(move |_| {
            m.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        chan.event(&Event::new("e"));
        chan.metric(&Metric::new("m", 1.0));
        chan.metric(&Metric::new("m", 2.0));

        assert_eq!(events.load(Ordering::SeqCst), 1);
        assert_eq!(metrics.load(Ordering::SeqCst), 2);
    }
}
