//! Single-topic in-process pub/sub with synchronous fan-out.
use crate::Result;
use std::sync::{Arc, Mutex, Weak};
use tracing::error;

type Callback<T> = Arc<dyn Fn(&T) -> Result<()> + Send + Sync>;

/// One registered subscriber.
struct Subscriber<T> {
    /// Identifies the subscriber for targeted removal.
    token: u64,
    callback: Callback<T>,
}

struct ChannelState<T> {
    subscribers: Vec<Subscriber<T>>,
    /// Set once the owning channel is torn down. Publishing and subscribing
    /// become no-ops afterwards.
    closed: bool,
    next_token: u64,
}

/// A single-topic channel.
///
/// Publishing invokes every subscriber synchronously, in subscription
/// order, on the publishing task. A subscriber returning an error does not
/// suppress delivery to the remaining subscribers; the failure is logged
/// with the channel id and the fan-out continues.
///
/// The subscriber table is guarded by a `std::sync::Mutex`. The critical
/// sections are tiny and never await; callbacks run outside the lock so a
/// subscriber may subscribe or unsubscribe from within its own callback.
pub struct Channel<T> {
    /// Stable identity, fixed at construction. Used by log lines and the
    /// debug monitor.
    id: String,
    state: Arc<Mutex<ChannelState<T>>>,
}

impl<T> std::fmt::Debug for Channel<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel").field("id", &self.id).finish()
    }
}

/// Handle returned by [`Channel::subscribe`].
///
/// `unsubscribe` removes exactly the subscriber that produced the handle.
/// It is idempotent and holds only a weak reference to the channel, so it
/// is safe to call after the channel has been torn down.
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

impl Subscription {
    /// Remove the subscriber this handle was returned for.
    pub fn unsubscribe(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }

    /// A handle that never referred to a live subscriber.
    fn inert() -> Self {
        Subscription { cancel: None }
    }
}

impl<T: 'static> Channel<T> {
    /// Create a channel with the given identity.
    pub fn new(id: impl Into<String>) -> Self {
        Channel {
            id: id.into(),
            state: Arc::new(Mutex::new(ChannelState {
                subscribers: Vec::new(),
                closed: false,
                next_token: 0,
            })),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Append a subscriber; it will receive every subsequent publish until
    /// unsubscribed or the channel closes.
    ///
    /// Subscribing to a closed channel returns an inert handle.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&T) -> Result<()> + Send + Sync + 'static,
    {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return Subscription::inert();
        }

        let token = state.next_token;
        state.next_token += 1;
        state.subscribers.push(Subscriber {
            token,
            callback: Arc::new(callback),
        });

        let weak: Weak<Mutex<ChannelState<T>>> = Arc::downgrade(&self.state);
        Subscription {
            cancel: Some(Box::new(move || {
                if let Some(state) = weak.upgrade() {
                    let mut state = state.lock().unwrap();
                    state.subscribers.retain(|s| s.token != token);
                }
            })),
        }
    }

    /// Deliver `item` to every subscriber, in subscription order.
    ///
    /// Runs on the calling task; a failing subscriber is logged and
    /// isolated from the rest. Publishing with no subscribers, or after
    /// `close`, is a no-op.
    pub fn publish(&self, item: &T) {
        // Snapshot the callbacks so the fan-out runs without the lock held.
        let callbacks: Vec<Callback<T>> = {
            let state = self.state.lock().unwrap();
            if state.closed {
                return;
            }
            state.subscribers.iter().map(|s| s.callback.clone()).collect()
        };

        for callback in callbacks {
            if let Err(e) = callback(item) {
                error!(error = %e, "{}: Subscription failed", self.id);
            }
        }
    }

    /// Number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.state.lock().unwrap().subscribers.len()
    }

    /// Drop every subscriber and refuse further publishes.
    pub fn close(&self) {
        let mut state = self.state.lock().unwrap();
        state.closed = true;
        state.subscribers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn delivers_in_subscription_order() {
        let chan = Channel::<u32>::new("test");
        let seen = Arc::new(Mutex::new(Vec::new()));

        let a = seen.clone();
        let _s1 = chan.subscribe(move |v| {
            a.lock().unwrap().push(("a", *v));
            Ok(())
        });
        let b = seen.clone();
        let _s2 = chan.subscribe(move |v| {
            b.lock().unwrap().push(("b", *v));
            Ok(())
        });

        chan.publish(&1);
        chan.publish(&2);

        let seen = seen.lock().unwrap();
        assert_eq!(*seen, vec![("a", 1), ("b", 1), ("a", 2), ("b", 2)]);
    }

    #[test]
    fn failing_subscriber_does_not_suppress_others() {
        let chan = Channel::<u32>::new("test");
        let delivered = Arc::new(AtomicUsize::new(0));

        let _bad = chan.subscribe(|_| Err(Error::Subscriber("boom".into())));
        let count = delivered.clone();
        let _good = chan.subscribe(move |_| {
            count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        chan.publish(&7);
        chan.publish(&8);

        assert_eq!(delivered.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn unsubscribe_removes_exactly_one_and_is_idempotent() {
        let chan = Channel::<u32>::new("test");
        let delivered = Arc::new(AtomicUsize::new(0));

        let first = delivered.clone();
        let mut sub = chan.subscribe(move |_| {
            first.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let second = delivered.clone();
        let _keep = chan.subscribe(move |_| {
            second.fetch_add(10, Ordering::SeqCst);
            Ok(())
        });

        sub.unsubscribe();
        sub.unsubscribe();
        chan.publish(&0);

        assert_eq!(delivered.load(Ordering::SeqCst), 10);
        assert_eq!(chan.subscriber_count(), 1);
    }

    #[test]
    fn unsubscribe_after_close_is_safe() {
        let chan = Channel::<u32>::new("test");
        let mut sub = chan.subscribe(|_| Ok(()));
        chan.close();
        sub.unsubscribe();
        assert_eq!(chan.subscriber_count(), 0);
    }

    #[test]
    fn publish_and_subscribe_after_close_are_noops() {
        let chan = Channel::<u32>::new("test");
        chan.close();

        let delivered = Arc::new(AtomicUsize::new(0));
        let count = delivered.clone();
        let _sub = chan.subscribe(move |_| {
            count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        chan.publish(&1);

        assert_eq!(delivered.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn subscriber_may_unsubscribe_itself_during_fanout() {
        let chan = Arc::new(Channel::<u32>::new("test"));
        let delivered = Arc::new(AtomicUsize::new(0));

        let sub = Arc::new(Mutex::new(None::<Subscription>));
        let slot = sub.clone();
        let count = delivered.clone();
        let handle = chan.subscribe(move |_| {
            count.fetch_add(1, Ordering::SeqCst);
            if let Some(mut s) = slot.lock().unwrap().take() {
                s.unsubscribe();
            }
            Ok(())
        });
        *sub.lock().unwrap() = Some(handle);

        chan.publish(&1);
        chan.publish(&2);

        assert_eq!(delivered.load(Ordering::SeqCst), 1);
    }
}
