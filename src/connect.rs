//! Reconnecting outbound client.
//!
//! A `ConnectClient` owns all traffic towards one downstream peer: the
//! socket, the reconnect loop, outbound admission, and (in buffered mode)
//! the flush scheduler. Subscriber callbacks never touch the socket
//! directly; they enqueue serialized bytes which a single connection task
//! drains to the peer.
use crate::channel::Subscription;
use crate::event::{Event, Metric};
use crate::handler::Handler;
use crate::plugin_channel::PluginChannel;
use crate::protocol::{BoxedStream, Dialer};
use crate::reporter::{Counter, Reporter};
use crate::shutdown::Lifeline;
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{broadcast, Notify};
use tokio::time;
use tracing::{error, info, warn};

/// First reconnect delay; doubles per consecutive failed attempt.
const INITIAL_RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// Upper bound on the reconnect delay. The delay would otherwise double
/// without limit.
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(300);

#[derive(Debug, Default)]
struct ConnectCounters {
    sent_events: Counter,
    sent_metrics: Counter,
    dropped_events: Counter,
    dropped_metrics: Counter,
    failed_flushes: Counter,
}

struct State {
    /// The TCP session is established.
    open: bool,
    /// User-initiated teardown in progress; suppresses reconnects.
    closing: bool,
    /// Delay before the next reconnect attempt.
    reconnect_delay: Duration,
    /// Serialized bytes admitted but not yet written to the socket.
    outbound: VecDeque<Bytes>,
    outbound_bytes: usize,
    /// Populated only in buffered mode, between flushes.
    event_buffer: Vec<Event>,
    metric_buffer: Vec<Metric>,
}

struct Shared {
    dialer: Dialer,
    peer: String,
    handler: Box<dyn Handler>,
    flush_period: Duration,
    outbound_limit: usize,
    state: Mutex<State>,
    /// Wakes the connection task when bytes are queued or teardown begins.
    wake: Notify,
    counters: ConnectCounters,
}

/// Why the drive loop over one established socket ended.
enum Driven {
    /// `close()` was requested; do not reconnect.
    Closing,
    /// The socket died; take the reconnect path.
    Lost,
}

/// Owns one outbound peer. See the module docs.
pub struct ConnectClient {
    shared: Arc<Shared>,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl std::fmt::Debug for ConnectClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectClient")
            .field("peer", &self.shared.peer)
            .finish()
    }
}

impl ConnectClient {
    /// Create a client for `dialer`, serializing through `handler`.
    ///
    /// `flush_period == 0` selects streaming mode: every item is written
    /// as it arrives. Any other value selects buffered mode with one flush
    /// per period. The mode is fixed for the lifetime of the client.
    pub fn new(
        dialer: Dialer,
        handler: Box<dyn Handler>,
        flush_period: Duration,
        outbound_limit: usize,
    ) -> Self {
        let peer = dialer.to_string();
        ConnectClient {
            shared: Arc::new(Shared {
                dialer,
                peer,
                handler,
                flush_period,
                outbound_limit,
                state: Mutex::new(State {
                    open: false,
                    closing: false,
                    reconnect_delay: INITIAL_RECONNECT_DELAY,
                    outbound: VecDeque::new(),
                    outbound_bytes: 0,
                    event_buffer: Vec::new(),
                    metric_buffer: Vec::new(),
                }),
                wake: Notify::new(),
                counters: ConnectCounters::default(),
            }),
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    /// Begin connecting and subscribe to the output channel.
    ///
    /// The shutdown broadcast doubles as the process-exit hook: when it
    /// fires, the connection is closed cleanly and never reopened.
    pub fn start(&self, output: &PluginChannel, notify: &broadcast::Sender<()>) {
        let shared = self.shared.clone();
        let lifeline = Lifeline::new(notify);
        tokio::spawn(async move {
            shared.run_connection(lifeline).await;
        });

        let mut subscriptions = self.subscriptions.lock().unwrap();
        if self.shared.flush_period.is_zero() {
            // Streaming mode: serialize and admit per item.
            let shared = self.shared.clone();
            subscriptions.push(output.subscribe_events(move |event| {
                shared.handle_event(event);
                Ok(())
            }));
            let shared = self.shared.clone();
            subscriptions.push(output.subscribe_metrics(move |metric| {
                shared.handle_metric(metric);
                Ok(())
            }));
        } else {
            // Buffered mode: collect between timer fires.
            let shared = self.shared.clone();
            subscriptions.push(output.subscribe_events(move |event| {
                shared.buffer_event(event.clone());
                Ok(())
            }));
            let shared = self.shared.clone();
            subscriptions.push(output.subscribe_metrics(move |metric| {
                shared.buffer_metric(metric.clone());
                Ok(())
            }));

            let shared = self.shared.clone();
            let mut lifeline = Lifeline::new(notify);
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = time::sleep(shared.flush_period) => shared.flush(),
                        _ = lifeline.stopped() => return,
                    }
                }
            });
        }
    }

    /// Initiate teardown. Idempotent; once called, no reconnect is ever
    /// scheduled again.
    pub fn close(&self) {
        self.shared.begin_close();
    }

    /// Whether the session is currently established.
    pub fn is_open(&self) -> bool {
        self.shared.state.lock().unwrap().open
    }

    pub fn peer(&self) -> &str {
        &self.shared.peer
    }

    /// The counters this client surfaces to the statistics pipeline.
    pub fn reporter(&self) -> Arc<dyn Reporter> {
        self.shared.clone()
    }

    #[cfg(test)]
    pub(crate) fn flush_now(&self) {
        self.shared.flush();
    }

    #[cfg(test)]
    pub(crate) fn reconnect_delay(&self) -> Duration {
        self.shared.state.lock().unwrap().reconnect_delay
    }
}

impl Shared {
    fn writable(&self, state: &State) -> bool {
        state.open && state.outbound_bytes < self.outbound_limit
    }

    fn enqueue(&self, state: &mut State, bytes: Bytes) {
        state.outbound_bytes += bytes.len();
        state.outbound.push_back(bytes);
        self.wake.notify_one();
    }

    /// Streaming-mode event path: drop when not writable, otherwise
    /// serialize and admit. A serialization failure loses the item.
    fn handle_event(&self, event: &Event) {
        let mut state = self.state.lock().unwrap();
        if !self.writable(&state) {
            self.counters.dropped_events.increment(1);
            return;
        }
        match self.handler.serialize_event(event) {
            Ok(bytes) => {
                self.enqueue(&mut state, bytes);
                self.counters.sent_events.increment(1);
            }
            Err(e) => error!(error = %e, "Failed to handle event"),
        }
    }

    /// Streaming-mode metric path; mirrors `handle_event`.
    fn handle_metric(&self, metric: &Metric) {
        let mut state = self.state.lock().unwrap();
        if !self.writable(&state) {
            self.counters.dropped_metrics.increment(1);
            return;
        }
        match self.handler.serialize_metric(metric) {
            Ok(bytes) => {
                self.enqueue(&mut state, bytes);
                self.counters.sent_metrics.increment(1);
            }
            Err(e) => error!(error = %e, "Failed to handle metric"),
        }
    }

    fn buffer_event(&self, event: Event) {
        self.state.lock().unwrap().event_buffer.push(event);
    }

    fn buffer_metric(&self, metric: Metric) {
        self.state.lock().unwrap().metric_buffer.push(metric);
    }

    /// Buffered-mode flush. The buffers are emptied on every invocation,
    /// success or not; a batch that cannot be written is dropped.
    fn flush(&self) {
        let mut state = self.state.lock().unwrap();
        let events = std::mem::take(&mut state.event_buffer);
        let metrics = std::mem::take(&mut state.metric_buffer);

        if events.is_empty() && metrics.is_empty() {
            return;
        }

        if !self.writable(&state) {
            self.counters.dropped_events.increment(events.len() as u64);
            self.counters.dropped_metrics.increment(metrics.len() as u64);
            return;
        }

        match self.handler.serialize_all(&events, &metrics) {
            Ok(bytes) => {
                self.enqueue(&mut state, bytes);
                self.counters.sent_events.increment(events.len() as u64);
                self.counters.sent_metrics.increment(metrics.len() as u64);
            }
            Err(e) => {
                self.counters.failed_flushes.increment(1);
                error!(error = %e, "Failed to flush");
            }
        }
    }

    fn begin_close(&self) {
        let mut state = self.state.lock().unwrap();
        if state.closing {
            return;
        }
        state.closing = true;
        drop(state);
        self.wake.notify_one();
    }

    /// Mark the session established: reset the backoff and log.
    fn mark_connected(&self) {
        let mut state = self.state.lock().unwrap();
        state.open = true;
        state.reconnect_delay = INITIAL_RECONNECT_DELAY;
        drop(state);
        info!("Connected {}", self.peer);
    }

    /// Mark the session gone. Bytes queued for the dead socket go with it;
    /// they were accounted at admission time.
    fn mark_disconnected(&self) {
        let mut state = self.state.lock().unwrap();
        state.open = false;
        state.outbound.clear();
        state.outbound_bytes = 0;
    }

    /// Take the current reconnect delay and double it for next time.
    /// Returns `None` once teardown has begun.
    fn take_backoff_delay(&self) -> Option<Duration> {
        let mut state = self.state.lock().unwrap();
        if state.closing {
            return None;
        }
        let delay = state.reconnect_delay;
        state.reconnect_delay = (delay * 2).min(MAX_RECONNECT_DELAY);
        Some(delay)
    }

    fn is_closing(&self) -> bool {
        self.state.lock().unwrap().closing
    }

    /// The connect/drive/reconnect loop. Exactly one of these runs per
    /// client, so at most one socket is live and at most one reconnect
    /// sleep is pending at any time.
    async fn run_connection(self: Arc<Self>, mut lifeline: Lifeline) {
        loop {
            if self.is_closing() {
                return;
            }

            let dialed = tokio::select! {
                dialed = self.dialer.dial() => dialed,
                _ = lifeline.stopped() => {
                    self.begin_close();
                    return;
                }
                _ = self.wake.notified() => continue,
            };

            let mut stream = match dialed {
                Ok(stream) => stream,
                Err(e) => {
                    if !self.backoff(&mut lifeline, Some(&e)).await {
                        return;
                    }
                    continue;
                }
            };

            self.mark_connected();
            let outcome = self.drive(&mut stream, &mut lifeline).await;
            self.mark_disconnected();

            match outcome {
                Driven::Closing => {
                    info!("Disconnected");
                    return;
                }
                Driven::Lost => {
                    if !self.backoff(&mut lifeline, None).await {
                        return;
                    }
                }
            }
        }
    }

    /// Sleep out the current backoff delay. Returns `false` when the
    /// client should stop reconnecting.
    async fn backoff(&self, lifeline: &mut Lifeline, cause: Option<&std::io::Error>) -> bool {
        let Some(delay) = self.take_backoff_delay() else {
            info!("Disconnected");
            return false;
        };

        match cause {
            Some(e) => {
                warn!(error = %e, "Disconnected, reconnecting in {}s", delay.as_secs())
            }
            None => warn!("Disconnected, reconnecting in {}s", delay.as_secs()),
        }

        tokio::select! {
            _ = time::sleep(delay) => !self.is_closing(),
            _ = lifeline.stopped() => {
                self.begin_close();
                false
            }
        }
    }

    /// Write queued bytes to the established socket until it dies or
    /// teardown begins. Also watches the read side so a peer close is
    /// noticed while the queue is idle.
    async fn drive(&self, stream: &mut BoxedStream, lifeline: &mut Lifeline) -> Driven {
        loop {
            let chunk = {
                let mut state = self.state.lock().unwrap();
                if state.closing {
                    return Driven::Closing;
                }
                let chunk = state.outbound.pop_front();
                if let Some(bytes) = &chunk {
                    state.outbound_bytes -= bytes.len();
                }
                chunk
            };

            match chunk {
                Some(bytes) => {
                    if let Err(e) = stream.write_all(&bytes).await {
                        error!(error = %e, "Failed to write to {}", self.peer);
                        return Driven::Lost;
                    }
                    if let Err(e) = stream.flush().await {
                        error!(error = %e, "Failed to write to {}", self.peer);
                        return Driven::Lost;
                    }
                }
                None => {
                    let mut probe = [0u8; 512];
                    tokio::select! {
                        _ = self.wake.notified() => {}
                        _ = lifeline.stopped() => {
                            self.begin_close();
                            return Driven::Closing;
                        }
                        read = stream.read(&mut probe) => match read {
                            // Anything the peer sends back is discarded;
                            // zero or an error means the socket is gone.
                            Ok(0) | Err(_) => return Driven::Lost,
                            Ok(_) => {}
                        },
                    }
                }
            }
        }
    }
}

impl Reporter for Shared {
    fn label(&self) -> String {
        format!("connect/{}", self.peer)
    }

    fn report_some(&self) -> bool {
        let c = &self.counters;
        c.sent_events.get() > 0
            || c.sent_metrics.get() > 0
            || c.dropped_events.get() > 0
            || c.dropped_metrics.get() > 0
            || c.failed_flushes.get() > 0
    }

    fn drain(&self) -> Vec<(&'static str, u64)> {
        let c = &self.counters;
        vec![
            ("sent_events", c.sent_events.take()),
            ("sent_metrics", c.sent_metrics.take()),
            ("dropped_events", c.dropped_events.take()),
            ("dropped_metrics", c.dropped_metrics.take()),
            ("failed_flushes", c.failed_flushes.take()),
        ]
    }
}
