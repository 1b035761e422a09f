//! Inbound servers.
//!
//! A [`BindServer`] listens on a stream endpoint, spawning a framing task
//! per accepted peer; a [`DatagramServer`] does the same job for the
//! datagram families, one frame set per packet. Binding and accepting both
//! go through the [`Retrier`], so a busy port or a transient accept
//! failure delays the server instead of killing it.
use crate::connection::{decode_datagram, FrameDecoder, LineConnection};
use crate::plugin_channel::PluginChannel;
use crate::protocol::{Acceptor, BoxedStream, ListenEndpoint};
use crate::retrier::Retrier;
use crate::shutdown::Lifeline;
use crate::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Semaphore};
use tracing::{debug, error, info, warn};

/// Maximum number of concurrent inbound connections per server.
///
/// When the limit is reached the server stops accepting until an active
/// connection terminates.
const MAX_CONNECTIONS: usize = 250;

/// First delay between bind or accept attempts.
const RETRY_INITIAL_DELAY: Duration = Duration::from_secs(1);

/// Total time budget for retrying a bind or an accept before giving up.
const RETRY_TIMEOUT: Duration = Duration::from_secs(64);

/// Largest datagram the datagram server will receive.
const MAX_DATAGRAM: usize = 64 * 1024;

/// Accepts inbound stream connections and frames each peer.
pub struct BindServer {
    endpoint: ListenEndpoint,
    decoder: Arc<dyn FrameDecoder>,
    retrier: Retrier,
}

impl BindServer {
    pub fn new(endpoint: ListenEndpoint, decoder: Arc<dyn FrameDecoder>) -> Self {
        BindServer {
            endpoint,
            decoder,
            retrier: Retrier::new(RETRY_INITIAL_DELAY, RETRY_TIMEOUT),
        }
    }

    /// Bind (retrying on failure) and start accepting.
    ///
    /// Returns once the listener is bound; accepted peers are processed on
    /// spawned tasks whose lifelines carry `done` so the supervisor can
    /// drain them at shutdown.
    pub async fn start(
        &self,
        input: Arc<PluginChannel>,
        _output: Arc<PluginChannel>,
        notify: &broadcast::Sender<()>,
        done: &mpsc::Sender<()>,
    ) -> Result<()> {
        let endpoint_display = self.endpoint.to_string();
        let acceptor = self
            .retrier
            .run(
                || self.endpoint.bind_stream(),
                |attempt, e, delay| {
                    warn!(
                        error = %e,
                        "failed to bind {endpoint_display}, attempt {attempt}, retrying in {}s",
                        delay.as_secs()
                    );
                },
            )
            .await?;
        info!("Listening on {endpoint_display}");

        let mut listener = Listener {
            acceptor,
            display: endpoint_display,
            decoder: self.decoder.clone(),
            input,
            limit_connections: Arc::new(Semaphore::new(MAX_CONNECTIONS)),
            retrier: Retrier::new(RETRY_INITIAL_DELAY, RETRY_TIMEOUT),
            notify_shutdown: notify.clone(),
            shutdown_complete_tx: done.clone(),
        };

        let mut lifeline = Lifeline::new(notify);
        tokio::spawn(async move {
            tokio::select! {
                res = listener.run() => {
                    if let Err(err) = res {
                        error!(cause = %err, "failed to accept");
                    }
                }
                _ = lifeline.stopped() => {}
            }
        });

        Ok(())
    }
}

/// Accept-loop state for one bound stream endpoint.
struct Listener {
    acceptor: Acceptor,
    display: String,
    decoder: Arc<dyn FrameDecoder>,
    input: Arc<PluginChannel>,
    limit_connections: Arc<Semaphore>,
    retrier: Retrier,
    notify_shutdown: broadcast::Sender<()>,
    shutdown_complete_tx: mpsc::Sender<()>,
}

impl Listener {
    async fn run(&mut self) -> Result<()> {
        loop {
            // The permit returns to the semaphore when the connection
            // task drops it.
            let permit = self
                .limit_connections
                .clone()
                .acquire_owned()
                .await
                .unwrap();

            let (stream, peer) = self.accept().await?;
            debug!(%peer, "accepted inbound connection");

            let mut connection =
                LineConnection::new(stream, peer, self.decoder.clone(), self.input.clone());
            let mut lifeline =
                Lifeline::with_drain(&self.notify_shutdown, &self.shutdown_complete_tx);

            tokio::spawn(async move {
                if let Err(err) = connection.run(&mut lifeline).await {
                    error!(cause = %err, "connection error");
                }
                drop(permit);
            });
        }
    }

    /// Accept one peer. Transient failures retry with backoff; once the
    /// retry budget is spent the listener gives up with the last error.
    async fn accept(&self) -> Result<(BoxedStream, String)> {
        let endpoint_display = &self.display;
        self.retrier
            .run(
                || async { Ok(self.acceptor.accept().await?) },
                |attempt, e, delay| {
                    warn!(
                        error = %e,
                        "failed to accept on {endpoint_display}, attempt {attempt}, retrying in {}s",
                        delay.as_secs()
                    );
                },
            )
            .await
    }
}

/// Receives datagrams and decodes each as a set of frames.
pub struct DatagramServer {
    endpoint: ListenEndpoint,
    decoder: Arc<dyn FrameDecoder>,
    retrier: Retrier,
}

impl DatagramServer {
    pub fn new(endpoint: ListenEndpoint, decoder: Arc<dyn FrameDecoder>) -> Self {
        DatagramServer {
            endpoint,
            decoder,
            retrier: Retrier::new(RETRY_INITIAL_DELAY, RETRY_TIMEOUT),
        }
    }

    pub async fn start(
        &self,
        input: Arc<PluginChannel>,
        _output: Arc<PluginChannel>,
        notify: &broadcast::Sender<()>,
        done: &mpsc::Sender<()>,
    ) -> Result<()> {
        let endpoint_display = self.endpoint.to_string();
        let socket = self
            .retrier
            .run(
                || self.endpoint.bind_datagram(),
                |attempt, e, delay| {
                    warn!(
                        error = %e,
                        "failed to bind {endpoint_display}, attempt {attempt}, retrying in {}s",
                        delay.as_secs()
                    );
                },
            )
            .await?;
        info!("Listening on {endpoint_display}");

        let decoder = self.decoder.clone();
        let mut lifeline = Lifeline::with_drain(notify, done);
        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM];
            loop {
                tokio::select! {
                    received = socket.recv(&mut buf) => match received {
                        Ok(n) => decode_datagram(&buf[..n], &decoder, &input, &endpoint_display),
                        Err(err) => {
                            warn!(%err, "failed to receive datagram");
                        }
                    },
                    _ = lifeline.stopped() => return,
                }
            }
        });

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Metric;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpStream;

    struct CountingDecoder {
        frames: AtomicUsize,
    }

    impl FrameDecoder for CountingDecoder {
        fn decode(&self, _frame: &[u8], input: &PluginChannel) -> Result<()> {
            self.frames.fetch_add(1, Ordering::SeqCst);
            input.metric(&Metric::new("seen", 1.0));
            Ok(())
        }
    }

    #[tokio::test]
    async fn accepts_peers_and_feeds_the_input_channel() {
        let decoder = Arc::new(CountingDecoder {
            frames: AtomicUsize::new(0),
        });
        let input = Arc::new(PluginChannel::new("input"));
        let output = Arc::new(PluginChannel::new("output"));

        let delivered = Arc::new(AtomicUsize::new(0));
        let count = delivered.clone();
        let _sub = input.subscribe_metrics(move |_| {
            count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let port = free_port().await;
        let server = BindServer::new(
            ListenEndpoint::Tcp {
                host: "127.0.0.1".to_string(),
                port,
            },
            decoder.clone(),
        );

        let (notify, _) = broadcast::channel(1);
        let (done_tx, mut done_rx) = mpsc::channel(1);
        server
            .start(input.clone(), output, &notify, &done_tx)
            .await
            .unwrap();

        let mut peer = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        peer.write_all(b"srv.load 1.5 1700000000\nsrv.load 1.6 1700000001\n")
            .await
            .unwrap();
        peer.shutdown().await.unwrap();
        drop(peer);

        for _ in 0..200 {
            if delivered.load(Ordering::SeqCst) == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(delivered.load(Ordering::SeqCst), 2);
        assert_eq!(decoder.frames.load(Ordering::SeqCst), 2);

        drop(notify);
        drop(done_tx);
        let _ = done_rx.recv().await;
    }

    /// Ask the OS for a free TCP port.
    async fn free_port() -> u16 {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        port
    }
}
