//! Protocol families and the tag registry.
//!
//! A protocol tag like `"tcp"` or `"unix+udp"` names a transport (stream or
//! datagram) over an address family (inet or unix). The registry is a fixed
//! table resolved at plugin setup time; endpoints built from it carry
//! everything the bind and connect machinery needs.
use crate::config::PluginConfig;
use crate::{Error, Result};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
#[cfg(unix)]
use tokio::net::{UnixDatagram, UnixListener, UnixStream};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Stream,
    Datagram,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    Inet,
    Unix,
}

/// One resolvable protocol family.
#[derive(Debug, Clone, Copy)]
pub struct Protocol {
    pub tag: &'static str,
    pub transport: Transport,
    pub family: Family,
}

/// The registry itself. Fixed at compile time; tags outside the table are
/// a configuration error.
const PROTOCOLS: &[Protocol] = &[
    Protocol {
        tag: "tcp",
        transport: Transport::Stream,
        family: Family::Inet,
    },
    Protocol {
        tag: "udp",
        transport: Transport::Datagram,
        family: Family::Inet,
    },
    Protocol {
        tag: "unix+tcp",
        transport: Transport::Stream,
        family: Family::Unix,
    },
    Protocol {
        tag: "unix+udp",
        transport: Transport::Datagram,
        family: Family::Unix,
    },
];

impl Protocol {
    /// Resolve a protocol tag to its descriptor.
    pub fn resolve(tag: &str) -> Result<Protocol> {
        PROTOCOLS
            .iter()
            .find(|p| p.tag == tag)
            .copied()
            .ok_or_else(|| Error::UnknownProtocol(tag.to_string()))
    }

    /// Build the outbound dialer for this family, validating the options
    /// it requires.
    pub fn dialer(&self, config: &PluginConfig) -> Result<Dialer> {
        match self.family {
            Family::Inet => {
                let (host, port) = inet_addr(config)?;
                Ok(match self.transport {
                    Transport::Stream => Dialer::Tcp { host, port },
                    Transport::Datagram => Dialer::Udp { host, port },
                })
            }
            Family::Unix => {
                let path = unix_path(config)?;
                Ok(match self.transport {
                    Transport::Stream => Dialer::Unix { path },
                    Transport::Datagram => Dialer::UnixDatagram { path },
                })
            }
        }
    }

    /// Build the listening endpoint for this family, validating the
    /// options it requires.
    pub fn listen(&self, config: &PluginConfig) -> Result<ListenEndpoint> {
        match self.family {
            Family::Inet => {
                let (host, port) = inet_addr(config)?;
                Ok(match self.transport {
                    Transport::Stream => ListenEndpoint::Tcp { host, port },
                    Transport::Datagram => ListenEndpoint::Udp { host, port },
                })
            }
            Family::Unix => {
                let path = unix_path(config)?;
                Ok(match self.transport {
                    Transport::Stream => ListenEndpoint::Unix { path },
                    Transport::Datagram => ListenEndpoint::UnixDatagram { path },
                })
            }
        }
    }
}

fn inet_addr(config: &PluginConfig) -> Result<(String, u16)> {
    let host = config.host.clone().ok_or(Error::MissingOption("host"))?;
    let port = config.port.ok_or(Error::MissingOption("port"))?;
    Ok((host, port))
}

fn unix_path(config: &PluginConfig) -> Result<String> {
    config.path.clone().ok_or(Error::MissingOption("path"))
}

/// A bidirectional byte stream usable by the transport core.
pub trait PeerStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> PeerStream for T {}

pub type BoxedStream = Box<dyn PeerStream>;

/// Outbound endpoint a connect client dials, possibly repeatedly.
#[derive(Debug, Clone)]
pub enum Dialer {
    Tcp { host: String, port: u16 },
    Udp { host: String, port: u16 },
    Unix { path: String },
    UnixDatagram { path: String },
}

impl Dialer {
    pub async fn dial(&self) -> io::Result<BoxedStream> {
        match self {
            Dialer::Tcp { host, port } => {
                let stream = TcpStream::connect((host.as_str(), *port)).await?;
                Ok(Box::new(stream))
            }
            Dialer::Udp { host, port } => {
                // Bind an ephemeral local socket and fix the remote peer so
                // plain writes become datagrams to it.
                let socket = UdpSocket::bind("0.0.0.0:0").await?;
                socket.connect((host.as_str(), *port)).await?;
                Ok(Box::new(UdpStream(socket)))
            }
            #[cfg(unix)]
            Dialer::Unix { path } => {
                let stream = UnixStream::connect(path).await?;
                Ok(Box::new(stream))
            }
            #[cfg(unix)]
            Dialer::UnixDatagram { path } => {
                let socket = UnixDatagram::unbound()?;
                socket.connect(path)?;
                Ok(Box::new(UnixDatagramStream(socket)))
            }
            #[cfg(not(unix))]
            Dialer::Unix { .. } | Dialer::UnixDatagram { .. } => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "unix sockets are not available on this platform",
            )),
        }
    }
}

impl std::fmt::Display for Dialer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Dialer::Tcp { host, port } => write!(f, "tcp://{host}:{port}"),
            Dialer::Udp { host, port } => write!(f, "udp://{host}:{port}"),
            Dialer::Unix { path } => write!(f, "unix+tcp://{path}"),
            Dialer::UnixDatagram { path } => write!(f, "unix+udp://{path}"),
        }
    }
}

/// Inbound endpoint a server listens on.
#[derive(Debug, Clone)]
pub enum ListenEndpoint {
    Tcp { host: String, port: u16 },
    Udp { host: String, port: u16 },
    Unix { path: String },
    UnixDatagram { path: String },
}

impl ListenEndpoint {
    pub fn transport(&self) -> Transport {
        match self {
            ListenEndpoint::Tcp { .. } | ListenEndpoint::Unix { .. } => Transport::Stream,
            ListenEndpoint::Udp { .. } | ListenEndpoint::UnixDatagram { .. } => Transport::Datagram,
        }
    }

    /// Bind a stream acceptor. Only valid for stream endpoints.
    pub async fn bind_stream(&self) -> Result<Acceptor> {
        match self {
            ListenEndpoint::Tcp { host, port } => {
                let listener = TcpListener::bind((host.as_str(), *port)).await?;
                Ok(Acceptor::Tcp(listener))
            }
            #[cfg(unix)]
            ListenEndpoint::Unix { path } => {
                let listener = UnixListener::bind(path)?;
                Ok(Acceptor::Unix(listener))
            }
            other => Err(Error::Io(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("not a stream endpoint: {other:?}"),
            ))),
        }
    }

    /// Bind a datagram socket. Only valid for datagram endpoints.
    pub async fn bind_datagram(&self) -> Result<DatagramSocket> {
        match self {
            ListenEndpoint::Udp { host, port } => {
                let socket = UdpSocket::bind((host.as_str(), *port)).await?;
                Ok(DatagramSocket::Udp(socket))
            }
            #[cfg(unix)]
            ListenEndpoint::UnixDatagram { path } => {
                let socket = UnixDatagram::bind(path)?;
                Ok(DatagramSocket::Unix(socket))
            }
            other => Err(Error::Io(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("not a datagram endpoint: {other:?}"),
            ))),
        }
    }
}

impl std::fmt::Display for ListenEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ListenEndpoint::Tcp { host, port } => write!(f, "tcp://{host}:{port}"),
            ListenEndpoint::Udp { host, port } => write!(f, "udp://{host}:{port}"),
            ListenEndpoint::Unix { path } => write!(f, "unix+tcp://{path}"),
            ListenEndpoint::UnixDatagram { path } => write!(f, "unix+udp://{path}"),
        }
    }
}

/// A bound stream listener.
pub enum Acceptor {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(UnixListener),
}

impl Acceptor {
    /// Accept one peer, returning the stream and a displayable peer name.
    pub async fn accept(&self) -> io::Result<(BoxedStream, String)> {
        match self {
            Acceptor::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                Ok((Box::new(stream), peer.to_string()))
            }
            #[cfg(unix)]
            Acceptor::Unix(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok((Box::new(stream), "unix-peer".to_string()))
            }
        }
    }
}

/// A bound datagram socket.
pub enum DatagramSocket {
    Udp(UdpSocket),
    #[cfg(unix)]
    Unix(UnixDatagram),
}

impl DatagramSocket {
    pub async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            DatagramSocket::Udp(socket) => {
                let (n, _) = socket.recv_from(buf).await?;
                Ok(n)
            }
            #[cfg(unix)]
            DatagramSocket::Unix(socket) => {
                let (n, _) = socket.recv_from(buf).await?;
                Ok(n)
            }
        }
    }
}

/// A connected UDP socket exposed as a byte stream; each write becomes one
/// datagram to the fixed peer.
struct UdpStream(UdpSocket);

impl AsyncWrite for UdpStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.0.poll_send(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

impl AsyncRead for UdpStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.0.poll_recv(cx, buf)
    }
}

/// A connected unix datagram socket exposed the same way.
#[cfg(unix)]
struct UnixDatagramStream(UnixDatagram);

#[cfg(unix)]
impl AsyncWrite for UnixDatagramStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.0.poll_send(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[cfg(unix)]
impl AsyncRead for UnixDatagramStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.0.poll_recv(cx, buf)
    }
}
