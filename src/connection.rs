//! Inbound framing.
//!
//! A [`LineConnection`] owns one accepted peer socket and turns its byte
//! stream into newline-delimited frames. What a frame *means* belongs to
//! the input plugin, which supplies a [`FrameDecoder`] that parses it and
//! publishes the result onto the input channel.
use crate::plugin_channel::PluginChannel;
use crate::shutdown::Lifeline;
use crate::{Error, Result};
use bytes::BytesMut;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, error};

const DEFAULT_BUFFER_SIZE: usize = 16 * 1024;

/// Parses one frame and publishes whatever it contains.
///
/// A frame is one line of a stream connection or one datagram segment.
/// Returning an error drops that frame only; the connection keeps going.
pub trait FrameDecoder: Send + Sync + 'static {
    fn decode(&self, frame: &[u8], input: &PluginChannel) -> Result<()>;
}

/// Reads newline-delimited frames from a peer.
///
/// The connection fills an internal buffer until at least one full line is
/// available, hands each complete line to the decoder, and keeps any
/// partial tail for the next read.
pub struct LineConnection<S> {
    stream: S,
    buffer: BytesMut,
    decoder: Arc<dyn FrameDecoder>,
    input: Arc<PluginChannel>,
    peer: String,
}

impl<S: AsyncRead + Unpin> LineConnection<S> {
    pub fn new(
        stream: S,
        peer: String,
        decoder: Arc<dyn FrameDecoder>,
        input: Arc<PluginChannel>,
    ) -> Self {
        LineConnection {
            stream,
            buffer: BytesMut::with_capacity(DEFAULT_BUFFER_SIZE),
            decoder,
            input,
            peer,
        }
    }

    /// Process the peer until it disconnects or shutdown is signalled.
    ///
    /// Malformed frames are logged and dropped; only I/O failures end the
    /// connection with an error.
    pub async fn run(&mut self, lifeline: &mut Lifeline) -> Result<()> {
        loop {
            while let Some(line) = self.next_line() {
                if let Err(e) = self.decoder.decode(&line, &self.input) {
                    error!(error = %e, peer = %self.peer, "dropping malformed frame");
                }
            }

            let read = tokio::select! {
                read = self.stream.read_buf(&mut self.buffer) => read?,
                _ = lifeline.stopped() => return Ok(()),
            };

            if read == 0 {
                // A clean close leaves no partial line behind.
                if self.buffer.is_empty() {
                    debug!(peer = %self.peer, "peer disconnected");
                    return Ok(());
                }
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::ConnectionReset,
                    "connection closed mid frame",
                )));
            }
        }
    }

    /// Split the next complete line off the buffer, without its newline.
    /// A trailing carriage return is stripped as well.
    fn next_line(&mut self) -> Option<BytesMut> {
        let pos = self.buffer.iter().position(|b| *b == b'\n')?;
        let mut line = self.buffer.split_to(pos + 1);
        line.truncate(pos);
        if line.last() == Some(&b'\r') {
            line.truncate(line.len() - 1);
        }
        Some(line)
    }
}

/// Decode every newline-separated segment of one datagram.
///
/// Trailing newlines produce empty segments, which are skipped rather than
/// treated as malformed.
pub(crate) fn decode_datagram(
    payload: &[u8],
    decoder: &Arc<dyn FrameDecoder>,
    input: &PluginChannel,
    peer: &str,
) {
    for segment in payload.split(|b| *b == b'\n') {
        let segment = match segment.last() {
            Some(b'\r') => &segment[..segment.len() - 1],
            _ => segment,
        };
        if segment.is_empty() {
            continue;
        }
        if let Err(e) = decoder.decode(segment, input) {
            error!(error = %e, peer = %peer, "dropping malformed frame");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Metric;
    use std::sync::Mutex;
    use tokio::sync::broadcast;

    /// Counts frames and records them verbatim.
    struct RecordingDecoder {
        frames: Mutex<Vec<Vec<u8>>>,
    }

    impl FrameDecoder for RecordingDecoder {
        fn decode(&self, frame: &[u8], input: &PluginChannel) -> Result<()> {
            if frame.starts_with(b"bad") {
                return Err(Error::MalformedFrame("bad".into()));
            }
            self.frames.lock().unwrap().push(frame.to_vec());
            input.metric(&Metric::new("seen", 1.0));
            Ok(())
        }
    }

    /// The sender is returned too: a dropped sender reads as a shutdown
    /// announcement and would end `run` before the stream is drained.
    fn fixture() -> (
        Arc<RecordingDecoder>,
        Arc<PluginChannel>,
        broadcast::Sender<()>,
        Lifeline,
    ) {
        let decoder = Arc::new(RecordingDecoder {
            frames: Mutex::new(Vec::new()),
        });
        let input = Arc::new(PluginChannel::new("input"));
        let (notify, _) = broadcast::channel(1);
        let lifeline = Lifeline::new(&notify);
        (decoder, input, notify, lifeline)
    }

    #[tokio::test]
    async fn splits_lines_across_reads() {
        let (decoder, input, _notify, mut lifeline) = fixture();
        let stream = tokio_test::io::Builder::new()
            .read(b"one\ntw")
            .read(b"o\r\nthree\n")
            .build();

        let mut conn =
            LineConnection::new(stream, "test".into(), decoder.clone(), input);
        conn.run(&mut lifeline).await.unwrap();

        assert_eq!(
            *decoder.frames.lock().unwrap(),
            vec![b"one".to_vec(), b"two".to_vec(), b"three".to_vec()]
        );
    }

    #[tokio::test]
    async fn malformed_frame_does_not_end_the_connection() {
        let (decoder, input, _notify, mut lifeline) = fixture();
        let stream = tokio_test::io::Builder::new()
            .read(b"good\nbad stuff\nalso good\n")
            .build();

        let mut conn =
            LineConnection::new(stream, "test".into(), decoder.clone(), input);
        conn.run(&mut lifeline).await.unwrap();

        assert_eq!(decoder.frames.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn close_mid_line_is_an_error() {
        let (decoder, input, _notify, mut lifeline) = fixture();
        let stream = tokio_test::io::Builder::new().read(b"dangling").build();

        let mut conn =
            LineConnection::new(stream, "test".into(), decoder, input);
        let result = conn.run(&mut lifeline).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn datagram_segments_decode_independently() {
        let (decoder, input, _notify, _lifeline) = fixture();
        let erased: Arc<dyn FrameDecoder> = decoder.clone();
        decode_datagram(b"one\nbad\ntwo\n", &erased, &input, "test");
        assert_eq!(
            *decoder.frames.lock().unwrap(),
            vec![b"one".to_vec(), b"two".to_vec()]
        );
    }
}
