//! Outbound serialization contract.
use crate::event::{Event, Metric};
use crate::Result;
use bytes::{Bytes, BytesMut};

/// Serializes items into the bytes a connect client writes to its peer.
///
/// The byte format is owned by the output plugin providing the handler;
/// the transport core never inspects the payload.
pub trait Handler: Send + Sync + 'static {
    fn serialize_event(&self, event: &Event) -> Result<Bytes>;

    fn serialize_metric(&self, metric: &Metric) -> Result<Bytes>;

    /// Serialize a whole batch. Events and metrics each keep their
    /// insertion order; the default layout is all events followed by all
    /// metrics.
    fn serialize_all(&self, events: &[Event], metrics: &[Metric]) -> Result<Bytes> {
        let mut out = BytesMut::new();
        for event in events {
            out.extend_from_slice(&self.serialize_event(event)?);
        }
        for metric in metrics {
            out.extend_from_slice(&self.serialize_metric(metric)?);
        }
        Ok(out.freeze())
    }
}
