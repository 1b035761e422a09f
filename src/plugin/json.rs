//! JSON-lines input and output: one `{"type": ...}` object per line.
use super::{
    InputInstance, InputServer, OutputInstance, OutputSink, PluginDescriptor, PluginInstance,
};
use crate::bind::{BindServer, DatagramServer};
use crate::config::PluginConfig;
use crate::connect::ConnectClient;
use crate::connection::FrameDecoder;
use crate::event::{Event, Metric};
use crate::handler::Handler;
use crate::plugin_channel::PluginChannel;
use crate::protocol::{Protocol, Transport};
use crate::Result;
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

pub fn descriptor() -> PluginDescriptor {
    PluginDescriptor {
        name: "json",
        setup_input: Some(setup_input),
        setup_output: Some(setup_output),
        setup_tunnel: None,
        source: module_path!(),
    }
}

fn setup_input(config: &PluginConfig) -> Result<PluginInstance> {
    let protocol = Protocol::resolve(&config.protocol)?;
    let endpoint = protocol.listen(config)?;
    let decoder = Arc::new(JsonDecoder);

    let server = match endpoint.transport() {
        Transport::Stream => InputServer::Stream(BindServer::new(endpoint, decoder)),
        Transport::Datagram => InputServer::Datagram(DatagramServer::new(endpoint, decoder)),
    };
    Ok(PluginInstance::Input(InputInstance::new("json", server)))
}

fn setup_output(config: &PluginConfig) -> Result<PluginInstance> {
    let protocol = Protocol::resolve(&config.protocol)?;
    let dialer = protocol.dialer(config)?;
    let client = ConnectClient::new(
        dialer,
        Box::new(JsonHandler),
        Duration::from_secs(config.flush_period),
        config.outbound_limit,
    );
    Ok(PluginInstance::Output(OutputInstance::new(
        "json",
        OutputSink::Connect(client),
    )))
}

/// The wire shape shared by input and output.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum Item {
    Metric(Metric),
    Event(Event),
}

/// Parses one JSON object per frame.
pub struct JsonDecoder;

impl FrameDecoder for JsonDecoder {
    fn decode(&self, frame: &[u8], input: &PluginChannel) -> Result<()> {
        match serde_json::from_slice::<Item>(frame)? {
            Item::Metric(metric) => input.metric(&metric),
            Item::Event(event) => input.event(&event),
        }
        Ok(())
    }
}

/// Serializes items as JSON lines.
pub struct JsonHandler;

impl JsonHandler {
    fn line(item: &Item) -> Result<Bytes> {
        let mut out = BytesMut::from(serde_json::to_vec(item)?.as_slice());
        out.put_u8(b'\n');
        Ok(out.freeze())
    }
}

impl Handler for JsonHandler {
    fn serialize_event(&self, event: &Event) -> Result<Bytes> {
        Self::line(&Item::Event(event.clone()))
    }

    fn serialize_metric(&self, metric: &Metric) -> Result<Bytes> {
        Self::line(&Item::Metric(metric.clone()))
    }
}
