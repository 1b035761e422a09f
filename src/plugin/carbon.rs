//! The carbon line protocol: `<path> <value> <timestamp>`.
use super::{
    InputInstance, InputServer, OutputInstance, OutputSink, PluginDescriptor, PluginInstance,
};
use crate::bind::{BindServer, DatagramServer};
use crate::config::PluginConfig;
use crate::connect::ConnectClient;
use crate::connection::FrameDecoder;
use crate::event::{unix_now, Event, Metric};
use crate::handler::Handler;
use crate::plugin_channel::PluginChannel;
use crate::protocol::{Protocol, Transport};
use crate::{Error, Result};
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;

pub fn descriptor() -> PluginDescriptor {
    PluginDescriptor {
        name: "carbon",
        setup_input: Some(setup_input),
        setup_output: Some(setup_output),
        setup_tunnel: None,
        source: module_path!(),
    }
}

fn setup_input(config: &PluginConfig) -> Result<PluginInstance> {
    let protocol = Protocol::resolve(&config.protocol)?;
    let endpoint = protocol.listen(config)?;
    let decoder = Arc::new(CarbonDecoder);

    let server = match endpoint.transport() {
        Transport::Stream => InputServer::Stream(BindServer::new(endpoint, decoder)),
        Transport::Datagram => InputServer::Datagram(DatagramServer::new(endpoint, decoder)),
    };
    Ok(PluginInstance::Input(InputInstance::new("carbon", server)))
}

fn setup_output(config: &PluginConfig) -> Result<PluginInstance> {
    let protocol = Protocol::resolve(&config.protocol)?;
    let dialer = protocol.dialer(config)?;
    let client = ConnectClient::new(
        dialer,
        Box::new(CarbonHandler),
        Duration::from_secs(config.flush_period),
        config.outbound_limit,
    );
    Ok(PluginInstance::Output(OutputInstance::new(
        "carbon",
        OutputSink::Connect(client),
    )))
}

/// Parses one carbon line into a metric.
pub struct CarbonDecoder;

impl FrameDecoder for CarbonDecoder {
    fn decode(&self, frame: &[u8], input: &PluginChannel) -> Result<()> {
        let metric = parse_line(frame)?;
        input.metric(&metric);
        Ok(())
    }
}

fn parse_line(frame: &[u8]) -> Result<Metric> {
    let line = std::str::from_utf8(frame)
        .map_err(|_| Error::MalformedFrame("not utf-8".to_string()))?;

    let mut parts = line.split_whitespace();
    let (Some(path), Some(value), Some(timestamp), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(Error::MalformedFrame(format!(
            "expected `<path> <value> <timestamp>`, got {line:?}"
        )));
    };

    let value: f64 = value
        .parse()
        .map_err(|_| Error::MalformedFrame(format!("bad value {value:?}")))?;
    let time = atoi::atoi::<u64>(timestamp.as_bytes())
        .ok_or_else(|| Error::MalformedFrame(format!("bad timestamp {timestamp:?}")))?;

    let mut metric = Metric::new(path, value);
    metric.time = Some(time);
    Ok(metric)
}

/// Serializes metrics back into carbon lines.
///
/// Events have no representation in this format; pair the carbon output
/// with metric-only pipelines.
pub struct CarbonHandler;

impl Handler for CarbonHandler {
    fn serialize_event(&self, _event: &Event) -> Result<Bytes> {
        Err(Error::Serialize(
            "events are not representable in the carbon line format".to_string(),
        ))
    }

    fn serialize_metric(&self, metric: &Metric) -> Result<Bytes> {
        let time = metric.time.unwrap_or_else(unix_now);
        Ok(Bytes::from(format!(
            "{} {} {}\n",
            metric.key, metric.value, time
        )))
    }
}
