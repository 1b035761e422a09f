//! Plugin discovery, capability typing, and instantiation.
//!
//! Every bundled plugin module exposes a `descriptor()`; the registry
//! collects them once at startup and is immutable afterwards. Loading
//! turns configuration entries into [`PluginSetup`] records the supervisor
//! invokes, skipping (and logging) entries that name nothing usable.
use crate::bind::{BindServer, DatagramServer};
use crate::channel::Subscription;
use crate::config::PluginConfig;
use crate::connect::ConnectClient;
use crate::plugin_channel::PluginChannel;
use crate::reporter::Reporter;
use crate::{Error, Result};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::error;

pub mod carbon;
pub mod json;
pub mod log;

/// What a plugin can be used as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginKind {
    Input,
    Output,
    Tunnel,
}

impl PluginKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PluginKind::Input => "input",
            PluginKind::Output => "output",
            PluginKind::Tunnel => "tunnel",
        }
    }
}

pub type SetupFn = fn(&PluginConfig) -> Result<PluginInstance>;

/// One discovered plugin.
#[derive(Clone)]
pub struct PluginDescriptor {
    pub name: &'static str,
    pub setup_input: Option<SetupFn>,
    pub setup_output: Option<SetupFn>,
    pub setup_tunnel: Option<SetupFn>,
    /// Module that registered the plugin.
    pub source: &'static str,
}

impl PluginDescriptor {
    /// Whether the plugin supports the given capability.
    pub fn can(&self, kind: PluginKind) -> bool {
        self.setup(kind).is_some()
    }

    fn setup(&self, kind: PluginKind) -> Option<SetupFn> {
        match kind {
            PluginKind::Input => self.setup_input,
            PluginKind::Output => self.setup_output,
            PluginKind::Tunnel => self.setup_tunnel,
        }
    }
}

/// The loaded-plugin table, keyed by name.
pub struct PluginRegistry {
    plugins: BTreeMap<&'static str, PluginDescriptor>,
}

impl PluginRegistry {
    /// Discover and load every bundled plugin.
    pub fn builtin() -> Self {
        let mut registry = PluginRegistry {
            plugins: BTreeMap::new(),
        };
        registry.register(carbon::descriptor());
        registry.register(json::descriptor());
        registry.register(log::descriptor());
        registry
    }

    fn register(&mut self, descriptor: PluginDescriptor) {
        self.plugins.insert(descriptor.name, descriptor);
    }

    pub fn get(&self, name: &str) -> Option<&PluginDescriptor> {
        self.plugins.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PluginDescriptor> {
        self.plugins.values()
    }

    /// Turn configuration entries into setups for the given capability.
    ///
    /// Entries with a missing type, an unknown name, or without the
    /// capability are logged and skipped; the rest of the list still
    /// loads.
    pub fn load_plugins(&self, kind: PluginKind, configs: &[PluginConfig]) -> Vec<PluginSetup> {
        let mut setups = Vec::new();

        for config in configs {
            let Some(name) = config.kind.as_deref() else {
                error!("{} plugin entry without a type, skipping", kind.as_str());
                continue;
            };

            let Some(descriptor) = self.get(name) else {
                error!(error = %Error::UnknownPlugin(name.to_string()),
                    "skipping {} plugin", kind.as_str());
                continue;
            };

            let Some(setup) = descriptor.setup(kind) else {
                error!(error = %Error::MissingCapability(name.to_string(), kind.as_str()),
                    "skipping {} plugin", kind.as_str());
                continue;
            };

            setups.push(PluginSetup {
                name: name.to_string(),
                config: config.clone(),
                setup,
            });
        }

        setups
    }
}

/// A loadable plugin entry, ready to be invoked by the supervisor.
pub struct PluginSetup {
    pub name: String,
    pub config: PluginConfig,
    setup: SetupFn,
}

impl PluginSetup {
    pub fn invoke(&self) -> Result<PluginInstance> {
        (self.setup)(&self.config)
    }
}

/// What invoking a setup produces.
pub enum PluginInstance {
    Input(InputInstance),
    Output(OutputInstance),
}

/// One inbound server, stream or datagram.
pub enum InputServer {
    Stream(BindServer),
    Datagram(DatagramServer),
}

pub struct InputInstance {
    pub name: String,
    server: InputServer,
}

impl InputInstance {
    pub fn new(name: impl Into<String>, server: InputServer) -> Self {
        InputInstance {
            name: name.into(),
            server,
        }
    }

    /// Bind and start serving. Returns once the endpoint is bound.
    pub async fn start(
        &self,
        input: Arc<PluginChannel>,
        output: Arc<PluginChannel>,
        notify: &broadcast::Sender<()>,
        done: &mpsc::Sender<()>,
    ) -> Result<()> {
        match &self.server {
            InputServer::Stream(server) => server.start(input, output, notify, done).await,
            InputServer::Datagram(server) => server.start(input, output, notify, done).await,
        }
    }
}

/// One outbound sink.
pub enum OutputSink {
    Connect(ConnectClient),
    Log(log::LogSink),
}

pub struct OutputInstance {
    pub name: String,
    sink: OutputSink,
}

impl OutputInstance {
    pub fn new(name: impl Into<String>, sink: OutputSink) -> Self {
        OutputInstance {
            name: name.into(),
            sink,
        }
    }

    /// Subscribe to the output channel and begin delivering.
    pub fn start(&self, output: &PluginChannel, notify: &broadcast::Sender<()>) {
        match &self.sink {
            OutputSink::Connect(client) => client.start(output, notify),
            OutputSink::Log(sink) => sink.start(output),
        }
    }

    /// Whether the sink can currently deliver. Log sinks always can; a
    /// connect sink can once its session is established.
    pub fn is_open(&self) -> bool {
        match &self.sink {
            OutputSink::Connect(client) => client.is_open(),
            OutputSink::Log(_) => true,
        }
    }

    /// Close any outbound session this sink owns.
    pub fn close(&self) {
        if let OutputSink::Connect(client) = &self.sink {
            client.close();
        }
    }

    pub fn reporter(&self) -> Option<Arc<dyn Reporter>> {
        match &self.sink {
            OutputSink::Connect(client) => Some(client.reporter()),
            OutputSink::Log(sink) => Some(sink.reporter()),
        }
    }
}

/// Keeps plugin-held subscriptions alive for as long as the instance.
pub(crate) struct SubscriptionSet {
    subscriptions: std::sync::Mutex<Vec<Subscription>>,
}

impl SubscriptionSet {
    pub(crate) fn new() -> Self {
        SubscriptionSet {
            subscriptions: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn push(&self, subscription: Subscription) {
        self.subscriptions.lock().unwrap().push(subscription);
    }
}
