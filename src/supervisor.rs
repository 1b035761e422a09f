//! Boots the components in dependency order and runs until shutdown.
use crate::config::Config;
use crate::debug::DebugMonitor;
use crate::dispatcher::CoreProcessor;
use crate::emitter::CoreEmitter;
use crate::plugin::{InputInstance, OutputInstance, PluginInstance, PluginKind, PluginRegistry};
use crate::plugin_channel::PluginChannel;
use crate::processor::ProcessorRegistry;
use crate::reporter::Reporter;
use crate::statistics::Statistics;
use crate::Result;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info};

/// The daemon core.
///
/// `run` owns the whole lifecycle: channels first, then processors and the
/// dispatcher, then plugin instances, then the timers. It returns once the
/// provided `shutdown` future completes and every spawned task has
/// drained.
pub struct Core {
    config: Config,
}

impl Core {
    pub fn new(config: Config) -> Self {
        Core { config }
    }

    /// Run the daemon until `shutdown` completes.
    ///
    /// `tokio::signal::ctrl_c()` is the usual argument; tests pass their
    /// own future to drive teardown deterministically.
    pub async fn run(self, shutdown: impl Future) -> Result<()> {
        let (notify_shutdown, _) = broadcast::channel(1);
        let (shutdown_complete_tx, mut shutdown_complete_rx) = mpsc::channel::<()>(1);

        // Channels exist before anything that could publish into them.
        let output = Arc::new(PluginChannel::new("output"));
        let input = Arc::new(PluginChannel::new("input"));

        let registry = PluginRegistry::builtin();

        // Tunnels come up before ordinary plugins so inputs can ride them.
        // None are bundled; misconfigured entries are logged and skipped.
        let tunnel_setups = registry.load_plugins(PluginKind::Tunnel, &self.config.tunnel);
        for setup in &tunnel_setups {
            if let Err(e) = setup.invoke() {
                error!(error = %e, "failed to set up tunnel plugin {}", setup.name);
            }
        }

        let processors = ProcessorRegistry::builtin().create_all(&self.config.processor_opts);
        let emitter = CoreEmitter::new(self.config.core.clone(), output.clone());
        let dispatcher = CoreProcessor::new(emitter, processors);

        let inputs = instantiate_inputs(&registry, &self.config);
        let outputs = instantiate_outputs(&registry, &self.config);

        output.start();
        input.start();
        dispatcher.start(&input);

        let mut reporters: Vec<Arc<dyn Reporter>> = outputs
            .iter()
            .filter_map(|instance| instance.reporter())
            .collect();
        reporters.extend(dispatcher.reporters().iter().cloned());
        info!(
            "Started {} processors, collected {} reporters",
            dispatcher.processor_count(),
            reporters.len()
        );

        for instance in &inputs {
            let started = instance
                .start(
                    input.clone(),
                    output.clone(),
                    &notify_shutdown,
                    &shutdown_complete_tx,
                )
                .await;
            if let Err(e) = started {
                error!(error = %e, "failed to start input plugin {}", instance.name);
            }
        }

        for instance in &outputs {
            instance.start(&output, &notify_shutdown);
        }

        // The reporting timer always runs; the statistics config decides
        // whether counts also come back as metrics.
        let prefix = self.config.statistics.as_ref().map(|s| s.prefix.clone());
        let statistics = Statistics::new(
            Duration::from_secs(self.config.report_interval),
            prefix,
            reporters,
        );
        statistics.start(input.clone(), &notify_shutdown);

        let monitor = DebugMonitor::new();
        if self.config.debug.is_some() {
            monitor.attach(&input);
            monitor.attach(&output);
        }

        info!("core started");
        shutdown.await;
        info!("shutting down");

        // Teardown unwinds the startup order: sinks close their sockets,
        // the channels fire their stopping hooks and drop subscribers,
        // then every spawned task drains.
        for instance in &outputs {
            instance.close();
        }
        input.stop();
        output.stop();
        dispatcher.stop();

        drop(notify_shutdown);
        drop(shutdown_complete_tx);
        let _ = shutdown_complete_rx.recv().await;

        Ok(())
    }
}

fn instantiate_inputs(registry: &PluginRegistry, config: &Config) -> Vec<InputInstance> {
    let mut instances = Vec::new();
    for setup in registry.load_plugins(PluginKind::Input, &config.input) {
        match setup.invoke() {
            Ok(PluginInstance::Input(instance)) => instances.push(instance),
            Ok(_) => error!("plugin {} did not produce an input", setup.name),
            Err(e) => error!(error = %e, "failed to set up input plugin {}", setup.name),
        }
    }
    instances
}

fn instantiate_outputs(registry: &PluginRegistry, config: &Config) -> Vec<OutputInstance> {
    let mut instances = Vec::new();
    for setup in registry.load_plugins(PluginKind::Output, &config.output) {
        match setup.invoke() {
            Ok(PluginInstance::Output(instance)) => instances.push(instance),
            Ok(_) => error!("plugin {} did not produce an output", setup.name),
            Err(e) => error!(error = %e, "failed to set up output plugin {}", setup.name),
        }
    }
    instances
}
