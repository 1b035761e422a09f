use anyhow::Context;
use clap::Parser;
use ffwd::config::{Config, DebugConfig, PluginConfig, StatisticsConfig};
use ffwd::plugin::{PluginKind, PluginRegistry};
use ffwd::{Core, DEFAULT_CARBON_PORT, DEFAULT_HOST};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = FfwdCli::parse();

    if cli.plugins {
        list_plugins();
        return Ok(());
    }

    let config = cli.into_config()?;
    Core::new(config).run(tokio::signal::ctrl_c()).await?;

    Ok(())
}

#[derive(Debug, Parser)]
#[command(name = "ffwd", version, author)]
/// A metric and event forwarding daemon.
struct FfwdCli {
    /// List discovered plugins and their capabilities, then exit.
    #[arg(long)]
    plugins: bool,
    /// Address the inputs listen on.
    #[arg(long, default_value = DEFAULT_HOST)]
    host: String,
    /// Carbon line-protocol input port.
    #[arg(long, default_value_t = DEFAULT_CARBON_PORT)]
    carbon_port: u16,
    /// Also accept JSON lines on this port.
    #[arg(long)]
    json_port: Option<u16>,
    /// Forward metrics to a downstream carbon endpoint, `host:port`.
    #[arg(long)]
    carbon_out: Option<String>,
    /// Attach debug monitors to the core channels.
    #[arg(long)]
    debug: bool,
}

impl FfwdCli {
    fn into_config(self) -> anyhow::Result<Config> {
        let mut input = vec![PluginConfig::new("carbon").with_addr(self.host.clone(), self.carbon_port)];
        if let Some(port) = self.json_port {
            input.push(PluginConfig::new("json").with_addr(self.host.clone(), port));
        }

        let mut output = vec![PluginConfig::new("log")];
        if let Some(addr) = &self.carbon_out {
            let (host, port) = addr
                .rsplit_once(':')
                .context("expected `host:port` for --carbon-out")?;
            let port: u16 = port
                .parse()
                .with_context(|| format!("bad port in --carbon-out: {port:?}"))?;
            output.push(PluginConfig::new("carbon").with_addr(host, port));
        }

        Ok(Config {
            input,
            output,
            statistics: Some(StatisticsConfig::default()),
            debug: self.debug.then(DebugConfig::default),
            ..Default::default()
        })
    }
}

fn list_plugins() {
    let registry = PluginRegistry::builtin();
    for descriptor in registry.iter() {
        let capabilities: Vec<&str> = [PluginKind::Input, PluginKind::Output, PluginKind::Tunnel]
            .iter()
            .filter(|kind| descriptor.can(**kind))
            .map(|kind| kind.as_str())
            .collect();
        println!(
            "{} [{}] ({})",
            descriptor.name,
            capabilities.join(", "),
            descriptor.source
        );
    }
}
