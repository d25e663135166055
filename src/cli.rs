use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;

use flowtap::capture::{PacketSource, PcapFileSource};
use flowtap::config::Config;
use flowtap::consumer::{self, PluginKind};
use flowtap::FlowEngine;

#[derive(Parser)]
#[command(name = "flowtap")]
#[command(author, version, about = "Flow classification and session tracking")]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Capture traffic and emit flow events
    Run {
        /// Interface to capture on (overrides the config file)
        #[arg(short, long)]
        interface: Option<String>,

        /// Replay a capture file instead of sniffing an interface
        #[arg(short, long)]
        pcap: Option<PathBuf>,

        /// Consumer for emitted events (overrides the config file)
        #[arg(long, value_enum)]
        plugin: Option<PluginKind>,
    },

    /// Validate the configuration file
    CheckConfig,

    /// Print the effective configuration
    ShowConfig,
}

pub async fn run_command(cli: Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_or_default()?,
    };

    match cli.command {
        Commands::Run {
            interface,
            pcap,
            plugin,
        } => {
            let mut config = config;
            if let Some(iface) = interface {
                config.interface = Some(iface);
            }
            if let Some(path) = pcap {
                config.capture.pcap_file = Some(path.display().to_string());
            }
            if let Some(kind) = plugin {
                config.plugin.kind = kind;
            }
            run(config).await
        }

        Commands::CheckConfig => {
            let report = config.validate();

            if !report.warnings.is_empty() {
                println!("{}", "Validation warnings:".yellow().bold());
                for warning in &report.warnings {
                    println!("  - {}", warning);
                }
            }

            if report.is_ok() {
                println!("{}", "Configuration is valid".green());
                Ok(())
            } else {
                println!("{}", "Validation errors:".red().bold());
                for error in &report.errors {
                    println!("  - {}", error);
                }
                bail!("{} configuration error(s)", report.errors.len())
            }
        }

        Commands::ShowConfig => {
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

async fn run(config: Config) -> Result<()> {
    let report = config.validate();
    for warning in &report.warnings {
        tracing::warn!("{}", warning);
    }
    if !report.is_ok() {
        bail!("Invalid configuration: {}", report.errors.join("; "));
    }

    let engine = FlowEngine::new(config.clone());
    let source = open_source(&config, &engine)?;
    let consumer = consumer::from_config(&config.plugin)?;

    let summary = engine.run(source, consumer).await?;
    if summary.events_dropped > 0 {
        tracing::warn!(dropped = summary.events_dropped, "events were dropped on a full queue");
    }
    Ok(())
}

fn open_source(config: &Config, engine: &FlowEngine) -> Result<Box<dyn PacketSource>> {
    let dns_ports = config.dns_decode_ports();

    if let Some(path) = &config.capture.pcap_file {
        let source = PcapFileSource::open(path, dns_ports)
            .with_context(|| format!("Failed to open capture file {}", path))?;
        return Ok(Box::new(source));
    }

    let Some(interface) = config.interface.as_deref() else {
        bail!("No interface or capture file configured");
    };
    open_live(interface, config, engine, dns_ports)
}

#[cfg(feature = "live")]
fn open_live(
    interface: &str,
    config: &Config,
    engine: &FlowEngine,
    dns_ports: Vec<u16>,
) -> Result<Box<dyn PacketSource>> {
    use flowtap::capture::LiveSource;

    let expression = Some(config.filter.expression.as_str());
    let source = LiveSource::open(interface, &config.capture, expression, dns_ports, engine.running_flag())
        .with_context(|| format!("Failed to open interface {}", interface))?;
    Ok(Box::new(source))
}

#[cfg(not(feature = "live"))]
fn open_live(
    interface: &str,
    _config: &Config,
    _engine: &FlowEngine,
    _dns_ports: Vec<u16>,
) -> Result<Box<dyn PacketSource>> {
    bail!(
        "Cannot capture on {}: built without the \"live\" feature, use --pcap to replay a file",
        interface
    )
}
