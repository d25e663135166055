//! Event consumers
//!
//! The dispatch loop hands every event to exactly one [`EventConsumer`].
//! Built-in consumers print events (debug text, colorized lines, JSON lines)
//! or stream them to an external program.

pub mod command;
pub mod json;
pub mod plain;
pub mod text;

pub use command::CommandConsumer;
pub use json::JsonLinesConsumer;
pub use plain::{PlainConsumer, ReverseDnsCache};
pub use text::TextSink;

use std::io::Write;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::core::FlowEvent;

/// Receiver of finished events
#[async_trait]
pub trait EventConsumer: Send + Sync {
    /// Consumer name for logs
    fn name(&self) -> &str;

    /// Handle one event; `config` is only passed when the plugin asks for it
    async fn handle(&self, event: &FlowEvent, config: Option<&Config>) -> anyhow::Result<()>;

    /// Flush and release resources after the last event
    async fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Built-in consumer kinds
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum PluginKind {
    /// Debug line per event
    #[default]
    Text,
    /// Colorized line per event
    Plain,
    /// JSON object per line
    Json,
    /// JSON lines piped into an external program
    Command,
}

/// Plugin section of the configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginConfig {
    pub kind: PluginKind,
    /// Program and arguments for the `command` kind
    pub command: Vec<String>,
    /// Hand the configuration snapshot to the consumer with every event
    pub pass_config: bool,
    /// Decorate destinations with reverse DNS names (`plain` kind)
    pub reverse_dns: bool,
    /// Lifetime of cached reverse DNS answers, misses included
    pub reverse_dns_ttl_secs: u64,
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            kind: PluginKind::Text,
            command: Vec::new(),
            pass_config: false,
            reverse_dns: false,
            reverse_dns_ttl_secs: 120,
        }
    }
}

/// Build the configured consumer
///
/// The `command` kind spawns its program here, so this must run inside the
/// tokio runtime.
pub fn from_config(config: &PluginConfig) -> anyhow::Result<Arc<dyn EventConsumer>> {
    let consumer: Arc<dyn EventConsumer> = match config.kind {
        PluginKind::Text => Arc::new(TextSink::stdout()),
        PluginKind::Plain => {
            let rdns = config
                .reverse_dns
                .then(|| ReverseDnsCache::system(config.reverse_dns_ttl()));
            Arc::new(PlainConsumer::stdout(rdns))
        }
        PluginKind::Json => Arc::new(JsonLinesConsumer::stdout()),
        PluginKind::Command => Arc::new(
            CommandConsumer::spawn(&config.command).context("Failed to start plugin command")?,
        ),
    };
    Ok(consumer)
}

impl PluginConfig {
    pub fn reverse_dns_ttl(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.reverse_dns_ttl_secs)
    }
}

/// Line-oriented output shared by the printing consumers
pub(crate) struct LineWriter {
    out: Mutex<Box<dyn Write + Send>>,
}

impl LineWriter {
    pub(crate) fn stdout() -> Self {
        Self::new(Box::new(std::io::stdout()))
    }

    pub(crate) fn new(out: Box<dyn Write + Send>) -> Self {
        Self { out: Mutex::new(out) }
    }

    pub(crate) fn write_line(&self, line: &str) -> std::io::Result<()> {
        let mut out = self.out.lock();
        writeln!(out, "{}", line)?;
        out.flush()
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plugin_config_defaults() {
        let config: PluginConfig = toml::from_str("").unwrap();
        assert_eq!(config.kind, PluginKind::Text);
        assert_eq!(config.reverse_dns_ttl_secs, 120);
        assert!(!config.pass_config);
    }

    #[test]
    fn test_plugin_kind_from_toml() {
        let config: PluginConfig = toml::from_str(
            r#"
            kind = "command"
            command = ["/usr/bin/logger", "-t", "flowtap"]
            pass_config = true
            "#,
        )
        .unwrap();
        assert_eq!(config.kind, PluginKind::Command);
        assert_eq!(config.command.len(), 3);
        assert!(config.pass_config);
    }

    #[tokio::test]
    async fn test_from_config_builds_named_consumer() {
        let consumer = from_config(&PluginConfig {
            kind: PluginKind::Json,
            ..Default::default()
        })
        .unwrap();
        assert_eq!(consumer.name(), "json");
    }

    #[tokio::test]
    async fn test_command_requires_program() {
        let err = from_config(&PluginConfig {
            kind: PluginKind::Command,
            ..Default::default()
        });
        assert!(err.is_err());
    }
}
