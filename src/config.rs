use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::capture::CaptureConfig;
use crate::consumer::{PluginConfig, PluginKind};
use crate::engine::dispatch::DispatchConfig;
use crate::engine::pipeline::DEFAULT_QUEUE_SIZE;
use crate::filter::{parse_network, FilterCriteria, FlowFilter, PROTOCOL_NAMES};
use crate::flow::{SessionConfig, MAX_TIMEOUT};

/// Main configuration structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Interface to capture on
    pub interface: Option<String>,

    /// Event queue capacity
    pub queue_size: usize,

    pub capture: CaptureConfig,
    pub filter: FilterCriteria,
    pub session: SessionConfig,
    pub dispatch: DispatchConfig,
    pub plugin: PluginConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            interface: None,
            queue_size: DEFAULT_QUEUE_SIZE,
            capture: CaptureConfig::default(),
            filter: FilterCriteria::default(),
            session: SessionConfig::default(),
            dispatch: DispatchConfig::default(),
            plugin: PluginConfig::default(),
        }
    }
}

impl Config {
    /// Load config from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.as_ref().display()))?;

        Ok(config)
    }

    /// Load config from default locations or create default
    pub fn load_or_default() -> Result<Self> {
        let paths = [
            PathBuf::from("/etc/flowtap/config.toml"),
            dirs_next::config_dir()
                .map(|p| p.join("flowtap/config.toml"))
                .unwrap_or_default(),
            PathBuf::from("config.toml"),
        ];

        for path in &paths {
            if path.is_file() {
                return Self::load(path);
            }
        }

        Ok(Self::default())
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(&path, content)
            .with_context(|| format!("Failed to write config file: {}", path.as_ref().display()))?;
        Ok(())
    }

    /// UDP ports whose payload the decoder parses as DNS
    ///
    /// Empty unless DNS annotation is enabled.
    pub fn dns_decode_ports(&self) -> Vec<u16> {
        let dns = &self.filter.payload.dns;
        if !dns.enabled {
            return Vec::new();
        }
        match dns.ports.as_deref() {
            Some(ports) if !ports.is_empty() => ports.to_vec(),
            _ => vec![self.session.dns_port],
        }
    }

    /// Check every setting and collect all problems at once
    pub fn validate(&self) -> ValidationReport {
        let mut report = ValidationReport::default();

        match (&self.interface, &self.capture.pcap_file) {
            (None, None) => report.error("interface is required unless capture.pcap_file is set"),
            (Some(iface), _) if iface.trim().is_empty() => report.error("interface must not be empty"),
            _ => {}
        }

        if let Some(file) = &self.capture.pcap_file {
            if !Path::new(file).is_file() {
                report.error(format!("capture.pcap_file {} does not exist", file));
            }
        }

        if self.queue_size == 0 {
            report.error("queue_size must be greater than 0");
        }

        let filter = &self.filter;
        for (path, list) in [("filter.source", &filter.source), ("filter.destination", &filter.destination)] {
            let Some(list) = report.optional_list(path, list) else {
                continue;
            };
            for value in list {
                if parse_network(value).is_err() {
                    report.error(format!(
                        "{} contains an invalid value: {}. Expected a CIDR range or a single IP address",
                        path, value
                    ));
                }
            }
        }

        report.optional_list("filter.port", &filter.port);

        if let Some(protocols) = report.optional_list("filter.protocol", &filter.protocol) {
            for value in protocols {
                if !PROTOCOL_NAMES.contains(&value.trim().to_lowercase().as_str()) {
                    report.error(format!(
                        "filter.protocol contains an invalid value: {}. Allowed values are: {}",
                        value,
                        PROTOCOL_NAMES.join(", ")
                    ));
                }
            }
        }

        let dns = &filter.payload.dns;
        report.optional_list("filter.payload.dns.ports", &dns.ports);
        if dns.patterns.iter().any(|p| p.trim().is_empty()) {
            report.error("filter.payload.dns.match entries must be non-empty strings");
        } else if let Err(e) = FlowFilter::new(filter) {
            // networks were reported above; only glob failures are new here
            if matches!(e, crate::error::FlowError::InvalidGlob { .. }) {
                report.error(format!("filter.payload.dns.match: {}", e));
            }
        }
        if !dns.enabled && (!dns.patterns.is_empty() || dns.ports.is_some()) {
            report.warning("filter.payload.dns is configured but not enabled, ignored");
        }

        let session = &self.session;
        if session.tcp_timeout_secs == 0 {
            report.error("session.tcp_timeout_secs must be greater than 0");
        }
        if session.udp_timeout_secs == 0 || session.udp_dns_timeout_secs == 0 {
            report.error("session UDP timeouts must be greater than 0");
        }
        if session.sweep_interval_secs == 0 {
            report.warning("session.sweep_interval_secs is 0, using 100ms");
        }
        let max_secs = MAX_TIMEOUT.as_secs();
        for (name, secs) in [
            ("tcp_timeout_secs", session.tcp_timeout_secs),
            ("udp_timeout_secs", session.udp_timeout_secs),
            ("udp_dns_timeout_secs", session.udp_dns_timeout_secs),
            ("sweep_interval_secs", session.sweep_interval_secs),
        ] {
            if secs > max_secs {
                report.error(format!("session.{} is {}, the maximum is {}", name, secs, max_secs));
            }
        }

        if self.dispatch.bypass_poll_delay {
            report.warning("dispatch.bypass_poll_delay is set, the poll delay is ignored");
        }

        let plugin = &self.plugin;
        match plugin.kind {
            PluginKind::Command if plugin.command.is_empty() => {
                report.error("plugin.command is required when plugin.kind is \"command\"")
            }
            PluginKind::Command => {}
            _ if !plugin.command.is_empty() => {
                report.warning("plugin.command is set but plugin.kind is not \"command\", ignored")
            }
            _ => {}
        }
        if plugin.reverse_dns && plugin.kind != PluginKind::Plain {
            report.warning("plugin.reverse_dns only applies to the plain plugin, ignored");
        }

        report
    }
}

/// Outcome of [`Config::validate`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    fn error(&mut self, msg: impl Into<String>) {
        self.errors.push(msg.into());
    }

    fn warning(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg.into());
    }

    /// Warn about a list that is present but empty; returns the list otherwise
    fn optional_list<'a, T>(&mut self, path: &str, list: &'a Option<Vec<T>>) -> Option<&'a [T]> {
        match list.as_deref() {
            Some([]) => {
                self.warning(format!("{} is set but empty, ignored", path));
                None
            }
            other => other,
        }
    }
}
