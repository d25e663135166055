//! Colorized one-line rendering with optional reverse DNS decoration

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use colored::{ColoredString, Colorize};
use parking_lot::Mutex;
use tracing::debug;
use trust_dns_resolver::config::{ResolverConfig, ResolverOpts};
use trust_dns_resolver::TokioAsyncResolver;

use crate::config::Config;
use crate::core::{FlowEvent, SessionState};

use super::{EventConsumer, LineWriter};

/// Reverse (PTR) lookup backend
#[async_trait]
pub trait ReverseLookup: Send + Sync {
    async fn reverse(&self, ip: IpAddr) -> Option<String>;
}

/// PTR lookups through the system resolver configuration
pub struct SystemResolver {
    resolver: TokioAsyncResolver,
}

impl SystemResolver {
    pub fn new() -> Self {
        Self {
            resolver: TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default()),
        }
    }
}

impl Default for SystemResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ReverseLookup for SystemResolver {
    async fn reverse(&self, ip: IpAddr) -> Option<String> {
        match self.resolver.reverse_lookup(ip).await {
            Ok(response) => response
                .iter()
                .next()
                .map(|name| name.to_string().trim_end_matches('.').to_string()),
            Err(e) => {
                debug!(%ip, "reverse lookup failed: {}", e);
                None
            }
        }
    }
}

/// Default bound on cached addresses
pub const DEFAULT_MAX_ENTRIES: usize = 10_000;

/// TTL cache in front of a [`ReverseLookup`]; misses are cached too
pub struct ReverseDnsCache {
    lookup: Arc<dyn ReverseLookup>,
    ttl: Duration,
    max_entries: usize,
    entries: Mutex<HashMap<String, (Option<String>, Instant)>>,
}

impl ReverseDnsCache {
    pub fn new(lookup: Arc<dyn ReverseLookup>, ttl: Duration) -> Self {
        Self {
            lookup,
            ttl,
            max_entries: DEFAULT_MAX_ENTRIES,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Limit the number of cached addresses (at least 1)
    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = max_entries.max(1);
        self
    }

    /// Cache backed by the system resolver
    pub fn system(ttl: Duration) -> Self {
        Self::new(Arc::new(SystemResolver::new()), ttl)
    }

    pub async fn resolve(&self, ip: &str) -> Option<String> {
        let now = Instant::now();
        {
            let mut entries = self.entries.lock();
            match entries.get(ip) {
                Some((name, at)) if now.duration_since(*at) < self.ttl => return name.clone(),
                Some(_) => {
                    entries.remove(ip);
                }
                None => {}
            }
        }

        let name = match ip.parse::<IpAddr>() {
            Ok(addr) => self.lookup.reverse(addr).await,
            Err(_) => None,
        };
        let mut entries = self.entries.lock();
        if !entries.contains_key(ip) && entries.len() >= self.max_entries {
            self.evict(&mut entries, now);
        }
        entries.insert(ip.to_string(), (name.clone(), now));
        name
    }

    /// Drop expired entries; if still full, drop the oldest one
    fn evict(&self, entries: &mut HashMap<String, (Option<String>, Instant)>, now: Instant) {
        let ttl = self.ttl;
        entries.retain(|_, (_, at)| now.duration_since(*at) < ttl);

        if entries.len() >= self.max_entries {
            let oldest = entries
                .iter()
                .min_by_key(|(_, (_, at))| *at)
                .map(|(ip, _)| ip.clone());
            if let Some(ip) = oldest {
                entries.remove(&ip);
            }
        }
        debug!(entries = entries.len(), "reverse DNS cache evicted");
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

pub struct PlainConsumer {
    out: LineWriter,
    rdns: Option<ReverseDnsCache>,
}

impl PlainConsumer {
    pub fn stdout(rdns: Option<ReverseDnsCache>) -> Self {
        Self {
            out: LineWriter::stdout(),
            rdns,
        }
    }

    pub fn with_writer(out: Box<dyn std::io::Write + Send>, rdns: Option<ReverseDnsCache>) -> Self {
        Self {
            out: LineWriter::new(out),
            rdns,
        }
    }
}

/// Uncolored line for an event; `dst_name` is the destination's PTR name
pub fn render(event: &FlowEvent, dst_name: Option<&str>) -> String {
    let dst = match dst_name {
        Some(name) => format!("{} ({})", event.dst_ip, name),
        None => event.dst_ip.clone(),
    };

    let mut line = if event.is_icmp() {
        format!(
            "[{}] {} -> {} Protocol: {} ({})",
            event.timestamp_str(),
            event.src_ip,
            dst,
            event.protocol_name,
            event.protocol_num
        )
    } else {
        format!(
            "[{}] {}:{} -> {}:{} Protocol: {} ({}), State: {}, Session: {}",
            event.timestamp_str(),
            event.src_ip,
            opt(event.src_port),
            dst,
            opt(event.dst_port),
            event.protocol_name,
            event.protocol_num,
            opt(event.state),
            opt(event.session_id)
        )
    };

    if let Some(domain) = event.dns_query() {
        line.push_str(&format!(", DNS: {}", domain));
    }
    line
}

fn opt<T: std::fmt::Display>(value: Option<T>) -> String {
    value.map_or_else(|| "-".to_string(), |v| v.to_string())
}

fn colorize(line: String, state: Option<SessionState>) -> ColoredString {
    match state {
        Some(SessionState::New) => line.blue(),
        Some(SessionState::Established) => line.green(),
        Some(SessionState::Close) => line.red(),
        Some(SessionState::Abort) => line.bright_red().bold(),
        _ => line.yellow(),
    }
}

#[async_trait]
impl EventConsumer for PlainConsumer {
    fn name(&self) -> &str {
        "plain"
    }

    async fn handle(&self, event: &FlowEvent, _config: Option<&Config>) -> anyhow::Result<()> {
        let dst_name = match &self.rdns {
            Some(cache) => cache.resolve(&event.dst_ip).await,
            None => None,
        };
        let line = colorize(render(event, dst_name.as_deref()), event.state);
        self.out.write_line(&line.to_string())?;
        Ok(())
    }
}
