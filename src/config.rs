//! # Configuration
//!
//! INI configuration with sections `[router]`, `[network]`, `[dns]`,
//! `[bind]`, `[connect]`, `[api]`, `[lokid]`, `[bootstrap]`, `[logging]`.
//! Unrecognised sections are an error; unrecognised options inside a known
//! section are an error too, except in the free-form sections (`[dns]`,
//! `[bind]`, `[connect]`) whose keys are data.
//!
//! Constraint violations abort startup with [`RouterError::ConfigInvalid`].
//! Role is inferred from `[bind]`: a node with inbound links is a relay,
//! otherwise a client; per-role connection floors are applied during
//! validation.

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::error::RouterError;
use crate::identity::RouterId;

/// Lower bound for the logic queue depth.
pub const MIN_JOB_QUEUE_SIZE: usize = 1024;

/// Netid must fit the fixed-size field in the RC.
pub const MAX_NETID_LEN: usize = 8;

pub const DEFAULT_NETID: &str = "veilnet";

/// Per-role connection defaults (minimum, maximum).
pub const RELAY_CONNECTION_LIMITS: (usize, usize) = (6, 60);
pub const CLIENT_CONNECTION_LIMITS: (usize, usize) = (4, 6);

pub const MAX_HOPS: usize = 8;
pub const MAX_PATHS: usize = 8;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LogSink {
    Stdout,
    File,
    Json,
}

#[derive(Clone, Debug)]
pub struct RouterSection {
    pub job_queue_size: usize,
    pub netid: String,
    pub min_connections: usize,
    pub max_connections: usize,
    pub data_dir: PathBuf,
    pub public_address: Option<Ipv4Addr>,
    pub public_port: Option<u16>,
    pub worker_threads: usize,
    pub net_threads: usize,
    pub block_bogons: bool,
}

impl Default for RouterSection {
    fn default() -> Self {
        Self {
            job_queue_size: MIN_JOB_QUEUE_SIZE,
            netid: DEFAULT_NETID.to_string(),
            min_connections: 0,
            max_connections: 0,
            data_dir: PathBuf::from("."),
            public_address: None,
            public_port: None,
            worker_threads: 1,
            net_threads: 1,
            block_bogons: true,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct NetworkSection {
    pub profiling: Option<bool>,
    pub hops: usize,
    pub paths: usize,
    pub strict_connect: Vec<RouterId>,
    pub blacklist: Vec<RouterId>,
}

#[derive(Clone, Debug)]
pub struct BindSection {
    pub interface: String,
    pub port: u16,
}

#[derive(Clone, Debug, Default)]
pub struct ApiSection {
    pub enabled: bool,
    pub bind: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct LokidSection {
    pub enabled: bool,
    pub jsonrpc: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Clone, Debug)]
pub struct LoggingSection {
    pub sink: LogSink,
    pub level: String,
    pub file: Option<PathBuf>,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            sink: LogSink::Stdout,
            level: "info".to_string(),
            file: None,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct Config {
    pub router: RouterSection,
    pub network: NetworkSection,
    /// Free-form DNS options consumed by the platform glue, not the core.
    pub dns: Vec<(String, String)>,
    pub binds: Vec<BindSection>,
    /// RC files to connect to at startup.
    pub connect_files: Vec<PathBuf>,
    pub api: ApiSection,
    pub lokid: LokidSection,
    /// Bootstrap RC files.
    pub bootstrap_files: Vec<PathBuf>,
    pub logging: LoggingSection,
}

impl Config {
    /// A node with inbound links is a relay (service node).
    pub fn is_relay(&self) -> bool {
        !self.binds.is_empty()
    }

    pub fn load(path: &Path) -> Result<Self, RouterError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| RouterError::ConfigInvalid(format!("{}: {e}", path.display())))?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self, RouterError> {
        let entries = parse_ini(text)?;
        let mut config = Config {
            network: NetworkSection {
                hops: 4,
                paths: 6,
                ..Default::default()
            },
            ..Default::default()
        };
        let mut seen_blacklist: HashSet<RouterId> = HashSet::new();

        for (section, key, value) in &entries {
            match section.as_str() {
                "router" => config.apply_router_option(key, value)?,
                "network" => config.apply_network_option(key, value, &mut seen_blacklist)?,
                "dns" => config.dns.push((key.clone(), value.clone())),
                "bind" => {
                    let port: u16 = value.parse().map_err(|_| {
                        RouterError::ConfigInvalid(format!("bind.{key}: bad port '{value}'"))
                    })?;
                    if port == 0 {
                        return Err(RouterError::ConfigInvalid(format!(
                            "bind.{key}: port must be > 0"
                        )));
                    }
                    config.binds.push(BindSection {
                        interface: key.clone(),
                        port,
                    });
                }
                "connect" => config.connect_files.push(PathBuf::from(value)),
                "api" => match key.as_str() {
                    "enabled" => config.api.enabled = parse_bool(section, key, value)?,
                    "bind" => config.api.bind = Some(value.clone()),
                    _ => return Err(unknown_option(section, key)),
                },
                "lokid" => match key.as_str() {
                    "enabled" => config.lokid.enabled = parse_bool(section, key, value)?,
                    "jsonrpc" => config.lokid.jsonrpc = Some(value.clone()),
                    "username" => config.lokid.username = Some(value.clone()),
                    "password" => config.lokid.password = Some(value.clone()),
                    _ => return Err(unknown_option(section, key)),
                },
                "bootstrap" => match key.as_str() {
                    "add-node" => config.bootstrap_files.push(PathBuf::from(value)),
                    _ => return Err(unknown_option(section, key)),
                },
                "logging" => match key.as_str() {
                    "type" => {
                        config.logging.sink = match value.as_str() {
                            "stdout" => LogSink::Stdout,
                            "file" => LogSink::File,
                            "json" => LogSink::Json,
                            other => {
                                return Err(RouterError::ConfigInvalid(format!(
                                    "logging.type: unknown sink '{other}'"
                                )))
                            }
                        }
                    }
                    "level" => {
                        let level = value.to_ascii_lowercase();
                        if !["trace", "debug", "info", "warn", "error"].contains(&level.as_str()) {
                            return Err(RouterError::ConfigInvalid(format!(
                                "logging.level: unknown level '{value}'"
                            )));
                        }
                        config.logging.level = level;
                    }
                    "file" => config.logging.file = Some(PathBuf::from(value)),
                    _ => return Err(unknown_option(section, key)),
                },
                other => {
                    return Err(RouterError::ConfigInvalid(format!(
                        "unrecognised section [{other}]"
                    )))
                }
            }
        }

        config.validate()?;
        Ok(config)
    }

    fn apply_router_option(&mut self, key: &str, value: &str) -> Result<(), RouterError> {
        match key {
            "job-queue-size" => {
                self.router.job_queue_size = parse_number(key, value)?;
            }
            "netid" => self.router.netid = value.to_string(),
            "min-connections" => self.router.min_connections = parse_number(key, value)?,
            "max-connections" => self.router.max_connections = parse_number(key, value)?,
            "data-dir" => self.router.data_dir = PathBuf::from(value),
            "public-address" => {
                let addr: Ipv4Addr = value.parse().map_err(|_| {
                    RouterError::ConfigInvalid(format!(
                        "router.public-address: bad IPv4 address '{value}'"
                    ))
                })?;
                self.router.public_address = Some(addr);
            }
            "public-port" => {
                let port: u16 = value.parse().map_err(|_| {
                    RouterError::ConfigInvalid(format!("router.public-port: bad port '{value}'"))
                })?;
                if port == 0 {
                    return Err(RouterError::ConfigInvalid(
                        "router.public-port: port must be > 0".into(),
                    ));
                }
                self.router.public_port = Some(port);
            }
            "worker-threads" => self.router.worker_threads = parse_number(key, value)?,
            "net-threads" => self.router.net_threads = parse_number(key, value)?,
            "block-bogons" => self.router.block_bogons = parse_bool("router", key, value)?,
            _ => return Err(unknown_option("router", key)),
        }
        Ok(())
    }

    fn apply_network_option(
        &mut self,
        key: &str,
        value: &str,
        seen_blacklist: &mut HashSet<RouterId>,
    ) -> Result<(), RouterError> {
        match key {
            "profiling" => self.network.profiling = Some(parse_bool("network", key, value)?),
            "hops" => self.network.hops = parse_number(key, value)?,
            "paths" => self.network.paths = parse_number(key, value)?,
            "strict-connect" => {
                let id = parse_router_id("network.strict-connect", value)?;
                self.network.strict_connect.push(id);
            }
            "blacklist-snode" => {
                let id = parse_router_id("network.blacklist-snode", value)?;
                if !seen_blacklist.insert(id) {
                    warn!(peer = %id, "duplicate blacklist-snode entry ignored");
                    return Ok(());
                }
                self.network.blacklist.push(id);
            }
            _ => return Err(unknown_option("network", key)),
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<(), RouterError> {
        if self.router.job_queue_size < MIN_JOB_QUEUE_SIZE {
            return Err(RouterError::ConfigInvalid(format!(
                "router.job-queue-size: {} is below the minimum {MIN_JOB_QUEUE_SIZE}",
                self.router.job_queue_size
            )));
        }
        if self.router.netid.is_empty() || self.router.netid.len() > MAX_NETID_LEN {
            return Err(RouterError::ConfigInvalid(format!(
                "router.netid: must be 1..={MAX_NETID_LEN} bytes"
            )));
        }
        if self.router.worker_threads == 0 {
            return Err(RouterError::ConfigInvalid(
                "router.worker-threads: must be > 0".into(),
            ));
        }
        if self.router.net_threads == 0 {
            return Err(RouterError::ConfigInvalid(
                "router.net-threads: must be > 0".into(),
            ));
        }
        if !self.router.data_dir.is_dir() {
            return Err(RouterError::ConfigInvalid(format!(
                "router.data-dir: {} does not exist",
                self.router.data_dir.display()
            )));
        }

        // Per-role floors; explicit settings may only raise them.
        let (default_min, default_max) = if self.is_relay() {
            RELAY_CONNECTION_LIMITS
        } else {
            CLIENT_CONNECTION_LIMITS
        };
        self.router.min_connections = self.router.min_connections.max(default_min);
        self.router.max_connections = self.router.max_connections.max(default_max);
        if self.router.max_connections < self.router.min_connections {
            return Err(RouterError::ConfigInvalid(format!(
                "router.max-connections: {} is below min-connections {}",
                self.router.max_connections, self.router.min_connections
            )));
        }

        if self.network.hops == 0 || self.network.hops > MAX_HOPS {
            return Err(RouterError::ConfigInvalid(format!(
                "network.hops: must be 1..={MAX_HOPS}"
            )));
        }
        if self.network.paths == 0 || self.network.paths > MAX_PATHS {
            return Err(RouterError::ConfigInvalid(format!(
                "network.paths: must be 1..={MAX_PATHS}"
            )));
        }
        if self.is_relay() && !self.network.strict_connect.is_empty() {
            return Err(RouterError::ConfigInvalid(
                "network.strict-connect: not usable on a relay".into(),
            ));
        }

        for file in &self.bootstrap_files {
            if !file.exists() {
                return Err(RouterError::ConfigInvalid(format!(
                    "bootstrap.add-node: no such file {}",
                    file.display()
                )));
            }
        }

        if self.logging.sink == LogSink::File && self.logging.file.is_none() {
            return Err(RouterError::ConfigInvalid(
                "logging.type=file requires logging.file".into(),
            ));
        }

        Ok(())
    }

    /// Default config text for a relay.
    pub fn default_router_ini() -> String {
        format!(
            "# veilnet relay configuration\n\
             [router]\n\
             netid = {DEFAULT_NETID}\n\
             data-dir = .\n\
             min-connections = 6\n\
             max-connections = 60\n\
             block-bogons = true\n\
             \n\
             [bind]\n\
             0.0.0.0 = 1090\n\
             \n\
             [network]\n\
             hops = 4\n\
             paths = 6\n\
             \n\
             [logging]\n\
             type = stdout\n\
             level = info\n"
        )
    }

    /// Default config text for a client.
    pub fn default_client_ini() -> String {
        format!(
            "# veilnet client configuration\n\
             [router]\n\
             netid = {DEFAULT_NETID}\n\
             data-dir = .\n\
             min-connections = 4\n\
             max-connections = 6\n\
             \n\
             [network]\n\
             profiling = true\n\
             hops = 4\n\
             paths = 6\n\
             \n\
             [logging]\n\
             type = stdout\n\
             level = info\n"
        )
    }
}

fn unknown_option(section: &str, key: &str) -> RouterError {
    RouterError::ConfigInvalid(format!("unknown option {section}.{key}"))
}

fn parse_bool(section: &str, key: &str, value: &str) -> Result<bool, RouterError> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Ok(true),
        "false" | "no" | "off" | "0" => Ok(false),
        _ => Err(RouterError::ConfigInvalid(format!(
            "{section}.{key}: expected a boolean, got '{value}'"
        ))),
    }
}

fn parse_number(key: &str, value: &str) -> Result<usize, RouterError> {
    value
        .parse()
        .map_err(|_| RouterError::ConfigInvalid(format!("{key}: expected a number, got '{value}'")))
}

fn parse_router_id(option: &str, value: &str) -> Result<RouterId, RouterError> {
    RouterId::from_hex(value)
        .map_err(|_| RouterError::ConfigInvalid(format!("{option}: bad router id '{value}'")))
}

/// Minimal INI line reader: `[section]` headers, `key = value` pairs,
/// `#`/`;` comments. Duplicate keys are preserved in order for the
/// multi-value options.
fn parse_ini(text: &str) -> Result<Vec<(String, String, String)>, RouterError> {
    let mut entries = Vec::new();
    let mut section: Option<String> = None;

    for (lineno, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if let Some(name) = line.strip_prefix('[') {
            let name = name.strip_suffix(']').ok_or_else(|| {
                RouterError::ConfigInvalid(format!("line {}: malformed section header", lineno + 1))
            })?;
            section = Some(name.trim().to_ascii_lowercase());
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            return Err(RouterError::ConfigInvalid(format!(
                "line {}: expected 'key = value'",
                lineno + 1
            )));
        };
        let Some(section) = &section else {
            return Err(RouterError::ConfigInvalid(format!(
                "line {}: option outside any section",
                lineno + 1
            )));
        };
        entries.push((
            section.clone(),
            key.trim().to_string(),
            value.trim().to_string(),
        ));
    }
    Ok(entries)
}
