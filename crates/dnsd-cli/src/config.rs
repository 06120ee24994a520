//! Configuration file for the dnsd server.

use crate::control::ControlConfig;
use anyhow::Context;
use dnsd_core::wire::Soa;
use dnsd_core::zone::parse_record;
use dnsd_core::{
    ConnectionPool, MAX_UDP_PAYLOAD, Name, NotifyConfig, Remote, RemoteAddr, Zone, ZoneSet,
};
use dnsd_transport::{QuicConfig, ServerConfig, TableConfig, XdpInterface, quic::DEFAULT_BUCKETS};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Idle outbound connections kept per remote for NOTIFY reuse
const NOTIFY_POOL_PER_REMOTE: usize = 2;

/// dnsd configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Listener and worker configuration
    #[serde(default)]
    pub server: ServerSection,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Remote control socket
    #[serde(default)]
    pub control: ControlConfig,
    /// NOTIFY targets
    #[serde(default, rename = "remote")]
    pub remotes: Vec<RemoteConfig>,
    /// Served zones
    #[serde(default, rename = "zone")]
    pub zones: Vec<ZoneConfig>,
}

/// `[server]` section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    /// UDP listening addresses
    #[serde(default = "default_listen")]
    pub listen: Vec<String>,
    /// UDP worker threads (0 = one per core)
    #[serde(default)]
    pub udp_workers: usize,
    /// QUIC worker threads
    #[serde(default = "default_quic_workers")]
    pub quic_workers: usize,
    /// QUIC listening addresses
    #[serde(default)]
    pub quic_listen: Vec<String>,
    /// One socket per worker with SO_REUSEPORT
    #[serde(default = "default_reuseport")]
    pub reuseport: bool,
    /// XDP interfaces
    #[serde(default)]
    pub xdp_interfaces: Vec<XdpInterfaceConfig>,
    /// TCP Fast Open for outbound exchanges
    #[serde(default)]
    pub tcp_fastopen: bool,
    /// Deadline of one outbound exchange
    #[serde(default = "default_remote_io_timeout_ms")]
    pub remote_io_timeout_ms: u64,
    /// QUIC certificate chain
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quic_cert_file: Option<PathBuf>,
    /// QUIC private key
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quic_key_file: Option<PathBuf>,
    /// Buckets of each QUIC connection table
    #[serde(default = "default_quic_table_buckets")]
    pub quic_table_buckets: usize,
    /// Live QUIC connections per worker
    #[serde(default = "default_quic_max_connections")]
    pub quic_max_connections: usize,
    /// QUIC connection inactivity limit
    #[serde(default = "default_quic_idle_timeout_ms")]
    pub quic_idle_timeout_ms: u64,
    /// Largest UDP reply
    #[serde(default = "default_udp_max_payload")]
    pub udp_max_payload: u16,
}

/// XDP interface entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct XdpInterfaceConfig {
    /// Interface name
    pub name: String,
    /// Queue count
    #[serde(default = "default_queues")]
    pub queues: usize,
    /// Pinned XSKMAP of the redirect program
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub xsks_map: Option<PathBuf>,
}

/// `[logging]` section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

/// `[[remote]]` entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Identifier referenced by zones
    pub id: String,
    /// Addresses tried in order
    pub address: Vec<String>,
    /// Source addresses; each destination uses the first of its family
    #[serde(default)]
    pub via: Vec<String>,
    /// Signing key name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

/// `[[zone]]` entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZoneConfig {
    /// Zone apex
    pub domain: String,
    /// Remote ids notified of changes
    #[serde(default)]
    pub notify: Vec<String>,
    /// Zone contents start at the SOA; without it the zone is empty
    #[serde(skip_serializing_if = "Option::is_none")]
    pub soa: Option<SoaConfig>,
    /// Additional records
    #[serde(default, rename = "record")]
    pub records: Vec<RecordConfig>,
}

/// `[zone.soa]` table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SoaConfig {
    /// Primary name server
    pub mname: String,
    /// Responsible mailbox
    pub rname: String,
    /// Zone serial
    pub serial: u32,
    /// Refresh interval
    #[serde(default = "default_refresh")]
    pub refresh: u32,
    /// Retry interval
    #[serde(default = "default_retry")]
    pub retry: u32,
    /// Expire limit
    #[serde(default = "default_expire")]
    pub expire: u32,
    /// Negative caching TTL
    #[serde(default = "default_minimum")]
    pub minimum: u32,
    /// TTL of the SOA record and default for other records
    #[serde(default = "default_ttl")]
    pub ttl: u32,
}

/// `[[zone.record]]` entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordConfig {
    /// Owner name; `@` is the apex
    pub owner: String,
    /// Record type (A, AAAA, NS, TXT)
    #[serde(rename = "type")]
    pub rtype: String,
    /// TTL, defaulting to the SOA TTL
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u32>,
    /// Presentation data
    pub data: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            udp_workers: 0,
            quic_workers: default_quic_workers(),
            quic_listen: Vec::new(),
            reuseport: default_reuseport(),
            xdp_interfaces: Vec::new(),
            tcp_fastopen: false,
            remote_io_timeout_ms: default_remote_io_timeout_ms(),
            quic_cert_file: None,
            quic_key_file: None,
            quic_table_buckets: default_quic_table_buckets(),
            quic_max_connections: default_quic_max_connections(),
            quic_idle_timeout_ms: default_quic_idle_timeout_ms(),
            udp_max_payload: default_udp_max_payload(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_listen() -> Vec<String> {
    vec!["0.0.0.0:53".to_string()]
}

fn default_quic_workers() -> usize {
    1
}

fn default_reuseport() -> bool {
    cfg!(target_os = "linux")
}

fn default_remote_io_timeout_ms() -> u64 {
    5000
}

fn default_quic_table_buckets() -> usize {
    DEFAULT_BUCKETS
}

fn default_quic_max_connections() -> usize {
    10_000
}

fn default_quic_idle_timeout_ms() -> u64 {
    30_000
}

fn default_udp_max_payload() -> u16 {
    MAX_UDP_PAYLOAD
}

fn default_queues() -> usize {
    1
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_refresh() -> u32 {
    3600
}

fn default_retry() -> u32 {
    600
}

fn default_expire() -> u32 {
    604_800
}

fn default_minimum() -> u32 {
    3600
}

fn default_ttl() -> u32 {
    3600
}

fn parse_addrs(addrs: &[String], what: &str) -> anyhow::Result<Vec<SocketAddr>> {
    addrs
        .iter()
        .map(|a| {
            a.parse::<SocketAddr>()
                .map_err(|_| anyhow::anyhow!("Invalid {what} '{a}' (expected ip:port)"))
        })
        .collect()
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("cannot read configuration {}", path.display()))?;
        Self::parse(&contents)
    }

    /// Parse configuration from TOML text
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not a valid configuration.
    pub fn parse(contents: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(contents)?;
        Ok(config)
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is invalid.
    pub fn validate(&self) -> anyhow::Result<()> {
        let server = &self.server;
        let listen = parse_addrs(&server.listen, "listen address")?;
        let quic_listen = parse_addrs(&server.quic_listen, "QUIC listen address")?;
        if listen.is_empty() && quic_listen.is_empty() && server.xdp_interfaces.is_empty() {
            anyhow::bail!("No listen address, QUIC address or XDP interface configured");
        }

        if let Some(iface) = server.xdp_interfaces.iter().find(|i| i.queues == 0) {
            anyhow::bail!("XDP interface {} must have at least one queue", iface.name);
        }

        if server.quic_table_buckets == 0 {
            anyhow::bail!("quic_table_buckets must be greater than 0");
        }

        if !quic_listen.is_empty() && !server.reuseport && server.quic_workers > 1 {
            anyhow::bail!(
                "quic_workers = {} requires reuseport; QUIC workers cannot share a socket",
                server.quic_workers
            );
        }

        match (&server.quic_cert_file, &server.quic_key_file) {
            (Some(_), None) => anyhow::bail!("quic_cert_file is set without quic_key_file"),
            (None, Some(_)) => anyhow::bail!("quic_key_file is set without quic_cert_file"),
            _ => {}
        }

        if self.control.enabled && self.control.listen.as_os_str().is_empty() {
            anyhow::bail!("control.listen must not be empty while control is enabled");
        }

        if server.udp_max_payload < 512 {
            anyhow::bail!(
                "udp_max_payload must be at least 512, got {}",
                server.udp_max_payload
            );
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid log level: {}. Must be one of: {}",
                self.logging.level,
                valid_log_levels.join(", ")
            );
        }

        let mut ids = HashSet::new();
        for remote in &self.remotes {
            if !ids.insert(remote.id.as_str()) {
                anyhow::bail!("Duplicate remote id '{}'", remote.id);
            }
            if remote.address.is_empty() {
                anyhow::bail!("Remote '{}' has no address", remote.id);
            }
            self.build_remote(remote)?;
        }

        for zone in &self.zones {
            if let Some(id) = zone.notify.iter().find(|id| !ids.contains(id.as_str())) {
                anyhow::bail!("Zone {} notifies unknown remote '{}'", zone.domain, id);
            }
        }

        self.build_zones()?;
        Ok(())
    }

    /// Listener configuration for the transport
    ///
    /// # Errors
    ///
    /// Returns an error if an address is malformed.
    pub fn server_config(&self) -> anyhow::Result<ServerConfig> {
        let server = &self.server;
        Ok(ServerConfig {
            listen: parse_addrs(&server.listen, "listen address")?,
            quic_listen: parse_addrs(&server.quic_listen, "QUIC listen address")?,
            udp_workers: server.udp_workers,
            quic_workers: server.quic_workers,
            reuseport: server.reuseport,
            xdp: server
                .xdp_interfaces
                .iter()
                .map(|i| XdpInterface {
                    name: i.name.clone(),
                    queues: i.queues,
                    xsks_map: i.xsks_map.clone(),
                })
                .collect(),
            max_udp_payload: server.udp_max_payload,
            quic: QuicConfig {
                cert_file: server.quic_cert_file.clone(),
                key_file: server.quic_key_file.clone(),
                table: TableConfig {
                    buckets: server.quic_table_buckets,
                    max_connections: server.quic_max_connections,
                    idle_timeout: Duration::from_millis(server.quic_idle_timeout_ms),
                    ..TableConfig::default()
                },
            },
            ..ServerConfig::default()
        })
    }

    /// Settings for outbound NOTIFY exchanges
    pub fn notify_config(&self) -> NotifyConfig {
        NotifyConfig {
            timeout: Duration::from_millis(self.server.remote_io_timeout_ms),
            tcp_fastopen: self.server.tcp_fastopen,
            pool: Some(Arc::new(ConnectionPool::new(NOTIFY_POOL_PER_REMOTE))),
            ..NotifyConfig::default()
        }
    }

    fn build_remote(&self, remote: &RemoteConfig) -> anyhow::Result<Remote> {
        let via = parse_addrs(&remote.via, "via address")?;
        let addresses = parse_addrs(&remote.address, "remote address")?
            .into_iter()
            .map(|addr| RemoteAddr {
                addr,
                via: via.iter().copied().find(|v| v.is_ipv4() == addr.is_ipv4()),
            })
            .collect();
        Ok(Remote {
            id: remote.id.clone(),
            addresses,
            key: remote.key.clone(),
        })
    }

    /// Remotes notified for `zone`, in the zone's order
    ///
    /// # Errors
    ///
    /// Returns an error if a remote id is unknown or an address is malformed.
    pub fn remotes_for(&self, zone: &ZoneConfig) -> anyhow::Result<Vec<Remote>> {
        zone.notify
            .iter()
            .map(|id| {
                let remote = self
                    .remotes
                    .iter()
                    .find(|r| &r.id == id)
                    .ok_or_else(|| anyhow::anyhow!("Unknown remote '{id}'"))?;
                self.build_remote(remote)
            })
            .collect()
    }

    /// Build the served zone set
    ///
    /// # Errors
    ///
    /// Returns an error if a name or record is malformed.
    pub fn build_zones(&self) -> anyhow::Result<ZoneSet> {
        let mut set = ZoneSet::new();
        for zc in &self.zones {
            let zone = build_zone(zc).with_context(|| format!("zone {}", zc.domain))?;
            set.insert(Arc::new(zone));
        }
        Ok(set)
    }
}

fn build_zone(zc: &ZoneConfig) -> anyhow::Result<Zone> {
    let apex = Name::from_ascii(&zc.domain)?;
    let Some(soa) = &zc.soa else {
        if !zc.records.is_empty() {
            anyhow::bail!("records configured without an SOA");
        }
        return Ok(Zone::empty(apex));
    };

    let mut zone = Zone::new(
        apex.clone(),
        Soa {
            mname: Name::from_ascii(&soa.mname)?,
            rname: Name::from_ascii(&soa.rname)?,
            serial: soa.serial,
            refresh: soa.refresh,
            retry: soa.retry,
            expire: soa.expire,
            minimum: soa.minimum,
        },
        soa.ttl,
    );

    for rc in &zc.records {
        let owner = if rc.owner == "@" {
            apex.to_string()
        } else {
            rc.owner.clone()
        };
        let record = parse_record(&owner, &rc.rtype, rc.ttl.unwrap_or(soa.ttl), &rc.data)?;
        zone.add_record(record)?;
    }
    Ok(zone)
}
