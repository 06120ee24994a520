//! Remote control of a running server over a Unix stream socket.
//!
//! A client sends one line, a command name followed by optional zone names,
//! and reads the reply until the server closes the connection. A failing
//! command answers a single line starting with `error:`.

use dnsd_core::{Name, ZoneSet};
use dnsd_transport::ServerStats;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Longest accepted request line
const MAX_REQUEST: u64 = 1024;

/// Per-connection I/O limit; a stalled client must not hold up the server
const IO_TIMEOUT: Duration = Duration::from_secs(2);

/// `[control]` section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlConfig {
    /// Socket path
    #[serde(default = "default_control_listen")]
    pub listen: PathBuf,
    /// Serve the control socket while running
    #[serde(default = "default_control_enabled")]
    pub enabled: bool,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            listen: default_control_listen(),
            enabled: default_control_enabled(),
        }
    }
}

fn default_control_listen() -> PathBuf {
    PathBuf::from("/run/dnsd/dnsd.sock")
}

fn default_control_enabled() -> bool {
    true
}

/// Control commands
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Report that the server is up
    Status,
    /// Stop the server
    Stop,
    /// Traffic counters
    Stats,
    /// Serial and notification state of the named zones, or all zones
    ZoneStatus(Vec<String>),
}

impl Command {
    /// Parse a request line
    ///
    /// # Errors
    ///
    /// Returns an error for an empty line, an unknown command or arguments
    /// to a command that takes none.
    pub fn parse(line: &str) -> anyhow::Result<Self> {
        let mut words = line.split_whitespace();
        let Some(name) = words.next() else {
            anyhow::bail!("empty command");
        };
        let args: Vec<String> = words.map(str::to_string).collect();
        let command = match name {
            "status" => Self::Status,
            "stop" => Self::Stop,
            "stats" => Self::Stats,
            "zone-status" => return Ok(Self::ZoneStatus(args)),
            other => anyhow::bail!("unknown command '{other}'"),
        };
        if !args.is_empty() {
            anyhow::bail!("'{name}' takes no arguments");
        }
        Ok(command)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Status => write!(f, "status"),
            Self::Stop => write!(f, "stop"),
            Self::Stats => write!(f, "stats"),
            Self::ZoneStatus(zones) => {
                write!(f, "zone-status")?;
                for zone in zones {
                    write!(f, " {zone}")?;
                }
                Ok(())
            }
        }
    }
}

/// What the control socket reports on and acts upon
pub struct ControlState {
    /// Served zones
    pub zones: Arc<ZoneSet>,
    /// Worker counters
    pub stats: Arc<ServerStats>,
    /// Set by `stop`
    pub stop: Arc<AtomicBool>,
}

impl ControlState {
    /// Run `command` and return the reply lines
    pub fn execute(&self, command: &Command) -> Vec<String> {
        match command {
            Command::Status => vec![format!(
                "running, version {}, {} workers, up {}s",
                env!("CARGO_PKG_VERSION"),
                self.stats.workers().len(),
                self.stats.uptime().as_secs()
            )],
            Command::Stop => {
                self.stop.store(true, Ordering::SeqCst);
                vec!["stopping".to_string()]
            }
            Command::Stats => {
                let mut lines = vec![format!(
                    "total: received={} sent={} dropped={} errors={}",
                    self.stats.total_received(),
                    self.stats.total_sent(),
                    self.stats.total_dropped(),
                    self.stats.total_errors()
                )];
                for (id, w) in self.stats.workers().iter().enumerate() {
                    lines.push(format!(
                        "worker {}: received={} sent={} dropped={} errors={}",
                        id,
                        w.received.load(Ordering::Relaxed),
                        w.sent.load(Ordering::Relaxed),
                        w.dropped.load(Ordering::Relaxed),
                        w.errors.load(Ordering::Relaxed)
                    ));
                }
                lines
            }
            Command::ZoneStatus(names) => self.zone_status(names),
        }
    }

    fn zone_status(&self, names: &[String]) -> Vec<String> {
        let zones = if names.is_empty() {
            self.zones.iter().collect::<Vec<_>>()
        } else {
            let mut zones = Vec::with_capacity(names.len());
            for name in names {
                let found = Name::from_ascii(name)
                    .ok()
                    .and_then(|n| self.zones.get(&n));
                match found {
                    Some(zone) => zones.push(zone),
                    None => return vec![format!("error: zone {name} is not served")],
                }
            }
            zones
        };

        zones
            .into_iter()
            .map(|zone| {
                let serial = zone.serial().map_or_else(|| "-".to_string(), |s| s.to_string());
                let notified = zone
                    .last_notified()
                    .map_or_else(|| "-".to_string(), |s| s.to_string());
                format!(
                    "{}\tserial={} | notified={} | records={}",
                    zone.name(),
                    serial,
                    notified,
                    zone.len()
                )
            })
            .collect()
    }
}

/// Listening control socket; the socket file is removed on drop
pub struct ControlSocket {
    listener: UnixListener,
    path: PathBuf,
}

impl ControlSocket {
    /// Bind at `path`, replacing a stale socket file.
    ///
    /// # Errors
    ///
    /// Returns an error if another server answers on `path` or the socket
    /// cannot be bound.
    pub fn bind(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            if UnixStream::connect(path).is_ok() {
                anyhow::bail!("control socket {} is in use", path.display());
            }
            fs::remove_file(path)?;
        }
        let listener = UnixListener::bind(path)
            .map_err(|e| anyhow::anyhow!("cannot bind control socket {}: {e}", path.display()))?;
        listener.set_nonblocking(true)?;
        info!("Remote control listening on {}", path.display());
        Ok(Self {
            listener,
            path: path.to_path_buf(),
        })
    }

    /// Socket path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Serve every pending connection; returns how many were served
    pub fn poll(&self, state: &ControlState) -> usize {
        let mut served = 0;
        loop {
            match self.listener.accept() {
                Ok((stream, _)) => {
                    if let Err(e) = serve(stream, state) {
                        debug!("Remote control connection failed: {}", e);
                    }
                    served += 1;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!("Remote control accept failed: {}", e);
                    break;
                }
            }
        }
        served
    }
}

impl Drop for ControlSocket {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            debug!("Failed to remove {}: {}", self.path.display(), e);
        }
    }
}

fn serve(stream: UnixStream, state: &ControlState) -> io::Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(IO_TIMEOUT))?;
    stream.set_write_timeout(Some(IO_TIMEOUT))?;

    let mut line = String::new();
    BufReader::new((&stream).take(MAX_REQUEST)).read_line(&mut line)?;
    let reply = match Command::parse(&line) {
        Ok(command) => {
            info!(command = %command, "Remote control command");
            state.execute(&command)
        }
        Err(e) => vec![format!("error: {e}")],
    };

    let mut out = &stream;
    for line in reply {
        writeln!(out, "{line}")?;
    }
    out.flush()
}

/// Send `command` to the server at `path` and return its reply lines.
///
/// # Errors
///
/// Returns an error if the server cannot be reached or reports a failure.
pub fn send(path: &Path, command: &Command) -> anyhow::Result<Vec<String>> {
    let mut stream = UnixStream::connect(path)
        .map_err(|e| anyhow::anyhow!("cannot connect to {}: {e}", path.display()))?;
    stream.set_read_timeout(Some(IO_TIMEOUT))?;
    writeln!(stream, "{command}")?;
    stream.shutdown(std::net::Shutdown::Write)?;

    let mut lines = Vec::new();
    for line in BufReader::new(stream).lines() {
        lines.push(line?);
    }
    if let Some(err) = lines.iter().find_map(|l| l.strip_prefix("error: ")) {
        anyhow::bail!("{err}");
    }
    Ok(lines)
}
