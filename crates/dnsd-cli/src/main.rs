//! dnsd - authoritative DNS server

use clap::{Parser, Subcommand};
use dnsd_cli::config::{Config, ZoneConfig};
use dnsd_cli::control::{self, Command, ControlSocket, ControlState};
use dnsd_core::notify::NotifyReport;
use dnsd_core::{Name, NotifyConfig, Remote, Responder, Zone, event_notify};
use dnsd_transport::Server;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Set from the signal handler; the main thread polls it
static SHUTDOWN: AtomicBool = AtomicBool::new(false);

/// dnsd - authoritative DNS server
#[derive(Parser)]
#[command(name = "dnsd")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file path
    #[arg(short, long, global = true, default_value = "/etc/dnsd/dnsd.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the server
    Run,

    /// Send NOTIFY to the remotes of one or all zones
    Notify {
        /// Zone to announce (default: all zones)
        #[arg(long)]
        zone: Option<String>,
    },

    /// Load and validate the configuration
    Check,

    /// Control a running server through its control socket
    Ctl {
        /// Control socket (default: `control.listen` from the configuration)
        #[arg(short, long)]
        socket: Option<PathBuf>,

        #[command(subcommand)]
        command: CtlCommand,
    },
}

#[derive(Subcommand)]
enum CtlCommand {
    /// Check that the server is running
    Status,
    /// Stop the server
    Stop,
    /// Show traffic counters
    Stats,
    /// Show zone serials and notification state
    ZoneStatus {
        /// Zones to show (default: all zones)
        zones: Vec<String>,
    },
}

impl From<CtlCommand> for Command {
    fn from(command: CtlCommand) -> Self {
        match command {
            CtlCommand::Status => Self::Status,
            CtlCommand::Stop => Self::Stop,
            CtlCommand::Stats => Self::Stats,
            CtlCommand::ZoneStatus { zones } => Self::ZoneStatus(zones),
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = Config::load(&cli.config)?;
    init_logging(&config.logging.level, cli.verbose);
    config.validate()?;

    match cli.command {
        Commands::Run => run_server(&config),
        Commands::Notify { zone } => notify_zones(&config, zone.as_deref()),
        Commands::Check => check_config(&config, &cli.config),
        Commands::Ctl { socket, command } => {
            let socket = socket.unwrap_or_else(|| config.control.listen.clone());
            run_ctl(&socket, command.into())
        }
    }
}

/// `RUST_LOG` wins over `-v`, which wins over the configured level
fn init_logging(level: &str, verbose: bool) {
    let level = if verbose { "debug" } else { level };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .init();
}

extern "C" fn on_signal(_signum: libc::c_int) {
    SHUTDOWN.store(true, Ordering::SeqCst);
}

fn install_signal_handlers() {
    let handler = on_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
    // SAFETY: the handler only stores to an atomic.
    unsafe {
        libc::signal(libc::SIGINT, handler);
        libc::signal(libc::SIGTERM, handler);
    }
}

/// Zones paired with the remotes they notify
fn notify_targets(
    config: &Config,
    zones: &dnsd_core::ZoneSet,
    selected: &[&ZoneConfig],
) -> anyhow::Result<Vec<(Arc<Zone>, Vec<Remote>)>> {
    let mut targets = Vec::new();
    for zc in selected {
        let name = Name::from_ascii(&zc.domain)?;
        let Some(zone) = zones.get(&name) else {
            continue;
        };
        targets.push((zone.clone(), config.remotes_for(zc)?));
    }
    Ok(targets)
}

/// Run the server until SIGINT, SIGTERM or a `stop` control command
fn run_server(config: &Config) -> anyhow::Result<()> {
    let zones = Arc::new(config.build_zones()?);
    let server = Server::bind(config.server_config()?)?;
    info!(
        udp = ?server.local_addrs(),
        quic = ?server.quic_addrs(),
        zones = zones.len(),
        "Listening"
    );

    let responder: Arc<dyn Responder> = zones.clone();
    let handle = server.start(responder)?;
    install_signal_handlers();
    info!(workers = handle.worker_count(), "Server started");

    // Announce the loaded serials without holding up query service.
    let all: Vec<&ZoneConfig> = config.zones.iter().filter(|z| !z.notify.is_empty()).collect();
    let targets = notify_targets(config, &zones, &all)?;
    if !targets.is_empty() {
        let notify = config.notify_config();
        let spawned = thread::Builder::new()
            .name("dnsd-notify".into())
            .spawn(move || announce(&notify, &targets));
        if let Err(e) = spawned {
            warn!("Failed to start notify thread: {}", e);
        }
    }

    let control = if config.control.enabled {
        match ControlSocket::bind(&config.control.listen) {
            Ok(socket) => Some(socket),
            Err(e) => {
                warn!("Remote control disabled: {:#}", e);
                None
            }
        }
    } else {
        None
    };
    let state = ControlState {
        zones: zones.clone(),
        stats: Arc::clone(handle.stats()),
        stop: Arc::new(AtomicBool::new(false)),
    };

    while !SHUTDOWN.load(Ordering::SeqCst) && !state.stop.load(Ordering::SeqCst) {
        if let Some(control) = &control {
            control.poll(&state);
        }
        thread::sleep(Duration::from_millis(200));
    }
    drop(control);

    info!("Shutting down");
    let stats = handle.stop();
    info!(
        received = stats.total_received(),
        sent = stats.total_sent(),
        dropped = stats.total_dropped(),
        errors = stats.total_errors(),
        "Server stopped"
    );
    Ok(())
}

fn announce(notify: &NotifyConfig, targets: &[(Arc<Zone>, Vec<Remote>)]) {
    for (zone, remotes) in targets {
        if let Err(e) = event_notify(notify, zone, remotes) {
            warn!(zone = %zone.name(), "NOTIFY, outgoing, {}", e);
        }
    }
}

/// Send NOTIFY and print one line per remote
fn notify_zones(config: &Config, zone: Option<&str>) -> anyhow::Result<()> {
    let selected: Vec<&ZoneConfig> = match zone {
        Some(wanted) => {
            let wanted = Name::from_ascii(wanted)?;
            let mut matches = Vec::new();
            for zc in &config.zones {
                if Name::from_ascii(&zc.domain)? == wanted {
                    matches.push(zc);
                }
            }
            if matches.is_empty() {
                anyhow::bail!("Zone {} is not configured", wanted);
            }
            matches
        }
        None => config.zones.iter().collect(),
    };

    let zones = config.build_zones()?;
    let notify = config.notify_config();
    let mut failed = 0;
    for (zone, remotes) in notify_targets(config, &zones, &selected)? {
        if remotes.is_empty() {
            println!("{}: no remotes configured", zone.name());
            continue;
        }
        match event_notify(&notify, &zone, &remotes) {
            Ok(report) => print_report(&zone, &report),
            Err(e) => {
                failed += 1;
                println!("{}: {}", zone.name(), e);
            }
        }
    }

    if failed > 0 {
        anyhow::bail!("NOTIFY failed for {} zone(s)", failed);
    }
    Ok(())
}

fn print_report(zone: &Zone, report: &NotifyReport) {
    if report.remotes.is_empty() {
        println!("{}: no contents, nothing to announce", zone.name());
        return;
    }
    for entry in &report.remotes {
        let address = entry
            .address
            .map_or_else(|| "-".to_string(), |a| a.to_string());
        println!("{} -> {} ({}): {}", zone.name(), entry.id, address, entry.outcome);
    }
}

fn run_ctl(socket: &std::path::Path, command: Command) -> anyhow::Result<()> {
    for line in control::send(socket, &command)? {
        println!("{line}");
    }
    Ok(())
}

fn check_config(config: &Config, path: &std::path::Path) -> anyhow::Result<()> {
    let server = config.server_config()?;
    println!("Configuration {} is valid", path.display());
    println!("  UDP listen:  {:?}", server.listen);
    if !server.quic_listen.is_empty() {
        println!("  QUIC listen: {:?}", server.quic_listen);
    }
    for iface in &server.xdp {
        println!("  XDP:         {} ({} queues)", iface.name, iface.queues);
    }
    println!("  UDP workers: {}", server.udp_threads());
    println!("  Zones:       {}", config.zones.len());
    println!("  Remotes:     {}", config.remotes.len());
    if config.control.enabled {
        println!("  Control:     {}", config.control.listen.display());
    }
    Ok(())
}
