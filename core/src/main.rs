use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use clap::{Parser, Subcommand};
use serde_json::json;
use sunpci_common::{AppConfig, ConfigStore, DriveMappingEntry, Request, Response};
use sunpci_core::controllers::drive_map::parse_drive_letter;
use sunpci_core::controllers::network::format_byte_size;
use sunpci_core::controllers::DriveMapTable;
use sunpci_core::{SessionSnapshot, SessionState, SunPciHost};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// How often `run` reports session statistics.
const STATUS_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(
    name = "sunpci-ctl",
    about = "Control a SunPCi coprocessor card: run guest sessions and manage drive mappings."
)]
struct Args {
    /// Configuration file (defaults to $XDG_CONFIG_HOME/sunpci/config.toml)
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,

    /// Device node, overriding the configuration file
    #[arg(long, value_name = "PATH", global = true)]
    device: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print driver version and the session state the driver reports
    Status {
        #[arg(long, action = clap::ArgAction::SetTrue)]
        json: bool,
    },
    /// Start a session and keep it running until interrupted
    Run {
        /// Guest memory in MiB, overriding the configuration file
        #[arg(long, value_name = "MB")]
        memory: Option<u32>,
    },
    /// Manage host directory to guest drive letter mappings
    Map {
        #[command(subcommand)]
        command: MapCommand,
    },
    /// Print the effective configuration as JSON
    Config,
}

#[derive(Subcommand, Debug)]
enum MapCommand {
    /// List configured mappings
    List {
        #[arg(long, action = clap::ArgAction::SetTrue)]
        json: bool,
    },
    /// Map a host directory to a guest drive letter
    Add {
        /// Drive letter, E: through Z:
        letter: String,
        /// Host directory
        path: PathBuf,
        #[arg(long, action = clap::ArgAction::SetTrue)]
        readonly: bool,
        #[arg(long, action = clap::ArgAction::SetTrue)]
        hidden: bool,
    },
    /// Remove the mapping for a drive letter
    Remove { letter: String },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let store = args
        .config
        .clone()
        .map(ConfigStore::new)
        .unwrap_or_default();
    let mut config = store
        .load()
        .with_context(|| format!("load configuration {}", store.path().display()))?;
    if let Some(device) = &args.device {
        config.device.path = device.clone();
    }

    match args.command {
        Command::Status { json } => status(config, json),
        Command::Run { memory } => run(config, memory),
        Command::Map { command } => map(&store, config, command),
        Command::Config => {
            println!("# {}", store.path().display());
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

fn status(config: AppConfig, as_json: bool) -> anyhow::Result<()> {
    let host = SunPciHost::open(config).context("open SunPCi device")?;
    let session = host.session();
    let version = session.driver_version().context("query driver version")?;
    let status = match session.channel().execute(Request::GetStatus)? {
        Response::Status(status) => status,
        other => bail!("unexpected reply to GET_STATUS: {:?}", other),
    };
    let state = SessionState::from_driver(status.state)
        .map(|state| state.to_string())
        .unwrap_or_else(|| format!("unknown ({})", status.state));

    if as_json {
        let out = json!({
            "driverVersion": version.to_string(),
            "state": state,
            "memoryUsedBytes": status.memory_used(),
            "uptimeNs": status.uptime_ns(),
            "cpuUsagePercent": f64::from(status.cpu_usage) / 100.0,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        println!("driver  {version}");
        println!("session {state}");
        println!("memory  {}", format_byte_size(status.memory_used()));
        println!("uptime  {}s", status.uptime_ns() / 1_000_000_000);
    }
    host.shutdown();
    Ok(())
}

fn run(config: AppConfig, memory: Option<u32>) -> anyhow::Result<()> {
    let host = SunPciHost::open(config).context("open SunPCi device")?;
    let mut session_config = sunpci_core::SessionConfig::from_app_config(host.config());
    if let Some(memory) = memory {
        session_config.memory_mb = memory;
    }
    host.start_with(session_config).context("start session")?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("build signal runtime")?;
    let outcome = runtime.block_on(supervise(&host));

    host.shutdown();
    outcome
}

/// Report statistics until Ctrl-C or a session fault.
async fn supervise(host: &SunPciHost) -> anyhow::Result<()> {
    let mut ticker = tokio::time::interval(STATUS_INTERVAL);
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("wait for Ctrl-C")?;
                info!("Interrupted, stopping session");
                return Ok(());
            }
            _ = ticker.tick() => {
                let snapshot = host.status()?;
                if snapshot.state == SessionState::Error {
                    let reason = snapshot.diagnostic.unwrap_or_default();
                    error!("Session faulted: {}", reason);
                    return Err(anyhow!("session faulted: {reason}"));
                }
                report(host, &snapshot);
            }
        }
    }
}

fn report(host: &SunPciHost, snapshot: &SessionSnapshot) {
    let stats = &snapshot.stats;
    let traffic = host
        .network()
        .traffic()
        .map(|traffic| traffic.summary())
        .unwrap_or_else(|| "network idle".to_string());
    info!(
        "{}: uptime {}s, memory {}, cpu {:.2}%, {}",
        snapshot.state,
        stats.uptime_ns / 1_000_000_000,
        format_byte_size(stats.memory_used_bytes),
        f64::from(stats.cpu_usage_percent_x100) / 100.0,
        traffic
    );
}

fn map(store: &ConfigStore, mut config: AppConfig, command: MapCommand) -> anyhow::Result<()> {
    match command {
        MapCommand::List { json } => {
            let table = DriveMapTable::from_config(&config.drive_mappings)?;
            if json {
                println!("{}", table.to_json()?);
                return Ok(());
            }
            for entry in table.iter() {
                let mut flags = Vec::new();
                if entry.flags.readonly {
                    flags.push("readonly");
                }
                if entry.flags.hidden {
                    flags.push("hidden");
                }
                println!(
                    "{}: {} {}",
                    entry.drive_letter,
                    entry.host_path,
                    flags.join(",")
                );
            }
            Ok(())
        }
        MapCommand::Add {
            letter,
            path,
            readonly,
            hidden,
        } => {
            let letter = parse_drive_letter(&letter)
                .ok_or_else(|| anyhow!("{letter:?} is not a drive letter between E: and Z:"))?;
            // run the same checks the controller applies before persisting
            let mut table = DriveMapTable::from_config(&config.drive_mappings)?;
            let flags = sunpci_core::controllers::DriveMapFlags { readonly, hidden };
            table.add(letter, &path.to_string_lossy(), flags)?;

            config
                .drive_mappings
                .retain(|entry| parse_drive_letter(&entry.drive_letter) != Some(letter));
            config.drive_mappings.push(DriveMappingEntry {
                drive_letter: format!("{letter}:"),
                host_path: path,
                readonly,
                hidden,
                enabled: true,
            });
            store.save(&config)?;
            println!("Mapped {letter}:");
            Ok(())
        }
        MapCommand::Remove { letter } => {
            let letter = parse_drive_letter(&letter)
                .ok_or_else(|| anyhow!("{letter:?} is not a drive letter between E: and Z:"))?;
            let before = config.drive_mappings.len();
            config
                .drive_mappings
                .retain(|entry| parse_drive_letter(&entry.drive_letter) != Some(letter));
            if config.drive_mappings.len() == before {
                bail!("{letter}: is not mapped");
            }
            store.save(&config)?;
            println!("Removed {letter}:");
            Ok(())
        }
    }
}
