// MIT License - Copyright (c) 2026 Peter Wright
// Terminal link CLI

use std::path::Path;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use tokio::time::{sleep, Duration};
use tracing::{error, info, warn};

use ticket_link::transport::serial::{SerialPortChannel, DEFAULT_BAUD};
use ticket_link::{
    CrcIntegrity, FileConfig, LinkConfig, LinkError, StagedFileApplier, Terminal, UpgradeOutcome,
};

/// Whole-command retries for transient host faults (UART hiccups, staging I/O).
const FAULT_RETRIES: u32 = 3;
const FAULT_RETRY_DELAY: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser)]
#[command(name = "ticket-link")]
#[command(about = "Cellular link control for a ticketing terminal")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, default_value = "ticket-link.toml")]
    config: String,

    /// Modem serial device
    #[arg(long, default_value = "/dev/ttyS1")]
    port: String,

    /// Modem baud rate
    #[arg(long, default_value_t = DEFAULT_BAUD)]
    baud: u32,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Clone)]
enum Command {
    /// Register on the mobile network
    Register,
    /// Register and bring the data bearer up
    Bearer,
    /// GET a path from the configured backend
    Get {
        /// Request path (default: the configured order path)
        path: Option<String>,
    },
    /// GET a full URL through the modem's HTTP stack
    ModemGet { url: String },
    /// Query the configured NTP server over a UDP socket
    Ntp,
    /// Read the modem clock
    Clock {
        /// Sync the modem clock over NTP first
        #[arg(long)]
        sync: bool,
    },
    /// Battery charge report
    Battery,
    /// Run one OTA upgrade cycle
    Ota,
}

fn load_config(path: &str) -> Result<LinkConfig> {
    if !Path::new(path).exists() {
        warn!("Config file {} not found, using defaults", path);
        return Ok(LinkConfig::default());
    }
    let file = FileConfig::load(path).context("Failed to read config file")?;
    Ok(file.into_link_config())
}

fn outcome_json(outcome: &UpgradeOutcome) -> Value {
    match outcome {
        UpgradeOutcome::Aborted(reason) => json!({
            "applied": false,
            "aborted": format!("{:?}", reason),
        }),
        UpgradeOutcome::Completed {
            transaction,
            applied,
        } => json!({
            "applied": applied,
            "units": transaction
                .units
                .iter()
                .map(|u| json!({ "name": u.entry.name, "state": format!("{:?}", u.state) }))
                .collect::<Vec<_>>(),
        }),
    }
}

async fn run(
    terminal: &mut Terminal<SerialPortChannel>,
    command: &Command,
) -> Result<Value, LinkError> {
    let value = match command {
        Command::Register => json!({ "registered": terminal.register().await? }),
        Command::Bearer => {
            let ip = terminal.connect_bearer().await?;
            json!({ "bearer": ip.map(|ip| ip.to_string()) })
        }
        Command::Get { path } => {
            let path = path
                .clone()
                .unwrap_or_else(|| terminal.config().order_path.clone());
            if terminal.bring_up().await?.is_none() {
                json!({ "path": path, "connected": false })
            } else {
                match terminal.get(&path).await? {
                    Some(exchange) => json!({
                        "path": path,
                        "connected": true,
                        "bytes": exchange.response.len(),
                        "payload": exchange
                            .payload
                            .map(|p| String::from_utf8_lossy(&p).into_owned()),
                    }),
                    None => json!({ "path": path, "connected": false }),
                }
            }
        }
        Command::ModemGet { url } => {
            let reply = terminal.modem_get(url).await?;
            json!({ "url": url, "response": String::from_utf8_lossy(&reply) })
        }
        Command::Ntp => {
            let time = if terminal.connect_bearer().await?.is_some() {
                terminal.network_time().await?
            } else {
                None
            };
            json!({ "time": time })
        }
        Command::Clock { sync } => json!({ "time": terminal.modem_time(*sync).await? }),
        Command::Battery => json!({ "battery": terminal.battery().await? }),
        Command::Ota => {
            let staging = terminal.config().staging_dir.clone();
            let mut applier = StagedFileApplier::new(staging);
            let outcome = terminal.upgrade(&CrcIntegrity, &mut applier).await?;
            outcome_json(&outcome)
        }
    };
    Ok(value)
}

#[tokio::main]
async fn main() -> Result<()> {
    // RUST_LOG controls verbosity (e.g. RUST_LOG=debug or RUST_LOG=ticket_link=trace).
    // Default: info.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    // systemd journal already adds timestamps, so omit them when running under systemd
    if std::env::var_os("JOURNAL_STREAM").is_some() {
        tracing_subscriber::fmt()
            .without_time()
            .with_env_filter(env_filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;
    let channel = SerialPortChannel::open(&cli.port, cli.baud)
        .with_context(|| format!("Failed to open modem port {}", cli.port))?;
    let mut terminal = Terminal::new(channel, config);

    let mut failures = 0;
    let value = loop {
        let result = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT, shutting down...");
                return Ok(());
            }
            result = run(&mut terminal, &cli.command) => result,
        };
        match result {
            Ok(value) => break value,
            Err(e) if e.is_retryable() && failures < FAULT_RETRIES => {
                failures += 1;
                error!("{} (retry {}/{})", e, failures, FAULT_RETRIES);
                sleep(FAULT_RETRY_DELAY).await;
            }
            Err(e) => return Err(e).context("Command failed"),
        }
    };

    println!(
        "{}",
        serde_json::to_string_pretty(&value).context("Failed to encode result")?
    );
    Ok(())
}
