//! Example: Bring the link up, report modem status and run one OTA cycle.

use ticket_link::transport::serial::SerialPortChannel;
use ticket_link::{CrcIntegrity, LinkConfig, StagedFileApplier, Terminal, UpgradeOutcome};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let config = LinkConfig::builder()
        .server_address("203.0.113.10")
        .server_port(443)
        .apn("ETC")
        .ota_base_path("/ota/")
        .staging_dir("/flash")
        .build();

    println!("Opening modem...");
    let channel = SerialPortChannel::open("/dev/ttyS1", 9600)?;
    let mut terminal = Terminal::new(channel, config);

    if let Some(battery) = terminal.battery().await? {
        println!(
            "Battery: {}% ({} mV, charging={})",
            battery.level, battery.millivolts, battery.charging
        );
    }

    match terminal.connect_bearer().await? {
        Some(ip) => println!("Bearer up at {}", ip),
        None => {
            println!("No network, giving up.");
            return Ok(());
        }
    }

    if let Some(time) = terminal.network_time().await? {
        println!(
            "Network time: {:04}-{:02}-{:02} {:02}:{:02}:{:02} UTC",
            time.year, time.month, time.day, time.hour, time.minute, time.second
        );
    }

    let mut applier = StagedFileApplier::new("/flash");
    match terminal.upgrade(&CrcIntegrity, &mut applier).await? {
        UpgradeOutcome::Aborted(reason) => println!("Upgrade aborted: {:?}", reason),
        UpgradeOutcome::Completed {
            transaction,
            applied,
        } => {
            println!("\n--- Units ({}) ---", transaction.units.len());
            for unit in &transaction.units {
                println!(
                    "  {:24} {:?} ({} bytes)",
                    unit.entry.name,
                    unit.state,
                    unit.data.len()
                );
            }
            println!("Applied: {}", applied);
        }
    }

    Ok(())
}
