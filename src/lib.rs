// MIT License - Copyright (c) 2021 TJForc
// ticket-link
//
//! # ticket-link
//!
//! Network engine for a cellular ticketing terminal that drives a
//! SIM800/SIM808-class modem over a plain serial line.
//!
//! The serial link has no framing and no end-of-reply marker. This crate
//! layers ordering, completion and bounded retries on top of it:
//!
//! - [`transport`]: command/response exchange by read-until-silence
//! - [`modem`]: power, registration and the data bearer
//! - [`session`]: the modem's single TCP/UDP socket
//! - [`http`]: HTTP/1.0 GET over that socket and payload extraction
//! - [`time_sync`]: raw NTP over UDP, or the modem's own clock
//! - [`ota`]: manifest-driven, verify-then-apply upgrades
//!
//! ## Quick Start
//!
//! ```no_run
//! use ticket_link::{CrcIntegrity, LinkConfig, StagedFileApplier, Terminal};
//! use ticket_link::transport::serial::SerialPortChannel;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = LinkConfig::builder()
//!         .server_address("ota.example.net")
//!         .staging_dir("/flash")
//!         .build();
//!     let channel = SerialPortChannel::open("/dev/ttyS1", 9600)?;
//!     let mut terminal = Terminal::new(channel, config);
//!
//!     let mut applier = StagedFileApplier::new("/flash");
//!     let outcome = terminal.upgrade(&CrcIntegrity, &mut applier).await?;
//!     println!("upgrade applied: {}", outcome.succeeded());
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod constants;
pub mod error;
pub mod http;
pub mod modem;
pub mod ota;
pub mod protocol;
pub mod retry;
pub mod session;
pub mod terminal;
pub mod time_sync;
pub mod transport;

// Re-export main types for convenience
pub use config::{ConfigSource, FileConfig, LinkConfig, LinkConfigBuilder};
pub use error::{LinkError, Result};
pub use http::{extract_payload, HeaderFlags, HttpExchange, HttpRequest};
pub use modem::{Modem, PowerKey};
pub use ota::{
    AbortReason, CrcIntegrity, IntegrityCheck, StagedFileApplier, UnitState, UpgradeApplier,
    UpgradeOutcome, UpgradeTransaction,
};
pub use protocol::{AtCommand, BatteryStatus, RegistrationState};
pub use session::{Session, SessionState};
pub use terminal::Terminal;
pub use time_sync::TimeSample;
pub use transport::at::AtTransport;
pub use transport::{RawResponse, SerialChannel};
