// MIT License - Copyright (c) 2021 TJForc
// Terminal facade

use std::net::Ipv4Addr;

use tracing::{info, warn};

use crate::config::LinkConfig;
use crate::error::Result;
use crate::http::{self, HeaderFlags, HttpExchange, HttpRequest};
use crate::modem::Modem;
use crate::ota::{self, IntegrityCheck, UpgradeApplier, UpgradeOutcome};
use crate::protocol::BatteryStatus;
use crate::session::Session;
use crate::time_sync::{self, TimeSample};
use crate::transport::at::AtTransport;
use crate::transport::{RawResponse, SerialChannel};

/// The network side of a ticketing terminal.
///
/// Owns the modem transport and the link configuration, and runs each
/// operation to completion before the next one can start.
///
/// # Example
///
/// ```no_run
/// use ticket_link::{LinkConfig, Terminal};
/// use ticket_link::transport::serial::SerialPortChannel;
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let config = LinkConfig::builder()
///         .server_address("ota.example.net")
///         .apn("ETC")
///         .build();
///     let channel = SerialPortChannel::open("/dev/ttyS1", 9600)?;
///     let mut terminal = Terminal::new(channel, config);
///
///     if terminal.bring_up().await?.is_some() {
///         if let Some(exchange) = terminal.get("/ayer_admin/order").await? {
///             println!("{:?}", exchange.payload);
///         }
///     }
///     Ok(())
/// }
/// ```
pub struct Terminal<C> {
    at: AtTransport<C>,
    config: LinkConfig,
}

impl<C: SerialChannel> Terminal<C> {
    pub fn new(channel: C, config: LinkConfig) -> Self {
        Self {
            at: AtTransport::new(channel),
            config,
        }
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    pub fn transport(&mut self) -> &mut AtTransport<C> {
        &mut self.at
    }

    pub fn into_transport(self) -> AtTransport<C> {
        self.at
    }

    pub fn modem(&mut self) -> Modem<'_, C> {
        Modem::new(&mut self.at)
    }

    pub async fn register(&mut self) -> Result<bool> {
        let attempts = self.config.registration_attempts;
        self.modem().register_network(attempts).await
    }

    pub async fn attach_bearer(&mut self) -> Result<Option<Ipv4Addr>> {
        let apn = self.config.apn.clone();
        let attempts = self.config.bearer_attempts;
        self.modem().attach_bearer(&apn, attempts).await
    }

    /// Register and attach the bearer, leaving the socket mode alone.
    pub async fn connect_bearer(&mut self) -> Result<Option<Ipv4Addr>> {
        if !self.register().await? {
            return Ok(None);
        }
        self.attach_bearer().await
    }

    /// Register, attach the bearer and select TLS. Returns the bearer
    /// address when the terminal is ready for a session.
    pub async fn bring_up(&mut self) -> Result<Option<Ipv4Addr>> {
        let Some(ip) = self.connect_bearer().await? else {
            return Ok(None);
        };
        if !self.modem().enable_ssl().await? {
            warn!("Modem refused SSL");
            return Ok(None);
        }
        info!("Link up at {}", ip);
        Ok(Some(ip))
    }

    /// GET `path` from the configured backend on a fresh session.
    ///
    /// `None` when the session could not be opened; no request is sent then.
    pub async fn get(&mut self, path: &str) -> Result<Option<HttpExchange>> {
        let config = &self.config;
        let mut session = Session::new(&mut self.at);
        if !session
            .open_session(
                config.session_attempts,
                &config.server_address,
                config.server_port,
            )
            .await?
        {
            return Ok(None);
        }

        let flags = if config.keep_alive {
            HeaderFlags::KEEP_ALIVE
        } else {
            HeaderFlags::empty()
        };
        let request = HttpRequest::get(path, flags);
        let exchange =
            http::exchange(session.transport(), request, config.idle_read_budget).await?;
        if exchange.peer_closed() {
            session.mark_closed();
        } else {
            session.close().await?;
        }
        Ok(Some(exchange))
    }

    /// GET a full URL through the modem's built-in HTTP client.
    pub async fn modem_get(&mut self, url: &str) -> Result<RawResponse> {
        http::modem_http_get(&mut self.at, &self.config.apn, url).await
    }

    /// Raw NTP against the configured server, on a plain UDP socket.
    pub async fn network_time(&mut self) -> Result<Option<TimeSample>> {
        time_sync::ntp_over_socket(
            &mut self.at,
            &self.config.ntp_server,
            self.config.session_attempts,
        )
        .await
    }

    /// The modem RTC, optionally synced over NTP first.
    pub async fn modem_time(&mut self, sync: bool) -> Result<Option<TimeSample>> {
        time_sync::modem_clock(&mut self.at, &self.config, sync).await
    }

    pub async fn battery(&mut self) -> Result<Option<BatteryStatus>> {
        self.modem().battery_status().await
    }

    pub async fn upgrade<I, A>(&mut self, integrity: &I, applier: &mut A) -> Result<UpgradeOutcome>
    where
        I: IntegrityCheck,
        A: UpgradeApplier,
    {
        ota::run_upgrade(&mut self.at, &self.config, integrity, applier).await
    }
}
