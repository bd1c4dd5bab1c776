// MIT License - Copyright (c) 2021 TJForc
// Modem power, registration and data bearer

use std::net::Ipv4Addr;

use tokio::time::{sleep, Duration};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::protocol::{
    is_ok, parse_attach_status, parse_bearer_address, AtCommand, BatteryStatus,
    RegistrationState,
};
use crate::retry::Attempts;
use crate::transport::at::AtTransport;
use crate::transport::{RawResponse, SerialChannel};

/// Pause after `at+cfun=1` before polling registration again.
const ACTIVATION_GAP: Duration = Duration::from_secs(1);
/// Settle time after the confirmatory `at+cfun=1,1`.
const REGISTRATION_SETTLE: Duration = Duration::from_secs(5);
/// Pause between bearer attach attempts.
const BEARER_GAP: Duration = Duration::from_secs(1);

/// The modem's PWRKEY line. GPIO access lives outside this crate.
pub trait PowerKey {
    fn set_level(&mut self, high: bool);
}

/// Pulse PWRKEY to switch the modem on.
pub async fn power_on<P: PowerKey>(key: &mut P) {
    info!("Powering modem on");
    key.set_level(true);
    sleep(Duration::from_millis(100)).await;
    key.set_level(false);
    sleep(Duration::from_millis(1200)).await;
    key.set_level(true);
}

/// Hold PWRKEY low for at least 1.5 s, then release.
pub async fn power_off<P: PowerKey>(key: &mut P) {
    info!("Powering modem off");
    key.set_level(false);
    sleep(Duration::from_millis(1600)).await;
    key.set_level(true);
    sleep(Duration::from_millis(100)).await;
}

/// Registration and bearer control over a borrowed transport.
pub struct Modem<'a, C> {
    at: &'a mut AtTransport<C>,
}

impl<'a, C: SerialChannel> Modem<'a, C> {
    pub fn new(at: &'a mut AtTransport<C>) -> Self {
        Self { at }
    }

    /// Leave slow-clock mode and enable full functionality.
    pub async fn activate(&mut self) -> Result<RawResponse> {
        self.at.send(&AtCommand::EnableSlowClock).await?;
        self.at.send(&AtCommand::FullFunctionality).await?;
        self.at.send(&AtCommand::FullFunctionalityReset).await
    }

    /// Switch RF off and drop to low-power mode.
    pub async fn deactivate(&mut self) -> Result<RawResponse> {
        self.at.send(&AtCommand::EnableSlowClock).await?;
        self.at.send(&AtCommand::LowPower).await
    }

    /// Query `+CREG`. Unmatched or malformed replies are `Unregistered`.
    pub async fn registration_status(&mut self) -> Result<RegistrationState> {
        let reply = self.at.send(&AtCommand::RegistrationQuery).await?;
        let state = RegistrationState::from_reply(&reply);
        debug!("Registration state: {:?}", state);
        Ok(state)
    }

    /// Poll registration, re-issuing `at+cfun=1` between polls.
    ///
    /// At most `timeout_attempts` polls are made. A terminal registered on
    /// the first poll is left alone. When registration only shows up after a
    /// re-activation, `at+cfun=1,1` is issued and the modem is given a settle
    /// period before returning `true`.
    pub async fn register_network(&mut self, timeout_attempts: u32) -> Result<bool> {
        let mut attempts = Attempts::new(timeout_attempts, ACTIVATION_GAP);

        if attempts.try_next() {
            let state = self.registration_status().await?;
            if state.is_registered() {
                info!("Already registered ({:?})", state);
                return Ok(true);
            }
        }

        while attempts.try_next() {
            debug!(
                "Not registered, re-activating (poll {} of {})",
                attempts.used(),
                attempts.limit()
            );
            self.at.send(&AtCommand::FullFunctionality).await?;
            attempts.pause().await;

            let state = self.registration_status().await?;
            if state.is_registered() {
                info!(
                    "Registered ({:?}) after {} poll(s)",
                    state,
                    attempts.used()
                );
                self.at.send(&AtCommand::FullFunctionalityReset).await?;
                sleep(REGISTRATION_SETTLE).await;
                return Ok(true);
            }
        }

        warn!(
            "Network registration failed after {} poll(s)",
            attempts.used()
        );
        Ok(false)
    }

    /// Current bearer address, if the data bearer is up.
    pub async fn bearer_address(&mut self) -> Result<Option<Ipv4Addr>> {
        let reply = self.at.send(&AtCommand::LocalAddress).await?;
        Ok(parse_bearer_address(&reply))
    }

    /// Bring the data bearer up on `apn`, bounded by `timeout_attempts`
    /// attach rounds.
    pub async fn attach_bearer(
        &mut self,
        apn: &str,
        timeout_attempts: u32,
    ) -> Result<Option<Ipv4Addr>> {
        if let Some(ip) = self.bearer_address().await? {
            debug!("Bearer already up: {}", ip);
            return Ok(Some(ip));
        }

        let mut attempts = Attempts::new(timeout_attempts, BEARER_GAP);
        while attempts.try_next() {
            self.at
                .send(&AtCommand::SetApn {
                    apn: apn.to_string(),
                })
                .await?;
            self.at.send(&AtCommand::BringUpWireless).await?;
            if let Some(ip) = self.bearer_address().await? {
                info!("Bearer attached: {}", ip);
                return Ok(Some(ip));
            }
            attempts.pause().await;
        }

        warn!("Bearer attach failed after {} attempt(s)", attempts.used());
        Ok(None)
    }

    /// `+CGATT: 1`.
    pub async fn gprs_attached(&mut self) -> Result<bool> {
        let reply = self.at.send(&AtCommand::AttachQuery).await?;
        Ok(parse_attach_status(&reply))
    }

    pub async fn battery_status(&mut self) -> Result<Option<BatteryStatus>> {
        let reply = self.at.send(&AtCommand::BatteryQuery).await?;
        Ok(BatteryStatus::from_reply(&reply))
    }

    /// Route the next socket through the modem's TLS stack.
    pub async fn enable_ssl(&mut self) -> Result<bool> {
        let reply = self.at.send(&AtCommand::EnableSsl).await?;
        Ok(is_ok(&reply))
    }

    /// Undo [`enable_ssl`](Self::enable_ssl) before a plain or UDP socket.
    pub async fn disable_ssl(&mut self) -> Result<bool> {
        let reply = self.at.send(&AtCommand::DisableSsl).await?;
        Ok(is_ok(&reply))
    }
}
