// MIT License - Copyright (c) 2021 TJForc
// Socket session

use tokio::time::Duration;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::protocol::{AtCommand, SocketOpenReply, SocketProtocol};
use crate::retry::Attempts;
use crate::transport::at::AtTransport;
use crate::transport::SerialChannel;

/// State of the modem's single socket slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Connected,
    Failed,
}

/// The one socket the modem can hold.
///
/// A session mutably borrows the transport for its whole lifetime, so a
/// second session on the same modem cannot exist at the same time.
pub struct Session<'a, C> {
    at: &'a mut AtTransport<C>,
    state: SessionState,
}

impl<'a, C: SerialChannel> Session<'a, C> {
    pub fn new(at: &'a mut AtTransport<C>) -> Self {
        Self {
            at,
            state: SessionState::Idle,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == SessionState::Connected
    }

    /// Open a TCP socket. TLS is selected beforehand with `AT+CIPSSL=1`.
    pub async fn open_session(&mut self, attempts: u32, address: &str, port: u16) -> Result<bool> {
        self.open(SocketProtocol::Tcp, attempts, address, port).await
    }

    pub async fn open_udp_session(
        &mut self,
        attempts: u32,
        address: &str,
        port: u16,
    ) -> Result<bool> {
        self.open(SocketProtocol::Udp, attempts, address, port).await
    }

    async fn open(
        &mut self,
        protocol: SocketProtocol,
        attempts: u32,
        address: &str,
        port: u16,
    ) -> Result<bool> {
        self.at.drain().await?;
        self.state = SessionState::Connecting;

        let command = AtCommand::SocketStart {
            protocol,
            address: address.to_string(),
            port,
        };
        // The 2 s command wait is the only gap between attempts.
        let mut budget = Attempts::new(attempts, Duration::ZERO);
        while budget.try_next() {
            let reply = self.at.send(&command).await?;
            let outcome = SocketOpenReply::from_reply(&reply);
            debug!(
                "{} open attempt {}/{}: {:?}",
                protocol.as_str(),
                budget.used(),
                budget.limit(),
                outcome
            );
            if outcome.is_open() {
                info!("{} session to {}:{} open", protocol.as_str(), address, port);
                self.state = SessionState::Connected;
                return Ok(true);
            }
        }

        warn!(
            "{} session to {}:{} failed after {} attempt(s)",
            protocol.as_str(),
            address,
            port,
            budget.used()
        );
        self.state = SessionState::Failed;
        Ok(false)
    }

    /// Record that the peer closed the socket (`CLOSED` seen in the stream).
    pub fn mark_closed(&mut self) {
        if self.state == SessionState::Connected {
            debug!("Peer closed the socket");
            self.state = SessionState::Idle;
        }
    }

    /// `AT+CIPCLOSE` and return the slot to idle.
    pub async fn close(&mut self) -> Result<()> {
        self.at.send(&AtCommand::SocketClose).await?;
        self.state = SessionState::Idle;
        Ok(())
    }

    /// The underlying transport, for exchanges on the open socket.
    pub fn transport(&mut self) -> &mut AtTransport<C> {
        &mut *self.at
    }
}
