// MIT License - Copyright (c) 2021 TJForc
// AT command/response exchange

use tokio::time::{sleep, Duration};
use tracing::{debug, trace};

use crate::constants::{CRLF, READ_CHUNK, READ_GAP};
use crate::error::Result;
use crate::protocol::AtCommand;
use crate::transport::{RawResponse, SerialChannel};

/// Owns the serial channel and turns it into a command/response exchange.
///
/// Every higher layer borrows the transport mutably for the duration of one
/// operation, so at most one exchange is ever in flight on the wire.
pub struct AtTransport<C> {
    channel: C,
}

impl<C: SerialChannel> AtTransport<C> {
    pub fn new(channel: C) -> Self {
        Self { channel }
    }

    /// Send a command using its default settle time.
    pub async fn send(&mut self, command: &AtCommand) -> Result<RawResponse> {
        self.execute(command, command.wait()).await
    }

    /// Send `command` + CRLF, sleep `wait`, then read until a read comes back
    /// empty.
    ///
    /// The modem gives no end-of-reply marker, so a reply that arrives after
    /// the first silent read is left in the UART for the next caller. An
    /// empty response is a valid result.
    pub async fn execute(&mut self, command: &AtCommand, wait: Duration) -> Result<RawResponse> {
        let wire = command.to_wire_string();
        self.execute_str(&wire, wait).await
    }

    /// Same as [`execute`](Self::execute) for a pre-rendered command string.
    pub async fn execute_str(&mut self, command: &str, wait: Duration) -> Result<RawResponse> {
        debug!("AT >> {}", command);
        let mut frame = Vec::with_capacity(command.len() + CRLF.len());
        frame.extend_from_slice(command.as_bytes());
        frame.extend_from_slice(CRLF);
        self.channel.write(&frame).await?;

        sleep(wait).await;

        let response = self.read_until_silence().await?;
        debug!("AT << {:?}", response);
        Ok(response)
    }

    /// Read chunks with a fixed gap until one comes back empty.
    pub async fn read_until_silence(&mut self) -> Result<RawResponse> {
        let mut buf = Vec::new();
        loop {
            let chunk = self.channel.read_available(READ_CHUNK).await?;
            sleep(READ_GAP).await;
            if chunk.is_empty() {
                break;
            }
            buf.extend_from_slice(&chunk);
        }
        Ok(RawResponse::new(buf))
    }

    /// Write bytes as-is (socket payload, terminator bytes).
    pub async fn write_raw(&mut self, data: &[u8]) -> Result<()> {
        trace!("RAW >> {} bytes", data.len());
        self.channel.write(data).await
    }

    /// One non-blocking read of at most `max` bytes.
    pub async fn read_chunk(&mut self, max: usize) -> Result<Vec<u8>> {
        self.channel.read_available(max).await
    }

    /// Discard anything already buffered (late replies, URCs).
    pub async fn drain(&mut self) -> Result<usize> {
        let mut dropped = 0;
        loop {
            let chunk = self.channel.read_available(READ_CHUNK).await?;
            if chunk.is_empty() {
                break;
            }
            dropped += chunk.len();
        }
        if dropped > 0 {
            debug!("Drained {} stale bytes", dropped);
        }
        Ok(dropped)
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }

    pub fn channel_mut(&mut self) -> &mut C {
        &mut self.channel
    }

    pub fn into_inner(self) -> C {
        self.channel
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::ScriptedModem;

    #[tokio::test(start_paused = true)]
    async fn test_execute_appends_crlf_and_collects_reply() {
        let modem = ScriptedModem::new().on("at+creg?", b"\r\n+CREG: 0,1\r\n\r\nOK\r\n");
        let mut at = AtTransport::new(modem);

        let reply = at.send(&AtCommand::RegistrationQuery).await.unwrap();
        assert!(reply.contains(b"+CREG: 0,1"));
        assert_eq!(at.channel().writes()[0], b"at+creg?\r\n".to_vec());
    }

    #[tokio::test(start_paused = true)]
    async fn test_silence_is_empty_response() {
        let mut at = AtTransport::new(ScriptedModem::new());
        let reply = at
            .execute(&AtCommand::Raw("AT".into()), Duration::from_millis(10))
            .await
            .unwrap();
        assert!(reply.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_multi_chunk_reply_is_concatenated() {
        let modem = ScriptedModem::new().on_chunks(
            "at+cifsr",
            vec![b"at+cifsr\r\n".to_vec(), b"10.1.2.3\r\n".to_vec()],
        );
        let mut at = AtTransport::new(modem);
        let reply = at.send(&AtCommand::LocalAddress).await.unwrap();
        assert_eq!(reply.as_bytes(), b"at+cifsr\r\n10.1.2.3\r\n");
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_discards_pending() {
        let mut modem = ScriptedModem::new();
        modem.push_unsolicited(b"\r\nRING\r\n");
        let mut at = AtTransport::new(modem);
        assert_eq!(at.drain().await.unwrap(), 8);
        assert!(at.read_chunk(16).await.unwrap().is_empty());
    }
}
