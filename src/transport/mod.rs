// MIT License - Copyright (c) 2021 TJForc
// Serial channel abstraction

pub mod at;
pub mod mock;
#[cfg(feature = "serial")]
pub mod serial;

use std::fmt;
use std::ops::Deref;

use crate::error::Result;

/// Half-duplex byte channel to the modem.
///
/// `read_available` never waits for data: it returns whatever the UART has
/// buffered right now, up to `max` bytes, and an empty vector when nothing
/// is pending. All pacing is done by the callers' fixed sleeps.
#[allow(async_fn_in_trait)]
pub trait SerialChannel {
    /// Write all bytes to the modem.
    async fn write(&mut self, data: &[u8]) -> Result<()>;

    /// Return the bytes available now, at most `max`.
    async fn read_available(&mut self, max: usize) -> Result<Vec<u8>>;
}

/// Bytes read back after a command, accumulated until the line went quiet.
///
/// No framing is implied: the buffer may hold the command echo, several
/// result lines, unsolicited codes, or nothing at all.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct RawResponse(Vec<u8>);

impl RawResponse {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn contains(&self, marker: &[u8]) -> bool {
        crate::protocol::contains(&self.0, marker)
    }
}

impl Deref for RawResponse {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl AsRef<[u8]> for RawResponse {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for RawResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RawResponse({:?})", String::from_utf8_lossy(&self.0))
    }
}
