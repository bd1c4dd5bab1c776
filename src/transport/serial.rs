// MIT License - Copyright (c) 2021 TJForc
// UART channel

use std::io::{Read, Write};
use std::time::Duration;

use serialport::{DataBits, Parity, SerialPort, StopBits};
use tracing::{debug, info};

use crate::error::{LinkError, Result};
use crate::transport::SerialChannel;

/// Default modem UART speed.
pub const DEFAULT_BAUD: u32 = 9600;

/// A modem attached to a local UART (8N1, no flow control).
///
/// Reads only ever consume what `bytes_to_read()` reports, so they return
/// immediately. Writes are small (commands and request lines) and go out
/// synchronously.
pub struct SerialPortChannel {
    port: Box<dyn SerialPort>,
}

impl SerialPortChannel {
    pub fn open(path: &str, baud: u32) -> Result<Self> {
        info!("Opening modem UART {} at {} baud", path, baud);
        let port = serialport::new(path, baud)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .timeout(Duration::from_millis(10))
            .open()?;
        Ok(Self { port })
    }

    pub fn from_port(port: Box<dyn SerialPort>) -> Self {
        Self { port }
    }
}

impl SerialChannel for SerialPortChannel {
    async fn write(&mut self, data: &[u8]) -> Result<()> {
        self.port.write_all(data)?;
        self.port.flush()?;
        Ok(())
    }

    async fn read_available(&mut self, max: usize) -> Result<Vec<u8>> {
        let pending = self.port.bytes_to_read().map_err(LinkError::from)? as usize;
        let want = pending.min(max);
        if want == 0 {
            return Ok(Vec::new());
        }
        let mut buf = vec![0u8; want];
        let n = match self.port.read(&mut buf) {
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => 0,
            Err(e) => return Err(e.into()),
        };
        buf.truncate(n);
        debug!("UART read {} of {} pending bytes", n, pending);
        Ok(buf)
    }
}
