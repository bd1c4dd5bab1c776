// MIT License - Copyright (c) 2021 TJForc
// Time sync: raw NTP over the modem socket, or the modem's own clock

use chrono::{DateTime, Datelike, Timelike};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::LinkConfig;
use crate::constants::{
    CTRL_Z, NTP_CLIENT_HEADER, NTP_IDLE_READS, NTP_PACKET_LEN, NTP_PORT, NTP_READ_GAP,
    NTP_READ_MAX, NTP_TRANSMIT_WORD, NTP_UNIX_OFFSET,
};
use crate::error::Result;
use crate::modem::Modem;
use crate::protocol::{is_send_prompt, parse_clock_reply, AtCommand};
use crate::retry::IdleBudget;
use crate::session::Session;
use crate::transport::at::AtTransport;
use crate::transport::SerialChannel;

/// A calendar time as handed to the terminal's RTC.
///
/// `weekday` and `millisecond` are always 0; neither producer reports them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct TimeSample {
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub weekday: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
    pub millisecond: u16,
}

impl TimeSample {
    /// UTC calendar fields of a Unix timestamp.
    pub fn from_unix(secs: u32) -> Option<Self> {
        let t = DateTime::from_timestamp(i64::from(secs), 0)?;
        Some(Self {
            year: u16::try_from(t.year()).ok()?,
            month: t.month() as u8,
            day: t.day() as u8,
            weekday: 0,
            hour: t.hour() as u8,
            minute: t.minute() as u8,
            second: t.second() as u8,
            millisecond: 0,
        })
    }
}

/// SNTP client request: LI 0, VN 3, mode 3, everything else zero.
pub fn ntp_request() -> [u8; NTP_PACKET_LEN] {
    let mut packet = [0u8; NTP_PACKET_LEN];
    packet[0] = NTP_CLIENT_HEADER;
    packet
}

/// Unix seconds from the transmit timestamp of an NTP reply.
///
/// The reply is read as twelve big-endian words; word 10 holds the integer
/// seconds since 1900. Short replies and pre-1970 stamps yield `None`.
pub fn unix_time_from_ntp(reply: &[u8]) -> Option<u32> {
    if reply.len() < NTP_PACKET_LEN {
        return None;
    }
    let offset = NTP_TRANSMIT_WORD * 4;
    let word: [u8; 4] = reply.get(offset..offset + 4)?.try_into().ok()?;
    u32::from_be_bytes(word).checked_sub(NTP_UNIX_OFFSET)
}

/// Collect what the modem relays after the request went out.
///
/// `SEND OK` arrives at once, the reply only after the network round trip.
/// Reading stops once a full packet's worth has arrived and the line goes
/// quiet, after `NTP_IDLE_READS` empty reads, or at `NTP_READ_MAX` bytes.
async fn read_ntp_reply<C: SerialChannel>(at: &mut AtTransport<C>) -> Result<Vec<u8>> {
    let mut data = Vec::new();
    let mut idle = IdleBudget::new(NTP_IDLE_READS);
    while !idle.spent() && data.len() < NTP_READ_MAX {
        let chunk = at.read_chunk(NTP_READ_MAX - data.len()).await?;
        let got_data = !chunk.is_empty();
        idle.observe(got_data);
        data.extend_from_slice(&chunk);
        if !got_data && data.len() >= NTP_PACKET_LEN {
            break;
        }
        sleep(NTP_READ_GAP).await;
    }
    Ok(data)
}

/// Query `server` with a raw NTP packet over a UDP socket on the modem.
///
/// TLS is switched off first; `AT+CIPSSL=1` would otherwise still apply to
/// the UDP socket.
pub async fn ntp_over_socket<C: SerialChannel>(
    at: &mut AtTransport<C>,
    server: &str,
    attempts: u32,
) -> Result<Option<TimeSample>> {
    Modem::new(at).disable_ssl().await?;

    let mut session = Session::new(at);
    if !session.open_udp_session(attempts, server, NTP_PORT).await? {
        return Ok(None);
    }

    let at = session.transport();
    let prompt = at.send(&AtCommand::SocketSend).await?;
    let reply = if is_send_prompt(&prompt) {
        let mut packet = ntp_request().to_vec();
        packet.push(CTRL_Z);
        at.write_raw(&packet).await?;
        read_ntp_reply(at).await?
    } else {
        warn!("No send prompt for NTP request");
        Vec::new()
    };
    session.close().await?;

    // The reply follows the modem's SEND OK; the packet is the tail.
    let tail = &reply[reply.len().saturating_sub(NTP_READ_MAX)..];
    let packet = tail.get(tail.len().saturating_sub(NTP_PACKET_LEN)..);
    let sample = packet
        .and_then(unix_time_from_ntp)
        .and_then(TimeSample::from_unix);
    match &sample {
        Some(s) => info!("NTP time from {}: {:?}", server, s),
        None => warn!("No usable NTP reply from {} ({} bytes)", server, reply.len()),
    }
    Ok(sample)
}

/// Read the modem RTC, optionally syncing it over NTP first.
pub async fn modem_clock<C: SerialChannel>(
    at: &mut AtTransport<C>,
    config: &LinkConfig,
    sync: bool,
) -> Result<Option<TimeSample>> {
    if sync {
        debug!("Syncing modem clock from {}", config.ntp_server);
        at.send(&AtCommand::BearerOpen).await?;
        at.send(&AtCommand::NtpProfile).await?;
        at.send(&AtCommand::NtpServer {
            server: config.ntp_server.clone(),
            timezone: config.ntp_timezone,
        })
        .await?;
        at.send(&AtCommand::NtpSync).await?;
    }
    let reply = at.send(&AtCommand::ClockQuery).await?;
    Ok(parse_clock_reply(&reply))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::ScriptedModem;
    use tokio::time::{Duration, Instant};

    // 2023-06-15T10:30:05Z
    const UNIX: u32 = 1_686_825_005;

    fn ntp_reply(unix: u32) -> Vec<u8> {
        let mut reply = vec![0u8; NTP_PACKET_LEN];
        reply[0] = 0x1C;
        let secs = (unix + NTP_UNIX_OFFSET).to_be_bytes();
        reply[40..44].copy_from_slice(&secs);
        reply
    }

    #[test]
    fn test_request_packet() {
        let packet = ntp_request();
        assert_eq!(packet.len(), 48);
        assert_eq!(packet[0], 0x1B);
        assert!(packet[1..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_unix_time_from_reply() {
        assert_eq!(unix_time_from_ntp(&ntp_reply(UNIX)), Some(UNIX));
        assert_eq!(unix_time_from_ntp(&ntp_reply(UNIX)[..47]), None);

        // Transmit stamp before 1970.
        let mut early = vec![0u8; NTP_PACKET_LEN];
        early[40..44].copy_from_slice(&1u32.to_be_bytes());
        assert_eq!(unix_time_from_ntp(&early), None);
    }

    #[test]
    fn test_sample_from_unix() {
        let sample = TimeSample::from_unix(UNIX).unwrap();
        assert_eq!(
            sample,
            TimeSample {
                year: 2023,
                month: 6,
                day: 15,
                weekday: 0,
                hour: 10,
                minute: 30,
                second: 5,
                millisecond: 0,
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_ntp_over_socket() {
        let mut reply = b"\r\nSEND OK\r\n".to_vec();
        reply.extend(ntp_reply(UNIX));
        let modem = ScriptedModem::new()
            .on("at+cipstart", b"CONNECT OK\r\n")
            .on("at+cipsend", b"> ")
            .on([NTP_CLIENT_HEADER], &reply)
            .on("AT+CIPCLOSE", b"CLOSE OK\r\n");
        let mut at = AtTransport::new(modem);

        let sample = ntp_over_socket(&mut at, "time.google.com", 3)
            .await
            .unwrap()
            .unwrap();
        assert_eq!((sample.year, sample.hour, sample.second), (2023, 10, 5));
        assert_eq!(at.channel().count("AT+CIPCLOSE"), 1);
    }

    /// Relays the NTP reply only after a simulated network round trip.
    struct SlowNetwork {
        modem: ScriptedModem,
        reply: Vec<u8>,
        rtt: Duration,
        due: Option<Instant>,
    }

    impl SerialChannel for SlowNetwork {
        async fn write(&mut self, data: &[u8]) -> Result<()> {
            if data.first() == Some(&NTP_CLIENT_HEADER) {
                self.due = Some(Instant::now() + self.rtt);
            }
            self.modem.write(data).await
        }

        async fn read_available(&mut self, max: usize) -> Result<Vec<u8>> {
            if self.due.is_some_and(|due| Instant::now() >= due) {
                self.due = None;
                let reply = std::mem::take(&mut self.reply);
                self.modem.push_unsolicited(&reply);
            }
            self.modem.read_available(max).await
        }
    }

    fn slow_network(rtt: Duration) -> SlowNetwork {
        let modem = ScriptedModem::new()
            .on("at+cipstart", b"CONNECT OK\r\n")
            .on("at+cipsend", b"> ")
            .on([NTP_CLIENT_HEADER], b"\r\nSEND OK\r\n")
            .on("AT+CIPCLOSE", b"CLOSE OK\r\n");
        SlowNetwork {
            modem,
            reply: ntp_reply(UNIX),
            rtt,
            due: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_ntp_reply_after_round_trip() {
        let mut at = AtTransport::new(slow_network(Duration::from_millis(300)));
        let sample = ntp_over_socket(&mut at, "time.google.com", 3)
            .await
            .unwrap();
        assert_eq!(sample, TimeSample::from_unix(UNIX));
        assert_eq!(at.channel().modem.count("AT+CIPCLOSE"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ntp_reply_too_late() {
        let mut at = AtTransport::new(slow_network(Duration::from_secs(60)));
        let sample = ntp_over_socket(&mut at, "time.google.com", 3)
            .await
            .unwrap();
        assert_eq!(sample, None);
        assert_eq!(at.channel().modem.count("AT+CIPCLOSE"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ntp_socket_is_plain() {
        let modem = ScriptedModem::new().on("at+cipstart", b"CONNECT OK\r\n");
        let mut at = AtTransport::new(modem);
        ntp_over_socket(&mut at, "time.google.com", 1).await.unwrap();

        let segments = at.channel().segments();
        let plain = segments.iter().position(|s| s.starts_with(b"AT+CIPSSL=0"));
        let open = segments.iter().position(|s| s.starts_with(b"at+cipstart=\"UDP\""));
        assert!(plain.is_some() && open.is_some());
        assert!(plain < open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ntp_without_session() {
        let mut at = AtTransport::new(ScriptedModem::new());
        assert_eq!(ntp_over_socket(&mut at, "pool.ntp.org", 2).await.unwrap(), None);
        assert_eq!(at.channel().count("at+cipsend"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_modem_clock_with_sync() {
        let modem = ScriptedModem::new().on(
            "AT+CCLK?",
            b"AT+CCLK?\r\n+CCLK: \"23/06/15,10:30:05+00\"\r\n\r\nOK\r\n",
        );
        let mut at = AtTransport::new(modem);
        let config = LinkConfig::default();

        let sample = modem_clock(&mut at, &config, true).await.unwrap().unwrap();
        assert_eq!((sample.year, sample.month, sample.day), (2023, 6, 15));
        assert_eq!(at.channel().count("AT+CNTP=\"time.google.com\",12"), 1);
        assert_eq!(at.channel().count("AT+CNTPCID=1"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_modem_clock_garbage() {
        let modem = ScriptedModem::new().on("AT+CCLK?", b"ERROR\r\n");
        let mut at = AtTransport::new(modem);
        let sample = modem_clock(&mut at, &LinkConfig::default(), false)
            .await
            .unwrap();
        assert_eq!(sample, None);
        assert_eq!(at.channel().count("AT+CNTP"), 0);
    }
}
