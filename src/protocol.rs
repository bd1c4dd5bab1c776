// MIT License - Copyright (c) 2021 TJForc
// AT command vocabulary and reply matchers

use std::net::Ipv4Addr;
use std::time::Duration;

use crate::constants::{
    ALREADY_CONNECT, CGATT_ATTACHED, CONNECT_OK, CREG_HOME, CREG_ROAMING, OK_MARKER, SEND_PROMPT,
};
use crate::time_sync::TimeSample;

/// Transport protocol requested from the modem's socket stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketProtocol {
    Tcp,
    Udp,
}

impl SocketProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tcp => "TCP",
            Self::Udp => "UDP",
        }
    }
}

/// Commands understood by the SIM800/SIM808 family.
///
/// # Wire format
///
/// Every command is sent as ASCII followed by `\r\n`. The modem echoes the
/// command, then prints zero or more information lines and a final result
/// (`OK`, `ERROR`, or a command-specific marker such as `CONNECT OK`).
/// There is no length prefix and no reliable end-of-reply marker, so
/// [`AtTransport::execute`](crate::transport::at::AtTransport::execute)
/// waits a per-command settle time and then reads until the line goes quiet.
///
/// # Bring-up order
///
/// ```text
/// at+csclk=1, at+cfun=1, at+creg? (poll), at+cfun=1,1,
/// at+cifsr (poll) / at+cstt / at+ciicr, AT+CIPSSL=1,
/// at+cipstart, at+cipsend ... 0x1A, AT+CIPCLOSE
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AtCommand {
    /// `at+csclk=1`: allow slow-clock mode (DTR-controlled sleep).
    EnableSlowClock,
    /// `at+cfun=1`: full functionality.
    FullFunctionality,
    /// `at+cfun=1,1`: full functionality with RF reset; used to confirm a
    /// fresh registration.
    FullFunctionalityReset,
    /// `at+cfun=4`: RF off, low-power mode.
    LowPower,
    /// `at+creg?`: network registration state.
    /// Reply: `+CREG: <n>,<stat>`.
    RegistrationQuery,
    /// `at+cgatt?`: packet-domain attach state.
    AttachQuery,
    /// `at+cbc`: battery charge. Reply: `+CBC: <bcs>,<bcl>,<mV>`.
    BatteryQuery,
    /// `at+cifsr`: local IP of the data bearer; a bare dotted quad.
    LocalAddress,
    /// `at+cstt="<apn>"`: set APN for the TCP/IP stack.
    SetApn { apn: String },
    /// `at+ciicr`: bring up the wireless connection.
    BringUpWireless,
    /// `AT+CIPSSL=1`: run the next socket over TLS.
    EnableSsl,
    /// `AT+CIPSSL=0`: plain sockets again.
    DisableSsl,
    /// `at+cipstart="<proto>","<address>","<port>"`.
    SocketStart {
        protocol: SocketProtocol,
        address: String,
        port: u16,
    },
    /// `at+cipsend`: request the `>` prompt for socket payload.
    SocketSend,
    /// `AT+CIPCLOSE`: close the single socket slot.
    SocketClose,
    /// `AT+SAPBR=3,1,"<param>","<value>"`: bearer profile setting.
    BearerSet { param: String, value: String },
    /// `AT+SAPBR=1,1`: open bearer profile 1.
    BearerOpen,
    /// `AT+SAPBR=2,1`: query bearer profile 1.
    BearerQuery,
    /// `AT+HTTPINIT`.
    HttpInit,
    /// `AT+HTTPPARA="<name>","<value>"`.
    HttpParam { name: String, value: String },
    /// `AT+HTTPSSL=1`.
    HttpSsl,
    /// `AT+HTTPACTION=<method>` (0 = GET, 1 = POST).
    HttpAction { method: u8 },
    /// `AT+HTTPREAD`.
    HttpRead,
    /// `AT+HTTPTERM`.
    HttpTerm,
    /// `AT+CNTPCID=1`: NTP over bearer profile 1.
    NtpProfile,
    /// `AT+CNTP="<server>",<tz>`: tz in quarter hours.
    NtpServer { server: String, timezone: i8 },
    /// `AT+CNTP`: run the modem's NTP sync.
    NtpSync,
    /// `AT+CCLK?`: read the modem RTC. Reply: `+CCLK: "yy/MM/dd,hh:mm:ss±zz"`.
    ClockQuery,
    /// Anything not listed above.
    Raw(String),
}

impl AtCommand {
    /// Convert the command to its wire string representation (without CRLF).
    pub fn to_wire_string(&self) -> String {
        match self {
            AtCommand::EnableSlowClock => "at+csclk=1".to_string(),
            AtCommand::FullFunctionality => "at+cfun=1".to_string(),
            AtCommand::FullFunctionalityReset => "at+cfun=1,1".to_string(),
            AtCommand::LowPower => "at+cfun=4".to_string(),
            AtCommand::RegistrationQuery => "at+creg?".to_string(),
            AtCommand::AttachQuery => "at+cgatt?".to_string(),
            AtCommand::BatteryQuery => "at+cbc".to_string(),
            AtCommand::LocalAddress => "at+cifsr".to_string(),
            AtCommand::SetApn { apn } => format!("at+cstt=\"{}\"", apn),
            AtCommand::BringUpWireless => "at+ciicr".to_string(),
            AtCommand::EnableSsl => "AT+CIPSSL=1".to_string(),
            AtCommand::DisableSsl => "AT+CIPSSL=0".to_string(),
            AtCommand::SocketStart {
                protocol,
                address,
                port,
            } => format!(
                "at+cipstart=\"{}\",\"{}\",\"{}\"",
                protocol.as_str(),
                address,
                port
            ),
            AtCommand::SocketSend => "at+cipsend".to_string(),
            AtCommand::SocketClose => "AT+CIPCLOSE".to_string(),
            AtCommand::BearerSet { param, value } => {
                format!("AT+SAPBR=3,1,\"{}\",\"{}\"", param, value)
            }
            AtCommand::BearerOpen => "AT+SAPBR=1,1".to_string(),
            AtCommand::BearerQuery => "AT+SAPBR=2,1".to_string(),
            AtCommand::HttpInit => "AT+HTTPINIT".to_string(),
            AtCommand::HttpParam { name, value } => {
                format!("AT+HTTPPARA=\"{}\",\"{}\"", name, value)
            }
            AtCommand::HttpSsl => "AT+HTTPSSL=1".to_string(),
            AtCommand::HttpAction { method } => format!("AT+HTTPACTION={}", method),
            AtCommand::HttpRead => "AT+HTTPREAD".to_string(),
            AtCommand::HttpTerm => "AT+HTTPTERM".to_string(),
            AtCommand::NtpProfile => "AT+CNTPCID=1".to_string(),
            AtCommand::NtpServer { server, timezone } => {
                format!("AT+CNTP=\"{}\",{}", server, timezone)
            }
            AtCommand::NtpSync => "AT+CNTP".to_string(),
            AtCommand::ClockQuery => "AT+CCLK?".to_string(),
            AtCommand::Raw(s) => s.clone(),
        }
    }

    /// Settle time between writing the command and reading the reply.
    pub fn wait(&self) -> Duration {
        match self {
            AtCommand::FullFunctionality
            | AtCommand::FullFunctionalityReset
            | AtCommand::AttachQuery
            | AtCommand::BatteryQuery => Duration::from_millis(100),
            AtCommand::RegistrationQuery | AtCommand::EnableSlowClock => {
                Duration::from_millis(500)
            }
            AtCommand::LowPower => Duration::from_millis(1500),
            AtCommand::SocketStart { .. } => Duration::from_secs(2),
            _ => Duration::from_secs(1),
        }
    }
}

/// Registration as reported by `+CREG`. Always re-queried, never cached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationState {
    Unregistered,
    RegisteredHome,
    RegisteredRoaming,
}

impl RegistrationState {
    /// Match a raw `at+creg?` reply. Anything unrecognised is `Unregistered`.
    pub fn from_reply(reply: &[u8]) -> Self {
        if CREG_HOME.iter().any(|m| contains(reply, m.as_bytes())) {
            Self::RegisteredHome
        } else if CREG_ROAMING.iter().any(|m| contains(reply, m.as_bytes())) {
            Self::RegisteredRoaming
        } else {
            Self::Unregistered
        }
    }

    pub fn is_registered(&self) -> bool {
        !matches!(self, Self::Unregistered)
    }
}

/// Outcome of a single `at+cipstart`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketOpenReply {
    Connected,
    AlreadyConnected,
    NotConnected,
}

impl SocketOpenReply {
    pub fn from_reply(reply: &[u8]) -> Self {
        if contains(reply, CONNECT_OK.as_bytes()) {
            Self::Connected
        } else if contains(reply, ALREADY_CONNECT.as_bytes()) {
            Self::AlreadyConnected
        } else {
            Self::NotConnected
        }
    }

    pub fn is_open(&self) -> bool {
        !matches!(self, Self::NotConnected)
    }
}

/// Battery report from `at+cbc`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct BatteryStatus {
    /// 0 = not charging, 1 = charging, 2 = charge finished
    pub charging: u8,
    /// Percent, 1-100
    pub level: u8,
    pub millivolts: u16,
}

impl BatteryStatus {
    /// Parse `+CBC: <bcs>,<bcl>,<voltage>`.
    pub fn from_reply(reply: &[u8]) -> Option<Self> {
        let text = std::str::from_utf8(reply).ok()?;
        let start = text.find("+CBC:")? + "+CBC:".len();
        let line = text[start..].lines().next()?;
        let mut fields = line.split(',').map(str::trim);
        let charging = fields.next()?.parse().ok()?;
        let level = fields.next()?.parse().ok()?;
        let millivolts = fields.next()?.parse().ok()?;
        Some(Self {
            charging,
            level,
            millivolts,
        })
    }
}

/// Find the first dotted-quad IPv4 address in an `at+cifsr` reply.
pub fn parse_bearer_address(reply: &[u8]) -> Option<Ipv4Addr> {
    let text = String::from_utf8_lossy(reply);
    text.split(|c: char| !(c.is_ascii_digit() || c == '.'))
        .filter(|token| token.matches('.').count() == 3)
        .find_map(|token| token.parse::<Ipv4Addr>().ok())
}

/// `+CGATT: 1` means the packet domain is attached.
pub fn parse_attach_status(reply: &[u8]) -> bool {
    contains(reply, CGATT_ATTACHED.as_bytes())
}

/// The modem is waiting for socket payload.
pub fn is_send_prompt(reply: &[u8]) -> bool {
    reply.contains(&SEND_PROMPT)
}

pub fn is_ok(reply: &[u8]) -> bool {
    contains(reply, OK_MARKER.as_bytes())
}

/// Parse an `AT+CCLK?` reply.
///
/// The timestamp is read from fixed offsets in `yy/MM/dd,hh:mm:ss`. When the
/// reply carries quotes, the text between the first pair is used.
pub fn parse_clock_reply(reply: &[u8]) -> Option<TimeSample> {
    let stamp = match reply.iter().position(|&b| b == b'"') {
        Some(open) => {
            let rest = &reply[open + 1..];
            let close = rest.iter().position(|&b| b == b'"')?;
            &rest[..close]
        }
        None => reply.trim_ascii(),
    };

    let field = |from: usize| -> Option<u16> {
        let digits = stamp.get(from..from + 2)?;
        if !digits.iter().all(u8::is_ascii_digit) {
            return None;
        }
        Some(u16::from(digits[0] - b'0') * 10 + u16::from(digits[1] - b'0'))
    };

    Some(TimeSample {
        year: field(0)? + 2000,
        month: field(3)? as u8,
        day: field(6)? as u8,
        weekday: 0,
        hour: field(9)? as u8,
        minute: field(12)? as u8,
        second: field(15)? as u8,
        millisecond: 0,
    })
}

/// Byte-substring search.
pub fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    find(haystack, needle).is_some()
}

/// Position of the first occurrence of `needle` in `haystack`.
pub fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}
