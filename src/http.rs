// MIT License - Copyright (c) 2021 TJForc
// HTTP over the modem socket

use bitflags::bitflags;
use tokio::time::{sleep, Duration};
use tracing::{debug, info, warn};

use crate::constants::{
    CLOSED_MARKER, CLOSED_TRAILER_LEN, CTRL_Z, HTTP_FIRST_READ_DELAY, HTTP_READ_CHUNK,
    HTTP_READ_GAP, SEND_PROMPT_ATTEMPTS, SEND_PROMPT_GAP,
};
use crate::error::Result;
use crate::protocol::{contains, find, is_send_prompt, AtCommand};
use crate::retry::{Attempts, IdleBudget};
use crate::transport::at::AtTransport;
use crate::transport::{RawResponse, SerialChannel};

const CONTENT_LENGTH: &[u8] = b"Content-Length: ";
const KEEP_ALIVE_HEADER: &str = "Connection: keep-alive";
/// Time the modem's HTTP stack gets to complete `AT+HTTPACTION`.
const HTTP_ACTION_SETTLE: Duration = Duration::from_secs(10);

bitflags! {
    /// Optional request headers.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HeaderFlags: u8 {
        const KEEP_ALIVE = 0x01;
    }
}

/// An HTTP/1.0 GET as written into the socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub verb: &'static str,
    pub path: String,
    pub flags: HeaderFlags,
}

impl HttpRequest {
    pub fn get(path: impl Into<String>, flags: HeaderFlags) -> Self {
        Self {
            verb: "GET",
            path: path.into(),
            flags,
        }
    }

    /// The writes that make up the request, in order. The last one carries
    /// the Ctrl-Z that ends the `at+cipsend` payload.
    pub fn wire_parts(&self) -> Vec<Vec<u8>> {
        let mut parts = vec![format!("{} {} HTTP/1.0\r\n", self.verb, self.path).into_bytes()];
        if self.flags.contains(HeaderFlags::KEEP_ALIVE) {
            parts.push(format!("{}\r\n", KEEP_ALIVE_HEADER).into_bytes());
        }
        let mut end = b"\r\n\r\n".to_vec();
        end.push(CTRL_Z);
        parts.push(end);
        parts
    }
}

/// A completed request with everything read back for it.
#[derive(Debug, Clone)]
pub struct HttpExchange {
    pub request: HttpRequest,
    pub response: Vec<u8>,
    pub payload: Option<Vec<u8>>,
}

impl HttpExchange {
    pub fn new(request: HttpRequest, response: Vec<u8>) -> Self {
        let payload = extract_payload(&response);
        Self {
            request,
            response,
            payload,
        }
    }

    /// The peer closed the socket during this exchange.
    pub fn peer_closed(&self) -> bool {
        contains(&self.response, CLOSED_MARKER)
    }

    /// The modem never offered the send prompt; nothing was sent.
    pub fn is_empty(&self) -> bool {
        self.response.is_empty()
    }
}

/// Value of the first `Content-Length: <digits>\r\n` header, and the offset
/// just past that header line.
fn content_length(raw: &[u8]) -> Option<(usize, usize)> {
    let start = find(raw, CONTENT_LENGTH)? + CONTENT_LENGTH.len();
    let rest = &raw[start..];
    let end = find(rest, b"\r\n")?;
    let digits = &rest[..end];
    if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
        return None;
    }
    let n = std::str::from_utf8(digits).ok()?.parse().ok()?;
    Some((n, start + end + 2))
}

/// Cut the body out of a raw socket capture using its Content-Length.
///
/// With `CLOSED` anywhere in the capture the body is the `n` bytes ending
/// 10 bytes before the end (the modem's close trailer). Otherwise it is the
/// `n` bytes ending one byte before the end. A missing or non-numeric
/// header, or a capture too short to hold `n` bytes after the headers,
/// yields `None`.
pub fn extract_payload(raw: &[u8]) -> Option<Vec<u8>> {
    let (n, header_end) = content_length(raw)?;
    let trailer = if contains(raw, CLOSED_MARKER) {
        CLOSED_TRAILER_LEN
    } else {
        1
    };
    let end = raw.len().checked_sub(trailer)?;
    let start = end.checked_sub(n)?;
    if start < header_end {
        return None;
    }
    Some(raw[start..end].to_vec())
}

/// Write `request` into the open socket and collect the reply.
///
/// Returns an empty buffer when the modem never offers the `>` prompt.
/// Accumulation stops at the first `CLOSED` or after `idle_read_budget`
/// consecutive empty reads.
pub async fn send<C: SerialChannel>(
    at: &mut AtTransport<C>,
    request: &HttpRequest,
    idle_read_budget: u32,
) -> Result<Vec<u8>> {
    let mut prompt = Attempts::new(SEND_PROMPT_ATTEMPTS, SEND_PROMPT_GAP);
    let mut ready = false;
    while prompt.try_next() {
        let reply = at.send(&AtCommand::SocketSend).await?;
        if is_send_prompt(&reply) {
            ready = true;
            break;
        }
        prompt.pause().await;
    }
    if !ready {
        warn!(
            "No send prompt after {} attempt(s), skipping {}",
            prompt.used(),
            request.path
        );
        return Ok(Vec::new());
    }

    debug!("HTTP >> {} {}", request.verb, request.path);
    for part in request.wire_parts() {
        at.write_raw(&part).await?;
    }

    // Echo and SEND OK.
    sleep(HTTP_FIRST_READ_DELAY).await;
    let ack = at.read_chunk(HTTP_READ_CHUNK).await?;
    debug!("Discarded {} byte send acknowledgement", ack.len());
    sleep(HTTP_READ_GAP).await;

    let mut data = Vec::new();
    let mut idle = IdleBudget::new(idle_read_budget);
    while !idle.spent() {
        let chunk = at.read_chunk(HTTP_READ_CHUNK).await?;
        idle.observe(!chunk.is_empty());
        if !chunk.is_empty() {
            data.extend_from_slice(&chunk);
            if contains(&data, CLOSED_MARKER) {
                debug!("Peer closed after {} bytes", data.len());
                break;
            }
        }
        sleep(HTTP_READ_GAP).await;
    }

    debug!("HTTP << {} bytes for {}", data.len(), request.path);
    Ok(data)
}

/// GET `path` on the open socket.
pub async fn send_request<C: SerialChannel>(
    at: &mut AtTransport<C>,
    path: &str,
    keep_alive: bool,
    idle_read_budget: u32,
) -> Result<Vec<u8>> {
    let flags = if keep_alive {
        HeaderFlags::KEEP_ALIVE
    } else {
        HeaderFlags::empty()
    };
    send(at, &HttpRequest::get(path, flags), idle_read_budget).await
}

/// GET `path` and derive the payload.
pub async fn exchange<C: SerialChannel>(
    at: &mut AtTransport<C>,
    request: HttpRequest,
    idle_read_budget: u32,
) -> Result<HttpExchange> {
    let response = send(at, &request, idle_read_budget).await?;
    Ok(HttpExchange::new(request, response))
}

/// GET `url` through the modem's own HTTP stack and return the
/// `AT+HTTPREAD` reply as-is.
pub async fn modem_http_get<C: SerialChannel>(
    at: &mut AtTransport<C>,
    apn: &str,
    url: &str,
) -> Result<RawResponse> {
    info!("Modem HTTP GET {}", url);
    at.send(&AtCommand::BearerSet {
        param: "Contype".into(),
        value: "GPRS".into(),
    })
    .await?;
    at.send(&AtCommand::BearerSet {
        param: "APN".into(),
        value: apn.into(),
    })
    .await?;
    at.send(&AtCommand::BearerOpen).await?;
    at.send(&AtCommand::BearerQuery).await?;

    at.send(&AtCommand::HttpInit).await?;
    for (name, value) in [("CID", "1"), ("URL", url), ("USERDATA", KEEP_ALIVE_HEADER)] {
        at.send(&AtCommand::HttpParam {
            name: name.into(),
            value: value.into(),
        })
        .await?;
    }
    if url.starts_with("https://") {
        at.send(&AtCommand::HttpSsl).await?;
    }
    at.send(&AtCommand::HttpAction { method: 0 }).await?;
    sleep(HTTP_ACTION_SETTLE).await;

    let response = at.send(&AtCommand::HttpRead).await?;
    at.send(&AtCommand::HttpTerm).await?;
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::ScriptedModem;

    fn response(body: &[u8], closed: bool) -> Vec<u8> {
        let mut raw = format!(
            "HTTP/1.0 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\n\r\n",
            body.len()
        )
        .into_bytes();
        raw.extend_from_slice(body);
        if closed {
            raw.extend_from_slice(b"\r\nCLOSED\r\n");
        } else {
            raw.push(b'\n');
        }
        raw
    }

    #[test]
    fn test_extract_with_closed_trailer() {
        let raw = response(b"hello world", true);
        assert_eq!(extract_payload(&raw), Some(b"hello world".to_vec()));
    }

    #[test]
    fn test_extract_without_closed() {
        let raw = response(b"0123456789", false);
        assert_eq!(extract_payload(&raw), Some(b"0123456789".to_vec()));
    }

    #[test]
    fn test_extract_zero_length() {
        let raw = response(b"", true);
        assert_eq!(extract_payload(&raw), Some(Vec::new()));
    }

    #[test]
    fn test_extract_malformed() {
        assert_eq!(extract_payload(b"HTTP/1.0 200 OK\r\n\r\nbody\n"), None);
        assert_eq!(
            extract_payload(b"HTTP/1.0 200 OK\r\nContent-Length: abc\r\n\r\nbody\n"),
            None
        );
        assert_eq!(
            extract_payload(b"HTTP/1.0 200 OK\r\nContent-Length: 500\r\n\r\nshort\n"),
            None
        );
        assert_eq!(extract_payload(b"Content-Length: 4"), None);
        assert_eq!(extract_payload(b""), None);
    }

    #[test]
    fn test_request_wire_parts() {
        let request = HttpRequest::get("/ota/main.py", HeaderFlags::KEEP_ALIVE);
        let parts = request.wire_parts();
        assert_eq!(parts[0], b"GET /ota/main.py HTTP/1.0\r\n".to_vec());
        assert_eq!(parts[1], b"Connection: keep-alive\r\n".to_vec());
        assert_eq!(parts[2], b"\r\n\r\n\x1a".to_vec());

        let plain = HttpRequest::get("/x", HeaderFlags::empty()).wire_parts();
        assert_eq!(plain.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_request_stops_at_closed() {
        let raw = response(b"{\"ok\":true}", true);
        let modem = ScriptedModem::new()
            .on("at+cipsend", b"at+cipsend\r\n> ")
            .on_chunks(
                "GET /ayer_admin/order",
                vec![b"\r\nSEND OK\r\n".to_vec(), raw.clone()],
            );
        let mut at = AtTransport::new(modem);

        let data = send_request(&mut at, "/ayer_admin/order", true, 100)
            .await
            .unwrap();
        assert_eq!(data, raw);
        assert_eq!(extract_payload(&data), Some(b"{\"ok\":true}".to_vec()));
        assert_eq!(at.channel().count("Connection: keep-alive"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_prompt_is_empty_noop() {
        let modem = ScriptedModem::new().on("at+cipsend", b"ERROR\r\n");
        let mut at = AtTransport::new(modem);
        let data = send_request(&mut at, "/x", false, 10).await.unwrap();
        assert!(data.is_empty());
        assert_eq!(at.channel().count("at+cipsend"), SEND_PROMPT_ATTEMPTS as usize);
        assert_eq!(at.channel().count("GET "), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_budget_ends_exchange() {
        let body = response(b"abc", false);
        let modem = ScriptedModem::new()
            .on("at+cipsend", b"> ")
            .on_chunks("GET ", vec![b"SEND OK\r\n".to_vec(), body.clone()]);
        let mut at = AtTransport::new(modem);

        let start = tokio::time::Instant::now();
        let exchange = exchange(&mut at, HttpRequest::get("/a", HeaderFlags::empty()), 5)
            .await
            .unwrap();
        assert!(!exchange.peer_closed());
        assert_eq!(exchange.response, body);
        assert_eq!(exchange.payload, Some(b"abc".to_vec()));
        // One data read followed by five empty ones.
        assert!(start.elapsed() >= HTTP_FIRST_READ_DELAY + HTTP_READ_GAP * 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_modem_http_get_sequence() {
        let modem = ScriptedModem::new().on("AT+HTTPREAD", b"+HTTPREAD: 2\r\nok\r\nOK\r\n");
        let mut at = AtTransport::new(modem);
        let reply = modem_http_get(&mut at, "ETC", "https://example.net/ping")
            .await
            .unwrap();
        assert!(reply.contains(b"+HTTPREAD: 2"));

        let modem = at.channel();
        assert_eq!(modem.count("AT+SAPBR=3,1,\"APN\",\"ETC\""), 1);
        assert_eq!(
            modem.count("AT+HTTPPARA=\"URL\",\"https://example.net/ping\""),
            1
        );
        assert_eq!(modem.count("AT+HTTPSSL=1"), 1);
        assert_eq!(modem.count("AT+HTTPACTION=0"), 1);
        assert_eq!(modem.count("AT+HTTPTERM"), 1);
    }
}
