// HTTP exchange over a scripted modem socket

use ticket_link::http::{exchange, send_request};
use ticket_link::transport::mock::ScriptedModem;
use ticket_link::{extract_payload, AtTransport, HeaderFlags, HttpRequest, LinkConfig, Terminal};

fn capture(headers: &str, body: &[u8], trailer: &[u8]) -> Vec<u8> {
    let mut raw = headers.as_bytes().to_vec();
    raw.extend_from_slice(body);
    raw.extend_from_slice(trailer);
    raw
}

#[test]
fn payload_ends_ten_bytes_before_closed_capture_end() {
    let raw = capture(
        "HTTP/1.0 200 OK\r\nContent-Length: 5\r\nConnection: close\r\n\r\n",
        b"12345",
        b"\r\nCLOSED\r\n",
    );
    let payload = extract_payload(&raw).unwrap();
    assert_eq!(payload, b"12345");
    assert_eq!(&raw[raw.len() - 15..raw.len() - 10], payload.as_slice());
}

#[test]
fn payload_ends_one_byte_before_open_capture_end() {
    let raw = capture(
        "HTTP/1.0 200 OK\r\nContent-Length: 4\r\nKeep-Alive: timeout=5\r\n\r\n",
        b"ABCD",
        b"\n",
    );
    assert_eq!(extract_payload(&raw), Some(b"ABCD".to_vec()));
}

#[test]
fn binary_payload_is_preserved() {
    let body: Vec<u8> = (0u8..=255).collect();
    let raw = capture(
        "HTTP/1.0 200 OK\r\nContent-Length: 256\r\n\r\n",
        &body,
        b"\r\nCLOSED\r\n",
    );
    assert_eq!(extract_payload(&raw), Some(body));
}

#[test]
fn malformed_captures_yield_none() {
    let no_header = capture("HTTP/1.0 200 OK\r\n\r\n", b"abc", b"\n");
    let bad_digits = capture("HTTP/1.0 200 OK\r\nContent-Length: 1x\r\n\r\n", b"abc", b"\n");
    let too_short = capture(
        "HTTP/1.0 200 OK\r\nContent-Length: 64\r\n\r\n",
        b"abc",
        b"\r\nCLOSED\r\n",
    );
    assert_eq!(extract_payload(&no_header), None);
    assert_eq!(extract_payload(&bad_digits), None);
    assert_eq!(extract_payload(&too_short), None);
}

#[tokio::test(start_paused = true)]
async fn response_split_across_reads_is_reassembled() {
    let body = vec![b'x'; 300];
    let raw = capture(
        "HTTP/1.0 200 OK\r\nContent-Length: 300\r\n\r\n",
        &body,
        b"\r\nCLOSED\r\n",
    );
    let modem = ScriptedModem::new()
        .on("at+cipsend", b"> ")
        .on_chunks("GET /big ", vec![b"SEND OK\r\n".to_vec(), raw.clone()]);
    let mut at = AtTransport::new(modem);

    let done = exchange(
        &mut at,
        HttpRequest::get("/big", HeaderFlags::KEEP_ALIVE),
        10,
    )
    .await
    .unwrap();
    assert!(done.peer_closed());
    assert_eq!(done.response, raw);
    assert_eq!(done.payload, Some(body));
}

#[tokio::test(start_paused = true)]
async fn request_without_keep_alive_header() {
    let modem = ScriptedModem::new().on("at+cipsend", b"> ");
    let mut at = AtTransport::new(modem);

    let data = send_request(&mut at, "/ayer_admin/order", false, 2).await.unwrap();
    assert!(data.is_empty());
    let modem = at.channel();
    assert_eq!(modem.count("GET /ayer_admin/order HTTP/1.0"), 1);
    assert_eq!(modem.count("Connection:"), 0);
}

#[tokio::test(start_paused = true)]
async fn failed_session_sends_no_request() {
    let config = LinkConfig::builder().session_attempts(10).build();
    let modem = ScriptedModem::new().on("at+cipstart", b"OK\r\n\r\nSTATE: TCP CLOSED\r\n");
    let mut terminal = Terminal::new(modem, config);

    assert!(terminal.get("/ayer_admin/order").await.unwrap().is_none());
    let modem = terminal.transport().channel();
    assert_eq!(modem.count("at+cipstart"), 10);
    assert_eq!(modem.count("at+cipsend"), 0);
    assert_eq!(modem.count("GET "), 0);
}
