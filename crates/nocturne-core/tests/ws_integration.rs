use nocturne_core::{Config, ConnectionIo, Daemon, SocketType, WsMode};
use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

const MASK: [u8; 4] = [0x11, 0x22, 0x33, 0x44];
const KEY: &str = "dGhlIHNhbXBsZSBub25jZQ==";

fn setup_ws_server() -> Daemon {
    let config = Config {
        sock_type: SocketType::IPv4,
        bind_addr: Some("127.0.0.1".into()),
        port: 0,
        workers: 1,
        listeners: 1,
        ..Config::default()
    };

    let mut daemon = Daemon::new();
    daemon.bind(config).unwrap();
    daemon
        .start(|io: &mut ConnectionIo<'_>| {
            let Ok(mut ws) = io.upgrade_to_ws(WsMode::Text) else {
                return;
            };
            let mut message = Vec::new();
            while let Ok(Some(mode)) = ws.read_message(&mut message) {
                let reply = [b"echo: ".as_slice(), message.as_slice()].concat();
                if ws.send_message(mode, &reply).is_err() {
                    break;
                }
            }
        })
        .unwrap();
    daemon
}

fn client_frame(opcode: u8, fin: bool, payload: &[u8], mask: Option<[u8; 4]>) -> Vec<u8> {
    let mut frame = vec![if fin { 0x80 } else { 0 } | opcode];
    let mask_bit = if mask.is_some() { 0x80 } else { 0 };
    match payload.len() {
        len @ 0..=125 => frame.push(mask_bit | len as u8),
        len => {
            frame.push(mask_bit | 126);
            frame.extend_from_slice(&(len as u16).to_be_bytes());
        }
    }
    match mask {
        Some(mask) => {
            frame.extend_from_slice(&mask);
            frame.extend(payload.iter().enumerate().map(|(i, b)| b ^ mask[i % 4]));
        }
        None => frame.extend_from_slice(payload),
    }
    frame
}

fn handshake(daemon: &Daemon) -> TcpStream {
    let mut stream = TcpStream::connect(daemon.local_addr().unwrap()).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    write!(
        stream,
        "GET /ws HTTP/1.1\r\nHost: localhost\r\nConnection: keep-alive, Upgrade\r\n\
         Upgrade: websocket\r\nSec-WebSocket-Version: 13\r\nSec-WebSocket-Key: {KEY}\r\n\r\n"
    )
    .unwrap();

    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        assert_eq!(stream.read(&mut byte).unwrap(), 1);
        head.push(byte[0]);
    }
    let head = String::from_utf8(head).unwrap();
    assert!(head.starts_with("HTTP/1.1 101 "), "{head}");
    assert!(head.contains("Connection: Upgrade\r\n"));
    assert!(head.contains("Upgrade: websocket\r\n"));
    assert!(head.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
    assert!(!head.contains("Content-Length"));
    stream
}

/// Read one unmasked server frame.
fn server_frame(stream: &mut TcpStream) -> (u8, Vec<u8>) {
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).unwrap();
    assert_eq!(header[1] & 0x80, 0, "server frames are never masked");
    let len = match header[1] & 0x7F {
        126 => {
            let mut ext = [0u8; 2];
            stream.read_exact(&mut ext).unwrap();
            u16::from_be_bytes(ext) as usize
        }
        len => len as usize,
    };
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).unwrap();
    (header[0], payload)
}

#[test]
fn test_ws_echo_and_close() {
    let daemon = setup_ws_server();
    let mut stream = handshake(&daemon);

    stream.write_all(&client_frame(1, true, b"hello", Some(MASK))).unwrap();
    let (first, payload) = server_frame(&mut stream);
    assert_eq!(first, 0x81);
    assert_eq!(payload, b"echo: hello");

    // Fragmented message with a ping in between
    stream.write_all(&client_frame(1, false, b"frag", Some(MASK))).unwrap();
    stream.write_all(&client_frame(9, true, b"p", Some(MASK))).unwrap();
    stream.write_all(&client_frame(0, true, b"ment", Some(MASK))).unwrap();
    let (first, payload) = server_frame(&mut stream);
    assert_eq!(first, 0x8A);
    assert_eq!(payload, b"p");
    let (first, payload) = server_frame(&mut stream);
    assert_eq!(first, 0x81);
    assert_eq!(payload, b"echo: fragment");

    stream.write_all(&client_frame(8, true, &[], Some(MASK))).unwrap();
    let (first, payload) = server_frame(&mut stream);
    assert_eq!(first, 0x88);
    assert!(payload.is_empty());

    let mut rest = Vec::new();
    stream.read_to_end(&mut rest).unwrap();
    assert!(rest.is_empty());
}

#[test]
fn test_ws_large_message_is_split() {
    let daemon = setup_ws_server();
    let mut stream = handshake(&daemon);

    let data = vec![b'z'; 5000];
    stream.write_all(&client_frame(1, true, &data, Some(MASK))).unwrap();

    let mut received = Vec::new();
    let (first, payload) = server_frame(&mut stream);
    assert_eq!(first, 0x01);
    assert_eq!(payload.len(), 4092);
    received.extend_from_slice(&payload);
    let (first, payload) = server_frame(&mut stream);
    assert_eq!(first, 0x80);
    received.extend_from_slice(&payload);
    assert_eq!(received.len(), 5006);
    assert!(received.starts_with(b"echo: zzz"));
}

#[test]
fn test_ws_unmasked_frame_aborts() {
    let daemon = setup_ws_server();
    let mut stream = handshake(&daemon);

    stream.write_all(&client_frame(1, true, b"bare", None)).unwrap();
    let mut rest = Vec::new();
    // Either a clean EOF or a reset, but never an echo
    match stream.read_to_end(&mut rest) {
        Ok(_) => assert!(rest.is_empty()),
        Err(e) => assert_ne!(e.kind(), std::io::ErrorKind::WouldBlock),
    }
}

#[test]
fn test_ws_version_mismatch() {
    let daemon = setup_ws_server();
    let mut stream = TcpStream::connect(daemon.local_addr().unwrap()).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    write!(
        stream,
        "GET /ws HTTP/1.1\r\nConnection: Upgrade\r\nUpgrade: websocket\r\n\
         Sec-WebSocket-Version: 8\r\nSec-WebSocket-Key: {KEY}\r\n\r\n"
    )
    .unwrap();

    let mut res = String::new();
    stream.read_to_string(&mut res).unwrap();
    assert!(res.starts_with("HTTP/1.1 426 "));
    assert!(res.contains("Sec-WebSocket-Version: 13\r\n"));
}
