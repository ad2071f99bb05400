//! In-process mock servers speaking the wire protocol. Test-only.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::BytesMut;
use rmpv::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use tntdb_protocol::codec::Encoder;
use tntdb_protocol::consts::{body, RequestType};
use tntdb_protocol::greeting::{GREETING_LINE_SIZE, GREETING_SIZE, SCRAMBLE_SIZE};
use tntdb_protocol::scramble;

use crate::config::ConnectionConfig;

/// Fixed salt every mock greeting advertises.
pub(crate) const TEST_SALT: [u8; 32] = [7u8; 32];

pub(crate) fn test_salt20() -> [u8; SCRAMBLE_SIZE] {
    let mut salt = [0u8; SCRAMBLE_SIZE];
    salt.copy_from_slice(&TEST_SALT[..SCRAMBLE_SIZE]);
    salt
}

pub(crate) fn greeting_block() -> [u8; GREETING_SIZE] {
    let mut block = [b' '; GREETING_SIZE];
    let banner = b"Tarantool 2.10.4 (Binary) mock";
    block[..banner.len()].copy_from_slice(banner);
    block[GREETING_LINE_SIZE - 1] = b'\n';
    let encoded = BASE64.encode(TEST_SALT);
    block[GREETING_LINE_SIZE..GREETING_LINE_SIZE + encoded.len()]
        .copy_from_slice(encoded.as_bytes());
    block[GREETING_SIZE - 1] = b'\n';
    block
}

pub(crate) async fn bind() -> (TcpListener, ConnectionConfig) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let config = ConnectionConfig::new(addr.ip().to_string()).with_port(addr.port());
    (listener, config)
}

pub(crate) async fn accept_with_greeting(listener: &TcpListener) -> TcpStream {
    let (mut sock, _) = listener.accept().await.unwrap();
    sock.write_all(&greeting_block()).await.unwrap();
    sock
}

/// Reads one request frame; `None` once the client hangs up.
pub(crate) async fn read_request(sock: &mut TcpStream) -> Option<(u64, u64, Value)> {
    let mut prefix = [0u8; 5];
    sock.read_exact(&mut prefix).await.ok()?;
    assert_eq!(prefix[0], 0xce, "request frame must start with the u32 marker");
    let len = u32::from_be_bytes(prefix[1..5].try_into().unwrap()) as usize;

    let mut payload = vec![0u8; len];
    sock.read_exact(&mut payload).await.ok()?;

    let mut rd = &payload[..];
    let header = rmpv::decode::read_value(&mut rd).unwrap();
    let mut code = 0;
    let mut sync = 0;
    for (key, value) in header.as_map().unwrap() {
        match key.as_u64().unwrap() {
            0x00 => code = value.as_u64().unwrap(),
            0x01 => sync = value.as_u64().unwrap(),
            other => panic!("unexpected request header key {other:#x}"),
        }
    }
    let request_body = if rd.is_empty() {
        Value::Nil
    } else {
        rmpv::decode::read_value(&mut rd).unwrap()
    };
    Some((code, sync, request_body))
}

/// Looks up a body map entry by its numeric key.
pub(crate) fn body_field(request_body: &Value, key: u8) -> Option<&Value> {
    request_body
        .as_map()?
        .iter()
        .find_map(|(k, v)| (k.as_u64() == Some(u64::from(key))).then_some(v))
}

/// Serves one connection: answers PING, verifies AUTH against `password`,
/// and delegates everything else to `handler`.
pub(crate) async fn serve_loop(
    mut sock: TcpStream,
    password: &str,
    mut handler: impl FnMut(u64, u64, &Value) -> BytesMut,
) {
    while let Some((code, sync, request_body)) = read_request(&mut sock).await {
        let reply = if code == RequestType::Ping as u64 {
            Encoder::encode_ok_response(sync, 0, None).unwrap()
        } else if code == RequestType::Auth as u64 {
            let proof = body_field(&request_body, body::TUPLE)
                .and_then(Value::as_array)
                .and_then(|tuple| tuple.get(1))
                .and_then(|v| match v {
                    Value::Binary(bytes) => Some(bytes.clone()),
                    _ => None,
                })
                .expect("auth request carries a binary scramble");
            let expected = scramble(&test_salt20(), password);
            if proof == expected {
                Encoder::encode_ok_response(sync, 0, None).unwrap()
            } else {
                Encoder::encode_error_response(
                    sync,
                    0,
                    0x8047,
                    "Incorrect password supplied for user",
                )
                .unwrap()
            }
        } else {
            handler(code, sync, &request_body)
        };
        if sock.write_all(&reply).await.is_err() {
            return;
        }
    }
}
