//! HTTP CONNECT local front
//!
//! Tunnel mode only: `CONNECT host:port` is answered with
//! `200 Connection Established` and the connection becomes a raw byte
//! stream. Forward-mode request rewriting is not a tunnel concern and is
//! refused.

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::common::{Address, Result};
use crate::error::Error;
use crate::transport::Conn;

/// Upper bound on the request head; anything longer is hostile
const MAX_HEAD_LEN: usize = 8 * 1024;

/// Run the HTTP CONNECT negotiation; `first` is the already-sniffed byte.
pub async fn handshake(stream: &mut Conn, first: u8) -> Result<Address> {
    let head = read_head(stream, first).await?;
    let line = head
        .split(|&b| b == b'\r')
        .next()
        .unwrap_or(&head);
    let line = std::str::from_utf8(line)
        .map_err(|_| Error::PresetProtocol("request line is not valid UTF-8".into()))?;

    let mut parts = line.split_whitespace();
    let method = parts.next().unwrap_or("");
    let target = parts.next().unwrap_or("");

    if !method.eq_ignore_ascii_case("CONNECT") {
        stream
            .write_all(b"HTTP/1.1 405 Method Not Allowed\r\n\r\n")
            .await?;
        return Err(Error::PresetProtocol(format!(
            "unsupported HTTP method: {}",
            method
        )));
    }

    let addr = parse_host_port(target)?;

    stream
        .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
        .await?;
    stream.flush().await?;

    Ok(addr)
}

/// Accumulate the request head up to the blank line, byte by byte so no
/// payload is consumed past the terminator.
async fn read_head(stream: &mut Conn, first: u8) -> Result<Vec<u8>> {
    let mut head = vec![first];
    let mut byte = [0u8; 1];

    while !head.ends_with(b"\r\n\r\n") {
        if head.len() >= MAX_HEAD_LEN {
            return Err(Error::PresetProtocol("HTTP request head too large".into()));
        }
        stream.read_exact(&mut byte).await?;
        head.push(byte[0]);
    }

    Ok(head)
}

fn parse_host_port(target: &str) -> Result<Address> {
    let (host, port) = match target.rsplit_once(':') {
        Some((host, port)) => {
            let port: u16 = port
                .parse()
                .map_err(|_| Error::InvalidAddress(format!("invalid port in {}", target)))?;
            (host, port)
        }
        None => (target, 443),
    };
    if host.is_empty() {
        return Err(Error::InvalidAddress(format!("empty host in {}", target)));
    }
    Ok(Address::from_host_port(host.trim_matches(&['[', ']'][..]), port))
}
