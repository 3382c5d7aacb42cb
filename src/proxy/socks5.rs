//! SOCKS5 local front (CONNECT only, no authentication)
//!
//! Only the pieces the tunnel needs: method negotiation, the CONNECT
//! request, and a success reply. UDP ASSOCIATE and BIND are refused.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::common::{Address, Result};
use crate::error::Error;
use crate::transport::Conn;

pub const SOCKS5_VERSION: u8 = 0x05;

const AUTH_NONE: u8 = 0x00;
const AUTH_NO_ACCEPTABLE: u8 = 0xFF;

const CMD_CONNECT: u8 = 0x01;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

const REP_SUCCESS: u8 = 0x00;
const REP_CMD_NOT_SUPPORTED: u8 = 0x07;
const REP_ATYP_NOT_SUPPORTED: u8 = 0x08;

/// Run the SOCKS5 negotiation; the version byte has already been consumed.
///
/// Returns the destination the application asked for. A success reply is
/// written before returning, so the next bytes on the stream are payload.
pub async fn handshake(stream: &mut Conn) -> Result<Address> {
    // 1. Auth methods
    let mut nmethods = [0u8; 1];
    stream.read_exact(&mut nmethods).await?;
    let mut methods = vec![0u8; nmethods[0] as usize];
    stream.read_exact(&mut methods).await?;

    if !methods.contains(&AUTH_NONE) {
        stream
            .write_all(&[SOCKS5_VERSION, AUTH_NO_ACCEPTABLE])
            .await?;
        return Err(Error::PresetProtocol("no acceptable auth method".into()));
    }
    stream.write_all(&[SOCKS5_VERSION, AUTH_NONE]).await?;

    // 2. Request: VER CMD RSV ATYP
    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;

    if head[0] != SOCKS5_VERSION {
        return Err(Error::PresetProtocol(format!(
            "unexpected SOCKS version: {}",
            head[0]
        )));
    }
    if head[1] != CMD_CONNECT {
        reply(stream, REP_CMD_NOT_SUPPORTED).await?;
        return Err(Error::PresetProtocol(format!(
            "unsupported SOCKS command: {}",
            head[1]
        )));
    }

    // 3. Destination address
    let addr = match head[3] {
        ATYP_IPV4 => {
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).await?;
            let port = read_port(stream).await?;
            Address::Socket((IpAddr::V4(Ipv4Addr::from(buf)), port).into())
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            let mut domain = vec![0u8; len[0] as usize];
            stream.read_exact(&mut domain).await?;
            let port = read_port(stream).await?;
            let domain = String::from_utf8(domain)
                .map_err(|_| Error::InvalidAddress("domain is not valid UTF-8".into()))?;
            Address::Domain(domain, port)
        }
        ATYP_IPV6 => {
            let mut buf = [0u8; 16];
            stream.read_exact(&mut buf).await?;
            let port = read_port(stream).await?;
            Address::Socket((IpAddr::V6(Ipv6Addr::from(buf)), port).into())
        }
        other => {
            reply(stream, REP_ATYP_NOT_SUPPORTED).await?;
            return Err(Error::PresetProtocol(format!(
                "unsupported address type: {}",
                other
            )));
        }
    };

    // 4. Success; the tunnel takes over from here
    reply(stream, REP_SUCCESS).await?;

    Ok(addr)
}

async fn read_port(stream: &mut Conn) -> Result<u16> {
    let mut buf = [0u8; 2];
    stream.read_exact(&mut buf).await?;
    Ok(u16::from_be_bytes(buf))
}

async fn reply(stream: &mut Conn, rep: u8) -> Result<()> {
    // BND.ADDR/BND.PORT are not meaningful for a tunneled CONNECT
    stream
        .write_all(&[SOCKS5_VERSION, rep, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0])
        .await?;
    stream.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::boxed;

    async fn drive(request: Vec<u8>) -> (Result<Address>, Vec<u8>) {
        let (client, server) = tokio::io::duplex(1024);
        let mut stream: Conn = boxed(server);

        let driver = tokio::spawn(async move {
            let (mut read, mut write) = tokio::io::split(client);
            write.write_all(&request).await.unwrap();
            drop(write);
            let mut replies = Vec::new();
            read.read_to_end(&mut replies).await.unwrap();
            replies
        });

        // version byte is consumed by the sniffer before handshake()
        let mut version = [0u8; 1];
        stream.read_exact(&mut version).await.unwrap();
        assert_eq!(version[0], SOCKS5_VERSION);

        let result = handshake(&mut stream).await;
        drop(stream);
        (result, driver.await.unwrap())
    }

    #[tokio::test]
    async fn test_connect_domain() {
        let mut request = vec![0x05, 0x01, 0x00];
        request.extend_from_slice(&[0x05, 0x01, 0x00, ATYP_DOMAIN]);
        request.push(11);
        request.extend_from_slice(b"example.com");
        request.extend_from_slice(&80u16.to_be_bytes());

        let (result, replies) = drive(request).await;
        assert_eq!(result.unwrap(), Address::domain("example.com", 80));
        assert_eq!(&replies[..2], &[0x05, 0x00]);
        assert_eq!(replies[3], REP_SUCCESS);
    }

    #[tokio::test]
    async fn test_connect_ipv6() {
        let mut request = vec![0x05, 0x01, 0x00];
        request.extend_from_slice(&[0x05, 0x01, 0x00, ATYP_IPV6]);
        request.extend_from_slice(&[0u8; 15]);
        request.push(1); // ::1
        request.extend_from_slice(&443u16.to_be_bytes());

        let (result, _) = drive(request).await;
        assert_eq!(result.unwrap(), Address::from_host_port("::1", 443));
    }

    #[tokio::test]
    async fn test_udp_associate_refused() {
        let mut request = vec![0x05, 0x01, 0x00];
        request.extend_from_slice(&[0x05, 0x03, 0x00, ATYP_IPV4, 127, 0, 0, 1, 0, 53]);

        let (result, replies) = drive(request).await;
        assert!(result.is_err());
        // negotiation reply then the error reply
        assert_eq!(replies[3], REP_CMD_NOT_SUPPORTED);
    }

    #[tokio::test]
    async fn test_no_acceptable_auth() {
        let request = vec![0x05, 0x01, 0x02]; // username/password only
        let (result, replies) = drive(request).await;
        assert!(result.is_err());
        assert_eq!(replies, vec![0x05, AUTH_NO_ACCEPTABLE]);
    }
}
