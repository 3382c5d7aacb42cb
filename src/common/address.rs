//! Address type for network connections
//!
//! Carries the destination of a tunneled connection and its wire form.
//! On the wire an address is `ALEN(1) || HOST(ALEN) || PORT(2 BE)` where
//! HOST is always the textual presentation of the host: numeric IPs travel
//! as text and the receiver re-parses them. No address-type byte is sent.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;

use bytes::{BufMut, BytesMut};

use crate::error::{Error, Result};

/// Network address representation
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    /// IP socket address (IP + port)
    Socket(SocketAddr),
    /// Domain name with port
    Domain(String, u16),
}

impl Address {
    /// Create an unspecified address (0.0.0.0:0)
    pub fn unspecified() -> Self {
        Address::Socket(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0))
    }

    /// Create from domain and port
    pub fn domain(domain: impl Into<String>, port: u16) -> Self {
        Address::Domain(domain.into(), port)
    }

    /// Create from a host string (IP literal or domain name) and port
    pub fn from_host_port(host: &str, port: u16) -> Self {
        match host.parse::<IpAddr>() {
            Ok(ip) => Address::Socket(SocketAddr::new(ip, port)),
            Err(_) => Address::Domain(host.to_string(), port),
        }
    }

    /// Get the port
    pub fn port(&self) -> u16 {
        match self {
            Address::Socket(addr) => addr.port(),
            Address::Domain(_, port) => *port,
        }
    }

    /// Get the host part as string (textual presentation for IPs)
    pub fn host(&self) -> String {
        match self {
            Address::Socket(addr) => addr.ip().to_string(),
            Address::Domain(domain, _) => domain.clone(),
        }
    }

    /// Check if this is a domain address
    pub fn is_domain(&self) -> bool {
        matches!(self, Address::Domain(_, _))
    }

    /// Serialize to the wire form `ALEN || HOST || PORT`.
    ///
    /// Fails if the textual host is empty or longer than 255 bytes.
    pub fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        let host = self.host();
        if host.is_empty() {
            return Err(Error::InvalidAddress("empty host".into()));
        }
        if host.len() > u8::MAX as usize {
            return Err(Error::InvalidAddress(format!(
                "host too long: {} bytes",
                host.len()
            )));
        }
        buf.put_u8(host.len() as u8);
        buf.put_slice(host.as_bytes());
        buf.put_u16(self.port());
        Ok(())
    }

    /// Parse the wire form from `host` bytes and a port.
    ///
    /// The host bytes must be valid UTF-8; an IP literal becomes a socket
    /// address, anything else a domain name.
    pub fn decode(host: &[u8], port: u16) -> Result<Self> {
        if host.is_empty() {
            return Err(Error::InvalidAddress("zero-length host".into()));
        }
        let host = std::str::from_utf8(host)
            .map_err(|_| Error::InvalidAddress("host is not valid UTF-8".into()))?;
        Ok(Self::from_host_port(host, port))
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Address::Socket(addr) => write!(f, "{}", addr),
            Address::Domain(domain, port) => write!(f, "{}:{}", domain, port),
        }
    }
}

impl FromStr for Address {
    type Err = Error;

    /// Parse `host:port` (IPv6 literals in brackets, `[::1]:80`)
    fn from_str(s: &str) -> Result<Self> {
        if let Ok(addr) = s.parse::<SocketAddr>() {
            return Ok(Address::Socket(addr));
        }
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| Error::InvalidAddress(format!("missing port: {}", s)))?;
        let port: u16 = port
            .parse()
            .map_err(|_| Error::InvalidAddress(format!("invalid port: {}", s)))?;
        if host.is_empty() {
            return Err(Error::InvalidAddress(format!("empty host: {}", s)));
        }
        Ok(Self::from_host_port(host, port))
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        Address::Socket(addr)
    }
}

impl From<(String, u16)> for Address {
    fn from((domain, port): (String, u16)) -> Self {
        Address::Domain(domain, port)
    }
}

impl From<(&str, u16)> for Address {
    fn from((domain, port): (&str, u16)) -> Self {
        Address::Domain(domain.to_string(), port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(addr: &Address) -> Address {
        let mut buf = BytesMut::new();
        addr.encode(&mut buf).unwrap();
        let alen = buf[0] as usize;
        assert_eq!(buf.len(), 1 + alen + 2);
        let port = u16::from_be_bytes([buf[1 + alen], buf[2 + alen]]);
        Address::decode(&buf[1..1 + alen], port).unwrap()
    }

    #[test]
    fn test_encode_decode_ipv4() {
        let addr = Address::from_host_port("127.0.0.1", 9);
        assert_eq!(roundtrip(&addr), addr);
    }

    #[test]
    fn test_encode_decode_ipv6() {
        let addr = Address::from_host_port("::1", 443);
        let mut buf = BytesMut::new();
        addr.encode(&mut buf).unwrap();
        // IPv6 travels as its textual presentation
        assert_eq!(&buf[1..1 + buf[0] as usize], b"::1");
        assert_eq!(roundtrip(&addr), addr);
    }

    #[test]
    fn test_encode_decode_domain() {
        let addr = Address::domain("example.com", 80);
        assert_eq!(roundtrip(&addr), addr);
    }

    #[test]
    fn test_decode_rejects_empty_host() {
        assert!(Address::decode(b"", 80).is_err());
    }

    #[test]
    fn test_decode_rejects_invalid_utf8() {
        assert!(Address::decode(&[0xff, 0xfe], 80).is_err());
    }

    #[test]
    fn test_encode_rejects_long_host() {
        let addr = Address::domain("a".repeat(256), 80);
        let mut buf = BytesMut::new();
        assert!(addr.encode(&mut buf).is_err());
    }

    #[test]
    fn test_from_str() {
        assert_eq!(
            "127.0.0.1:1080".parse::<Address>().unwrap(),
            Address::Socket("127.0.0.1:1080".parse().unwrap())
        );
        assert_eq!(
            "example.com:443".parse::<Address>().unwrap(),
            Address::domain("example.com", 443)
        );
        assert!("no-port".parse::<Address>().is_err());
        assert!(":1080".parse::<Address>().is_err());
    }
}
