//! Local proxy fronts (client side)
//!
//! The client accepts plain application traffic and must learn the
//! destination before the preset pipeline can be built. Two fronts are
//! supported and sniffed apart by the first byte of the connection:
//! SOCKS5 (0x05) and HTTP CONNECT (anything else).

pub mod http;
pub mod socks5;

use tokio::io::AsyncReadExt;

use crate::common::{Address, Result};
use crate::transport::Conn;

/// Negotiate with the local application and return the destination it
/// wants to reach. The stream is left positioned at the first payload byte.
pub async fn accept_local(stream: &mut Conn) -> Result<Address> {
    let mut first = [0u8; 1];
    stream.read_exact(&mut first).await?;

    if first[0] == socks5::SOCKS5_VERSION {
        socks5::handshake(stream).await
    } else {
        http::handshake(stream, first[0]).await
    }
}
