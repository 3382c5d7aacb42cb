//! Transport endpoints
//!
//! An endpoint owns one socket and hands the relay plain bidirectional
//! byte IO; preset transforms never happen at this layer. The two sides
//! are deliberately asymmetric:
//!
//! - Inbound traffic always arrives over the hub's single TCP listener
//!   (`Inbound`), so listening is a concrete type, not a trait.
//! - Outbound connections go through a [`Dialer`]: plain TCP toward
//!   resolved destinations and redirect targets, TCP or a single HTTP/2
//!   stream for the client-to-server hop. Every dialer enforces its own
//!   connect deadline and reports failures as `Error::Connect`, so the
//!   relay can treat "could not open the outbound" uniformly.

mod http2;
mod tcp;

pub use http2::Http2Dialer;
pub use tcp::{Inbound, TcpDialer};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::common::{Address, Result};

/// Bidirectional byte IO as the relay pumps it
pub trait ByteIo: AsyncRead + AsyncWrite {}

impl<T: AsyncRead + AsyncWrite> ByteIo for T {}

/// One endpoint's socket, boxed for the relay. Relays split a `Conn`
/// into halves and drive each direction independently; half-close is
/// expressed by shutting down the write half.
pub type Conn = Box<dyn ByteIo + Unpin + Send>;

/// Box a concrete socket into a relay-ready connection
pub fn boxed<T>(io: T) -> Conn
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    Box::new(io)
}

/// Opens one outbound connection per call, bounded by the dialer's
/// connect deadline.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, addr: &Address) -> Result<Conn>;
}
