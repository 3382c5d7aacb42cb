//! TCP endpoints
//!
//! `Inbound` is the hub's listener; a bind failure there is fatal for the
//! process. `TcpDialer` opens outbound sockets toward whatever address a
//! preset resolved (or the redirect target), with the connect deadline
//! applied here so relays never wait on a dead destination. Domain names
//! dial through the textual host form, the same representation the wire
//! protocol carries.

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

use crate::common::{Address, Result};
use crate::error::Error;

use super::{boxed, Conn, Dialer};

/// The hub's single listening socket
pub struct Inbound {
    listener: TcpListener,
}

impl Inbound {
    /// Bind the listener. Only IP addresses are listenable; a domain name
    /// here is a configuration mistake.
    pub async fn bind(addr: &Address) -> Result<Self> {
        let Address::Socket(socket_addr) = addr else {
            return Err(Error::Config(format!(
                "cannot listen on a domain name: {}",
                addr
            )));
        };
        let listener = TcpListener::bind(socket_addr).await.map_err(Error::Bind)?;
        Ok(Self { listener })
    }

    /// Accept the next connection for the hub to wrap into a relay
    pub async fn accept(&self) -> Result<(Conn, Address)> {
        let (socket, peer) = self.listener.accept().await?;
        socket.set_nodelay(true)?;
        Ok((boxed(socket), Address::Socket(peer)))
    }

    /// The bound address (resolves port 0 to the assigned port)
    pub fn local_addr(&self) -> Result<Address> {
        Ok(Address::Socket(self.listener.local_addr()?))
    }
}

/// Plain TCP dialer with a bounded connect deadline
pub struct TcpDialer {
    deadline: Duration,
}

impl TcpDialer {
    pub fn new(deadline: Duration) -> Self {
        Self { deadline }
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, addr: &Address) -> Result<Conn> {
        let connect = TcpStream::connect((addr.host(), addr.port()));
        let socket = match timeout(self.deadline, connect).await {
            Ok(Ok(socket)) => socket,
            Ok(Err(e)) => return Err(Error::Connect(e)),
            Err(_) => {
                return Err(Error::Connect(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("connect deadline elapsed for {}", addr),
                )))
            }
        };
        socket.set_nodelay(true)?;
        Ok(boxed(socket))
    }
}
