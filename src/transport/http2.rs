//! HTTP/2 outbound endpoint
//!
//! The client-to-server hop can ride a single HTTP/2 stream: the dialer
//! opens a TLS session to `https://host:port`, requires ALPN to settle on
//! `h2`, sends one POST request and hands the relay the paired
//! send/receive stream as an ordinary byte pipe. Peer verification uses
//! the configured CA bundle, falling back to the bundled web PKI roots.
//! There is no listening side; the server role keeps its TCP listener and
//! an external gateway terminates the HTTP/2 session in front of it.

use std::fs::File;
use std::io::{self, BufReader};
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use h2::{RecvStream, SendStream};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::timeout;
use tokio_rustls::rustls::{pki_types::ServerName, ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::common::{Address, Result};
use crate::error::Error;

use super::{boxed, Conn, Dialer};

/// Dials the configured server over TLS + HTTP/2
pub struct Http2Dialer {
    connector: TlsConnector,
    deadline: Duration,
}

impl Http2Dialer {
    /// Build the dialer once per relay; reading and validating the CA
    /// bundle happens here so a bad bundle fails loudly, not mid-dial.
    pub fn new(ca_bundle: Option<&Path>, deadline: Duration) -> Result<Self> {
        let mut root_store = RootCertStore::empty();
        match ca_bundle {
            Some(path) => {
                for cert in load_ca_bundle(path)? {
                    root_store.add(cert).map_err(|e| {
                        Error::Config(format!("Invalid CA certificate in {:?}: {}", path, e))
                    })?;
                }
            }
            None => {
                root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            }
        }

        let mut tls_config = ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();
        tls_config.alpn_protocols = vec![b"h2".to_vec()];

        Ok(Self {
            connector: TlsConnector::from(Arc::new(tls_config)),
            deadline,
        })
    }

    /// TCP, TLS with mandatory `h2` ALPN, then one request stream
    async fn open(&self, addr: &Address) -> Result<H2Stream> {
        let host = addr.host();

        let tcp = tokio::net::TcpStream::connect((host.clone(), addr.port()))
            .await
            .map_err(Error::Connect)?;
        tcp.set_nodelay(true)?;

        let server_name = ServerName::try_from(host.clone())
            .map_err(|_| Error::Config(format!("Invalid TLS server name: {}", host)))?;
        let tls = self
            .connector
            .connect(server_name, tcp)
            .await
            .map_err(Error::Connect)?;

        let (_, session) = tls.get_ref();
        if session.alpn_protocol() != Some(b"h2") {
            return Err(Error::Connect(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "peer did not negotiate h2",
            )));
        }

        let uri = format!("https://{}:{}/", host, addr.port());
        open_h2_stream(tls, &uri).await
    }
}

#[async_trait]
impl Dialer for Http2Dialer {
    async fn dial(&self, addr: &Address) -> Result<Conn> {
        match timeout(self.deadline, self.open(addr)).await {
            Ok(Ok(stream)) => Ok(boxed(stream)),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(Error::Connect(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("h2 session deadline elapsed for {}", addr),
            ))),
        }
    }
}

/// Run the h2 client handshake over `io` and open the single byte-pipe
/// stream with a POST request.
pub(crate) async fn open_h2_stream<T>(io: T, uri: &str) -> Result<H2Stream>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (send_request, connection) = h2::client::handshake(io).await.map_err(h2_err)?;

    // The connection future drives the whole session
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            debug!("h2 session terminated: {}", e);
        }
    });

    let mut send_request = send_request.ready().await.map_err(h2_err)?;

    let request = http::Request::builder()
        .method(http::Method::POST)
        .uri(uri)
        .body(())
        .map_err(|e| Error::Config(format!("Invalid h2 request: {}", e)))?;

    let (response, send) = send_request.send_request(request, false).map_err(h2_err)?;
    let response = response.await.map_err(h2_err)?;
    if !response.status().is_success() {
        return Err(Error::Connect(io::Error::new(
            io::ErrorKind::ConnectionRefused,
            format!("h2 gateway answered {}", response.status()),
        )));
    }

    Ok(H2Stream {
        send,
        recv: response.into_body(),
        readbuf: Bytes::new(),
        fin_sent: false,
    })
}

fn h2_err(e: h2::Error) -> Error {
    Error::Connect(io::Error::new(io::ErrorKind::Other, e))
}

fn h2_io_err(e: h2::Error) -> io::Error {
    io::Error::new(io::ErrorKind::Other, e)
}

fn load_ca_bundle(path: &Path) -> Result<Vec<tokio_rustls::rustls::pki_types::CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| Error::Config(format!("Failed to open CA bundle {:?}: {}", path, e)))?;
    let mut reader = BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Config(format!("Failed to parse CA bundle {:?}: {}", path, e)))?;
    if certs.is_empty() {
        return Err(Error::Config(format!(
            "CA bundle {:?} contains no certificates",
            path
        )));
    }
    Ok(certs)
}

// ============================================================================
// H2Stream - byte pipe over one request stream
// ============================================================================

/// Adapter exposing one HTTP/2 request stream as `AsyncRead + AsyncWrite`
pub struct H2Stream {
    send: SendStream<Bytes>,
    recv: RecvStream,
    readbuf: Bytes,
    fin_sent: bool,
}

impl AsyncRead for H2Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if !this.readbuf.is_empty() {
                let n = this.readbuf.len().min(buf.remaining());
                buf.put_slice(&this.readbuf.split_to(n));
                return Poll::Ready(Ok(()));
            }

            match this.recv.poll_data(cx) {
                Poll::Ready(Some(Ok(data))) => {
                    // hand the consumed window back to the peer
                    let _ = this.recv.flow_control().release_capacity(data.len());
                    this.readbuf = data;
                }
                Poll::Ready(Some(Err(e))) => return Poll::Ready(Err(h2_io_err(e))),
                Poll::Ready(None) => return Poll::Ready(Ok(())), // EOF
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl AsyncWrite for H2Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let this = self.get_mut();
        this.send.reserve_capacity(buf.len());
        loop {
            match this.send.poll_capacity(cx) {
                Poll::Ready(Some(Ok(0))) => continue,
                Poll::Ready(Some(Ok(capacity))) => {
                    let n = capacity.min(buf.len());
                    this.send
                        .send_data(Bytes::copy_from_slice(&buf[..n]), false)
                        .map_err(h2_io_err)?;
                    return Poll::Ready(Ok(n));
                }
                Poll::Ready(Some(Err(e))) => return Poll::Ready(Err(h2_io_err(e))),
                Poll::Ready(None) => {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::BrokenPipe,
                        "h2 stream closed",
                    )))
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // DATA frames are queued on the session as they are sent
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.fin_sent {
            this.send
                .send_data(Bytes::new(), true)
                .map_err(h2_io_err)?;
            this.fin_sent = true;
        }
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// In-process h2 echo peer over a duplex pipe (no TLS involved).
    /// The accept loop keeps running so the session stays driven while the
    /// spawned handler echoes the request body.
    async fn run_echo_server(io: tokio::io::DuplexStream) {
        let mut conn = h2::server::handshake(io).await.unwrap();
        while let Some(result) = conn.accept().await {
            let (request, mut respond) = result.unwrap();
            tokio::spawn(async move {
                let mut body = request.into_body();

                let response = http::Response::builder().status(200).body(()).unwrap();
                let mut send = respond.send_response(response, false).unwrap();

                while let Some(data) = body.data().await {
                    let data = data.unwrap();
                    let _ = body.flow_control().release_capacity(data.len());
                    send.send_data(data, false).unwrap();
                }
                send.send_data(Bytes::new(), true).unwrap();
            });
        }
    }

    #[tokio::test]
    async fn test_h2_stream_roundtrip() {
        let (client_io, server_io) = tokio::io::duplex(16 * 1024);
        let server = tokio::spawn(run_echo_server(server_io));

        let mut stream = open_h2_stream(client_io, "https://localhost/").await.unwrap();
        stream.write_all(b"hello over h2").await.unwrap();

        let mut buf = [0u8; 13];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello over h2");

        stream.shutdown().await.unwrap();
        let mut rest = Vec::new();
        stream.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());

        // releasing the stream lets the session close and the peer finish
        drop(stream);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_h2_gateway_error_is_fatal() {
        let (client_io, server_io) = tokio::io::duplex(16 * 1024);
        tokio::spawn(async move {
            let mut conn = h2::server::handshake(server_io).await.unwrap();
            // keep polling accept so the queued response is flushed
            while let Some(result) = conn.accept().await {
                let (_request, mut respond) = result.unwrap();
                let response = http::Response::builder().status(502).body(()).unwrap();
                let _ = respond.send_response(response, true);
            }
        });

        let result = open_h2_stream(client_io, "https://localhost/").await;
        assert!(matches!(result, Err(Error::Connect(_))));
    }

    #[test]
    fn test_missing_ca_bundle_rejected() {
        let result = Http2Dialer::new(
            Some(Path::new("/nonexistent/ca.pem")),
            Duration::from_secs(5),
        );
        assert!(result.is_err());
    }
}
