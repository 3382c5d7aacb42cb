//! Relay - one logical client-to-destination tunnel
//!
//! A relay pairs an inbound endpoint with an outbound endpoint through a
//! preset pipeline and drives its lifecycle:
//!
//! ```text
//! [Connecting] --inbound bytes--> pipeline.forward --ConnectToDst--> open outbound
//!      |                                                                  |
//!      |<---------------- notify_connected, flush released --------------+
//!      v
//! [Established] <------ bidirectional pump, idle timer ------>
//!      |
//!      v
//! [Closing] -- drain or abort --> [Closed]
//! ```
//!
//! On the client the destination is learned from the local proxy front and
//! the outbound (the configured server) is opened eagerly. On the server
//! the outbound stays deferred until a preset resolves the destination; a
//! preset failure before that point can fall back to a raw splice toward
//! the configured redirect target.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::broadcast;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

use crate::common::{Address, Result};
use crate::config::{CoreConfig, ServerTransport};
use crate::error::Error;
use crate::pipeline::{Pipeline, PipelineOutput};
use crate::preset::{PresetContext, Role};
use crate::proxy;
use crate::transport::{Conn, Dialer, Http2Dialer, TcpDialer};

use super::profile;

// ============================================================================
// Constants
// ============================================================================

/// Relay buffer size (32KB)
const RELAY_BUFFER_SIZE: usize = 32 * 1024;

/// Upper bound on bytes staged before the outbound exists
const MAX_STAGED_BYTES: usize = 64 * 1024;

/// Deadline for opening an outbound connection
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Deadline for the graceful half-close on shutdown
const DRAIN_DEADLINE: Duration = Duration::from_secs(5);

/// Round-robin cursor over the configured servers (client role)
static NEXT_SERVER: AtomicUsize = AtomicUsize::new(0);

// ============================================================================
// Relay
// ============================================================================

/// Lifecycle state of a relay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Connecting,
    Established,
    Closing,
    Closed,
}

/// One bidirectional tunnel with its own lifecycle
pub struct Relay {
    id: u64,
    cfg: Arc<CoreConfig>,
    shutdown: broadcast::Sender<()>,
    state: RelayState,
}

impl Relay {
    pub fn new(id: u64, cfg: Arc<CoreConfig>, shutdown: broadcast::Sender<()>) -> Self {
        Self {
            id,
            cfg,
            shutdown,
            state: RelayState::Connecting,
        }
    }

    pub fn state(&self) -> RelayState {
        self.state
    }

    /// Drive the relay to completion
    pub async fn run(mut self, inbound: Conn, peer: Address) -> Result<()> {
        profile::RELAYS_TOTAL.inc();
        profile::RELAYS_ACTIVE.inc();

        let result = match self.cfg.role {
            Role::Client => self.run_client(inbound, &peer).await,
            Role::Server => self.run_server(inbound, &peer).await,
        };

        profile::RELAYS_ACTIVE.dec();
        self.state = RelayState::Closed;
        result
    }

    // ------------------------------------------------------------------
    // Client role
    // ------------------------------------------------------------------

    async fn run_client(&mut self, mut inbound: Conn, peer: &Address) -> Result<()> {
        // The local front (SOCKS5/HTTP CONNECT) yields the destination
        let destination = proxy::accept_local(&mut inbound).await?;
        let server = self.pick_server()?;
        debug!(id = self.id, %peer, %destination, %server, "client relay connecting");

        let ctx = PresetContext {
            role: Role::Client,
            key: self.cfg.key.clone(),
            destination: Some(destination.clone()),
        };
        let pipeline = Pipeline::build(&self.cfg.presets, &ctx)?;

        let dialer = self.server_dialer()?;
        let outbound = match dialer.dial(&server).await {
            Ok(conn) => conn,
            Err(e) => {
                profile::CONNECT_FAILURES.inc();
                self.state = RelayState::Closing;
                return Err(e);
            }
        };

        self.state = RelayState::Established;
        info!(id = self.id, %peer, %destination, via = %server, "relay established");

        let (in_r, in_w) = tokio::io::split(inbound);
        let (out_r, out_w) = tokio::io::split(outbound);
        let stats = self.pump(Arc::new(Mutex::new(pipeline)), in_r, in_w, out_r, out_w).await;

        info!(
            id = self.id,
            %peer,
            %destination,
            up = stats.forward,
            down = stats.backward,
            "relay closed"
        );
        Ok(())
    }

    /// Round-robin over the enabled servers
    fn pick_server(&self) -> Result<Address> {
        if self.cfg.servers.is_empty() {
            return Err(Error::Config("no servers configured".into()));
        }
        let index = NEXT_SERVER.fetch_add(1, Ordering::Relaxed) % self.cfg.servers.len();
        Ok(self.cfg.servers[index].clone())
    }

    fn server_dialer(&self) -> Result<Box<dyn Dialer>> {
        match self.cfg.server_transport {
            ServerTransport::Tcp => Ok(Box::new(TcpDialer::new(CONNECT_TIMEOUT))),
            ServerTransport::H2 => Ok(Box::new(Http2Dialer::new(
                self.cfg.tls_ca.as_deref(),
                CONNECT_TIMEOUT,
            )?)),
        }
    }

    // ------------------------------------------------------------------
    // Server role
    // ------------------------------------------------------------------

    async fn run_server(&mut self, inbound: Conn, peer: &Address) -> Result<()> {
        let ctx = PresetContext {
            role: Role::Server,
            key: self.cfg.key.clone(),
            destination: None,
        };
        let pipeline = Arc::new(Mutex::new(Pipeline::build(&self.cfg.presets, &ctx)?));

        let (mut in_r, in_w) = tokio::io::split(inbound);
        let activity = Arc::new(Activity::new());
        let mut shutdown_rx = self.shutdown.subscribe();
        // Raw pre-establish bytes, kept verbatim for the redirect splice
        let mut staged = BytesMut::new();
        let mut buf = vec![0u8; RELAY_BUFFER_SIZE];

        let outcome = loop {
            let n = tokio::select! {
                r = in_r.read(&mut buf) => r?,
                _ = shutdown_rx.recv() => {
                    debug!(id = self.id, "shutdown before establishment");
                    self.state = RelayState::Closing;
                    return Ok(());
                }
                _ = idle_watchdog(activity.clone(), self.cfg.timeout) => {
                    debug!(id = self.id, "idle timeout before establishment");
                    self.state = RelayState::Closing;
                    return Err(Error::Timeout);
                }
            };

            if n == 0 {
                break ConnectOutcome::Eof(pipeline.lock().drain());
            }
            activity.touch();

            if staged.len() + n > MAX_STAGED_BYTES {
                break ConnectOutcome::Failed("handshake too large".into());
            }
            let chunk = Bytes::copy_from_slice(&buf[..n]);
            staged.extend_from_slice(&chunk);

            let output = pipeline.lock().forward(chunk);
            match output {
                PipelineOutput::Hold => continue,
                PipelineOutput::ConnectToDst(addr) => break ConnectOutcome::Connect(addr),
                PipelineOutput::Fail(reason) => break ConnectOutcome::Failed(reason),
                PipelineOutput::Emit(_) => {
                    break ConnectOutcome::Failed("data emitted before destination resolved".into())
                }
            }
        };

        match outcome {
            ConnectOutcome::Connect(destination) => {
                self.establish_server(pipeline, destination, peer, in_r, in_w, activity)
                    .await
            }
            ConnectOutcome::Failed(reason) => {
                self.handle_preset_failure(reason, staged.freeze(), in_r, in_w, activity)
                    .await
            }
            ConnectOutcome::Eof(Some(reason)) => {
                self.handle_preset_failure(reason, staged.freeze(), in_r, in_w, activity)
                    .await
            }
            ConnectOutcome::Eof(None) => {
                debug!(id = self.id, %peer, "closed before handshake");
                self.state = RelayState::Closing;
                Ok(())
            }
        }
    }

    async fn establish_server(
        &mut self,
        pipeline: Arc<Mutex<Pipeline>>,
        destination: Address,
        peer: &Address,
        in_r: ReadHalf<Conn>,
        in_w: WriteHalf<Conn>,
        activity: Arc<Activity>,
    ) -> Result<()> {
        debug!(id = self.id, %destination, "dialing destination");
        let outbound = match TcpDialer::new(CONNECT_TIMEOUT).dial(&destination).await {
            Ok(conn) => conn,
            Err(e) => {
                profile::CONNECT_FAILURES.inc();
                self.state = RelayState::Closing;
                return Err(e);
            }
        };

        let (out_r, mut out_w) = tokio::io::split(outbound);

        // Completion signal: presets release their buffered payload
        let released = pipeline
            .lock()
            .notify_connected()
            .map_err(Error::PresetProtocol)?;
        for chunk in &released {
            out_w.write_all(chunk).await?;
            profile::BYTES_FORWARD.inc_by(chunk.len() as u64);
        }
        out_w.flush().await?;
        activity.touch();

        self.state = RelayState::Established;
        info!(id = self.id, %peer, %destination, "relay established");

        let stats = self
            .pump_with_activity(pipeline, in_r, in_w, out_r, out_w, activity)
            .await;

        info!(
            id = self.id,
            %peer,
            %destination,
            up = stats.forward,
            down = stats.backward,
            "relay closed"
        );
        Ok(())
    }

    /// Preset failure before establishment: splice raw bytes to the
    /// redirect target when one is configured, close otherwise.
    async fn handle_preset_failure(
        &mut self,
        reason: String,
        staged: Bytes,
        in_r: ReadHalf<Conn>,
        in_w: WriteHalf<Conn>,
        activity: Arc<Activity>,
    ) -> Result<()> {
        profile::PRESET_FAILURES.inc();
        self.state = RelayState::Closing;

        let redirect = match &self.cfg.redirect {
            Some(addr) => addr.clone(),
            None => {
                warn!(id = self.id, %reason, "preset failure");
                return Err(Error::PresetProtocol(reason));
            }
        };

        warn!(id = self.id, %reason, %redirect, "preset failure; splicing to redirect");
        profile::REDIRECTS.inc();

        let outbound = TcpDialer::new(CONNECT_TIMEOUT).dial(&redirect).await?;
        let (out_r, mut out_w) = tokio::io::split(outbound);

        // Replay everything received so far, untouched
        out_w.write_all(&staged).await?;
        out_w.flush().await?;
        activity.touch();

        self.state = RelayState::Established;
        let pipeline = Arc::new(Mutex::new(Pipeline::empty(Role::Server)));
        let stats = self
            .pump_with_activity(pipeline, in_r, in_w, out_r, out_w, activity)
            .await;

        debug!(
            id = self.id,
            up = stats.forward,
            down = stats.backward,
            "redirect splice finished"
        );
        Ok(())
    }

    // ------------------------------------------------------------------
    // Bidirectional pump
    // ------------------------------------------------------------------

    async fn pump(
        &mut self,
        pipeline: Arc<Mutex<Pipeline>>,
        in_r: ReadHalf<Conn>,
        in_w: WriteHalf<Conn>,
        out_r: ReadHalf<Conn>,
        out_w: WriteHalf<Conn>,
    ) -> PumpStats {
        let activity = Arc::new(Activity::new());
        self.pump_with_activity(pipeline, in_r, in_w, out_r, out_w, activity)
            .await
    }

    async fn pump_with_activity(
        &mut self,
        pipeline: Arc<Mutex<Pipeline>>,
        mut in_r: ReadHalf<Conn>,
        mut in_w: WriteHalf<Conn>,
        mut out_r: ReadHalf<Conn>,
        mut out_w: WriteHalf<Conn>,
        activity: Arc<Activity>,
    ) -> PumpStats {
        let id = self.id;
        let idle_limit = self.cfg.timeout;
        let forward_total = Arc::new(AtomicU64::new(0));
        let backward_total = Arc::new(AtomicU64::new(0));

        // inbound -> pipeline.forward -> outbound
        let forward = {
            let pipeline = pipeline.clone();
            let activity = activity.clone();
            let total = forward_total.clone();
            let mut shutdown_rx = self.shutdown.subscribe();
            async move {
                let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
                loop {
                    let n = tokio::select! {
                        r = in_r.read(&mut buf) => match r {
                            Ok(n) => n,
                            Err(e) => {
                                debug!(id, error = %e, "inbound read failed");
                                break;
                            }
                        },
                        _ = shutdown_rx.recv() => {
                            let _ = timeout(DRAIN_DEADLINE, out_w.shutdown()).await;
                            break;
                        }
                    };
                    if n == 0 {
                        // half-close toward the outbound
                        let _ = out_w.shutdown().await;
                        break;
                    }
                    activity.touch();

                    let output = pipeline.lock().forward(Bytes::copy_from_slice(&buf[..n]));
                    match output {
                        PipelineOutput::Emit(chunk) => {
                            if out_w.write_all(&chunk).await.is_err()
                                || out_w.flush().await.is_err()
                            {
                                break;
                            }
                            total.fetch_add(chunk.len() as u64, Ordering::Relaxed);
                            profile::BYTES_FORWARD.inc_by(chunk.len() as u64);
                            activity.touch();
                        }
                        PipelineOutput::Hold => {}
                        PipelineOutput::ConnectToDst(_) => {
                            warn!(id, "connect event after establishment");
                            break;
                        }
                        PipelineOutput::Fail(reason) => {
                            warn!(id, %reason, "preset failure in forward direction");
                            profile::PRESET_FAILURES.inc();
                            let _ = out_w.shutdown().await;
                            break;
                        }
                    }
                }
            }
        };

        // outbound -> pipeline.backward -> inbound
        let backward = {
            let pipeline = pipeline.clone();
            let activity = activity.clone();
            let total = backward_total.clone();
            let mut shutdown_rx = self.shutdown.subscribe();
            async move {
                let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
                loop {
                    let n = tokio::select! {
                        r = out_r.read(&mut buf) => match r {
                            Ok(n) => n,
                            Err(e) => {
                                debug!(id, error = %e, "outbound read failed");
                                break;
                            }
                        },
                        _ = shutdown_rx.recv() => {
                            let _ = timeout(DRAIN_DEADLINE, in_w.shutdown()).await;
                            break;
                        }
                    };
                    if n == 0 {
                        let _ = in_w.shutdown().await;
                        break;
                    }
                    activity.touch();

                    let output = pipeline.lock().backward(Bytes::copy_from_slice(&buf[..n]));
                    match output {
                        PipelineOutput::Emit(chunk) => {
                            if in_w.write_all(&chunk).await.is_err()
                                || in_w.flush().await.is_err()
                            {
                                break;
                            }
                            total.fetch_add(chunk.len() as u64, Ordering::Relaxed);
                            profile::BYTES_BACKWARD.inc_by(chunk.len() as u64);
                            activity.touch();
                        }
                        PipelineOutput::Hold => {}
                        PipelineOutput::ConnectToDst(_) => {
                            warn!(id, "connect event in backward direction");
                            break;
                        }
                        PipelineOutput::Fail(reason) => {
                            warn!(id, %reason, "preset failure in backward direction");
                            profile::PRESET_FAILURES.inc();
                            let _ = in_w.shutdown().await;
                            break;
                        }
                    }
                }
            }
        };

        tokio::select! {
            _ = async { tokio::join!(forward, backward); } => {}
            _ = idle_watchdog(activity, idle_limit) => {
                debug!(id, "idle timeout");
            }
        }

        // teardown flush; failures at this point are only worth a log line
        if let Some(reason) = pipeline.lock().drain() {
            debug!(id, %reason, "pipeline reported failure on drain");
        }

        self.state = RelayState::Closing;
        PumpStats {
            forward: forward_total.load(Ordering::Relaxed),
            backward: backward_total.load(Ordering::Relaxed),
        }
    }
}

enum ConnectOutcome {
    Connect(Address),
    Failed(String),
    Eof(Option<String>),
}

#[derive(Debug, Default, Clone, Copy)]
struct PumpStats {
    forward: u64,
    backward: u64,
}

// ============================================================================
// Idle tracking
// ============================================================================

/// Last-activity clock shared by both pump directions
struct Activity {
    start: Instant,
    last_ms: AtomicU64,
}

impl Activity {
    fn new() -> Self {
        Self {
            start: Instant::now(),
            last_ms: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let elapsed = self.start.elapsed().as_millis() as u64;
        self.last_ms.store(elapsed, Ordering::Relaxed);
    }

    fn idle(&self) -> Duration {
        let elapsed = self.start.elapsed().as_millis() as u64;
        let last = self.last_ms.load(Ordering::Relaxed);
        Duration::from_millis(elapsed.saturating_sub(last))
    }
}

/// Resolves once no activity has been observed for `limit`
async fn idle_watchdog(activity: Arc<Activity>, limit: Duration) {
    loop {
        let idle = activity.idle();
        if idle >= limit {
            return;
        }
        sleep(limit - idle).await;
    }
}
