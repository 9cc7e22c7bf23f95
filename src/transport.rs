//! UDP transport: one bound socket, one receive thread, one inbound queue.
//!
//! Datagrams are handed to a registered callback on the receive thread, or,
//! when no callback is set, pushed onto a mutex-guarded FIFO that the
//! consumer drains on its own schedule. The queue is unbounded: a consumer
//! that falls behind grows memory without limit.
//!
//! Shutdown clears the running flag and waits a bounded time for the receive
//! thread to notice. The socket carries a read timeout so a blocked
//! `recv_from` wakes up to check the flag. Every start hands the new thread
//! its own flag, so a thread detached by a slow shutdown never resumes.
//!
//! Datagrams longer than `recv_buffer_size` are dropped and counted in
//! [`TransportStats::oversized_datagrams`], never delivered truncated.

use crate::codec::WireCodec;
use crate::registry::Endpoint;
use crate::telemetry::TelemetryUpdate;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::io;
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Largest datagram accepted by default; longer ones are dropped.
pub const DEFAULT_RECV_BUFFER_SIZE: usize = 1024;
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

const SHUTDOWN_POLL: Duration = Duration::from_millis(5);

/// One inbound datagram, consumed exactly once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawMessage {
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
    pub source: Endpoint,
    /// Arrival order within this transport, starting at 0.
    pub sequence: u64,
}

pub type MessageCallback = Arc<dyn Fn(RawMessage) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportStatus {
    Stopped,
    Running,
    /// The last start attempt failed; retry with `start()`.
    Unavailable,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportStats {
    pub datagrams_received: u64,
    pub bytes_received: u64,
    pub receive_errors: u64,
    pub datagrams_sent: u64,
    pub send_failures: u64,
    pub dropped_after_stop: u64,
    pub oversized_datagrams: u64,
}

#[derive(Debug, Default)]
struct StatsCounters {
    datagrams_received: AtomicU64,
    bytes_received: AtomicU64,
    receive_errors: AtomicU64,
    datagrams_sent: AtomicU64,
    send_failures: AtomicU64,
    dropped_after_stop: AtomicU64,
    oversized_datagrams: AtomicU64,
}

impl StatsCounters {
    fn snapshot(&self) -> TransportStats {
        TransportStats {
            datagrams_received: self.datagrams_received.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            receive_errors: self.receive_errors.load(Ordering::Relaxed),
            datagrams_sent: self.datagrams_sent.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
            dropped_after_stop: self.dropped_after_stop.load(Ordering::Relaxed),
            oversized_datagrams: self.oversized_datagrams.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to bind UDP socket on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to configure UDP socket: {0}")]
    Configure(#[source] io::Error),
    #[error("failed to spawn receive thread: {0}")]
    Spawn(#[source] io::Error),
    #[error("transport is not running")]
    NotRunning,
    #[error("invalid destination {ip}:{port}")]
    InvalidDestination { ip: String, port: u16 },
    #[error("send to {destination} failed: {source}")]
    Send {
        destination: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("short write to {destination}: {sent} of {expected} bytes")]
    ShortWrite {
        destination: SocketAddr,
        sent: usize,
        expected: usize,
    },
    #[error("encode failed: {0}")]
    Codec(#[from] crate::codec::CodecError),
}

#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// `host:port` to bind; port 0 picks an ephemeral port.
    pub bind_addr: String,
    /// Largest payload delivered. Longer datagrams are dropped and counted.
    pub recv_buffer_size: usize,
    pub poll_interval: Duration,
    pub shutdown_timeout: Duration,
}

impl TransportConfig {
    pub fn new(bind_addr: impl Into<String>) -> Self {
        Self {
            bind_addr: bind_addr.into(),
            ..Self::default()
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8890".to_string(),
            recv_buffer_size: DEFAULT_RECV_BUFFER_SIZE,
            poll_interval: DEFAULT_POLL_INTERVAL,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }
}

/// State shared between the receive thread and the owning transport.
struct Inbound {
    queue: Mutex<VecDeque<RawMessage>>,
    callback: RwLock<Option<MessageCallback>>,
    active_loops: AtomicUsize,
    next_sequence: AtomicU64,
    stats: StatsCounters,
}

impl Inbound {
    fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            callback: RwLock::new(None),
            active_loops: AtomicUsize::new(0),
            next_sequence: AtomicU64::new(0),
            stats: StatsCounters::default(),
        }
    }

    fn queue(&self) -> MutexGuard<'_, VecDeque<RawMessage>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn callback(&self) -> Option<MessageCallback> {
        self.callback
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn dispatch(&self, message: RawMessage) {
        match self.callback() {
            Some(callback) => callback(message),
            None => self.queue().push_back(message),
        }
    }
}

/// Keeps `Inbound::active_loops` accurate however the loop exits.
struct ActiveLoop<'a>(&'a AtomicUsize);

impl<'a> ActiveLoop<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(counter)
    }
}

impl Drop for ActiveLoop<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// UDP endpoint speaking exactly one wire format.
pub struct UdpTransport {
    config: TransportConfig,
    codec: Arc<dyn WireCodec>,
    inbound: Arc<Inbound>,
    /// Flag of the current run; replaced on every start.
    running: Arc<AtomicBool>,
    socket: Option<Arc<UdpSocket>>,
    worker: Option<JoinHandle<()>>,
    status: TransportStatus,
    local_addr: Option<SocketAddr>,
}

impl UdpTransport {
    pub fn new(config: TransportConfig, codec: Arc<dyn WireCodec>) -> Self {
        Self {
            config,
            codec,
            inbound: Arc::new(Inbound::new()),
            running: Arc::new(AtomicBool::new(false)),
            socket: None,
            worker: None,
            status: TransportStatus::Stopped,
            local_addr: None,
        }
    }

    /// Binds the socket and spawns the receive loop. Calling it while
    /// already running is a no-op.
    pub fn start(&mut self) -> Result<(), TransportError> {
        if self.status == TransportStatus::Running {
            return Ok(());
        }

        match self.open() {
            Ok(()) => {
                self.status = TransportStatus::Running;
                info!(
                    format = %self.codec.format(),
                    addr = ?self.local_addr,
                    "UDP transport listening"
                );
                Ok(())
            }
            Err(e) => {
                self.status = TransportStatus::Unavailable;
                error!(addr = %self.config.bind_addr, "UDP transport unavailable: {}", e);
                Err(e)
            }
        }
    }

    fn open(&mut self) -> Result<(), TransportError> {
        let socket = UdpSocket::bind(&self.config.bind_addr).map_err(|source| TransportError::Bind {
            addr: self.config.bind_addr.clone(),
            source,
        })?;
        socket
            .set_read_timeout(Some(self.config.poll_interval))
            .map_err(TransportError::Configure)?;
        let local_addr = socket.local_addr().map_err(TransportError::Configure)?;

        let socket = Arc::new(socket);
        let loop_socket = Arc::clone(&socket);
        let inbound = Arc::clone(&self.inbound);
        let buffer_size = self.config.recv_buffer_size.max(1);

        let running = Arc::new(AtomicBool::new(true));
        let loop_running = Arc::clone(&running);
        let worker = thread::Builder::new()
            .name(format!("udp-rx-{}", local_addr.port()))
            .spawn(move || receive_loop(&loop_socket, &inbound, &loop_running, buffer_size))
            .map_err(TransportError::Spawn)?;

        self.running = running;
        self.socket = Some(socket);
        self.worker = Some(worker);
        self.local_addr = Some(local_addr);
        Ok(())
    }

    /// Stops the receive loop and releases the socket. Safe to call
    /// repeatedly; nothing is queued once this returns.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        self.socket = None;

        if let Some(worker) = self.worker.take() {
            let deadline = Instant::now() + self.config.shutdown_timeout;
            while !worker.is_finished() && Instant::now() < deadline {
                thread::sleep(SHUTDOWN_POLL);
            }
            if worker.is_finished() {
                if worker.join().is_err() {
                    warn!("UDP receive thread panicked");
                }
            } else {
                warn!(
                    timeout_ms = self.config.shutdown_timeout.as_millis() as u64,
                    "UDP receive thread did not exit in time, detaching"
                );
            }
        }

        if self.status == TransportStatus::Running {
            info!(addr = ?self.local_addr, "UDP transport stopped");
        }
        self.status = TransportStatus::Stopped;
    }

    /// Best-effort single datagram write.
    pub fn send(&self, payload: &[u8], ip: &str, port: u16) -> Result<usize, TransportError> {
        let destination = ip
            .parse::<IpAddr>()
            .map(|ip| SocketAddr::new(ip, port))
            .map_err(|_| TransportError::InvalidDestination {
                ip: ip.to_string(),
                port,
            })?;
        self.send_to_addr(payload, destination)
    }

    pub fn send_to_endpoint(&self, payload: &[u8], endpoint: &Endpoint) -> Result<usize, TransportError> {
        self.send(payload, &endpoint.ip, endpoint.port)
    }

    /// Encodes `update` with this transport's codec and sends every
    /// resulting datagram. Returns the total bytes written.
    pub fn send_update(&self, update: &TelemetryUpdate, endpoint: &Endpoint) -> Result<usize, TransportError> {
        let mut total = 0;
        for datagram in self.codec.encode(update)? {
            total += self.send_to_endpoint(&datagram, endpoint)?;
        }
        Ok(total)
    }

    fn send_to_addr(&self, payload: &[u8], destination: SocketAddr) -> Result<usize, TransportError> {
        let stats = &self.inbound.stats;
        let Some(socket) = self.socket.as_ref() else {
            stats.send_failures.fetch_add(1, Ordering::Relaxed);
            return Err(TransportError::NotRunning);
        };

        match socket.send_to(payload, destination) {
            Ok(sent) if sent == payload.len() => {
                stats.datagrams_sent.fetch_add(1, Ordering::Relaxed);
                debug!(%destination, bytes = sent, "datagram sent");
                Ok(sent)
            }
            Ok(sent) => {
                stats.send_failures.fetch_add(1, Ordering::Relaxed);
                Err(TransportError::ShortWrite {
                    destination,
                    sent,
                    expected: payload.len(),
                })
            }
            Err(source) => {
                stats.send_failures.fetch_add(1, Ordering::Relaxed);
                warn!(%destination, "UDP send failed: {}", source);
                Err(TransportError::Send { destination, source })
            }
        }
    }

    /// Removes and returns everything queued so far, oldest first.
    pub fn drain(&self) -> Vec<RawMessage> {
        let drained = std::mem::take(&mut *self.inbound.queue());
        Vec::from(drained)
    }

    pub fn pending_count(&self) -> usize {
        self.inbound.queue().len()
    }

    /// Discards queued messages, returning how many were dropped.
    pub fn clear(&self) -> usize {
        let mut queue = self.inbound.queue();
        let dropped = queue.len();
        queue.clear();
        dropped
    }

    /// Routes every later datagram to `callback` on the receive thread,
    /// bypassing the queue.
    pub fn set_callback<F>(&self, callback: F)
    where
        F: Fn(RawMessage) + Send + Sync + 'static,
    {
        *self
            .inbound
            .callback
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(callback));
    }

    pub fn clear_callback(&self) {
        *self
            .inbound
            .callback
            .write()
            .unwrap_or_else(PoisonError::into_inner) = None;
    }

    pub fn status(&self) -> TransportStatus {
        self.status
    }

    pub fn is_running(&self) -> bool {
        self.status == TransportStatus::Running
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn codec(&self) -> &Arc<dyn WireCodec> {
        &self.codec
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn stats(&self) -> TransportStats {
        self.inbound.stats.snapshot()
    }

    /// Receive threads still alive, including any detached by a slow stop.
    pub fn active_receive_loops(&self) -> usize {
        self.inbound.active_loops.load(Ordering::Acquire)
    }
}

impl Drop for UdpTransport {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for UdpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpTransport")
            .field("format", &self.codec.format())
            .field("bind_addr", &self.config.bind_addr)
            .field("local_addr", &self.local_addr)
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

fn receive_loop(socket: &UdpSocket, inbound: &Inbound, running: &AtomicBool, buffer_size: usize) {
    let _active = ActiveLoop::enter(&inbound.active_loops);
    // One spare byte tells an exact fit from a datagram the kernel truncated.
    let mut buffer = vec![0u8; buffer_size + 1];
    debug!("UDP receive loop started");

    while running.load(Ordering::Acquire) {
        let (len, addr) = match socket.recv_from(&mut buffer) {
            Ok(received) => received,
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                ) =>
            {
                continue
            }
            Err(e) => {
                if !running.load(Ordering::Acquire) {
                    break;
                }
                inbound.stats.receive_errors.fetch_add(1, Ordering::Relaxed);
                warn!("UDP recv error: {}", e);
                continue;
            }
        };

        if !running.load(Ordering::Acquire) {
            inbound.stats.dropped_after_stop.fetch_add(1, Ordering::Relaxed);
            break;
        }

        if len > buffer_size {
            inbound.stats.oversized_datagrams.fetch_add(1, Ordering::Relaxed);
            warn!(%addr, limit = buffer_size, "dropping oversized datagram");
            continue;
        }

        inbound.stats.datagrams_received.fetch_add(1, Ordering::Relaxed);
        inbound.stats.bytes_received.fetch_add(len as u64, Ordering::Relaxed);

        let message = RawMessage {
            payload: buffer[..len].to_vec(),
            source: Endpoint::from(addr),
            sequence: inbound.next_sequence.fetch_add(1, Ordering::Relaxed),
        };
        inbound.dispatch(message);
    }

    debug!("UDP receive loop exited");
}
