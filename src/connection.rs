//! Connection traits and the engine shared by both connection variants: connection ids,
//!  the bounded send queue, the one-shot close protocol, dialing, the writer loop with
//!  its heartbeat / recv-timeout arbitration, and the task supervisors that convert
//!  errors and panics into an orderly close.

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::bail;
use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::time;
use tokio::time::Instant;
use tracing::{debug, error, trace};

use crate::codec::Codec;
use crate::config::ConnectionConfig;
use crate::net_manager::NetContext;
use crate::packet::{Message, Packet, PacketCommand};

/// how long a single dial attempt may take
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

static NEXT_CONNECTION_ID: AtomicU32 = AtomicU32::new(1);

/// process-unique, monotonic
pub(crate) fn next_connection_id() -> u32 {
    NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed)
}

fn unix_seconds_now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

/// Application-side callbacks of one connection. Each callback is invoked from a single
///  task: [ConnectionHandler::on_recv_packet] is never concurrent with itself for a
///  given connection, and [ConnectionHandler::on_disconnected] fires exactly once,
///  after the last packet was delivered.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ConnectionHandler: Send + Sync + 'static {
    /// called once with the dial result for connectors, and once after accept for
    ///  accepted connections
    async fn on_connected(&self, connection: Arc<dyn Connection>, success: bool);

    async fn on_disconnected(&self, connection: Arc<dyn Connection>);

    async fn on_recv_packet(&self, connection: Arc<dyn Connection>, packet: Packet);

    /// Called from the writer on each heartbeat tick (connector role only). Returning
    ///  `None` skips the emission.
    fn create_heartbeat_packet(&self, connection: &Arc<dyn Connection>) -> Option<Packet>;
}

/// hook invoked at the tail end of a connection's close, after the handler was notified
pub type OnClose =
    Box<dyn FnOnce(Arc<dyn Connection>) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send>;

/// The outward face of a connection, shared by the ring-buffered and the
///  per-frame-allocating variants.
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    fn connection_id(&self) -> u32;

    /// true if the local side initiated the dial (client role)
    fn is_connector(&self) -> bool;

    fn is_connected(&self) -> bool;

    fn local_addr(&self) -> Option<SocketAddr>;

    fn peer_addr(&self) -> Option<SocketAddr>;

    /// current depth of the outbound packet queue
    fn send_queue_len(&self) -> usize;

    /// Wrap a structured message into a packet and enqueue it. Blocks while the send
    ///  queue is full; returns false if the connection is not connected. The message
    ///  must not be mutated afterwards - it is owned by the writer from here on.
    async fn send(&self, command: PacketCommand, message: Box<dyn Message>) -> bool;

    /// enqueue a packet, blocking while the send queue is full
    async fn send_packet(&self, packet: Packet) -> bool;

    /// Enqueue with a bound on the wait: a zero timeout never blocks, otherwise the
    ///  call gives up after `timeout`. Returns false on refusal - for packets that are
    ///  allowed to be dropped, e.g. chat broadcasts.
    async fn try_send_packet(&self, packet: Packet, timeout: Duration) -> bool;

    /// Single dial attempt with a 1-second timeout. Fires
    ///  [ConnectionHandler::on_connected] with the outcome. Only meaningful for
    ///  connector-role connections that are not yet connected.
    async fn connect(self: Arc<Self>, addr: &str) -> bool;

    /// spawn the reader and writer tasks; `on_close` runs after teardown
    fn start(self: Arc<Self>, ctx: &NetContext, on_close: Option<OnClose>);

    /// Orderly one-shot close: marks the connection disconnected, unblocks both tasks,
    ///  notifies the handler, runs the `on_close` hook. Idempotent.
    async fn close(self: Arc<Self>);
}

/// State shared by both connection variants.
pub(crate) struct ConnectionCore {
    pub connection_id: u32,
    pub is_connector: bool,
    pub config: Arc<ConnectionConfig>,
    pub codec: Arc<dyn Codec>,
    pub handler: Arc<dyn ConnectionHandler>,

    connected: AtomicBool,
    /// seconds-since-epoch of the last complete inbound packet
    last_recv_tick: AtomicU32,

    send_tx: mpsc::Sender<Packet>,
    send_rx: Mutex<Option<mpsc::Receiver<Packet>>>,

    /// per-connection shutdown signal; this is what unblocks the reader when the
    ///  writer (or an external caller) initiates the close
    shutdown_tx: broadcast::Sender<()>,
    close_guard: AtomicBool,
    on_close: Mutex<Option<OnClose>>,

    stream: Mutex<Option<TcpStream>>,
    local_addr: Mutex<Option<SocketAddr>>,
    peer_addr: Mutex<Option<SocketAddr>>,
}

impl ConnectionCore {
    pub fn new(
        is_connector: bool,
        config: Arc<ConnectionConfig>,
        codec: Arc<dyn Codec>,
        handler: Arc<dyn ConnectionHandler>,
    ) -> ConnectionCore {
        let (send_tx, send_rx) = mpsc::channel(config.send_packet_cache_cap);
        let (shutdown_tx, _) = broadcast::channel(1);

        ConnectionCore {
            connection_id: next_connection_id(),
            is_connector,
            config,
            codec,
            handler,
            connected: AtomicBool::new(false),
            last_recv_tick: AtomicU32::new(unix_seconds_now()),
            send_tx,
            send_rx: Mutex::new(Some(send_rx)),
            shutdown_tx,
            close_guard: AtomicBool::new(false),
            on_close: Mutex::new(None),
            stream: Mutex::new(None),
            local_addr: Mutex::new(None),
            peer_addr: Mutex::new(None),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().unwrap()
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        *self.peer_addr.lock().unwrap()
    }

    pub fn send_queue_len(&self) -> usize {
        self.send_tx.max_capacity() - self.send_tx.capacity()
    }

    pub fn touch_recv_tick(&self) {
        self.last_recv_tick.store(unix_seconds_now(), Ordering::Release);
    }

    /// seconds since the last complete inbound packet
    fn recv_idle_secs(&self) -> u32 {
        unix_seconds_now().saturating_sub(self.last_recv_tick.load(Ordering::Acquire))
    }

    pub fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    pub fn set_on_close(&self, on_close: Option<OnClose>) {
        *self.on_close.lock().unwrap() = on_close;
    }

    /// adopt an already-connected socket (accept path, or dial success)
    pub fn attach_stream(&self, stream: TcpStream) {
        *self.local_addr.lock().unwrap() = stream.local_addr().ok();
        *self.peer_addr.lock().unwrap() = stream.peer_addr().ok();
        *self.stream.lock().unwrap() = Some(stream);
        self.connected.store(true, Ordering::Release);
        self.touch_recv_tick();
    }

    pub fn take_stream(&self) -> Option<TcpStream> {
        self.stream.lock().unwrap().take()
    }

    pub fn take_send_rx(&self) -> Option<mpsc::Receiver<Packet>> {
        self.send_rx.lock().unwrap().take()
    }

    /// single dial attempt; fires on_connected with the outcome
    pub async fn dial(&self, as_dyn: Arc<dyn Connection>, addr: &str) -> bool {
        if self.is_connected() {
            return false;
        }
        match time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                self.attach_stream(stream);
                debug!("connection {} connected to {}", self.connection_id, addr);
                self.handler.on_connected(as_dyn, true).await;
                true
            }
            Ok(Err(e)) => {
                debug!("connection {} failed to connect to {}: {}", self.connection_id, addr, e);
                self.handler.on_connected(as_dyn, false).await;
                false
            }
            Err(_) => {
                debug!("connection {} timed out connecting to {}", self.connection_id, addr);
                self.handler.on_connected(as_dyn, false).await;
                false
            }
        }
    }

    pub async fn enqueue(&self, packet: Packet) -> bool {
        if !self.is_connected() {
            return false;
        }
        self.send_tx.send(packet).await.is_ok()
    }

    pub async fn try_enqueue(&self, packet: Packet, timeout: Duration) -> bool {
        if !self.is_connected() {
            return false;
        }
        if timeout.is_zero() {
            return self.send_tx.try_send(packet).is_ok();
        }
        matches!(time::timeout(timeout, self.send_tx.send(packet)).await, Ok(Ok(())))
    }

    /// The one-shot teardown. Every termination path (peer EOF, protocol error, write
    ///  failure, recv timeout, cancellation, explicit close) funnels through here;
    ///  only the first caller performs the side effects.
    pub async fn close(&self, as_dyn: Arc<dyn Connection>) {
        if self.close_guard.swap(true, Ordering::AcqRel) {
            return;
        }
        self.connected.store(false, Ordering::Release);
        let _ = self.shutdown_tx.send(());
        debug!("connection {} closed", self.connection_id);

        self.handler.on_disconnected(as_dyn.clone()).await;

        let on_close = self.on_close.lock().unwrap().take();
        if let Some(on_close) = on_close {
            on_close(as_dyn).await;
        }
    }
}

/// One socket write with the configured per-write deadline; the deadline is re-armed
///  for every attempt.
pub(crate) async fn write_with_deadline(
    write_half: &mut OwnedWriteHalf,
    write_timeout: Option<Duration>,
    buf: &[u8],
) -> anyhow::Result<usize> {
    let n = match write_timeout {
        Some(t) => match time::timeout(t, write_half.write(buf)).await {
            Ok(res) => res?,
            Err(_) => bail!("socket write timed out after {:?}", t),
        },
        None => write_half.write(buf).await?,
    };
    if n == 0 && !buf.is_empty() {
        bail!("socket closed during write");
    }
    Ok(n)
}

/// write the whole slice, looping over short writes
pub(crate) async fn write_full(
    write_half: &mut OwnedWriteHalf,
    write_timeout: Option<Duration>,
    mut buf: &[u8],
) -> anyhow::Result<()> {
    while !buf.is_empty() {
        let n = write_with_deadline(write_half, write_timeout, buf).await?;
        buf = &buf[n..];
    }
    Ok(())
}

/// How the writer loop puts one packet on the wire - the ring variant stages frames
///  through its send ring, the direct variant writes header and payload straight to
///  the socket.
#[async_trait]
pub(crate) trait FrameSink: Send {
    /// Write `packet` (and, if the implementation batches, any packets it can pull
    ///  from `queue` without waiting).
    async fn write_packet(
        &mut self,
        packet: Packet,
        queue: &mut mpsc::Receiver<Packet>,
    ) -> anyhow::Result<()>;
}

/// The writer task body, shared by both variants: multiplexes the send queue, the
///  heartbeat timer, the recv-timeout timer and the shutdown signals.
///
/// Timers are re-armed to their *remaining* budgets, not naively to the full interval,
///  so bursty traffic does not starve idle detection.
pub(crate) async fn write_loop<S: FrameSink>(
    core: Arc<ConnectionCore>,
    as_dyn: Arc<dyn Connection>,
    mut sink: S,
    mut send_rx: mpsc::Receiver<Packet>,
    mut conn_shutdown: broadcast::Receiver<()>,
    mut root_shutdown: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    trace!("write loop started for connection {}", core.connection_id);

    let heartbeat_interval = core.config.heartbeat_interval;
    let mut heartbeat_enabled = core.is_connector && heartbeat_interval.is_some();
    let heartbeat_interval = heartbeat_interval.unwrap_or(Duration::from_secs(3600));
    let mut heartbeat_deadline = Instant::now() + heartbeat_interval;

    let recv_timeout = core.config.recv_timeout;
    let recv_timeout_enabled = recv_timeout.is_some();
    let recv_timeout = recv_timeout.unwrap_or(Duration::from_secs(3600));
    let mut recv_deadline = Instant::now() + recv_timeout;

    while core.is_connected() {
        tokio::select! {
            maybe_packet = send_rx.recv() => {
                match maybe_packet {
                    Some(packet) => sink.write_packet(packet, &mut send_rx).await?,
                    None => return Ok(()),
                }
            }

            _ = time::sleep_until(heartbeat_deadline), if heartbeat_enabled => {
                if let Some(packet) = core.handler.create_heartbeat_packet(&as_dyn) {
                    trace!("connection {} sending heartbeat", core.connection_id);
                    sink.write_packet(packet, &mut send_rx).await?;
                    heartbeat_deadline = Instant::now() + heartbeat_interval;
                } else {
                    // a handler without a heartbeat packet opts out for good
                    heartbeat_enabled = false;
                }
            }

            _ = time::sleep_until(recv_deadline), if recv_timeout_enabled => {
                let idle = Duration::from_secs(core.recv_idle_secs() as u64);
                if idle >= recv_timeout {
                    // nothing received for the full budget: the peer is assumed dead,
                    //  close to prevent the connection from leaking
                    debug!("connection {} recv timeout after {:?}", core.connection_id, idle);
                    return Ok(());
                }
                recv_deadline = Instant::now() + (recv_timeout - idle);
            }

            _ = conn_shutdown.recv() => {
                trace!("connection {} writer: close notify", core.connection_id);
                return Ok(());
            }

            _ = root_shutdown.recv() => {
                trace!("connection {} writer: shutdown notify", core.connection_id);
                return Ok(());
            }
        }
    }
    Ok(())
}

/// Spawn a connection task plus its supervisor. The supervisor logs error returns and
///  panics surfacing at the task boundary, and always converges on the connection's
///  one-shot close - this is how all failure paths end in `on_disconnected`.
pub(crate) fn spawn_supervised<F>(
    ctx: &NetContext,
    task_name: &'static str,
    connection: Arc<dyn Connection>,
    fut: F,
) where
    F: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    let inner = ctx.spawn(fut);
    ctx.spawn(async move {
        match inner.await {
            Ok(Ok(())) => {
                trace!("{} of connection {} finished", task_name, connection.connection_id());
            }
            Ok(Err(e)) => {
                debug!("{} of connection {} ended: {:#}", task_name, connection.connection_id(), e);
            }
            Err(join_error) if join_error.is_panic() => {
                error!(
                    "{} of connection {} panicked: {:?}",
                    task_name,
                    connection.connection_id(),
                    join_error
                );
            }
            Err(_) => {
                // cancelled at runtime shutdown
            }
        }
        connection.close().await;
    });
}
