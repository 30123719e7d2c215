//! The listener accepts inbound sockets, wraps each one into a connection through the
//!  configured factory, owns the live connections in a keyed map, and tears everything
//!  down on close.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use tokio::net::{TcpListener as TcpServerSocket, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, trace};

use crate::codec::Codec;
use crate::config::ConnectionConfig;
use crate::connection::{Connection, ConnectionHandler, OnClose};
use crate::net_manager::NetContext;
use crate::packet::Packet;

static NEXT_LISTENER_ID: AtomicU32 = AtomicU32::new(1);

/// Lifecycle callbacks of a listener, invoked as accepted connections come and go.
#[async_trait]
pub trait ListenerHandler: Send + Sync + 'static {
    async fn on_connection_connected(
        &self,
        listener: Arc<Listener>,
        connection: Arc<dyn Connection>,
    );

    async fn on_connection_disconnect(
        &self,
        listener: Arc<Listener>,
        connection: Arc<dyn Connection>,
    );
}

/// Builds the connection wrapping an accepted socket. The default factory produces the
///  ring-buffered [crate::TcpConnection]; a custom factory can substitute the
///  per-frame-allocating [crate::DirectConnection] (or an application-defined variant).
pub type AcceptFactory = Box<
    dyn Fn(
            TcpStream,
            Arc<ConnectionConfig>,
            Arc<dyn Codec>,
            Arc<dyn ConnectionHandler>,
        ) -> Arc<dyn Connection>
        + Send
        + Sync,
>;

pub struct Listener {
    listener_id: u32,
    ctx: NetContext,
    handler: Option<Arc<dyn ListenerHandler>>,

    accept_config: Arc<ConnectionConfig>,
    accept_codec: Arc<dyn Codec>,
    accept_handler: Arc<dyn ConnectionHandler>,
    factory: AcceptFactory,

    /// live accepted connections; mutators take the write lock, lookups the read lock
    connections: RwLock<FxHashMap<u32, Arc<dyn Connection>>>,

    local_addr: Mutex<Option<SocketAddr>>,
    close_guard: AtomicBool,
    /// listener-local shutdown; stops the accept task, which drops the OS listener
    shutdown_tx: broadcast::Sender<()>,
}

impl Listener {
    pub(crate) fn new(
        ctx: NetContext,
        accept_config: Arc<ConnectionConfig>,
        accept_codec: Arc<dyn Codec>,
        accept_handler: Arc<dyn ConnectionHandler>,
        handler: Option<Arc<dyn ListenerHandler>>,
        factory: AcceptFactory,
    ) -> Listener {
        let (shutdown_tx, _) = broadcast::channel(1);
        Listener {
            listener_id: NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed),
            ctx,
            handler,
            accept_config,
            accept_codec,
            accept_handler,
            factory,
            connections: RwLock::new(FxHashMap::default()),
            local_addr: Mutex::new(None),
            close_guard: AtomicBool::new(false),
            shutdown_tx,
        }
    }

    /// bind and listen, then spawn the accept task and the close watcher
    pub(crate) async fn start(this: &Arc<Listener>, listen_addr: &str) -> anyhow::Result<()> {
        let socket = TcpServerSocket::bind(listen_addr).await?;
        *this.local_addr.lock().unwrap() = socket.local_addr().ok();
        info!("listener {} bound to {:?}", this.listener_id, this.addr());

        let accept_this = this.clone();
        let local_shutdown = this.shutdown_tx.subscribe();
        this.ctx.spawn(async move {
            Listener::accept_loop(accept_this, socket, local_shutdown).await;
        });

        let watch_this = this.clone();
        let mut root_shutdown = this.ctx.subscribe_shutdown();
        this.ctx.spawn(async move {
            let _ = root_shutdown.recv().await;
            debug!("listener {} received shutdown notify", watch_this.listener_id);
            watch_this.close().await;
        });

        Ok(())
    }

    async fn accept_loop(
        this: Arc<Listener>,
        socket: TcpServerSocket,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        loop {
            let accepted = tokio::select! {
                res = socket.accept() => res,
                _ = shutdown.recv() => break,
            };
            match accepted {
                Ok((stream, peer_addr)) => {
                    debug!("listener {} accepted connection from {}", this.listener_id, peer_addr);
                    Listener::register_connection(&this, stream).await;
                }
                Err(e) => {
                    debug!("listener {} accept error: {}", this.listener_id, e);
                    break;
                }
            }
        }
        trace!("listener {} accept loop ended", this.listener_id);
    }

    async fn register_connection(this: &Arc<Listener>, stream: TcpStream) {
        let connection = (this.factory)(
            stream,
            this.accept_config.clone(),
            this.accept_codec.clone(),
            this.accept_handler.clone(),
        );

        this.connections
            .write()
            .await
            .insert(connection.connection_id(), connection.clone());

        this.accept_handler.on_connected(connection.clone(), true).await;

        let hook_this = this.clone();
        let on_close: OnClose = Box::new(move |conn| {
            Box::pin(async move {
                if let Some(handler) = &hook_this.handler {
                    handler.on_connection_disconnect(hook_this.clone(), conn.clone()).await;
                }
                hook_this.connections.write().await.remove(&conn.connection_id());
            })
        });
        connection.clone().start(&this.ctx, Some(on_close));

        if let Some(handler) = &this.handler {
            handler.on_connection_connected(this.clone(), connection).await;
        }
    }

    pub fn listener_id(&self) -> u32 {
        self.listener_id
    }

    /// the bound local address, available once [Listener::start] succeeded
    pub fn addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().unwrap()
    }

    pub async fn get_connection(&self, connection_id: u32) -> Option<Arc<dyn Connection>> {
        self.connections.read().await.get(&connection_id).cloned()
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Enqueue a deep copy of `packet` to every live accepted connection.
    pub async fn broadcast(&self, packet: &Packet) {
        let targets: Vec<Arc<dyn Connection>> = self
            .connections
            .read()
            .await
            .values()
            .filter(|c| c.is_connected())
            .cloned()
            .collect();

        for connection in targets {
            connection.send_packet(packet.clone()).await;
        }
    }

    /// Idempotent: stop accepting, drop the OS listener, then close every managed
    ///  connection. Each connection's close hook removes it from the map.
    pub async fn close(&self) {
        if self.close_guard.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("listener {} closing", self.listener_id);
        let _ = self.shutdown_tx.send(());

        let connections: Vec<Arc<dyn Connection>> =
            self.connections.read().await.values().cloned().collect();
        for connection in connections {
            connection.close().await;
        }
    }
}
