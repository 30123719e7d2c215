//! The net manager owns listeners and dialed connections, carries the root shutdown
//!  signal, and keeps wait-group-style track of every spawned task so that
//!  [NetManager::shutdown] can block until the whole library has wound down.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use rustc_hash::FxHashMap;
use tokio::sync::{broadcast, Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::codec::Codec;
use crate::config::ConnectionConfig;
use crate::connection::{Connection, ConnectionHandler, OnClose};
use crate::listener::{AcceptFactory, Listener, ListenerHandler};
use crate::tcp_connection::TcpConnection;

/// Counts live tasks; [TaskGroup::wait] resolves once the count drops to zero.
struct TaskGroup {
    count: AtomicUsize,
    notify: Notify,
}

impl TaskGroup {
    fn new() -> TaskGroup {
        TaskGroup {
            count: AtomicUsize::new(0),
            notify: Notify::new(),
        }
    }

    fn register(self: &Arc<Self>) -> TaskGuard {
        self.count.fetch_add(1, Ordering::AcqRel);
        TaskGuard {
            group: self.clone(),
        }
    }

    async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            if self.count.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// membership token held by a task for its lifetime
struct TaskGuard {
    group: Arc<TaskGroup>,
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        if self.group.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.group.notify.notify_waiters();
        }
    }
}

/// Handed from the manager to listeners and connections: carries the root shutdown
///  signal and registers every spawned task with the manager's task group.
#[derive(Clone)]
pub struct NetContext {
    shutdown_tx: broadcast::Sender<()>,
    tasks: Arc<TaskGroup>,
}

impl NetContext {
    pub fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// spawn a task that counts towards [NetManager::shutdown]'s wait
    pub fn spawn<F, T>(&self, fut: F) -> JoinHandle<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let guard = self.tasks.register();
        tokio::spawn(async move {
            let _guard = guard;
            fut.await
        })
    }
}

/// Builds a connector-role connection for [NetManager::new_connector_custom];
///  counterpart of [AcceptFactory] on the dial path.
pub type ConnectorFactory = Box<
    dyn FnOnce(
            Arc<ConnectionConfig>,
            Arc<dyn Codec>,
            Arc<dyn ConnectionHandler>,
        ) -> Arc<dyn Connection>
        + Send,
>;

pub struct NetManager {
    ctx: NetContext,
    listeners: RwLock<Vec<Arc<Listener>>>,
    /// dialed connections, removed again by their close hooks
    connections: Arc<RwLock<FxHashMap<u32, Arc<dyn Connection>>>>,
}

impl NetManager {
    pub fn new() -> NetManager {
        let (shutdown_tx, _) = broadcast::channel(1);
        NetManager {
            ctx: NetContext {
                shutdown_tx,
                tasks: Arc::new(TaskGroup::new()),
            },
            listeners: RwLock::new(Vec::new()),
            connections: Arc::new(RwLock::new(FxHashMap::default())),
        }
    }

    pub fn context(&self) -> &NetContext {
        &self.ctx
    }

    /// listen with the default (ring-buffered) connection variant
    pub async fn new_listener(
        &self,
        listen_addr: &str,
        config: ConnectionConfig,
        codec: Arc<dyn Codec>,
        handler: Arc<dyn ConnectionHandler>,
        listener_handler: Option<Arc<dyn ListenerHandler>>,
    ) -> anyhow::Result<Arc<Listener>> {
        let factory: AcceptFactory = Box::new(|stream, config, codec, handler| {
            let connection: Arc<dyn Connection> =
                TcpConnection::new_accept(stream, config, codec, handler);
            connection
        });
        self.new_listener_custom(listen_addr, config, codec, handler, listener_handler, factory)
            .await
    }

    /// listen with a custom connection factory (e.g. the per-frame-allocating variant)
    pub async fn new_listener_custom(
        &self,
        listen_addr: &str,
        config: ConnectionConfig,
        codec: Arc<dyn Codec>,
        handler: Arc<dyn ConnectionHandler>,
        listener_handler: Option<Arc<dyn ListenerHandler>>,
        factory: AcceptFactory,
    ) -> anyhow::Result<Arc<Listener>> {
        config.validate()?;

        let listener = Arc::new(Listener::new(
            self.ctx.clone(),
            Arc::new(config),
            codec,
            handler,
            listener_handler,
            factory,
        ));
        Listener::start(&listener, listen_addr).await?;

        self.listeners.write().await.push(listener.clone());
        Ok(listener)
    }

    /// dial with the default (ring-buffered) connection variant
    pub async fn new_connector(
        &self,
        addr: &str,
        config: ConnectionConfig,
        codec: Arc<dyn Codec>,
        handler: Arc<dyn ConnectionHandler>,
    ) -> Option<Arc<dyn Connection>> {
        self.new_connector_custom(
            addr,
            config,
            codec,
            handler,
            Box::new(|config, codec, handler| {
                let connection: Arc<dyn Connection> = TcpConnection::new(config, codec, handler);
                connection
            }),
        )
        .await
    }

    /// dial with a custom connection factory
    pub async fn new_connector_custom(
        &self,
        addr: &str,
        config: ConnectionConfig,
        codec: Arc<dyn Codec>,
        handler: Arc<dyn ConnectionHandler>,
        factory: ConnectorFactory,
    ) -> Option<Arc<dyn Connection>> {
        if let Err(e) = config.validate() {
            debug!("connector config rejected: {:#}", e);
            return None;
        }

        let connection = factory(Arc::new(config), codec, handler);
        if !connection.clone().connect(addr).await {
            return None;
        }

        let map = self.connections.clone();
        let on_close: OnClose = Box::new(move |conn| {
            Box::pin(async move {
                map.write().await.remove(&conn.connection_id());
            })
        });

        self.connections
            .write()
            .await
            .insert(connection.connection_id(), connection.clone());
        connection.clone().start(&self.ctx, Some(on_close));

        Some(connection)
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn listener_count(&self) -> usize {
        self.listeners.read().await.len()
    }

    /// Cancel the root context. Every writer task observes the signal directly and
    ///  initiates its connection's close; listeners close via their watchers. With
    ///  `wait`, block until all spawned tasks have finished.
    pub async fn shutdown(&self, wait: bool) {
        info!("net manager shutting down");
        let _ = self.ctx.shutdown_tx.send(());
        if wait {
            self.ctx.tasks.wait().await;
            info!("net manager shutdown complete");
        }
    }
}

impl Default for NetManager {
    fn default() -> NetManager {
        NetManager::new()
    }
}
