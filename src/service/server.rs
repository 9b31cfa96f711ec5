use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{self, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::network::{
    Connection, ConnectionContext, ConnectionHooks, ConnectionRegistry, Dispatcher,
    MessageCodec, RouteTable, Router,
};
use crate::{AppError, AppResult, Shutdown};

use super::config::{ServerConfig, TransportMode};

/// Decides whether a freshly accepted socket may become a connection. An `Err` drops the
/// socket before it gets an id.
pub type AuthHook = Arc<dyn Fn(&TcpStream, SocketAddr) -> AppResult<()> + Send + Sync>;

/// A TCP server: one accept loop feeding connections into a shared dispatcher.
///
/// Routers and hooks are set up first, `start` freezes them. Lifecycle:
///
/// 1. `start` builds the dispatcher (and its workers), binds the listener and spawns the
///    accept loop.
/// 2. Every accepted socket takes a connection permit, gets the next id, is registered and
///    runs until its connection is stopped; the permit is released afterwards.
/// 3. `stop` broadcasts shutdown, which ends the accept loop and the workers, then stops
///    every registered connection.
pub struct Server {
    config: ServerConfig,
    registry: Arc<ConnectionRegistry>,
    // None once started
    routes: Option<RouteTable>,
    hooks: ConnectionHooks,
    auth_hook: Option<AuthHook>,
    notify_shutdown: broadcast::Sender<()>,
    running: Option<Running>,
}

struct Running {
    local_addr: SocketAddr,
    acceptor: JoinHandle<()>,
    // cancelled once the accept loop has exited, for whatever reason
    accept_closed: CancellationToken,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        let (notify_shutdown, _) = broadcast::channel(1);
        Server {
            config,
            registry: Arc::new(ConnectionRegistry::new()),
            routes: Some(RouteTable::new()),
            hooks: ConnectionHooks::default(),
            auth_hook: None,
            notify_shutdown,
            running: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.general.name
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Address the listener is bound to, `None` before `start`.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|running| running.local_addr)
    }

    /// False before `start`, after `stop`, and once the accept loop gave up on a failing
    /// listener. Live connections are not affected by the latter.
    pub fn is_accepting(&self) -> bool {
        self.running
            .as_ref()
            .is_some_and(|running| !running.accept_closed.is_cancelled())
    }

    pub fn add_router<R: Router>(&mut self, msg_id: u32, router: R) -> AppResult<()> {
        let routes = self.routes.as_mut().ok_or_else(|| {
            AppError::IllegalStateError(format!(
                "router for msg id {} added after server start",
                msg_id
            ))
        })?;
        routes.add_router(msg_id, Arc::new(router))
    }

    /// Runs for every connection once its loops are up. Only servers not yet started pick
    /// it up.
    pub fn set_on_conn_start<F>(&mut self, hook: F)
    where
        F: Fn(&Connection) + Send + Sync + 'static,
    {
        self.hooks.on_start = Some(Arc::new(hook));
    }

    /// Runs for every connection while it is finalized, before it leaves the registry.
    pub fn set_on_conn_stop<F>(&mut self, hook: F)
    where
        F: Fn(&Connection) + Send + Sync + 'static,
    {
        self.hooks.on_stop = Some(Arc::new(hook));
    }

    pub fn set_auth_hook<F>(&mut self, hook: F)
    where
        F: Fn(&TcpStream, SocketAddr) -> AppResult<()> + Send + Sync + 'static,
    {
        self.auth_hook = Some(Arc::new(hook));
    }

    /// Starts the dispatcher and the accept loop, returns the bound address.
    #[tracing::instrument(skip(self), fields(server = %self.config.general.name))]
    pub async fn start(&mut self) -> AppResult<SocketAddr> {
        let network = &self.config.network;
        if network.mode != TransportMode::Tcp {
            return Err(AppError::UnsupportedTransport(format!("{:?}", network.mode)));
        }
        if self.running.is_some() || self.routes.is_none() {
            return Err(AppError::IllegalStateError(format!(
                "server {} already started",
                self.config.general.name
            )));
        }

        let listen_address = format!("{}:{}", network.host, network.tcp_port);
        let listener = match TcpListener::bind(&listen_address).await {
            Ok(listener) => listener,
            Err(err) => {
                let error_msg = format!(
                    "Failed to bind server to address: {} - Error: {}",
                    listen_address, err
                );
                error!(error_msg);
                return Err(AppError::IllegalStateError(error_msg));
            }
        };
        let local_addr = listener.local_addr()?;

        let routes = self.routes.take().unwrap_or_default();
        let dispatcher = Dispatcher::new(
            routes,
            &self.config.worker_pool,
            self.notify_shutdown.clone(),
        );
        let context = ConnectionContext::new(
            MessageCodec::from_config(network),
            Arc::new(dispatcher),
            self.registry.clone(),
            network,
        )
        .with_hooks(self.hooks.clone());

        let max_connection = match network.max_connection {
            0 => Semaphore::MAX_PERMITS,
            max => max,
        };
        let acceptor = Acceptor {
            listener,
            limit_connections: Arc::new(Semaphore::new(max_connection)),
            context: Arc::new(context),
            auth_hook: self.auth_hook.clone(),
            next_connection_id: AtomicU64::new(1),
            accept_closed: CancellationToken::new(),
        };
        let accept_closed = acceptor.accept_closed.clone();
        let shutdown = Shutdown::subscribe(&self.notify_shutdown);
        let acceptor = tokio::spawn(acceptor.run(shutdown));

        info!(
            "tcp server {} {} listening on {}",
            self.config.general.name, self.config.general.version, local_addr
        );
        self.running = Some(Running {
            local_addr,
            acceptor,
            accept_closed,
        });
        Ok(local_addr)
    }

    /// Stops accepting, shuts the workers down and stops every live connection.
    /// Does nothing on a server that is not running.
    pub async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        info!("stopping server {}", self.config.general.name);
        if running.accept_closed.is_cancelled() {
            warn!(
                "server {} had already stopped accepting connections",
                self.config.general.name
            );
        }
        // no receivers left only means everybody is gone already
        let _ = self.notify_shutdown.send(());
        if let Err(err) = running.acceptor.await {
            error!("accept loop failed: {}", err);
        }
        self.registry.clear_all();
        info!("server {} stopped", self.config.general.name);
    }

    /// Starts the server, runs until ctrl-c or until the accept loop dies, then stops it.
    pub async fn serve(&mut self) -> AppResult<()> {
        self.start().await?;
        let accept_closed = match &self.running {
            Some(running) => running.accept_closed.clone(),
            None => CancellationToken::new(),
        };
        let result = tokio::select! {
            res = tokio::signal::ctrl_c() => {
                info!("get shutdown signal");
                res.map_err(AppError::from)
            }
            _ = accept_closed.cancelled() => Err(AppError::IllegalStateError(format!(
                "server {} stopped accepting connections",
                self.config.general.name
            ))),
        };
        self.stop().await;
        result
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("name", &self.config.general.name)
            .field("local_addr", &self.local_addr())
            .field("connections", &self.registry.len())
            .finish()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if self.running.is_some() {
            let _ = self.notify_shutdown.send(());
            self.registry.clear_all();
        }
        debug!("tcp server dropped");
    }
}

struct Acceptor {
    listener: TcpListener,
    limit_connections: Arc<Semaphore>,
    context: Arc<ConnectionContext>,
    auth_hook: Option<AuthHook>,
    next_connection_id: AtomicU64,
    accept_closed: CancellationToken,
}

impl Acceptor {
    async fn run(self, mut shutdown: Shutdown) {
        let _closed = self.accept_closed.clone().drop_guard();
        loop {
            // wait for a free slot first, a full server leaves new peers in the backlog
            let permit = tokio::select! {
                _ = shutdown.recv() => break,
                permit = self.limit_connections.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let (socket, peer_addr) = tokio::select! {
                _ = shutdown.recv() => break,
                res = self.accept() => match res {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        error!(
                            cause = %err,
                            "failed to accept, listener on {:?} no longer accepts connections",
                            self.listener.local_addr().ok()
                        );
                        break;
                    }
                },
            };

            if let Some(auth_hook) = &self.auth_hook {
                if let Err(err) = auth_hook(&socket, peer_addr) {
                    warn!(peer = %peer_addr, "{}", err);
                    continue;
                }
            }

            let connection_id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
            let connection = Connection::new(
                connection_id,
                self.context.clone(),
                Some(peer_addr),
                socket.local_addr().ok(),
            );
            self.context.registry().add(connection.clone());
            debug!(connection_id, peer = %peer_addr, "accept new connection");

            let (reader, writer) = socket.into_split();
            tokio::spawn(async move {
                if let Err(err) = connection.start(reader, writer).await {
                    error!(connection_id, "Connection error: {}", err);
                }
                // whether gracefully or unexpectedly closed, release the slot
                drop(permit);
            });
        }
        debug!("accept loop exit");
    }

    async fn accept(&self) -> AppResult<(TcpStream, SocketAddr)> {
        let mut backoff = 1;

        loop {
            match self.listener.accept().await {
                Ok(accepted) => return Ok(accepted),
                Err(err) => {
                    if backoff > 64 {
                        return Err(err.into());
                    }
                    warn!("accept error: {}, retry in {}s", err, backoff);
                }
            }

            time::sleep(Duration::from_secs(backoff)).await;
            backoff *= 2;
        }
    }
}
