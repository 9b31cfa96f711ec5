use std::fmt::{Debug, Formatter};
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

use crate::network::{ConnectionRegistry, Dispatcher, Message, MessageCodec, Request, HEADER_LEN};
use crate::service::NetworkConfig;
use crate::{AppError, AppResult};

pub type ConnectionHook = Arc<dyn Fn(&Connection) + Send + Sync>;

/// Optional callbacks run around every connection's lifecycle.
#[derive(Clone, Default)]
pub struct ConnectionHooks {
    /// runs once both loops are up
    pub on_start: Option<ConnectionHook>,
    /// runs in the finalizer, before the connection leaves the registry
    pub on_stop: Option<ConnectionHook>,
}

/// Everything a connection shares with the server that accepted it.
pub struct ConnectionContext {
    codec: MessageCodec,
    dispatcher: Arc<Dispatcher>,
    registry: Arc<ConnectionRegistry>,
    outbound_capacity: usize,
    write_timeout: Duration,
    hooks: ConnectionHooks,
}

impl ConnectionContext {
    pub fn new(
        codec: MessageCodec,
        dispatcher: Arc<Dispatcher>,
        registry: Arc<ConnectionRegistry>,
        network_config: &NetworkConfig,
    ) -> Self {
        ConnectionContext {
            codec,
            dispatcher,
            registry,
            outbound_capacity: network_config.max_msg_chan_len.max(1),
            write_timeout: network_config.write_timeout(),
            hooks: ConnectionHooks::default(),
        }
    }

    pub fn with_hooks(mut self, hooks: ConnectionHooks) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn codec(&self) -> &MessageCodec {
        &self.codec
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }
}

/// One client connection.
///
/// After `start`, a reader loop turns frames into requests for the dispatcher and a writer
/// loop drains the outbound queue into the socket. Both loops, `write_msg` callers and the
/// lifecycle task only share the cancellation token and the outbound queue. Whatever ends
/// first (peer close, bad frame, write error, `stop`) fires the token, and the lifecycle
/// task finalizes the connection exactly once.
pub struct Connection {
    id: u64,
    peer_addr: Option<SocketAddr>,
    local_addr: Option<SocketAddr>,
    context: Arc<ConnectionContext>,
    // None once the connection is closed, dropping the sender closes the queue
    outbound: RwLock<Option<mpsc::Sender<Bytes>>>,
    // taken by `start`
    outbound_rx: parking_lot::Mutex<Option<mpsc::Receiver<Bytes>>>,
    cancel: CancellationToken,
    finalized: AtomicBool,
}

impl Connection {
    pub fn new(
        id: u64,
        context: Arc<ConnectionContext>,
        peer_addr: Option<SocketAddr>,
        local_addr: Option<SocketAddr>,
    ) -> Arc<Self> {
        let (outbound_tx, outbound_rx) = mpsc::channel(context.outbound_capacity);
        Arc::new(Connection {
            id,
            peer_addr,
            local_addr,
            context,
            outbound: RwLock::new(Some(outbound_tx)),
            outbound_rx: parking_lot::Mutex::new(Some(outbound_rx)),
            cancel: CancellationToken::new(),
            finalized: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// True once `stop` was called or the connection has been finalized.
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled() || self.finalized.load(Ordering::Acquire)
    }

    /// Fires the cancellation token, idempotent.
    pub fn stop(&self) {
        if !self.cancel.is_cancelled() {
            debug!(connection_id = self.id, "stopping connection");
        }
        self.cancel.cancel();
    }

    /// Frames `data` as message `msg_id` and queues it for the writer.
    ///
    /// Waits at most the configured write timeout for room in the outbound queue and fails
    /// with `WriteTimeout` after that; the connection itself stays open.
    pub async fn write_msg(&self, msg_id: u32, data: impl Into<Bytes>) -> AppResult<()> {
        let outbound = self.outbound.read().await;
        let sender = match outbound.as_ref() {
            Some(sender) if !self.cancel.is_cancelled() => sender,
            _ => return Err(AppError::ConnectionClosed(self.id)),
        };
        let frame = self.context.codec.encode(&Message::new(msg_id, data))?;

        sender
            .send_timeout(frame, self.context.write_timeout)
            .await
            .map_err(|err| match err {
                SendTimeoutError::Timeout(_) => AppError::WriteTimeout(self.id),
                SendTimeoutError::Closed(_) => AppError::ConnectionClosed(self.id),
            })
    }

    /// Runs the connection until it is cancelled, then finalizes it.
    ///
    /// Returns once the socket halves are dropped and the connection has left the registry.
    pub async fn start<R, W>(self: Arc<Self>, reader: R, writer: W) -> AppResult<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let outbound_rx = self.outbound_rx.lock().take().ok_or_else(|| {
            AppError::IllegalStateError(format!("connection {} already started", self.id))
        })?;
        debug!(
            connection_id = self.id,
            peer = ?self.peer_addr,
            "connection started"
        );

        let reader_task = tokio::spawn(self.clone().read_loop(reader));
        let writer_task = tokio::spawn(self.clone().write_loop(writer, outbound_rx));

        if let Some(on_start) = &self.context.hooks.on_start {
            on_start(&*self);
        }

        self.cancel.cancelled().await;

        self.finalize(reader_task, writer_task).await;
        Ok(())
    }

    async fn finalize(
        &self,
        reader_task: tokio::task::JoinHandle<()>,
        writer_task: tokio::task::JoinHandle<()>,
    ) {
        if self.finalized.swap(true, Ordering::AcqRel) {
            return;
        }
        // mark closed and close the outbound queue, waits out any write_msg in flight
        self.outbound.write().await.take();

        // both loops watch the token, once they return the socket halves are dropped
        for (name, task) in [("reader", reader_task), ("writer", writer_task)] {
            if let Err(err) = task.await {
                error!(connection_id = self.id, "{} task failed: {}", name, err);
            }
        }

        if let Some(on_stop) = &self.context.hooks.on_stop {
            on_stop(self);
        }
        self.context.registry.remove(self);
        info!(
            connection_id = self.id,
            peer = ?self.peer_addr,
            "connection closed"
        );
    }

    async fn read_loop<R>(self: Arc<Self>, reader: R)
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let mut reader = BufReader::new(reader);
        let result = tokio::select! {
            _ = self.cancel.cancelled() => Ok(()),
            res = self.read_frames(&mut reader) => res,
        };
        match result {
            Ok(()) => trace!(connection_id = self.id, "reader exit on cancel"),
            Err(AppError::IoError(err)) if err.kind() == ErrorKind::UnexpectedEof => {
                debug!(connection_id = self.id, "peer closed the connection");
            }
            Err(err) => {
                error!(connection_id = self.id, "reader exit: {}", err);
            }
        }
        self.stop();
    }

    async fn read_frames<R>(self: &Arc<Self>, reader: &mut R) -> AppResult<()>
    where
        R: AsyncRead + Unpin,
    {
        let mut header = [0u8; HEADER_LEN];
        loop {
            reader.read_exact(&mut header).await?;
            let header = self.context.codec.decode(&header)?;

            let mut payload = BytesMut::zeroed(header.length as usize);
            if header.length > 0 {
                reader.read_exact(&mut payload).await?;
            }
            trace!(
                connection_id = self.id,
                msg_id = header.id,
                len = header.length,
                "frame received"
            );

            let request = Request::new(self.clone(), Message::new(header.id, payload.freeze()));
            self.context.dispatcher.submit(request).await?;
        }
    }

    async fn write_loop<W>(self: Arc<Self>, writer: W, mut outbound_rx: mpsc::Receiver<Bytes>)
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let mut writer = BufWriter::new(writer);
        let result = tokio::select! {
            _ = self.cancel.cancelled() => Ok(()),
            res = Self::write_frames(&mut writer, &mut outbound_rx) => res,
        };
        match result {
            Ok(()) => trace!(connection_id = self.id, "writer exit"),
            Err(err) => error!(connection_id = self.id, "writer exit: {}", err),
        }
        self.stop();
    }

    /// Returns once the queue is closed.
    async fn write_frames<W>(
        writer: &mut BufWriter<W>,
        outbound_rx: &mut mpsc::Receiver<Bytes>,
    ) -> AppResult<()>
    where
        W: AsyncWrite + Unpin,
    {
        while let Some(frame) = outbound_rx.recv().await {
            writer.write_all(&frame).await?;
            // batch whatever is already queued into one flush
            while let Ok(frame) = outbound_rx.try_recv() {
                writer.write_all(&frame).await?;
            }
            writer.flush().await?;
        }
        Ok(())
    }
}

impl Debug for Connection {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("local_addr", &self.local_addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}
