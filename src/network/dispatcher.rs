use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, trace};

use crate::network::{Request, RouteTable};
use crate::service::WorkerPoolConfig;
use crate::utils::{MultipleChannelWorkerPool, PoolConfig, PoolHandler};
use crate::{AppError, AppResult};

#[derive(Clone)]
struct RequestHandler {
    routes: Arc<RouteTable>,
}

impl PoolHandler<Request> for RequestHandler {
    fn handle(&self, worker_id: usize, request: Request) -> impl Future<Output = ()> + Send {
        let routes = self.routes.clone();
        async move {
            trace!(
                worker_id,
                connection_id = request.connection().id(),
                msg_id = request.msg_id(),
                "worker picked up request"
            );
            routes.dispatch(request).await;
        }
    }
}

/// Routes decoded requests to their routers.
///
/// With a worker pool, every connection is pinned to worker `connection id % pool size`,
/// so requests of one connection are handled one after another in arrival order. A slow
/// router delays every connection pinned to the same worker. Without a pool (size 0) each
/// request runs on its own task and ordering is lost.
#[derive(Debug)]
pub struct Dispatcher {
    routes: Arc<RouteTable>,
    pool: Option<MultipleChannelWorkerPool<Request>>,
}

impl Dispatcher {
    /// Freezes `routes` and starts the workers. A non-empty pool has to be built inside a
    /// tokio runtime.
    pub fn new(
        routes: RouteTable,
        config: &WorkerPoolConfig,
        notify_shutdown: broadcast::Sender<()>,
    ) -> Self {
        let routes = Arc::new(routes);
        let pool = (config.pool_size > 0).then(|| {
            let pool_config = PoolConfig {
                channel_capacity: config.max_task_len,
                num_channels: config.pool_size,
                monitor_interval: Duration::from_millis(config.monitor_interval_ms),
                worker_check_timeout: Duration::from_millis(config.worker_check_timeout_ms),
            };
            MultipleChannelWorkerPool::new(
                notify_shutdown,
                RequestHandler {
                    routes: routes.clone(),
                },
                pool_config,
            )
        });
        debug!(
            pool_size = config.pool_size,
            routes = routes.len(),
            "dispatcher started"
        );
        Dispatcher { routes, pool }
    }

    pub fn is_pool_enabled(&self) -> bool {
        self.pool.is_some()
    }

    pub fn pool_size(&self) -> usize {
        self.pool.as_ref().map_or(0, |pool| pool.channel_count())
    }

    /// Worker that owns connection `connection_id`, `None` without a pool.
    pub fn worker_index(&self, connection_id: u64) -> Option<usize> {
        self.pool
            .as_ref()
            .map(|pool| (connection_id % pool.channel_count() as u64) as usize)
    }

    /// Handles `request` on the calling task.
    pub async fn do_msg_handler(&self, request: Request) {
        self.routes.dispatch(request).await;
    }

    /// Queues `request` on its connection's worker, waiting while that queue is full.
    pub async fn send_msg_to_task_queue(&self, request: Request) -> AppResult<()> {
        let (Some(pool), Some(worker_id)) = (
            self.pool.as_ref(),
            self.worker_index(request.connection().id()),
        ) else {
            return Err(AppError::IllegalStateError(
                "worker pool is disabled".to_string(),
            ));
        };
        pool.send(request, worker_id)
            .await
            .map_err(|e| AppError::ChannelSendError(e.to_string()))
    }

    /// Hands `request` to the pool, or to a fresh task when the pool is disabled.
    pub async fn submit(&self, request: Request) -> AppResult<()> {
        if self.pool.is_some() {
            self.send_msg_to_task_queue(request).await
        } else {
            let routes = self.routes.clone();
            tokio::spawn(async move { routes.dispatch(request).await });
            Ok(())
        }
    }
}
