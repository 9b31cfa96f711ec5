use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::network::Request;
use crate::{AppError, AppResult};

pub type HandleFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

/// Business handler for one message id.
///
/// A request runs `pre_handle`, `handle` and `post_handle` in that order; any stage can
/// reply through `request.connection().write_msg(..)` and steer the remaining stages with
/// `request.abort()` or `request.goto(..)`.
pub trait Router: Send + Sync + 'static {
    fn pre_handle<'a>(&'a self, _request: &'a Request) -> HandleFuture<'a> {
        Box::pin(async {})
    }

    fn handle<'a>(&'a self, request: &'a Request) -> HandleFuture<'a>;

    fn post_handle<'a>(&'a self, _request: &'a Request) -> HandleFuture<'a> {
        Box::pin(async {})
    }
}

/// Message id to router table. Filled before the server starts, read-only afterwards.
#[derive(Default)]
pub struct RouteTable {
    routers: HashMap<u32, Arc<dyn Router>>,
}

impl RouteTable {
    pub fn new() -> Self {
        RouteTable::default()
    }

    /// A second router for the same id is a configuration error.
    pub fn add_router(&mut self, msg_id: u32, router: Arc<dyn Router>) -> AppResult<()> {
        if self.routers.contains_key(&msg_id) {
            return Err(AppError::DuplicateRouterRegistration(msg_id));
        }
        self.routers.insert(msg_id, router);
        debug!(msg_id, "router added");
        Ok(())
    }

    pub fn route(&self, msg_id: u32) -> AppResult<&Arc<dyn Router>> {
        self.routers
            .get(&msg_id)
            .ok_or(AppError::RouterNotFound(msg_id))
    }

    pub fn len(&self) -> usize {
        self.routers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routers.is_empty()
    }

    /// Binds the router for the request's message id and runs its pipeline.
    ///
    /// Requests without a router are dropped; the connection they came from stays open.
    pub async fn dispatch(&self, mut request: Request) {
        let router = match self.route(request.msg_id()) {
            Ok(router) => router.clone(),
            Err(err) => {
                warn!(
                    connection_id = request.connection().id(),
                    "{}, request dropped", err
                );
                return;
            }
        };
        trace!(
            connection_id = request.connection().id(),
            msg_id = request.msg_id(),
            "dispatch request"
        );
        request.bind_router(router);
        request.call().await;
    }
}

impl std::fmt::Debug for RouteTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut ids: Vec<_> = self.routers.keys().collect();
        ids.sort();
        f.debug_struct("RouteTable").field("msg_ids", &ids).finish()
    }
}
