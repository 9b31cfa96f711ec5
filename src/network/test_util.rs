use std::sync::Arc;

use tokio::sync::broadcast;

use crate::network::{
    ByteOrder, Connection, ConnectionContext, ConnectionRegistry, Dispatcher, MessageCodec,
    RouteTable, Router,
};
use crate::service::{NetworkConfig, WorkerPoolConfig};

fn network_config(byte_order: ByteOrder) -> NetworkConfig {
    NetworkConfig {
        max_packet_size: 1024,
        max_msg_chan_len: 4,
        write_timeout_ms: 5,
        byte_order,
        ..NetworkConfig::default()
    }
}

pub(crate) fn routes_with(msg_id: u32, router: impl Router) -> RouteTable {
    let mut routes = RouteTable::new();
    routes
        .add_router(msg_id, Arc::new(router))
        .expect("empty route table");
    routes
}

/// Context with its own registry and dispatcher. A non-zero `pool_size` spawns workers,
/// so it needs a runtime.
pub(crate) fn connection_context(
    routes: RouteTable,
    pool_size: usize,
    byte_order: ByteOrder,
) -> Arc<ConnectionContext> {
    let config = network_config(byte_order);
    let pool_config = WorkerPoolConfig {
        pool_size,
        max_task_len: 16,
        monitor_interval_ms: 100,
        worker_check_timeout_ms: 10,
    };
    let (notify_shutdown, _) = broadcast::channel(1);
    let dispatcher = Dispatcher::new(routes, &pool_config, notify_shutdown);
    Arc::new(ConnectionContext::new(
        MessageCodec::from_config(&config),
        Arc::new(dispatcher),
        Arc::new(ConnectionRegistry::new()),
        &config,
    ))
}

/// A never started connection without routes or workers, usable outside a runtime.
pub(crate) fn detached_connection(id: u64) -> Arc<Connection> {
    let context = connection_context(RouteTable::new(), 0, ByteOrder::BigEndian);
    Connection::new(id, context, None, None)
}
