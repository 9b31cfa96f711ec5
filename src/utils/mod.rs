pub use multiple_channel_worker_pool::{MultipleChannelWorkerPool, PoolConfig, PoolHandler};
mod multiple_channel_worker_pool;
