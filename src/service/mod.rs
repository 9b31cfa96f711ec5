pub use app_error::{AppError, AppResult};
pub use config::{
    GeneralConfig, LogConfig, LogRotation, NetworkConfig, ServerConfig, TransportMode,
    WorkerPoolConfig, ENV_PREFIX,
};
pub use server::{AuthHook, Server};
pub use shutdown::Shutdown;
pub use tracing_config::{setup_local_tracing, setup_tracing, LogGuard};

mod app_error;
mod config;
mod server;
mod shutdown;
mod tracing_config;
