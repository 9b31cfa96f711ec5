pub mod network;
pub mod service;
pub mod utils;

pub use network::{
    ByteOrder, Connection, ConnectionRegistry, HandleFuture, HandleStep, Message, MessageCodec,
    Request, Router,
};
pub use service::{
    setup_local_tracing, setup_tracing, AppError, AppResult, AuthHook, LogGuard, Server,
    ServerConfig, Shutdown,
};
