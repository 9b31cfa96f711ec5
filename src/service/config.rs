use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::network::ByteOrder;

use super::{AppError, AppResult};

/// Prefix of the environment variables that override file settings,
/// e.g. `STONENET_NETWORK__TCP_PORT=7000`.
pub const ENV_PREFIX: &str = "STONENET";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    #[default]
    Tcp,
    Websocket,
    Udp,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogRotation {
    Minutely,
    Hourly,
    #[default]
    Daily,
    Never,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct GeneralConfig {
    pub name: String,
    pub version: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        GeneralConfig {
            name: "stonenet".to_string(),
            version: "V1.0".to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct NetworkConfig {
    pub host: String,
    pub tcp_port: u16,
    /// reserved for the websocket transport
    pub ws_port: u16,
    pub mode: TransportMode,
    /// max payload size of a single frame, 0 means unlimited
    pub max_packet_size: u32,
    /// max live connections, 0 means unlimited
    pub max_connection: usize,
    /// capacity of each connection's outbound queue
    pub max_msg_chan_len: usize,
    /// how long `write_msg` waits for room in a full outbound queue
    pub write_timeout_ms: u64,
    pub byte_order: ByteOrder,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            host: "0.0.0.0".to_string(),
            tcp_port: 7777,
            ws_port: 9000,
            mode: TransportMode::Tcp,
            max_packet_size: 4096,
            max_connection: 12000,
            max_msg_chan_len: 1024,
            write_timeout_ms: 5,
            byte_order: ByteOrder::BigEndian,
        }
    }
}

impl NetworkConfig {
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct WorkerPoolConfig {
    /// number of workers, 0 disables the pool and every request runs on its own task
    pub pool_size: usize,
    /// capacity of each worker's task queue
    pub max_task_len: usize,
    pub monitor_interval_ms: u64,
    pub worker_check_timeout_ms: u64,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        WorkerPoolConfig {
            pool_size: 10,
            max_task_len: 1024,
            monitor_interval_ms: 5000,
            worker_check_timeout_ms: 200,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct LogConfig {
    pub dir: String,
    pub file_name: String,
    pub rotation: LogRotation,
    /// used when `RUST_LOG` is not set
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            dir: "logs".to_string(),
            file_name: "stonenet.log".to_string(),
            rotation: LogRotation::Daily,
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub general: GeneralConfig,
    pub network: NetworkConfig,
    pub worker_pool: WorkerPoolConfig,
    pub log: LogConfig,
}

impl ServerConfig {
    /// Loads the config file at `path`, then applies `STONENET_` environment overrides.
    /// Settings missing from both fall back to their defaults.
    pub fn set_up_config<P: AsRef<Path>>(path: P) -> AppResult<ServerConfig> {
        let path_str = path
            .as_ref()
            .to_str()
            .ok_or(AppError::InvalidValue(format!(
                "config file path: {}",
                path.as_ref().to_string_lossy()
            )))?;
        let config = config::Config::builder()
            .add_source(config::File::with_name(path_str))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let server_config: ServerConfig = config.try_deserialize()?;
        server_config.validate()?;

        Ok(server_config)
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.network.max_msg_chan_len == 0 {
            return Err(AppError::InvalidValue(
                "network.max_msg_chan_len must be greater than 0".to_string(),
            ));
        }
        if self.worker_pool.pool_size > 0 && self.worker_pool.max_task_len == 0 {
            return Err(AppError::InvalidValue(
                "worker_pool.max_task_len must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}
