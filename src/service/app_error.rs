// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// general errors
    #[error("illegal state: {0}")]
    IllegalStateError(String),

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("channel send error: {0}")]
    ChannelSendError(String),

    #[error("config file error: {0}")]
    ConfigFileError(#[from] config::ConfigError),

    /// framing errors, fatal for the connection that produced them
    #[error("frame of length {length} exceeds max packet size {max}")]
    FrameTooLarge { length: u64, max: u32 },

    #[error("malformed protocol: {0}")]
    MalformedProtocol(String),

    /// connection errors, reported to the caller only
    #[error("write to connection {0} timed out, outbound queue is full")]
    WriteTimeout(u64),

    #[error("connection {0} is closed")]
    ConnectionClosed(u64),

    #[error("connection {0} not found")]
    NotFound(u64),

    #[error("connection rejected: {0}")]
    Unauthenticated(String),

    /// routing errors
    #[error("no router registered for msg id {0}")]
    RouterNotFound(u32),

    #[error("router for msg id {0} registered twice")]
    DuplicateRouterRegistration(u32),

    #[error("unsupported transport mode: {0}")]
    UnsupportedTransport(String),
}
