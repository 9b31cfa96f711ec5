//! Network Module Implementation
//!
//! Everything between the socket and the business routers: framing, the per-connection
//! reader/writer loops, the live connection registry, the request pipeline and the worker
//! pool dispatch.
//!
//! # Data flow
//!
//! ```text
//! socket -> reader loop -> MessageCodec::decode -> Request -> Dispatcher
//!        -> worker (conn_id % pool_size) -> Router pre/handle/post
//!        -> Connection::write_msg -> outbound queue -> writer loop -> socket
//! ```
//!
//! # Components
//!
//! - `MessageCodec`: `[id: u32][length: u32][payload]` frames, big or little endian
//! - `Connection`: one client, its loops, its outbound queue and its cancellation token
//! - `ConnectionRegistry`: live connections of one server by id
//! - `Request`: a decoded message plus its pipeline state
//! - `RouteTable`/`Router`: message id to business handler
//! - `Dispatcher`: per-connection ordered hand off to the worker pool

pub use codec::{ByteOrder, MessageCodec, HEADER_LEN};
pub use connection::{Connection, ConnectionContext, ConnectionHook, ConnectionHooks};
pub use dispatcher::Dispatcher;
pub use message::{FrameHeader, Message};
pub use registry::ConnectionRegistry;
pub use request::{HandleStep, Request};
pub use router::{HandleFuture, RouteTable, Router};

mod codec;
mod connection;
mod dispatcher;
mod message;
mod registry;
mod request;
mod router;

#[cfg(test)]
mod test_util;
