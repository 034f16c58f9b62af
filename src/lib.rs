//! # callbus
//!
//! Local-socket RPC bus with prioritized handlers, streaming updates and
//! cooperative cancellation.
//!
//! A bus server ([`Server`], or the `callbus-server` binary) accepts sessions
//! on a Unix socket. Each session ([`Client`]) can register named handlers
//! with a priority and call any registered name. The server offers a call to
//! the handlers for its name in descending priority until one of them
//! finishes it; a handler may stream any number of updates before the
//! result, and the caller may cancel at any time.
//!
//! ## Architecture
//!
//! - **Control line** (stdout): the server prints its socket path, nothing else
//! - **Data plane** (Unix socket): 13-byte framed MsgPack messages, many calls
//!   multiplexed per connection by call id
//!
//! ## Example
//!
//! ```ignore
//! use callbus::{Client, ServerContext};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> callbus::error::Result<()> {
//!     let client = Client::connect(std::env::var("CALLBUS_SOCKET").unwrap()).await?;
//!
//!     client
//!         .register("count", 100, |n: u64, ctx: ServerContext| async move {
//!             for i in 0..n {
//!                 ctx.emit(&json!({ "count": i })).await?;
//!             }
//!             ctx.ok(&json!({ "total": n })).await
//!         })
//!         .await?;
//!
//!     let mut call = client.call("count", &3).await?;
//!     while let Some(update) = call.recv().await {
//!         println!("{}", update);
//!     }
//!     println!("{:?}", call.wait().await);
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod control;
pub mod error;
pub mod handler;
pub mod protocol;
pub mod result;
pub mod server;
pub mod transport;

mod backpressure;
mod client;
mod writer;

pub use backpressure::{DEFAULT_UPDATE_TIMEOUT, DEFAULT_UPDATE_WINDOW};
pub use client::{
    Client, ClientBuilder, ClientContext, Registration, ThinClient, DEFAULT_BROADCAST_CAPACITY,
    DEFAULT_MAX_CONCURRENT_HANDLERS,
};
pub use error::CallbusError;
pub use handler::ServerContext;
pub use result::{RpcError, RpcErrorKind, RpcResult};
pub use server::{Server, ServerConfig};
pub use writer::{WriterConfig, DEFAULT_BACKPRESSURE_TIMEOUT, DEFAULT_MAX_PENDING_FRAMES};
