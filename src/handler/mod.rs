//! Handler module - serving calls routed to this session.
//!
//! Provides:
//! - [`Handler`] / [`TypedHandler`] - what a session registers
//! - [`ServerContext`] - lets a handler stream updates and finish its call
//!
//! # Example
//!
//! ```ignore
//! use callbus::{Client, ServerContext};
//!
//! let client = Client::connect(&socket).await?;
//!
//! // Plain request/response
//! client.register("echo", 100, |args: serde_json::Value, ctx: ServerContext| async move {
//!     ctx.ok(&args).await
//! }).await?;
//!
//! // Streaming
//! client.register("count", 100, |n: u64, ctx: ServerContext| async move {
//!     for i in 0..n {
//!         ctx.emit(&i).await?;
//!     }
//!     ctx.ok(&n).await
//! }).await?;
//! ```

mod context;
mod registry;

pub(crate) use context::{CallSignals, ServingCall};
pub(crate) use registry::HandlerTable;
pub use context::ServerContext;
pub use registry::{BoxFuture, Handler, HandlerResult, TypedHandler};
