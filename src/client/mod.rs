//! Client sessions.
//!
//! [`Client`] owns a connection to the bus server. [`ThinClient`] is a
//! cloneable handle on the same session, meant to be moved into handlers and
//! tasks. Both can issue calls and manage registrations; only the owning
//! [`Client`] closes the session, explicitly or when dropped.
//!
//! # Example
//!
//! ```ignore
//! use callbus::{Client, ServerContext};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> callbus::error::Result<()> {
//!     let client = Client::connect("/tmp/callbus.sock").await?;
//!
//!     client
//!         .register("test.test", 100, |args: serde_json::Value, ctx: ServerContext| async move {
//!             ctx.ok(&json!({ "echo": args })).await
//!         })
//!         .await?;
//!
//!     let mut call = client.call("test.test", &json!({ "blub": "foo" })).await?;
//!     println!("{:?}", call.wait().await);
//!
//!     client.disconnect();
//!     Ok(())
//! }
//! ```

mod call;
pub(crate) mod session;

use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::codec::to_payload;
use crate::error::Result;
use crate::handler::{Handler, HandlerResult, ServerContext, TypedHandler};
use crate::transport;
use session::{Session, SessionConfig};

pub use call::ClientContext;
pub use session::{Registration, DEFAULT_BROADCAST_CAPACITY, DEFAULT_MAX_CONCURRENT_HANDLERS};

/// Builder for configuring a session before connecting.
pub struct ClientBuilder {
    config: SessionConfig,
}

impl ClientBuilder {
    /// Create a new client builder.
    pub fn new() -> Self {
        Self {
            config: SessionConfig::default(),
        }
    }

    /// Set the maximum number of handlers running at once.
    ///
    /// Calls arriving beyond the limit finish with an `Internal` error.
    /// Default: 256
    pub fn max_concurrent_handlers(mut self, limit: usize) -> Self {
        self.config.max_concurrent_handlers = limit;
        self
    }

    /// Set the maximum pending frames for backpressure.
    ///
    /// Default: 1024
    pub fn max_pending_frames(mut self, limit: usize) -> Self {
        self.config.writer.max_pending_frames = limit;
        self
    }

    /// Set the backpressure timeout.
    ///
    /// Default: 5 seconds
    pub fn backpressure_timeout(mut self, timeout: Duration) -> Self {
        self.config.writer.backpressure_timeout = timeout;
        self
    }

    /// Set how many updates a served call may have unacknowledged.
    ///
    /// Default: 1
    pub fn update_window(mut self, size: usize) -> Self {
        self.config.update_window = size.max(1);
        self
    }

    /// Set how long a handler waits for its caller to drain an update
    /// before the call is considered done.
    ///
    /// Default: 30 seconds
    pub fn update_timeout(mut self, timeout: Duration) -> Self {
        self.config.update_timeout = timeout;
        self
    }

    /// Set the largest accepted frame payload.
    ///
    /// Default: 64 MB
    pub fn max_payload_size(mut self, size: u32) -> Self {
        self.config.max_payload_size = size;
        self
    }

    /// Set how many broadcast messages are kept until read. Messages
    /// arriving while the queue is full are dropped.
    ///
    /// Default: 1024
    pub fn broadcast_capacity(mut self, capacity: usize) -> Self {
        self.config.broadcast_capacity = capacity.max(1);
        self
    }

    /// Connect to the bus server listening at `path`.
    pub async fn connect(self, path: impl AsRef<Path>) -> Result<Client> {
        let stream = transport::connect(path.as_ref()).await?;
        tracing::debug!("Connected to bus at {}", path.as_ref().display());
        Ok(Client {
            session: Session::for_stream(stream, self.config),
        })
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Owning handle on a session with the bus server.
pub struct Client {
    session: Arc<Session>,
}

impl Client {
    /// Create a new client builder.
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// Connect with default settings.
    ///
    /// Fails with an I/O error if no bus server listens at `path`.
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self> {
        ClientBuilder::new().connect(path).await
    }

    /// Cloneable handle on this session.
    pub fn thin(&self) -> ThinClient {
        ThinClient::new(self.session.clone())
    }

    /// Call `name` with serialized `args`.
    pub async fn call<T: Serialize>(&self, name: &str, args: &T) -> Result<ClientContext> {
        self.session.call(name, to_payload(args)?).await
    }

    /// Register a typed handler for `name`.
    ///
    /// Higher priorities are tried first.
    pub async fn register<F, T, Fut>(&self, name: &str, priority: i64, handler: F) -> Result<Registration>
    where
        F: Fn(T, ServerContext) -> Fut + Send + Sync + 'static,
        T: DeserializeOwned + Send + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.session
            .register(name, priority, TypedHandler::arc(handler))
            .await
    }

    /// Register an already erased handler.
    pub async fn register_handler(
        &self,
        name: &str,
        priority: i64,
        handler: Arc<dyn Handler>,
    ) -> Result<Registration> {
        self.session.register(name, priority, handler).await
    }

    /// Remove a handler. Calls it is already serving are unaffected.
    pub async fn unregister(&self, registration: &Registration) -> Result<()> {
        self.session.unregister(registration).await
    }

    /// Send `message` to every connected session, this one included.
    ///
    /// Returns once the bus server has sent it; a broadcast that returned is
    /// already queued on this session.
    pub async fn broadcast<T: Serialize>(&self, message: &T) -> Result<()> {
        self.session.broadcast(to_payload(message)?).await
    }

    /// Next broadcast message, in the order the bus server sent them.
    ///
    /// `None` once the session closed and every queued message was read.
    pub async fn recv_broadcast(&self) -> Option<Value> {
        self.session.recv_broadcast().await
    }

    /// Next broadcast message if one is queued; never waits.
    pub fn try_recv_broadcast(&self) -> Option<Value> {
        self.session.try_recv_broadcast()
    }

    /// False once the session closed.
    pub fn is_connected(&self) -> bool {
        !self.session.is_closed()
    }

    /// Close the session.
    ///
    /// Outgoing calls finish with an `Io` error, served calls are cancelled,
    /// and the bus server drops this session's registrations. Idempotent.
    pub fn disconnect(&self) {
        self.session.teardown("client disconnected");
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.session.teardown("client dropped");
    }
}

/// Cloneable handle on a session.
///
/// Does not keep the session open: once the owning [`Client`] is gone, every
/// operation fails with [`CallbusError::Disconnected`](crate::CallbusError::Disconnected).
#[derive(Clone)]
pub struct ThinClient {
    session: Arc<Session>,
}

impl ThinClient {
    pub(crate) fn new(session: Arc<Session>) -> Self {
        Self { session }
    }

    /// Call `name` with serialized `args`.
    pub async fn call<T: Serialize>(&self, name: &str, args: &T) -> Result<ClientContext> {
        self.session.call(name, to_payload(args)?).await
    }

    /// Register a typed handler for `name`.
    pub async fn register<F, T, Fut>(&self, name: &str, priority: i64, handler: F) -> Result<Registration>
    where
        F: Fn(T, ServerContext) -> Fut + Send + Sync + 'static,
        T: DeserializeOwned + Send + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.session
            .register(name, priority, TypedHandler::arc(handler))
            .await
    }

    /// Remove a handler.
    pub async fn unregister(&self, registration: &Registration) -> Result<()> {
        self.session.unregister(registration).await
    }

    /// Send `message` to every connected session.
    pub async fn broadcast<T: Serialize>(&self, message: &T) -> Result<()> {
        self.session.broadcast(to_payload(message)?).await
    }

    pub fn is_connected(&self) -> bool {
        !self.session.is_closed()
    }
}
