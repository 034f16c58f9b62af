//! Local handler table of a session.
//!
//! A session keeps the handlers it registered with the bus server here,
//! keyed by a handler id it allocates itself. The bus server forwards calls
//! with that id, so two handlers for the same name on one session never get
//! confused.
//!
//! # Example
//!
//! ```ignore
//! use callbus::handler::TypedHandler;
//!
//! let handler = TypedHandler::arc(|args: serde_json::Value, ctx| async move {
//!     ctx.ok(&args).await
//! });
//! client.register_handler("echo", 100, handler).await?;
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde_json::Value;

use super::ServerContext;
use crate::codec::from_payload;
use crate::error::Result;
use crate::result::RpcErrorKind;

/// Result type for handler functions.
///
/// An `Err` that escapes a handler which has not finished its call finishes
/// it with an `Internal` error.
pub type HandlerResult = Result<()>;

/// Boxed future for handler results.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Trait for handler functions.
pub trait Handler: Send + Sync + 'static {
    /// Handle a call with its raw payload.
    ///
    /// The handler owns `ctx` and is expected to finish the call through it,
    /// or decline with [`ServerContext::not_handled`].
    fn call(&self, args: Value, ctx: ServerContext) -> BoxFuture<'static, HandlerResult>;
}

/// Wrapper that deserializes the arguments before calling the handler.
///
/// Arguments that do not deserialize into `T` finish the call with
/// [`RpcErrorKind::InvalidArgs`] without invoking the handler.
pub struct TypedHandler<F, T, Fut>
where
    F: Fn(T, ServerContext) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    handler: F,
    _phantom: PhantomData<fn(T) -> Fut>,
}

impl<F, T, Fut> TypedHandler<F, T, Fut>
where
    F: Fn(T, ServerContext) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    pub fn new(handler: F) -> Self {
        Self {
            handler,
            _phantom: PhantomData,
        }
    }

    /// Wrap and erase into a shareable trait object.
    pub fn arc(handler: F) -> Arc<dyn Handler> {
        Arc::new(Self::new(handler))
    }
}

impl<F, T, Fut> Handler for TypedHandler<F, T, Fut>
where
    F: Fn(T, ServerContext) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    fn call(&self, args: Value, ctx: ServerContext) -> BoxFuture<'static, HandlerResult> {
        let parsed: T = match from_payload(args) {
            Ok(v) => v,
            Err(e) => {
                return Box::pin(async move {
                    ctx.error(RpcErrorKind::InvalidArgs, Value::String(e.to_string()))
                        .await
                })
            }
        };

        Box::pin((self.handler)(parsed, ctx))
    }
}

/// Entry for a registered handler.
struct HandlerEntry {
    name: String,
    handler: Arc<dyn Handler>,
}

/// Handlers of one session, by handler id.
pub(crate) struct HandlerTable {
    /// Next handler ID to assign.
    next_id: AtomicU64,
    handlers: RwLock<HashMap<u64, HandlerEntry>>,
}

impl HandlerTable {
    pub(crate) fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// Store a handler and return its freshly assigned id.
    pub(crate) fn insert(&self, name: &str, handler: Arc<dyn Handler>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.handlers.write().insert(
            id,
            HandlerEntry {
                name: name.to_string(),
                handler,
            },
        );
        id
    }

    /// Handler `id`, if it was registered for `name`.
    pub(crate) fn get(&self, id: u64, name: &str) -> Option<Arc<dyn Handler>> {
        self.handlers
            .read()
            .get(&id)
            .filter(|e| e.name == name)
            .map(|e| e.handler.clone())
    }

    /// Remove a handler; returns whether it was present.
    pub(crate) fn remove(&self, id: u64) -> bool {
        self.handlers.write().remove(&id).is_some()
    }

    /// Drop every handler (session teardown).
    pub(crate) fn clear(&self) {
        self.handlers.write().clear();
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.handlers.read().len()
    }
}

impl Default for HandlerTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> Arc<dyn Handler> {
        TypedHandler::arc(|_: Value, ctx: ServerContext| async move { ctx.not_handled().await })
    }

    #[test]
    fn test_insert_assigns_sequential_ids() {
        let table = HandlerTable::new();

        let first = table.insert("test.test", noop());
        let second = table.insert("test.test", noop());
        let third = table.insert("test.other", noop());

        assert_eq!((first, second, third), (1, 2, 3));
        assert_eq!(table.len(), 3);
    }

    #[test]
    fn test_same_name_twice_keeps_both() {
        let table = HandlerTable::new();

        let a = table.insert("test.test", noop());
        let b = table.insert("test.test", noop());

        assert!(table.get(a, "test.test").is_some());
        assert!(table.get(b, "test.test").is_some());
    }

    #[test]
    fn test_lookup_requires_registered_name() {
        let table = HandlerTable::new();
        let id = table.insert("test.test", noop());

        assert!(table.get(id, "test.other").is_none());
        assert!(table.get(99, "test.test").is_none());
    }

    #[test]
    fn test_remove_and_clear() {
        let table = HandlerTable::new();
        let id = table.insert("a", noop());
        table.insert("b", noop());

        assert!(table.remove(id));
        assert!(!table.remove(id));
        assert!(table.get(id, "a").is_none());

        table.clear();
        assert_eq!(table.len(), 0);
    }
}
