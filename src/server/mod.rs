//! The bus server.
//!
//! Accepts sessions on a Unix socket, keeps the priority registry, and routes
//! every call to the session that registered the handler, relaying updates,
//! results, acknowledgements and cancellations between the two.
//!
//! # Example
//!
//! ```ignore
//! use callbus::Server;
//! use callbus::transport::generate_socket_path;
//!
//! let server = Server::launch(generate_socket_path()).await?;
//! println!("listening on {}", server.path().display());
//! // ...
//! server.shutdown();
//! ```

mod connection;
mod registry;
mod router;

pub use registry::{RpcRegistry, Target};

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::task::{AbortHandle, JoinHandle};

use crate::error::Result;
use crate::protocol::{Frame, DEFAULT_MAX_PAYLOAD_SIZE};
use crate::transport::SocketListener;
use crate::writer::{spawn_writer_task, WriterConfig};
use connection::Connection;

/// Server tunables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Writer settings for every connection.
    pub writer: WriterConfig,
    /// Largest accepted frame payload.
    pub max_payload_size: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            writer: WriterConfig::default(),
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
        }
    }
}

/// State shared by the accept loop, connections and routing tasks.
pub(crate) struct ServerState {
    pub(crate) config: ServerConfig,
    pub(crate) registry: RpcRegistry,
    connections: RwLock<HashMap<u64, Arc<Connection>>>,
    next_conn_id: AtomicU64,
    shutting_down: AtomicBool,
}

impl ServerState {
    pub(crate) fn connection(&self, id: u64) -> Option<Arc<Connection>> {
        self.connections.read().get(&id).cloned()
    }

    /// Forget a connection and everything it registered.
    pub(crate) fn drop_connection(&self, conn: &Connection) {
        if !conn.close() {
            return;
        }
        self.connections.write().remove(&conn.id());
        let removed = self.registry.remove_connection(conn.id());
        tracing::debug!(
            "Connection {} closed, {} registrations removed",
            conn.id(),
            removed
        );
    }

    /// Send `frame` to every open connection; returns how many took it.
    pub(crate) async fn broadcast(&self, frame: Frame) -> usize {
        let connections: Vec<Arc<Connection>> =
            self.connections.read().values().cloned().collect();
        let mut reached = 0;
        for conn in connections {
            match conn.writer().send(frame.clone()).await {
                Ok(()) => reached += 1,
                Err(e) => tracing::debug!("Broadcast to connection {} failed: {}", conn.id(), e),
            }
        }
        reached
    }

    fn close_all(&self) {
        let connections: Vec<Arc<Connection>> =
            self.connections.read().values().cloned().collect();
        for conn in connections {
            self.drop_connection(&conn);
        }
    }
}

/// A running bus server.
///
/// Shuts down when dropped.
pub struct Server {
    state: Arc<ServerState>,
    path: PathBuf,
    accept_abort: AbortHandle,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl Server {
    /// Bind `path` and start accepting sessions with default settings.
    pub async fn launch(path: impl AsRef<Path>) -> Result<Self> {
        Self::launch_with(path, ServerConfig::default()).await
    }

    /// Bind `path` and start accepting sessions.
    pub async fn launch_with(path: impl AsRef<Path>, config: ServerConfig) -> Result<Self> {
        let listener = SocketListener::bind(path.as_ref()).await?;
        let path = listener.path().to_path_buf();

        let state = Arc::new(ServerState {
            config,
            registry: RpcRegistry::new(),
            connections: RwLock::new(HashMap::new()),
            next_conn_id: AtomicU64::new(1),
            shutting_down: AtomicBool::new(false),
        });

        let accept_task = tokio::spawn(accept_loop(listener, state.clone()));
        tracing::info!("Bus server listening on {}", path.display());

        Ok(Self {
            state,
            path,
            accept_abort: accept_task.abort_handle(),
            accept_task: Mutex::new(Some(accept_task)),
        })
    }

    /// Socket path the server listens on.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of connected sessions.
    pub fn connection_count(&self) -> usize {
        self.state.connections.read().len()
    }

    /// The priority registry.
    pub fn registry(&self) -> &RpcRegistry {
        &self.state.registry
    }

    /// Wait until the accept loop stops (listener failure or shutdown).
    pub async fn wait(&self) {
        let task = self.accept_task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    /// Stop accepting and close every session, failing their calls.
    ///
    /// Idempotent.
    pub fn shutdown(&self) {
        if self.state.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!("Bus server shutting down");

        self.accept_abort.abort();
        self.state.close_all();
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn accept_loop(listener: SocketListener, state: Arc<ServerState>) {
    loop {
        let stream = match listener.accept().await {
            Ok(s) => s,
            Err(e) => {
                tracing::error!("Accept failed: {}", e);
                return;
            }
        };

        if state.shutting_down.load(Ordering::Acquire) {
            return;
        }

        let id = state.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let (reader, write_half) = stream.into_split();
        let (writer, writer_task) = spawn_writer_task(write_half, state.config.writer.clone());

        let conn = Arc::new(Connection::new(id, writer));
        state.connections.write().insert(id, conn.clone());

        let read_task = tokio::spawn(connection::read_loop(reader, conn.clone(), state.clone()));
        conn.track(writer_task.abort_handle());
        conn.track(read_task.abort_handle());

        if state.shutting_down.load(Ordering::Acquire) {
            state.drop_connection(&conn);
            return;
        }
        tracing::debug!("Connection {} accepted", id);
    }
}
