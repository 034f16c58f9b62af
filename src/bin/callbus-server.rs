//! Bus server entry point.
//!
//! Listens on `$CALLBUS_SOCKET`, or on a fresh path under the temp dir, and
//! prints that path as the first line of stdout once it is ready to accept
//! sessions. Logs go to stderr; `RUST_LOG` controls the level.

use std::path::PathBuf;

use callbus::control::announce_address;
use callbus::transport::generate_socket_path;
use callbus::Server;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Environment variable naming the socket path.
const SOCKET_ENV: &str = "CALLBUS_SOCKET";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let path = std::env::var_os(SOCKET_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(generate_socket_path);

    let server = Server::launch(&path).await?;
    announce_address(server.path())?;

    tokio::select! {
        _ = server.wait() => {
            tracing::warn!("Accept loop stopped");
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted");
        }
    }

    server.shutdown();
    Ok(())
}
