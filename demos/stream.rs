//! Stream - progress updates and cancellation.
//!
//! The handler counts until its caller cancels; the caller reads a few
//! updates, cancels, and prints the final result.
//!
//! ```text
//! RUST_LOG=callbus=debug cargo run --example stream
//! ```

use std::time::Duration;

use callbus::transport::generate_socket_path;
use callbus::{Client, Server, ServerContext};
use serde_json::json;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let server = Server::launch(generate_socket_path()).await?;
    let client = Client::connect(server.path()).await?;

    client
        .register("count", 0, |step_ms: u64, ctx: ServerContext| async move {
            let mut count = 0u64;
            while !ctx.is_cancelled() {
                if ctx.emit(&json!({ "count": count })).await.is_err() {
                    break;
                }
                count += 1;
                tokio::time::sleep(Duration::from_millis(step_ms)).await;
            }
            ctx.ok(&json!({ "stopped_at": count })).await
        })
        .await?;

    let mut call = client.call("count", &10u64).await?;
    for _ in 0..5 {
        if let Some(update) = call.recv().await {
            println!("update: {}", update);
        }
    }
    call.cancel();

    println!("result: {:?}", call.wait().await);

    client.disconnect();
    server.shutdown();
    Ok(())
}
