//! Echo - request/response over an in-process bus server.
//!
//! This demo shows:
//! - Launching a bus server on a fresh socket
//! - Registering a typed handler
//! - Calling it from a second session and waiting for the result
//!
//! ```text
//! cargo run --example echo
//! ```

use callbus::transport::generate_socket_path;
use callbus::{Client, Server, ServerContext};
use serde::{Deserialize, Serialize};

/// Input structure for the echo handler.
#[derive(Deserialize, Serialize, Debug)]
struct EchoInput {
    message: String,
}

/// Output structure for the echo handler.
#[derive(Serialize, Debug)]
struct EchoOutput {
    echo: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let server = Server::launch(generate_socket_path()).await?;

    let worker = Client::connect(server.path()).await?;
    worker
        .register("echo", 100, |data: EchoInput, ctx: ServerContext| async move {
            ctx.ok(&EchoOutput { echo: data.message }).await
        })
        .await?;

    let caller = Client::connect(server.path()).await?;
    let mut call = caller
        .call(
            "echo",
            &EchoInput {
                message: "hello".into(),
            },
        )
        .await?;

    println!("{:?}", call.wait().await);

    caller.disconnect();
    worker.disconnect();
    server.shutdown();
    Ok(())
}
