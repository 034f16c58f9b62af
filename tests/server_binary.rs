//! The `callbus-server` binary as a parent process sees it.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use callbus::transport::generate_socket_path;
use callbus::{Client, RpcResult, ServerContext};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

#[tokio::test]
async fn test_first_stdout_line_is_a_connectable_socket_path() {
    let requested = generate_socket_path();
    let mut child = Command::new(env!("CARGO_BIN_EXE_callbus-server"))
        .env("CALLBUS_SOCKET", &requested)
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .unwrap();

    let stdout = child.stdout.take().unwrap();
    let mut lines = BufReader::new(stdout).lines();
    let line = tokio::time::timeout(Duration::from_secs(10), lines.next_line())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let announced = PathBuf::from(line);
    assert_eq!(announced, requested);

    let client = Client::connect(&announced).await.unwrap();
    client
        .register("test.echo", 0, |args: Value, ctx: ServerContext| async move {
            ctx.ok(&args).await
        })
        .await
        .unwrap();
    let mut call = client.call("test.echo", &json!({"blub": "foo"})).await.unwrap();
    assert_eq!(call.wait().await, RpcResult::ok(json!({"blub": "foo"})));

    client.disconnect();
    child.kill().await.unwrap();
}
