//! Control line - how a bus server tells its parent where to connect.
//!
//! The server's first line on stdout is its socket path, written before it
//! accepts connections. Everything else (logs, diagnostics) goes to stderr.
//!
//! # Example
//!
//! ```ignore
//! use callbus::control::announce_address;
//! use callbus::transport::generate_socket_path;
//!
//! let path = generate_socket_path();
//! announce_address(&path)?;
//! ```

mod stdio;

pub use stdio::{announce_address, write_stdout_line};
