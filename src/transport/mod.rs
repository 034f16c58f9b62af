//! Transport module - Unix domain socket handling.

mod socket;

pub use socket::{connect, generate_socket_path, SocketListener};
