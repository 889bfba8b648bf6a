#![warn(missing_docs)]

//! Weft: a small public API facade for the workspace.
//!
//! This crate provides a clean, stable surface that re-exports the most
//! commonly used types to build callback-driven TCP/UDP apps:
//!
//! - Clients and servers (`TcpClient`, `UdpClient`, `TcpServer`, `UdpServer`)
//! - Shared buffers and configuration (`SharedBuffer`, `Config`)
//! - The error taxonomy (`ErrorKind`, `Severity`)
//! - The idle-timeout plugins
//!
//! Example
//! ```no_run
//! use weft::{TcpClient, TcpServer};
//! use std::sync::Arc;
//!
//! let mut server = TcpServer::new();
//! server.callbacks().set_on_receive(Arc::new(|_server, connection, buffer, size| {
//!     // Echo the payload back to its sender.
//!     connection.send(&buffer, size);
//! }));
//! assert!(server.start("40001"));
//!
//! let client = TcpClient::new();
//! assert!(client.connect("127.0.0.1", "40001"));
//! client.send_string("hello");
//!
//! while server.update() {
//!     std::thread::sleep(std::time::Duration::from_millis(100));
//! }
//! ```

// Core: buffers, configuration, errors, ids
pub use weft_core::{
    BASE_CLIENT_ID, ClientId, Config, DEFAULT_LAYER, ErrorKind, INVALID_CLIENT_ID,
    MAX_CONNECTIONS, Severity, SharedBuffer,
    time::{Clock, SystemClock},
};
// Address helpers
pub use weft_utilities::{format_endpoint, parse_ip, parse_port, resolve_host, resolve_host_all};
// Client: wrapper, handles, callbacks, plugins
pub use weft_client::{
    Client, ClientApi, ClientCallbackRegister, ClientCallbacks, ClientHandle, ClientIdleTimeout,
    ClientPlugin, Protocol, Tcp, TcpClient, Udp, UdpClient,
};
// Server: wrapper, handles, callbacks, connections, plugins
pub use weft_server::{
    ConnectionApi, ConnectionHandle, Server, ServerApi, ServerCallbackRegister, ServerCallbacks,
    ServerHandle, ServerIdleTimeout, ServerPlugin, TcpServer, UdpServer,
};

/// Convenience prelude with the most commonly used items.
pub mod prelude {
    pub use crate::{
        ClientApi, ClientHandle, ClientId, Config, ConnectionApi, ConnectionHandle, ErrorKind,
        ServerApi, ServerHandle, Severity, SharedBuffer, TcpClient, TcpServer, UdpClient,
        UdpServer,
    };
}
