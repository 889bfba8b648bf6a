#![warn(missing_docs)]

//! weft-server: TCP/UDP server runtime.
//!
//! A server owns a single I/O worker thread, a connection registry with
//! bidirectional id/endpoint mapping, a background reaper evicting unhealthy
//! connections, a layered callback register, and a plugin manager. The TCP
//! and UDP servers share the abstract machinery and differ only in their
//! accept/receive loops and connection types.

/// Server event callbacks and the layered callback register.
pub mod callbacks;
/// Per-peer connection state and the connection trait.
pub mod connection;
/// Server plugins and the plugin manager.
pub mod plugins;
/// Connection registry and the unhealthy-connection queue.
pub mod registry;
/// Abstract server state shared by both transports.
pub mod state;
/// Stream (TCP) server and connection.
pub mod tcp;
/// Datagram (UDP) server and connection.
pub mod udp;
/// The public server wrapper with default logging layer and plugins.
pub mod wrapper;

pub use callbacks::{ServerCallbackRegister, ServerCallbacks};
pub use connection::{ConnectionApi, ConnectionHandle};
pub use plugins::{ServerIdleTimeout, ServerPlugin, ServerPluginManager};
pub use registry::{ConnectionRegistry, UnhealthyQueue};
pub use state::{ServerApi, ServerHandle};
pub use tcp::{TcpConnection, TcpServerCore};
pub use udp::{UdpConnection, UdpServerCore};
pub use wrapper::{Server, TcpServer, UdpServer};
