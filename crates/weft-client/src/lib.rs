#![warn(missing_docs)]

//! weft-client: protocol-generic client runtime.
//!
//! A client is parameterised by a transport tag ([`protocol::Tcp`] or
//! [`protocol::Udp`]) and exposes the same surface for both: `connect`,
//! `disconnect`, the `send` family, a layered callback register, and a
//! plugin manager ticked through `update()`.

/// Client event callbacks and the layered callback register.
pub mod callbacks;
/// The client core: state, control flow, and the I/O worker loop.
pub mod client;
/// Client plugins and the plugin manager.
pub mod plugins;
/// Transport tags and their socket primitives.
pub mod protocol;
/// The public client wrapper with default logging layer and plugins.
pub mod wrapper;

pub use callbacks::{ClientApi, ClientCallbackRegister, ClientCallbacks, ClientHandle};
pub use client::ClientCore;
pub use plugins::{ClientIdleTimeout, ClientPlugin, ClientPluginManager};
pub use protocol::{Protocol, Tcp, Udp};
pub use wrapper::{Client, TcpClient, UdpClient};
