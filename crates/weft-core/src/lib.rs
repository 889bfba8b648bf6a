#![warn(missing_docs)]

//! weft-core: foundational types and utilities.
//!
//! This crate provides the minimal set of core utilities shared by the client
//! and server layers:
//! - Configuration types
//! - Error handling and the three-tier severity taxonomy
//! - Shared byte buffers for the send/receive path
//! - The layered callback machinery and its worker pool
//! - Clock abstraction for testable time

/// Constants shared across layers.
pub mod constants {
    /// Identifier assigned to every connection a server accepts.
    pub type ClientId = u64;

    /// Sentinel id meaning "no connection". Never assigned to a live connection.
    pub const INVALID_CLIENT_ID: ClientId = ClientId::MAX;
    /// First id handed out by a freshly started server.
    pub const BASE_CLIENT_ID: ClientId = 0;

    /// Listen backlog for stream servers when the platform maximum is unknown.
    pub const MAX_CONNECTIONS: u32 = 4096;

    /// Name of the callback layer created implicitly on first write.
    pub const DEFAULT_LAYER: &str = "__default_layer__";
}

/// Configuration options for clients and servers.
pub mod config;
/// Error types, results, and the severity taxonomy.
pub mod error;
/// Shared, reference-counted receive/send buffers.
pub mod buffer;
/// Worker pool executing asynchronous callback dispatches.
pub mod pool;
/// Layered callback register machinery.
pub mod callbacks;
/// Socket option plumbing shared by client and server sockets.
pub mod socket;
/// Clock abstraction to improve testability.
pub mod time;

mod sync;

pub use buffer::SharedBuffer;
pub use config::Config;
pub use constants::{BASE_CLIENT_ID, ClientId, DEFAULT_LAYER, INVALID_CLIENT_ID, MAX_CONNECTIONS};
pub use error::{ErrorKind, Result, Severity};
pub use sync::lock;
