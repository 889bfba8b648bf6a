use std::{default::Default, time::Duration};

use crate::{
    buffer::{DEFAULT_BUFFER_CAPACITY, MAX_BUFFER_CAPACITY},
    error::{ErrorKind, Result},
};

/// Configuration options to tune runtime behavior.
///
/// A single `Config` is shared by a client or server and every component it
/// creates (callback pool, connections, sockets).
#[derive(Clone, Debug)]
pub struct Config {
    /// Capacity of the shared receive/send buffers in bytes.
    /// Must be in `(0, 65536]`.
    pub buffer_capacity: usize,
    /// Poll quantum of the I/O worker loop. Doubles as the socket read
    /// timeout, so unhealthy entities stop within one quantum.
    pub poll_interval: Duration,
    /// Number of worker threads in the asynchronous-callback pool.
    pub callback_workers: usize,
    /// Listen backlog for stream servers.
    pub accept_backlog: u32,
    /// Socket receive buffer size in bytes (None = use system default).
    /// Corresponds to the SO_RCVBUF socket option.
    pub socket_recv_buffer_size: Option<usize>,
    /// Socket send buffer size in bytes (None = use system default).
    /// Corresponds to the SO_SNDBUF socket option.
    pub socket_send_buffer_size: Option<usize>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            poll_interval: Duration::from_millis(1),
            callback_workers: 2,
            accept_backlog: crate::constants::MAX_CONNECTIONS,
            socket_recv_buffer_size: None, // Use system default
            socket_send_buffer_size: None, // Use system default
        }
    }
}

impl Config {
    /// Checks that the configuration is usable. Called before a client
    /// connects or a server starts; a bad configuration fails those calls.
    pub fn validate(&self) -> Result<()> {
        if self.buffer_capacity == 0 || self.buffer_capacity > MAX_BUFFER_CAPACITY {
            return Err(ErrorKind::InvalidConfig(format!(
                "buffer_capacity must be in (0, {}], got {}",
                MAX_BUFFER_CAPACITY, self.buffer_capacity
            )));
        }
        if self.callback_workers == 0 {
            return Err(ErrorKind::InvalidConfig(
                "callback_workers must be at least 1".to_string(),
            ));
        }
        if self.poll_interval.is_zero() {
            return Err(ErrorKind::InvalidConfig(
                "poll_interval must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}
