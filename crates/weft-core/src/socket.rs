use std::io;

use socket2::SockRef;

use crate::config::Config;

/// Applies socket options from configuration to any socket type that can be
/// viewed as a raw socket (TCP streams, listeners, and UDP sockets alike).
pub fn apply_socket_options(socket: SockRef<'_>, config: &Config) -> io::Result<()> {
    if let Some(size) = config.socket_recv_buffer_size {
        socket.set_recv_buffer_size(size)?;
    }
    if let Some(size) = config.socket_send_buffer_size {
        socket.set_send_buffer_size(size)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::net::UdpSocket;

    use super::*;

    #[test]
    fn applies_buffer_sizes() {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let config = Config {
            socket_recv_buffer_size: Some(64 * 1024),
            socket_send_buffer_size: Some(64 * 1024),
            ..Config::default()
        };
        apply_socket_options(SockRef::from(&socket), &config).unwrap();
    }

    #[test]
    fn defaults_leave_socket_untouched() {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        apply_socket_options(SockRef::from(&socket), &Config::default()).unwrap();
    }
}
