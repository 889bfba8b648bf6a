//! Transport tags for the protocol-generic client.
//!
//! [`Tcp`] and [`Udp`] are zero-sized tags selecting the socket primitives
//! at compile time. Connect semantics differ per tag: the stream transport
//! walks every resolved candidate, dropping the failed socket between
//! attempts; the datagram transport opens a v4 socket and connects it to the
//! first candidate with no retry.

use std::{
    io::{self, Read, Write},
    net::{Ipv4Addr, TcpStream, UdpSocket},
};

use socket2::SockRef;
use weft_core::{Config, socket::apply_socket_options};
use weft_utilities::{parse_port, resolve_host_all};

/// Compile-time transport tag used by [`crate::client::ClientCore`].
pub trait Protocol: Send + Sync + 'static {
    /// Short transport name used in aliases and thread names.
    const NAME: &'static str;
    /// The concrete socket owned by the I/O worker.
    type Socket: Send + 'static;

    /// Resolves `host:port` and establishes the transport's socket. The
    /// returned socket has its read timeout set to the poll quantum.
    fn connect(host: &str, port: &str, config: &Config) -> io::Result<Self::Socket>;

    /// Receives at most `buffer.len()` bytes. A stream end-of-file is
    /// reported as `UnexpectedEof` so that it classifies as
    /// connection-fatal.
    fn recv(socket: &Self::Socket, buffer: &mut [u8]) -> io::Result<usize>;

    /// Sends `data` in full and returns the byte count.
    fn send(socket: &Self::Socket, data: &[u8]) -> io::Result<usize>;
}

/// Stream (TCP) transport tag.
pub enum Tcp {}

/// Datagram (UDP) transport tag.
pub enum Udp {}

impl Protocol for Tcp {
    const NAME: &'static str = "tcp";
    type Socket = TcpStream;

    fn connect(host: &str, port: &str, config: &Config) -> io::Result<Self::Socket> {
        let port = parse_port(port)?;
        let mut last_error =
            io::Error::new(io::ErrorKind::NotFound, format!("host not found: {}", host));
        for candidate in resolve_host_all(host, port)? {
            // A failed attempt drops the socket; the next iteration opens a
            // fresh one.
            match TcpStream::connect(candidate) {
                Ok(stream) => {
                    stream.set_read_timeout(Some(config.poll_interval))?;
                    apply_socket_options(SockRef::from(&stream), config)?;
                    return Ok(stream);
                }
                Err(error) => last_error = error,
            }
        }
        Err(last_error)
    }

    fn recv(socket: &Self::Socket, buffer: &mut [u8]) -> io::Result<usize> {
        let mut reader: &TcpStream = socket;
        match reader.read(buffer)? {
            0 => Err(io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed by peer")),
            received => Ok(received),
        }
    }

    fn send(socket: &Self::Socket, data: &[u8]) -> io::Result<usize> {
        let mut writer: &TcpStream = socket;
        writer.write_all(data)?;
        Ok(data.len())
    }
}

impl Protocol for Udp {
    const NAME: &'static str = "udp";
    type Socket = UdpSocket;

    fn connect(host: &str, port: &str, config: &Config) -> io::Result<Self::Socket> {
        let port = parse_port(port)?;
        let candidates = resolve_host_all(host, port)?;
        let target = candidates
            .iter()
            .find(|addr| addr.is_ipv4())
            .copied()
            .unwrap_or(candidates[0]);

        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        socket.set_read_timeout(Some(config.poll_interval))?;
        apply_socket_options(SockRef::from(&socket), config)?;
        socket.connect(target)?;
        Ok(socket)
    }

    fn recv(socket: &Self::Socket, buffer: &mut [u8]) -> io::Result<usize> {
        socket.recv(buffer)
    }

    fn send(socket: &Self::Socket, data: &[u8]) -> io::Result<usize> {
        socket.send(data)
    }
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;

    use super::*;

    #[test]
    fn tcp_connect_reports_invalid_port() {
        assert!(Tcp::connect("127.0.0.1", "notaport", &Config::default()).is_err());
        assert!(Tcp::connect("127.0.0.1", "70000", &Config::default()).is_err());
    }

    #[test]
    fn tcp_connect_reaches_a_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port().to_string();
        let stream = Tcp::connect("127.0.0.1", &port, &Config::default()).unwrap();
        assert!(stream.peer_addr().is_ok());
    }

    #[test]
    fn tcp_connect_fails_without_listener() {
        // Port 1 on loopback is essentially never listening.
        assert!(Tcp::connect("127.0.0.1", "1", &Config::default()).is_err());
    }

    #[test]
    fn udp_connect_binds_a_v4_socket() {
        let socket = Udp::connect("127.0.0.1", "9", &Config::default()).unwrap();
        assert!(socket.local_addr().unwrap().is_ipv4());
    }

    #[test]
    fn udp_round_trip_over_loopback() {
        let server = UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = server.local_addr().unwrap().port().to_string();

        let client = Udp::connect("127.0.0.1", &port, &Config::default()).unwrap();
        Udp::send(&client, b"ping").unwrap();

        let mut buffer = [0u8; 16];
        let (received, from) = server.recv_from(&mut buffer).unwrap();
        assert_eq!(&buffer[..received], b"ping");

        server.send_to(b"pong", from).unwrap();
        let received = Udp::recv(&client, &mut buffer).unwrap();
        assert_eq!(&buffer[..received], b"pong");
    }
}
