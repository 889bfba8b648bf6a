#![warn(missing_docs)]

//! Utility functions for weft networking.
//!
//! This crate provides the small set of address helpers the client and
//! server layers share:
//!
//! - Port parsing with range validation
//! - DNS resolution (hostname to socket addresses)
//! - Endpoint formatting (the canonical `ip:port` registry key)
//!
//! These utilities are provided as a separate crate to keep the core library
//! dependency-free.

use std::{
    io,
    net::{IpAddr, SocketAddr, ToSocketAddrs},
};

/// Parses a port string, validating the numeric range.
///
/// # Arguments
/// * `text` - The port as text (e.g. "8080")
///
/// # Returns
/// The port number, or an error if the text is not an integer in
/// `[0, 65535]`.
///
/// # Examples
/// ```
/// use weft_utilities::parse_port;
///
/// assert_eq!(parse_port("40001").unwrap(), 40001);
/// assert!(parse_port("65536").is_err());
/// assert!(parse_port("-1").is_err());
/// ```
pub fn parse_port(text: &str) -> io::Result<u16> {
    let wide: i64 = text.trim().parse().map_err(|_| {
        io::Error::new(io::ErrorKind::InvalidInput, format!("invalid port: {}", text))
    })?;
    if !(0..=i64::from(u16::MAX)).contains(&wide) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("port out of range: {}", wide),
        ));
    }
    Ok(wide as u16)
}

/// Resolves a hostname to every socket address it maps to.
///
/// # Arguments
/// * `hostname` - The hostname to resolve (e.g. "example.com")
/// * `port` - The port number to use
///
/// # Returns
/// All resolved addresses, or an error if resolution fails or yields none.
pub fn resolve_host_all(hostname: &str, port: u16) -> io::Result<Vec<SocketAddr>> {
    let candidates: Vec<SocketAddr> = (hostname, port).to_socket_addrs()?.collect();
    if candidates.is_empty() {
        return Err(io::Error::new(io::ErrorKind::NotFound, "could not resolve hostname"));
    }
    Ok(candidates)
}

/// Resolves a hostname to its first socket address.
///
/// # Examples
/// ```no_run
/// use weft_utilities::resolve_host;
///
/// let addr = resolve_host("localhost", 8080).unwrap();
/// assert_eq!(addr.port(), 8080);
/// ```
pub fn resolve_host(hostname: &str, port: u16) -> io::Result<SocketAddr> {
    Ok(resolve_host_all(hostname, port)?[0])
}

/// Parses an IP address string (without DNS resolution) to a socket address.
///
/// # Examples
/// ```
/// use weft_utilities::parse_ip;
///
/// let addr = parse_ip("127.0.0.1", 8080).unwrap();
/// assert_eq!(addr.port(), 8080);
/// ```
pub fn parse_ip(ip_str: &str, port: u16) -> io::Result<SocketAddr> {
    match ip_str.parse::<IpAddr>() {
        Ok(ip) => Ok(SocketAddr::new(ip, port)),
        Err(_) => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("not an IP address: {}", ip_str),
        )),
    }
}

/// Formats a socket address as the canonical `ip:port` endpoint string used
/// as the secondary key in a server's connection registry.
pub fn format_endpoint(addr: &SocketAddr) -> String {
    addr.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_port_accepts_full_range() {
        assert_eq!(parse_port("0").unwrap(), 0);
        assert_eq!(parse_port("65535").unwrap(), 65535);
        assert_eq!(parse_port(" 8080 ").unwrap(), 8080);
    }

    #[test]
    fn parse_port_rejects_out_of_range() {
        assert!(parse_port("65536").is_err());
        assert!(parse_port("-1").is_err());
        assert!(parse_port("999999999999999999999").is_err());
    }

    #[test]
    fn parse_port_rejects_garbage() {
        assert!(parse_port("http").is_err());
        assert!(parse_port("").is_err());
    }

    #[test]
    fn parse_ip_round_trips() {
        let addr = parse_ip("127.0.0.1", 40001).unwrap();
        assert_eq!(format_endpoint(&addr), "127.0.0.1:40001");
    }

    #[test]
    fn parse_ip_rejects_hostnames() {
        assert!(parse_ip("localhost", 80).is_err());
    }

    #[test]
    fn resolve_loopback() {
        let addrs = resolve_host_all("127.0.0.1", 9000).unwrap();
        assert!(!addrs.is_empty());
        assert!(addrs.iter().all(|a| a.port() == 9000));
    }
}
