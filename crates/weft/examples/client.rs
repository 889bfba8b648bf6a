//! Simple line-oriented client for the echo server example.
//!
//! Run the server first:
//! - cargo run -p weft --example server -- 9000 tcp
//!
//! Then:
//! - cargo run -p weft --example client -- 127.0.0.1 9000 tcp
//!
//! Every line typed on stdin is sent to the server; replies are printed as
//! they arrive. Type "exit" to stop the server, or close stdin to quit.

use std::{env, io::BufRead, sync::Arc};

use weft::{Client, Protocol, TcpClient, UdpClient};

fn run<P: Protocol>(client: Client<P>, host: &str, port: &str) {
    client.callbacks().set_on_receive(Arc::new(|_client, buffer, size| {
        println!("[reply] \"{}\"", String::from_utf8_lossy(&buffer.as_slice()[..size]));
    }));
    client.callbacks().set_on_receive_async(true);

    if !client.connect(host, port) {
        eprintln!("failed to connect to {}:{}", host, port);
        return;
    }
    println!("connected as {}", client.alias());

    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let Ok(line) = line else { break };
        if !client.healthy() {
            println!("connection lost - exiting");
            break;
        }
        client.send_string(&line);
    }

    client.disconnect();
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .init();

    let mut args = env::args().skip(1);
    let host = args.next().unwrap_or_else(|| "127.0.0.1".to_string());
    let port = args.next().unwrap_or_else(|| "9000".to_string());
    let protocol = args.next().unwrap_or_else(|| "tcp".to_string());

    match protocol.as_str() {
        "tcp" => run(TcpClient::new(), &host, &port),
        "udp" => run(UdpClient::new(), &host, &port),
        other => eprintln!("unsupported protocol: {} (only tcp/udp)", other),
    }
}
