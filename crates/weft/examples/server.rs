//! Simple echo server using weft.
//!
//! Run:
//! - cargo run -p weft --example server
//! - cargo run -p weft --example server -- 9000 udp

use std::{env, sync::Arc, thread, time::Duration};

use weft::{Server, ServerApi, TcpServer, UdpServer};

fn run<C: ServerApi + 'static>(mut server: Server<C>, port: &str) {
    // Echo every payload back to its sender; "exit" shuts the server down.
    server.callbacks().set_on_receive(Arc::new(|server, connection, buffer, size| {
        let text = String::from_utf8_lossy(&buffer.as_slice()[..size]);
        if text.trim() == "exit" {
            println!("[exit] requested by {}", connection.alias());
            server.request_stop();
            return;
        }
        println!("[recv] {} bytes from {}: \"{}\"", size, connection.alias(), text.trim_end());
        connection.send(&buffer, size);
    }));

    if !server.start(port) {
        eprintln!("failed to start server on port {}", port);
        return;
    }
    println!("weft echo server listening on {:?}", server.local_addr());

    while server.update() {
        thread::sleep(Duration::from_millis(100));
    }
    server.stop();
    println!("server closed");
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .init();

    let mut args = env::args().skip(1);
    let port = args.next().unwrap_or_else(|| "9000".to_string());
    let protocol = args.next().unwrap_or_else(|| "tcp".to_string());

    match protocol.as_str() {
        "tcp" => run(TcpServer::new(), &port),
        "udp" => run(UdpServer::new(), &port),
        other => eprintln!("unsupported protocol: {} (only tcp/udp)", other),
    }
}
