//! End-to-end tests exercising real loopback sockets.
//!
//! Servers bind port 0 and tests discover the assigned port through
//! `local_addr()`, so the suite can run in parallel.

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, unbounded};
use weft::{
    Config, ErrorKind, ServerIdleTimeout, Severity, TcpClient, TcpServer, UdpClient, UdpServer,
};

const DEADLINE: Duration = Duration::from_secs(5);

fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < DEADLINE {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}

fn recv_within<T>(receiver: &Receiver<T>) -> T {
    receiver.recv_timeout(DEADLINE).expect("timed out waiting for event")
}

#[test]
fn tcp_echo_round_trip() {
    let server = TcpServer::new();
    server.callbacks().set_on_receive(Arc::new(|_server, connection, buffer, size| {
        connection.send(&buffer, size);
    }));
    assert!(server.start("0"));
    let port = server.local_addr().unwrap().port().to_string();

    let (reply_tx, reply_rx) = unbounded();
    let client = TcpClient::new();
    client.callbacks().set_on_receive(Arc::new(move |_client, buffer, size| {
        let _ = reply_tx.send((buffer.as_slice().to_vec(), size));
    }));

    assert!(client.connect("127.0.0.1", &port));
    assert!(client.send_string("hello"));

    let (payload, size) = recv_within(&reply_rx);
    assert_eq!(size, 5);
    assert_eq!(payload, b"hello");
    assert_eq!(payload.len(), size);

    assert!(client.disconnect());
    assert!(server.stop());
}

#[test]
fn graceful_stop_requested_from_receive_handler() {
    let mut server = TcpServer::new();
    let stop_successes = Arc::new(AtomicUsize::new(0));
    let stop_errors = Arc::new(AtomicUsize::new(0));

    server.callbacks().set_on_receive(Arc::new(|server, _connection, _buffer, _size| {
        server.request_stop();
    }));
    {
        let sink = stop_successes.clone();
        server.callbacks().set_on_stop_success(Arc::new(move || {
            sink.fetch_add(1, Ordering::SeqCst);
        }));
    }
    {
        let sink = stop_errors.clone();
        server.callbacks().set_on_stop_error(Arc::new(move |_error| {
            sink.fetch_add(1, Ordering::SeqCst);
        }));
    }

    assert!(server.start("0"));
    let port = server.local_addr().unwrap().port().to_string();

    let client = TcpClient::new();
    assert!(client.connect("127.0.0.1", &port));
    assert!(client.send_string("shutdown please"));

    // request_stop clears health; update() observes it within a quantum.
    assert!(wait_until(|| !server.update()));
    assert!(server.is_running(), "requested stop must leave running up until stop()");

    assert!(server.stop());
    assert_eq!(stop_successes.load(Ordering::SeqCst), 1);
    assert_eq!(stop_errors.load(Ordering::SeqCst), 0);

    // Second stop fails and fires exactly one on_stop_error.
    assert!(!server.stop());
    assert_eq!(stop_successes.load(Ordering::SeqCst), 1);
    assert_eq!(stop_errors.load(Ordering::SeqCst), 1);

    client.disconnect();
}

#[test]
fn client_observes_abrupt_peer_close() {
    let server = TcpServer::new();
    assert!(server.start("0"));
    let port = server.local_addr().unwrap().port().to_string();

    let (recv_error_tx, recv_error_rx) = unbounded();
    let (send_error_tx, send_error_rx) = unbounded();
    let client = TcpClient::new();
    client.callbacks().set_on_receive_error(Arc::new(move |_client, _buffer, error, _size| {
        let _ = recv_error_tx.send(error);
    }));
    client.callbacks().set_on_send_error(Arc::new(move |_client, error, _size| {
        let _ = send_error_tx.send(error);
    }));

    assert!(client.connect("127.0.0.1", &port));
    assert!(wait_until(|| server.connection_count() == 1));

    // Stopping the server shuts every connection socket down.
    assert!(server.stop());

    let error = recv_within(&recv_error_rx);
    assert_eq!(error.severity(), Severity::ConnectionFatal);
    assert!(wait_until(|| !client.healthy()));

    assert!(!client.send_string("x"));
    assert_eq!(recv_within(&send_error_rx), ErrorKind::NotConnected);

    client.disconnect();
}

#[test]
fn datagram_server_registers_each_peer_once() {
    let server = UdpServer::new();
    let (connection_tx, connection_rx) = unbounded();
    let (receive_tx, receive_rx) = unbounded();
    server.callbacks().set_on_connection(Arc::new(move |_server, connection| {
        let _ = connection_tx.send(connection.endpoint().to_string());
    }));
    server.callbacks().set_on_receive(Arc::new(move |_server, connection, _buffer, size| {
        let _ = receive_tx.send((connection.id(), size));
    }));
    assert!(server.start("0"));
    let port = server.local_addr().unwrap().port().to_string();

    let client = UdpClient::new();
    assert!(client.connect("127.0.0.1", &port));
    assert!(client.send_string("one"));

    let endpoint = recv_within(&connection_rx);
    let (first_id, first_size) = recv_within(&receive_rx);
    assert_eq!(first_size, 3);
    assert!(endpoint.starts_with("127.0.0.1:"));

    assert!(client.send_string("two!"));
    let (second_id, second_size) = recv_within(&receive_rx);
    assert_eq!(second_size, 4);
    assert_eq!(first_id, second_id);

    // Exactly one on_connection for the endpoint.
    assert!(connection_rx.is_empty());
    assert_eq!(server.connection_count(), 1);

    client.disconnect();
    server.stop();
}

#[test]
fn udp_echo_round_trip() {
    let server = UdpServer::new();
    server.callbacks().set_on_receive(Arc::new(|_server, connection, buffer, size| {
        connection.send(&buffer, size);
    }));
    assert!(server.start("0"));
    let port = server.local_addr().unwrap().port().to_string();

    let (reply_tx, reply_rx) = unbounded();
    let client = UdpClient::new();
    client.callbacks().set_on_receive(Arc::new(move |_client, buffer, size| {
        let _ = reply_tx.send((buffer.as_slice().to_vec(), size));
    }));
    assert!(client.connect("127.0.0.1", &port));
    assert!(client.send_bytes(b"ping"));

    let (payload, size) = recv_within(&reply_rx);
    assert_eq!(size, 4);
    assert_eq!(payload, b"ping");

    client.disconnect();
    server.stop();
}

#[test]
fn idle_timeout_plugin_evicts_silent_connections() {
    let mut server = TcpServer::new();
    let (disconnect_tx, disconnect_rx) = unbounded();
    server.callbacks().set_on_disconnection(Arc::new(move |_server, id| {
        let _ = disconnect_tx.send(id);
    }));
    server.attach_plugin(ServerIdleTimeout::new(Duration::from_millis(200)));
    assert!(server.start("0"));
    let port = server.local_addr().unwrap().port().to_string();

    let client = TcpClient::new();
    assert!(client.connect("127.0.0.1", &port));
    assert!(wait_until(|| server.connection_count() == 1));

    // Send nothing; keep ticking until the plugin evicts the connection.
    let deadline = Instant::now() + DEADLINE;
    let mut evicted = None;
    while Instant::now() < deadline {
        server.update();
        if let Ok(id) = disconnect_rx.try_recv() {
            evicted = Some(id);
            break;
        }
        std::thread::sleep(Duration::from_millis(50));
    }

    assert!(evicted.is_some(), "idle connection was not evicted");
    assert_eq!(server.connection_count(), 0);

    client.disconnect();
    server.stop();
}

#[test]
fn layers_observe_receives_in_register_order() {
    use weft::ServerCallbacks;

    let server = TcpServer::new();
    let order = Arc::new(std::sync::Mutex::new(Vec::<&'static str>::new()));
    let metrics_count = Arc::new(AtomicUsize::new(0));

    {
        let order = order.clone();
        // Replaces the default layer's logging handler with a recorder.
        server.callbacks().set_on_receive(Arc::new(move |_server, _connection, _buffer, _size| {
            order.lock().unwrap().push("default");
        }));
    }
    server.callbacks().add_layer("metrics", ServerCallbacks::default());
    {
        let order = order.clone();
        let count = metrics_count.clone();
        server.callbacks().set_on_receive_for(
            "metrics",
            Arc::new(move |_server, _connection, _buffer, _size| {
                order.lock().unwrap().push("metrics");
                count.fetch_add(1, Ordering::SeqCst);
            }),
        );
    }

    assert!(server.start("0"));
    let port = server.local_addr().unwrap().port().to_string();

    let client = TcpClient::new();
    assert!(client.connect("127.0.0.1", &port));
    for _ in 0..3 {
        assert!(client.send_string("tick"));
        std::thread::sleep(Duration::from_millis(20));
    }

    assert!(wait_until(|| metrics_count.load(Ordering::SeqCst) >= 1));
    // Let in-flight dispatches finish before inspecting the order.
    std::thread::sleep(Duration::from_millis(100));

    let order = order.lock().unwrap();
    assert!(!order.is_empty());
    assert_eq!(order.len() % 2, 0, "both layers must observe every receive");
    for pair in order.chunks(2) {
        // "__default_layer__" sorts before "metrics"; both see each receive.
        assert_eq!(pair, ["default", "metrics"]);
    }

    client.disconnect();
    server.stop();
}

#[test]
fn oversized_and_empty_sends_fail_validation() {
    let server = TcpServer::new();
    assert!(server.start("0"));
    let port = server.local_addr().unwrap().port().to_string();

    let (error_tx, error_rx) = unbounded();
    let client = TcpClient::new();
    client.callbacks().set_on_send_error(Arc::new(move |_client, error, _size| {
        let _ = error_tx.send(error);
    }));
    assert!(client.connect("127.0.0.1", &port));

    let buffer = weft::SharedBuffer::from_slice(b"abc", 16);
    assert!(!client.send(&buffer, 0));
    assert_eq!(recv_within(&error_rx), ErrorKind::EmptySend);

    assert!(!client.send(&buffer, buffer.len() + 1));
    assert_eq!(
        recv_within(&error_rx),
        ErrorKind::OversizedSend { requested: 4, available: 3 }
    );

    client.disconnect();
    server.stop();
}

#[test]
fn buffer_capacity_extremes_still_run() {
    for capacity in [1usize, 65536] {
        let config = Config { buffer_capacity: capacity, ..Config::default() };
        let server = TcpServer::with_config(config.clone());
        assert!(server.start("0"), "capacity {} server failed to start", capacity);
        let port = server.local_addr().unwrap().port().to_string();

        let (reply_tx, reply_rx) = unbounded();
        server.callbacks().set_on_receive(Arc::new(|_server, connection, buffer, size| {
            connection.send(&buffer, size);
        }));
        let client = TcpClient::with_config(config);
        client.callbacks().set_on_receive(Arc::new(move |_client, _buffer, size| {
            let _ = reply_tx.send(size);
        }));
        assert!(client.connect("127.0.0.1", &port));
        assert!(client.send_bytes(b"x"));
        assert_eq!(recv_within(&reply_rx), 1);

        client.disconnect();
        server.stop();
    }
}

#[test]
fn send_to_unknown_id_and_endpoint_fail() {
    let server = TcpServer::new();
    let (error_tx, error_rx) = unbounded();
    server.callbacks().set_on_send_error(Arc::new(move |_server, connection, error, _size| {
        let _ = error_tx.send((connection.is_none(), error));
    }));
    assert!(server.start("0"));

    assert!(!server.send_string_to(999, "nope"));
    let (no_connection, error) = recv_within(&error_rx);
    assert!(no_connection);
    assert_eq!(error, ErrorKind::NotConnected);

    assert!(!server.send_string_to_endpoint("10.0.0.1:1", "nope"));
    let (no_connection, error) = recv_within(&error_rx);
    assert!(no_connection);
    assert_eq!(error, ErrorKind::NotFound);

    assert!(!server.disconnect(999));
    assert!(!server.disconnect_endpoint("10.0.0.1:1"));

    server.stop();
}
