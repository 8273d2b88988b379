mod common;

use common::{Echo, Tally, connect, init_tracing, wait_until};
use muxio::{AcceptedSocket, ConnectionManager, Error, ServerBuilder};

use std::net::{TcpListener as StdTcpListener, TcpStream as StdTcpStream};
use std::sync::Arc;

/// A connected pair: the server half wrapped for the manager, and the client half.
fn socket_pair(listener: &StdTcpListener) -> (AcceptedSocket, StdTcpStream) {
    let client = StdTcpStream::connect(listener.local_addr().expect("local addr")).expect("connect");
    let (server, _peer) = listener.accept().expect("accept");
    (AcceptedSocket::from_std(server).expect("from_std"), client)
}

#[test]
fn sequential_connections_are_spread_evenly() {
    init_tracing();

    let tally = Tally::default();
    let server = ServerBuilder::new()
        .listeners(3)
        .build(tally.clone())
        .expect("build");
    let address = server.bind().expect("bind");
    let manager = server.manager().expect("manager");
    assert_eq!(manager.listener_count(), 3);

    let clients: Vec<_> = (0..6).map(|_| connect(address)).collect();
    tally.wait_for_connections(clients.len());

    assert!(wait_until(|| manager.registered_counts() == vec![2, 2, 2]));
    for (handle, _) in tally.wait_for_connections(clients.len()) {
        assert!(handle.id().listener() < 3);
    }

    server.shutdown().expect("shutdown");
}

#[test]
fn full_listener_passes_connection_to_next_slot() {
    init_tracing();

    let config = ServerBuilder::new()
        .listeners(3)
        .max_connections_per_listener(1)
        .config()
        .expect("config");
    let manager = ConnectionManager::new(Arc::new(config), Arc::new(Echo));
    manager.open_socket_selectors().expect("open");

    let source = StdTcpListener::bind("127.0.0.1:0").expect("bind");
    let mut clients = Vec::new();
    for _ in 0..3 {
        let (socket, client) = socket_pair(&source);
        manager.manage_connection(socket).expect("manage");
        clients.push(client);
    }
    assert!(wait_until(|| manager.registered_counts() == vec![1, 1, 1]));

    // Vacate the middle slot, then aim the cursor at the full first one.
    drop(clients.remove(1));
    assert!(wait_until(|| manager.registered_counts() == vec![1, 0, 1]));

    let (socket, client) = socket_pair(&source);
    manager.manage_connection(socket).expect("retried on next slot");
    clients.push(client);
    assert!(wait_until(|| manager.registered_counts() == vec![1, 1, 1]));

    manager.close_socket_selectors();
}

#[test]
fn connection_is_refused_when_every_listener_is_full() {
    init_tracing();

    let config = ServerBuilder::new()
        .listeners(2)
        .max_connections_per_listener(1)
        .config()
        .expect("config");
    let manager = ConnectionManager::new(Arc::new(config), Arc::new(Echo));
    manager.open_socket_selectors().expect("open");

    let source = StdTcpListener::bind("127.0.0.1:0").expect("bind");
    let mut clients = Vec::new();
    for _ in 0..2 {
        let (socket, client) = socket_pair(&source);
        manager.manage_connection(socket).expect("manage");
        clients.push(client);
    }

    let (socket, _client) = socket_pair(&source);
    match manager.manage_connection(socket) {
        Err(Error::AtCapacity { listeners }) => assert_eq!(listeners, 2),
        other => panic!("expected AtCapacity, got {other:?}"),
    }

    manager.close_socket_selectors();
}

#[test]
fn closed_manager_rejects_connections_and_close_is_idempotent() {
    init_tracing();

    let config = ServerBuilder::new().listeners(1).config().expect("config");
    let manager = ConnectionManager::new(Arc::new(config), Arc::new(Echo));
    manager.open_socket_selectors().expect("open");

    manager.close_socket_selectors();
    manager.close_socket_selectors();
    assert!(manager.is_closed());

    let source = StdTcpListener::bind("127.0.0.1:0").expect("bind");
    let (socket, _client) = socket_pair(&source);
    assert!(matches!(manager.manage_connection(socket), Err(Error::Closed)));
    assert!(matches!(manager.open_socket_selectors(), Err(Error::Closed)));
}

#[test]
fn drained_listener_is_replaced_on_its_slot() {
    init_tracing();

    let config = ServerBuilder::new().listeners(1).config().expect("config");
    let manager = ConnectionManager::new(Arc::new(config), Arc::new(Echo));
    manager.open_socket_selectors().expect("open");

    let source = StdTcpListener::bind("127.0.0.1:0").expect("bind");
    let (socket, client) = socket_pair(&source);
    manager.manage_connection(socket).expect("manage");
    assert!(wait_until(|| manager.registered_counts() == vec![1]));

    drop(client);
    assert!(wait_until(|| manager.registered_counts() == vec![0]));

    let (socket, _client) = socket_pair(&source);
    manager.manage_connection(socket).expect("manage after drain");
    assert!(wait_until(|| manager.registered_counts() == vec![1]));

    manager.close_socket_selectors();
}
