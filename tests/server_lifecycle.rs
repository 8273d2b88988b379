mod common;

use common::{Echo, connect, init_tracing, read_exact_string};
use muxio::{Error, ServerBuilder, ServerConfig, UnbindPolicy};

use std::io::Write;
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

#[test]
fn builder_rejects_invalid_configuration() {
    let zero_listeners = ServerBuilder::new().listeners(0).config();
    assert!(matches!(zero_listeners, Err(Error::InvalidConfig(_))));

    let zero_backlog = ServerBuilder::new().backlog(0).build(Echo);
    assert!(matches!(zero_backlog, Err(Error::InvalidConfig(_))));

    let zero_buffer = ServerBuilder::new().write_pool(0, 16).config();
    assert!(matches!(zero_buffer, Err(Error::InvalidConfig(_))));

    let zero_select = ServerBuilder::new().select_timeout(Duration::ZERO).config();
    assert!(matches!(zero_select, Err(Error::InvalidConfig(_))));
}

#[test]
fn zero_socket_buffer_sizes_keep_os_defaults() {
    init_tracing();

    let config = ServerBuilder::new()
        .send_buffer_size(0)
        .receive_buffer_size(0)
        .config()
        .expect("os default buffers are valid");
    assert_eq!(config.send_buffer_size, 0);
    assert_eq!(config.receive_buffer_size, 0);

    let server = ServerBuilder::new()
        .listeners(1)
        .send_buffer_size(0)
        .receive_buffer_size(0)
        .build(Echo)
        .expect("build");
    let address = server.bind().expect("bind");

    let mut stream = connect(address);
    stream.write_all(b"os").expect("write");
    assert_eq!(read_exact_string(&mut stream, 2), "os");

    server.shutdown().expect("shutdown");
}

#[test]
fn default_configuration_is_valid() {
    let config = ServerConfig::default();
    config.validate().expect("valid defaults");

    assert!(config.listener_count >= 1);
    assert_eq!(config.max_connections_per_listener, 0);
    assert_eq!(config.unbind_policy, UnbindPolicy::Proceed);
    assert_eq!(config.unbind_timeout, Duration::from_secs(10));
    assert_eq!(config.select_timeout, Duration::from_secs(10));
}

#[test]
fn unbinding_stops_accepting() {
    init_tracing();

    let server = ServerBuilder::new()
        .listeners(1)
        .select_timeout(Duration::from_millis(200))
        .build(Echo)
        .expect("build");
    let address = server.bind().expect("bind");
    assert_eq!(server.local_addrs(), vec![address]);

    let mut stream = connect(address);
    stream.write_all(b"ok").expect("write");
    assert_eq!(read_exact_string(&mut stream, 2), "ok");

    server.unbind(address).expect("unbind");
    assert!(server.local_addrs().is_empty());
    assert!(server.manager().is_none());
    assert!(TcpStream::connect(address).is_err());
}

#[test]
fn unbinding_an_unknown_address_fails() {
    let server = ServerBuilder::new().listeners(1).build(Echo).expect("build");
    let address: SocketAddr = "127.0.0.1:9".parse().expect("address");

    assert!(matches!(server.unbind(address), Err(Error::NotBound(a)) if a == address));
}

#[test]
fn two_ports_share_one_manager_until_the_last_unbind() {
    init_tracing();

    let server = ServerBuilder::new()
        .listeners(2)
        .select_timeout(Duration::from_millis(200))
        .build(Echo)
        .expect("build");
    let first = server.bind().expect("bind first");
    let second = server.bind().expect("bind second");
    assert_ne!(first, second);

    let manager = server.manager().expect("manager");
    server.unbind(first).expect("unbind first");
    assert!(!manager.is_closed());

    let mut stream = connect(second);
    stream.write_all(b"still").expect("write");
    assert_eq!(read_exact_string(&mut stream, 5), "still");

    server.unbind(second).expect("unbind second");
    assert!(manager.is_closed());
}

#[test]
fn unbind_timeout_fails_under_fail_policy() {
    init_tracing();

    let server = ServerBuilder::new()
        .listeners(1)
        .select_timeout(Duration::from_millis(200))
        .unbind(Duration::ZERO, UnbindPolicy::Fail)
        .build(Echo)
        .expect("build");
    let address = server.bind().expect("bind");

    match server.unbind(address) {
        Err(Error::UnbindTimeout { address: reported, .. }) => assert_eq!(reported, address),
        other => panic!("expected UnbindTimeout, got {other:?}"),
    }
    assert!(server.local_addrs().is_empty());
}

#[test]
fn unbind_timeout_proceeds_under_proceed_policy() {
    init_tracing();

    let server = ServerBuilder::new()
        .listeners(1)
        .select_timeout(Duration::from_millis(200))
        .unbind(Duration::ZERO, UnbindPolicy::Proceed)
        .build(Echo)
        .expect("build");
    let address = server.bind().expect("bind");

    server.unbind(address).expect("proceeds after timeout");
    assert!(server.manager().is_none());
}

#[test]
fn dropping_the_server_shuts_it_down() {
    init_tracing();

    let server = ServerBuilder::new()
        .listeners(1)
        .select_timeout(Duration::from_millis(200))
        .build(Echo)
        .expect("build");
    server.bind().expect("bind");
    let manager = server.manager().expect("manager");

    drop(server);
    assert!(manager.is_closed());
}
