mod common;

use common::{Echo, Tally, connect, init_tracing, read_exact_string, read_to_end_string, wait_until};
use muxio::{
    ConnectionHandle, ConnectionHandler, ConnectionManager, IdleContext, Protocol, ReadContext,
    Result, ServerBuilder, WriteBuffer,
};

use bytes::Bytes;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;

#[test]
fn echoes_three_clients_across_two_listeners() {
    init_tracing();

    let server = ServerBuilder::new().listeners(2).build(Echo).expect("build");
    let address = server.bind().expect("bind");

    let mut clients: Vec<_> = ["A", "B", "C"]
        .into_iter()
        .map(|name| (name, connect(address)))
        .collect();

    for (name, stream) in clients.iter_mut() {
        stream.write_all(name.as_bytes()).expect("write");
    }
    for (name, stream) in clients.iter_mut() {
        assert_eq!(read_exact_string(stream, 1), *name);
    }

    let (_, closed) = clients.remove(1);
    drop(closed);

    for (name, stream) in clients.iter_mut() {
        let message = format!("{name}{name}{name}");
        stream.write_all(message.as_bytes()).expect("write");
        assert_eq!(read_exact_string(stream, 3), message);
    }

    server.shutdown().expect("shutdown");
}

#[test]
fn large_echo_survives_partial_writes() {
    init_tracing();

    let server = ServerBuilder::new()
        .listeners(1)
        .write_pool(512, 16)
        .build(Echo)
        .expect("build");
    let address = server.bind().expect("bind");

    let payload: Vec<u8> = (0..256 * 1024).map(|i| (i % 251) as u8).collect();
    let mut stream = connect(address);
    let mut writer = stream.try_clone().expect("clone");

    let expected = payload.clone();
    let sender = std::thread::spawn(move || writer.write_all(&payload).expect("write"));

    let mut received = vec![0u8; expected.len()];
    stream.read_exact(&mut received).expect("read_exact");
    sender.join().expect("sender");

    assert_eq!(received, expected);
    server.shutdown().expect("shutdown");
}

struct Farewell;

struct FarewellHandler;

impl Protocol for Farewell {
    type Request = ();
    type Handler = FarewellHandler;

    fn create_connection_handler(&self, _connection: &ConnectionHandle) -> FarewellHandler {
        FarewellHandler
    }

    fn process_request(&self, _connection: &ConnectionHandle, _request: ()) -> Result<()> {
        Ok(())
    }
}

impl ConnectionHandler<Farewell> for FarewellHandler {
    fn handle_read(&mut self, context: &mut ReadContext<'_, Farewell>) -> Result<()> {
        context.write_data(&[WriteBuffer::copy(b"one,")]);
        context.write_data(&[
            WriteBuffer::copy(b"two,"),
            WriteBuffer::shared(Bytes::from_static(b"three")),
        ]);
        context.close();
        context.write_data(&[WriteBuffer::copy(b"late")]);
        assert!(context.is_closed());
        Ok(())
    }
}

#[test]
fn writes_before_close_flush_in_order_and_later_writes_are_dropped() {
    init_tracing();

    let server = ServerBuilder::new().listeners(1).build(Farewell).expect("build");
    let address = server.bind().expect("bind");

    let mut stream = connect(address);
    stream.write_all(b"hi").expect("write");

    assert_eq!(read_to_end_string(&mut stream), "one,two,three");
    server.shutdown().expect("shutdown");
}

#[test]
fn handle_writes_from_another_thread_reach_the_peer() {
    init_tracing();

    let tally = Tally::default();
    let server = ServerBuilder::new()
        .listeners(2)
        .build(tally.clone())
        .expect("build");
    let address = server.bind().expect("bind");

    let mut stream = connect(address);
    let connections = tally.wait_for_connections(1);
    let handle = connections[0].0.clone();

    let writer = std::thread::spawn(move || {
        handle.write_data(&[WriteBuffer::copy(b"alpha ")]);
        handle.write_data(&[WriteBuffer::shared(Bytes::from_static(b"beta "))]);
        handle.write_data(&[WriteBuffer::copy(b"gamma")]);
        handle.close();
        handle.write_data(&[WriteBuffer::copy(b" delta")]);
        assert!(handle.is_closed());
    });
    writer.join().expect("writer");

    assert_eq!(read_to_end_string(&mut stream), "alpha beta gamma");
    server.shutdown().expect("shutdown");
}

#[test]
fn reads_are_forwarded_to_process_request() {
    init_tracing();

    let tally = Tally::default();
    let server = ServerBuilder::new()
        .listeners(1)
        .build(tally.clone())
        .expect("build");
    let address = server.bind().expect("bind");

    let mut stream = connect(address);
    stream.write_all(b"ping").expect("write");
    assert_eq!(read_exact_string(&mut stream, 4), "ping");

    let requests = tally.requests();
    assert_eq!(requests.concat(), b"ping".to_vec());
    server.shutdown().expect("shutdown");
}

#[test]
fn shutdown_terminates_open_connections() {
    init_tracing();

    let tally = Tally::default();
    let server = ServerBuilder::new()
        .listeners(2)
        .select_timeout(Duration::from_millis(200))
        .build(tally.clone())
        .expect("build");
    let address = server.bind().expect("bind");

    let mut stream = connect(address);
    let connections = tally.wait_for_connections(1);

    server.shutdown().expect("shutdown");

    assert!(wait_until(|| connections[0].0.is_closed()));
    let mut buf = [0u8; 8];
    match stream.read(&mut buf) {
        Ok(count) => assert_eq!(count, 0),
        Err(err) => assert_ne!(err.kind(), std::io::ErrorKind::WouldBlock),
    }
    assert!(server.manager().is_none());
}

/// Writes through the handle, then closes through the handler context.
struct HandleThenClose;

struct HandleThenCloseHandler;

impl Protocol for HandleThenClose {
    type Request = ();
    type Handler = HandleThenCloseHandler;

    fn create_connection_handler(&self, _connection: &ConnectionHandle) -> HandleThenCloseHandler {
        HandleThenCloseHandler
    }

    fn process_request(&self, _connection: &ConnectionHandle, _request: ()) -> Result<()> {
        Ok(())
    }
}

impl ConnectionHandler<HandleThenClose> for HandleThenCloseHandler {
    fn handle_read(&mut self, context: &mut ReadContext<'_, HandleThenClose>) -> Result<()> {
        context.connection().write_data(&[WriteBuffer::copy(b"bye")]);
        context.close();
        Ok(())
    }
}

#[test]
fn handle_write_followed_by_context_close_still_flushes() {
    init_tracing();

    let server = ServerBuilder::new()
        .listeners(1)
        .build(HandleThenClose)
        .expect("build");
    let address = server.bind().expect("bind");

    let mut stream = connect(address);
    stream.write_all(b"x").expect("write");

    assert_eq!(read_to_end_string(&mut stream), "bye");
    server.shutdown().expect("shutdown");
}

/// Closes from the idle hook once another thread finished writing.
#[derive(Clone, Default)]
struct CloseWhenWritten {
    handles: Arc<Mutex<Vec<ConnectionHandle>>>,
    written: Arc<AtomicBool>,
}

struct CloseWhenWrittenHandler {
    written: Arc<AtomicBool>,
}

impl Protocol for CloseWhenWritten {
    type Request = ();
    type Handler = CloseWhenWrittenHandler;

    fn create_connection_handler(&self, connection: &ConnectionHandle) -> CloseWhenWrittenHandler {
        self.handles.lock().unwrap().push(connection.clone());
        CloseWhenWrittenHandler {
            written: Arc::clone(&self.written),
        }
    }

    fn process_request(&self, _connection: &ConnectionHandle, _request: ()) -> Result<()> {
        Ok(())
    }
}

impl ConnectionHandler<CloseWhenWritten> for CloseWhenWrittenHandler {
    fn handle_read(&mut self, _context: &mut ReadContext<'_, CloseWhenWritten>) -> Result<()> {
        Ok(())
    }

    fn handle_idle_connection(&mut self, context: &mut IdleContext<'_>) -> Result<()> {
        if self.written.load(Ordering::SeqCst) {
            context.close();
        }
        Ok(())
    }
}

#[test]
fn cross_thread_write_survives_a_later_close_from_the_loop_thread() {
    init_tracing();

    let protocol = CloseWhenWritten::default();
    let server = ServerBuilder::new()
        .listeners(1)
        .heartbeat_interval(Duration::from_millis(20))
        .build(protocol.clone())
        .expect("build");
    let address = server.bind().expect("bind");

    let mut stream = connect(address);
    assert!(wait_until(|| !protocol.handles.lock().unwrap().is_empty()));
    let handle = protocol.handles.lock().unwrap()[0].clone();

    let written = Arc::clone(&protocol.written);
    let writer = std::thread::spawn(move || {
        handle.write_data(&[WriteBuffer::copy(b"from afar")]);
        written.store(true, Ordering::SeqCst);
    });
    writer.join().expect("writer");

    assert_eq!(read_to_end_string(&mut stream), "from afar");
    server.shutdown().expect("shutdown");
}

/// Queues a large reply, closes, and counts idle ticks seen afterwards.
#[derive(Clone, Default)]
struct SlowDrain {
    idles_after_close: Arc<AtomicUsize>,
}

struct SlowDrainHandler {
    closed: bool,
    idles_after_close: Arc<AtomicUsize>,
}

const SLOW_DRAIN_LEN: usize = 16 * 1024 * 1024;

impl Protocol for SlowDrain {
    type Request = ();
    type Handler = SlowDrainHandler;

    fn create_connection_handler(&self, _connection: &ConnectionHandle) -> SlowDrainHandler {
        SlowDrainHandler {
            closed: false,
            idles_after_close: Arc::clone(&self.idles_after_close),
        }
    }

    fn process_request(&self, _connection: &ConnectionHandle, _request: ()) -> Result<()> {
        Ok(())
    }
}

impl ConnectionHandler<SlowDrain> for SlowDrainHandler {
    fn handle_read(&mut self, context: &mut ReadContext<'_, SlowDrain>) -> Result<()> {
        let payload = Bytes::from(vec![b'z'; SLOW_DRAIN_LEN]);
        context.write_data(&[WriteBuffer::shared(payload)]);
        context.close();
        self.closed = true;
        Ok(())
    }

    fn handle_idle_connection(&mut self, _context: &mut IdleContext<'_>) -> Result<()> {
        if self.closed {
            self.idles_after_close.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

#[test]
fn closing_connection_gets_no_idle_ticks_while_draining() {
    init_tracing();

    let protocol = SlowDrain::default();
    let server = ServerBuilder::new()
        .listeners(1)
        .heartbeat_interval(Duration::from_millis(10))
        .build(protocol.clone())
        .expect("build");
    let address = server.bind().expect("bind");

    let mut stream = connect(address);
    stream.write_all(b"go").expect("write");

    // Leave the reply stuck in full socket buffers across several heartbeats.
    std::thread::sleep(Duration::from_millis(200));

    let mut received = Vec::new();
    stream.read_to_end(&mut received).expect("read_to_end");
    assert_eq!(received.len(), SLOW_DRAIN_LEN);
    assert_eq!(protocol.idles_after_close.load(Ordering::SeqCst), 0);

    server.shutdown().expect("shutdown");
}

/// Replies with the manager's registered total, computed off the loop thread.
#[derive(Clone, Default)]
struct Census {
    manager: Arc<OnceLock<Weak<ConnectionManager<Census>>>>,
}

struct CensusHandler {
    manager: Arc<OnceLock<Weak<ConnectionManager<Census>>>>,
}

impl Protocol for Census {
    type Request = ();
    type Handler = CensusHandler;

    fn create_connection_handler(&self, _connection: &ConnectionHandle) -> CensusHandler {
        CensusHandler {
            manager: Arc::clone(&self.manager),
        }
    }

    fn process_request(&self, _connection: &ConnectionHandle, _request: ()) -> Result<()> {
        Ok(())
    }
}

impl ConnectionHandler<Census> for CensusHandler {
    fn handle_read(&mut self, context: &mut ReadContext<'_, Census>) -> Result<()> {
        let handle = context.connection().clone();
        let manager = Arc::clone(&self.manager);

        std::thread::spawn(move || {
            let Some(manager) = manager.get().and_then(Weak::upgrade) else {
                handle.close();
                return;
            };
            let total: usize = manager.registered_counts().iter().sum();
            let reply = total.to_string();
            handle.write_data(&[WriteBuffer::copy(reply.as_bytes())]);
        });
        Ok(())
    }
}

#[test]
fn handler_work_handed_to_another_thread_can_query_the_manager() {
    init_tracing();

    let protocol = Census::default();
    let server = ServerBuilder::new()
        .listeners(1)
        .build(protocol.clone())
        .expect("build");
    let address = server.bind().expect("bind");
    let manager = server.manager().expect("manager");
    protocol
        .manager
        .set(Arc::downgrade(&manager))
        .expect("manager set once");

    let mut stream = connect(address);
    stream.write_all(b"?").expect("write");
    assert_eq!(read_exact_string(&mut stream, 1), "1");

    server.shutdown().expect("shutdown");
}
