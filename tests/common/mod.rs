#![allow(dead_code)]

use muxio::{
    ConnectionHandle, ConnectionHandler, IdleContext, Protocol, ReadContext, Result, WriteBuffer,
    WriteContext,
};

use std::io::Read;
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Polls `condition` every few milliseconds for up to five seconds.
pub fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

pub fn connect(address: SocketAddr) -> TcpStream {
    let stream = TcpStream::connect(address).expect("connect");
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .expect("read timeout");
    stream
}

pub fn read_exact_string(stream: &mut TcpStream, len: usize) -> String {
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).expect("read_exact");
    String::from_utf8(buf).expect("utf8")
}

pub fn read_to_end_string(stream: &mut TcpStream) -> String {
    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).expect("read_to_end");
    String::from_utf8(buf).expect("utf8")
}

/// Writes back every chunk it reads.
pub struct Echo;

pub struct EchoHandler;

impl Protocol for Echo {
    type Request = ();
    type Handler = EchoHandler;

    fn create_connection_handler(&self, _connection: &ConnectionHandle) -> EchoHandler {
        EchoHandler
    }

    fn process_request(&self, _connection: &ConnectionHandle, _request: ()) -> Result<()> {
        Ok(())
    }
}

impl ConnectionHandler<Echo> for EchoHandler {
    fn handle_read(&mut self, context: &mut ReadContext<'_, Echo>) -> Result<()> {
        let data = context.data();
        context.write_data(&[WriteBuffer::copy(data)]);
        Ok(())
    }
}

/// Per-connection hook counts.
#[derive(Default)]
pub struct Counters {
    pub reads: AtomicUsize,
    pub writes: AtomicUsize,
    pub idles: AtomicUsize,
}

impl Counters {
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn idles(&self) -> usize {
        self.idles.load(Ordering::SeqCst)
    }
}

/// Echoes through `process_request` and records every connection it serves.
#[derive(Clone, Default)]
pub struct Tally {
    connections: Arc<Mutex<Vec<(ConnectionHandle, Arc<Counters>)>>>,
    requests: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl Tally {
    /// Waits until `count` connections were adopted and returns them in order.
    pub fn wait_for_connections(&self, count: usize) -> Vec<(ConnectionHandle, Arc<Counters>)> {
        assert!(
            wait_until(|| self.connections.lock().unwrap().len() >= count),
            "expected {count} connections"
        );
        self.connections.lock().unwrap().clone()
    }

    pub fn requests(&self) -> Vec<Vec<u8>> {
        self.requests.lock().unwrap().clone()
    }
}

pub struct TallyHandler {
    counters: Arc<Counters>,
}

impl Protocol for Tally {
    type Request = Vec<u8>;
    type Handler = TallyHandler;

    fn create_connection_handler(&self, connection: &ConnectionHandle) -> TallyHandler {
        let counters = Arc::new(Counters::default());
        self.connections
            .lock()
            .unwrap()
            .push((connection.clone(), Arc::clone(&counters)));
        TallyHandler { counters }
    }

    fn process_request(&self, _connection: &ConnectionHandle, request: Vec<u8>) -> Result<()> {
        self.requests.lock().unwrap().push(request);
        Ok(())
    }
}

impl ConnectionHandler<Tally> for TallyHandler {
    fn handle_read(&mut self, context: &mut ReadContext<'_, Tally>) -> Result<()> {
        self.counters.reads.fetch_add(1, Ordering::SeqCst);
        let data = context.data();
        context.write_data(&[WriteBuffer::copy(data)]);
        context.process_request(data.to_vec())
    }

    fn handle_write(&mut self, _context: &mut WriteContext<'_>) -> Result<()> {
        self.counters.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn handle_idle_connection(&mut self, _context: &mut IdleContext<'_>) -> Result<()> {
        self.counters.idles.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
