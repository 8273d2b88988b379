//! Socket-level plumbing: binding the listening socket and configuring
//! accepted ones.

use crate::config::ServerConfig;

use libc::{SO_LINGER, SO_RCVBUF, SO_SNDBUF, SOL_SOCKET, c_int, c_void, linger, socklen_t};
use mio::net::{TcpListener, TcpStream};
use std::io;
use std::mem;
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};

/// An accepted, non-blocking socket that has not yet been adopted by a listener.
#[derive(Debug)]
pub struct AcceptedSocket {
    pub(crate) stream: TcpStream,
    pub(crate) peer_addr: SocketAddr,
}

impl AcceptedSocket {
    /// Wraps a socket accepted by the accepter.
    pub(crate) fn new(stream: TcpStream, peer_addr: SocketAddr) -> Self {
        Self { stream, peer_addr }
    }

    /// Wraps an already connected standard library stream.
    ///
    /// The stream is switched to non-blocking mode.
    ///
    /// # Returns
    /// The wrapped socket, or an I/O error if the peer address cannot be read
    pub fn from_std(stream: std::net::TcpStream) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        let peer_addr = stream.peer_addr()?;

        Ok(Self {
            stream: TcpStream::from_std(stream),
            peer_addr,
        })
    }

    /// Address of the remote peer.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }
}

/// Socket options applied to every accepted connection.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SocketOptions {
    send_buffer_size: usize,
    receive_buffer_size: usize,
}

impl SocketOptions {
    pub(crate) fn from_config(config: &ServerConfig) -> Self {
        Self {
            send_buffer_size: config.send_buffer_size,
            receive_buffer_size: config.receive_buffer_size,
        }
    }

    /// Disables Nagle and linger and applies the configured buffer sizes.
    pub(crate) fn apply(&self, stream: &TcpStream) -> io::Result<()> {
        stream.set_nodelay(true)?;

        let file_descriptor = stream.as_raw_fd();
        let no_linger = linger {
            l_onoff: 0,
            l_linger: 0,
        };
        set_option(file_descriptor, SO_LINGER, &no_linger)?;

        if self.send_buffer_size > 0 {
            set_option(file_descriptor, SO_SNDBUF, &clamp(self.send_buffer_size))?;
        }
        if self.receive_buffer_size > 0 {
            set_option(file_descriptor, SO_RCVBUF, &clamp(self.receive_buffer_size))?;
        }

        Ok(())
    }
}

/// Binds a non-blocking listening socket with the given backlog.
///
/// The standard library binds with `SO_REUSEADDR` and a fixed backlog; the
/// socket is then put back into `listen(2)` with the configured backlog,
/// which updates the queue length in place.
///
/// # Arguments
/// * `address` - Address to bind to
/// * `backlog` - Length of the pending connection queue
pub(crate) fn bind_listener(address: SocketAddr, backlog: u32) -> io::Result<TcpListener> {
    let listener = std::net::TcpListener::bind(address)?;
    listener.set_nonblocking(true)?;

    let ret = unsafe { libc::listen(listener.as_raw_fd(), clamp(backlog as usize)) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(TcpListener::from_std(listener))
}

fn set_option<T>(file_descriptor: RawFd, name: c_int, value: &T) -> io::Result<()> {
    let ret = unsafe {
        libc::setsockopt(
            file_descriptor,
            SOL_SOCKET,
            name,
            value as *const T as *const c_void,
            mem::size_of::<T>() as socklen_t,
        )
    };

    if ret < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(())
}

fn clamp(value: usize) -> c_int {
    value.min(c_int::MAX as usize) as c_int
}
