use std::{
    io::{self, Read, Write},
    mem,
    net::SocketAddr,
    os::fd::{AsRawFd, FromRawFd, RawFd},
};

use mio::net::{TcpListener, TcpStream};
use tracing::warn;

pub const DEFAULT_BACKLOG: i32 = 1024;

/// Outcome of one nonblocking transfer attempt.
///
/// `Again` covers EAGAIN/EWOULDBLOCK/EINTR: nothing moved, try on the next
/// readiness. `Gone` covers peer close and every fatal socket error; the
/// caller must tear the connection down.
#[derive(Debug, PartialEq, Eq)]
pub enum IoStatus {
    Transferred(usize),
    Again,
    Gone,
}

/// Nonblocking stream socket owned by one [`Connection`].
///
/// The stream slot empties on [`close`](Self::close) so late handler runs
/// observe `Gone` instead of touching a reused descriptor.
///
/// [`Connection`]: crate::connection::Connection
pub struct Socket {
    stream: Option<TcpStream>,
    fd: RawFd,
}

impl Socket {
    pub fn from_stream(stream: TcpStream) -> Self {
        let fd = stream.as_raw_fd();
        Self { stream: Some(stream), fd }
    }

    #[inline]
    pub fn raw_fd(&self) -> RawFd {
        self.fd
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.stream.as_ref().and_then(|s| s.peer_addr().ok())
    }

    /// One nonblocking read into `buf`.
    pub fn recv(&mut self, buf: &mut [u8]) -> IoStatus {
        let Some(stream) = self.stream.as_mut() else {
            return IoStatus::Gone;
        };
        match stream.read(buf) {
            Ok(0) => IoStatus::Gone,
            Ok(n) => IoStatus::Transferred(n),
            Err(ref e) if retriable(e) => IoStatus::Again,
            Err(err) => {
                warn!(%err, "socket recv failed");
                IoStatus::Gone
            }
        }
    }

    /// One nonblocking write of `buf`.
    pub fn send(&mut self, buf: &[u8]) -> IoStatus {
        if buf.is_empty() {
            return IoStatus::Transferred(0);
        }
        let Some(stream) = self.stream.as_mut() else {
            return IoStatus::Gone;
        };
        match stream.write(buf) {
            Ok(0) => IoStatus::Gone,
            Ok(n) => IoStatus::Transferred(n),
            Err(ref e) if retriable(e) => IoStatus::Again,
            Err(err) => {
                warn!(%err, "socket send failed");
                IoStatus::Gone
            }
        }
    }

    /// Shuts both directions down and drops the stream.
    ///
    /// The descriptor must already be out of the poller: closing releases the
    /// fd number for reuse.
    pub fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
    }
}

fn retriable(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted)
}

/// Creates a nonblocking listener with `SO_REUSEADDR` and `SO_REUSEPORT` set
/// before bind, backlog [`DEFAULT_BACKLOG`].
///
/// Reuse options must precede bind, which rules out the stock listener
/// constructors; the socket is assembled through libc instead.
pub fn bind_listener(port: u16) -> io::Result<TcpListener> {
    unsafe {
        let fd = libc::socket(
            libc::AF_INET,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        );
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }

        let one: libc::c_int = 1;
        for opt in [libc::SO_REUSEADDR, libc::SO_REUSEPORT] {
            if libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                opt,
                std::ptr::from_ref(&one).cast::<libc::c_void>(),
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            ) < 0
            {
                let err = io::Error::last_os_error();
                libc::close(fd);
                return Err(err);
            }
        }

        let addr = libc::sockaddr_in {
            sin_family: libc::AF_INET as libc::sa_family_t,
            sin_port: port.to_be(),
            sin_addr: libc::in_addr { s_addr: libc::INADDR_ANY },
            sin_zero: [0; 8],
        };
        if libc::bind(
            fd,
            std::ptr::from_ref(&addr).cast::<libc::sockaddr>(),
            mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        ) < 0
        {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err);
        }
        if libc::listen(fd, DEFAULT_BACKLOG) < 0 {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err);
        }

        Ok(TcpListener::from_std(std::net::TcpListener::from_raw_fd(fd)))
    }
}
