use std::{
    io,
    net::SocketAddr,
    os::fd::AsRawFd,
    sync::{Arc, Mutex, Weak},
};

use mio::net::{TcpListener, TcpStream};
use tracing::warn;

use crate::{channel::Channel, error::SetupError, event_loop::EventLoop};

pub type AcceptCallback = Arc<dyn Fn(TcpStream, SocketAddr) + Send + Sync>;

/// Listening socket bound to the base loop.
///
/// Only produces raw accepted streams; building connections out of them is
/// the server's job. Accept errors are logged and accepting continues.
pub struct Acceptor {
    listener: Mutex<TcpListener>,
    channel: Arc<Channel>,
    on_accept: Mutex<Option<AcceptCallback>>,
}

impl Acceptor {
    /// Binds the listening socket (reuse-addr + reuse-port, backlog 1024)
    /// and wires its channel to `ev_loop`. Interest stays off until
    /// [`listen`](Self::listen).
    pub fn bind(ev_loop: &Arc<EventLoop>, port: u16) -> Result<Arc<Self>, SetupError> {
        let listener = crate::socket::bind_listener(port)
            .map_err(|source| SetupError::Bind { port, source })?;
        let channel = Channel::new(ev_loop, listener.as_raw_fd());

        let acceptor = Arc::new(Self {
            listener: Mutex::new(listener),
            channel: Arc::clone(&channel),
            on_accept: Mutex::new(None),
        });

        let weak: Weak<Self> = Arc::downgrade(&acceptor);
        channel.set_read_callback(Arc::new(move || {
            if let Some(acceptor) = weak.upgrade() {
                acceptor.handle_accept();
            }
        }));

        Ok(acceptor)
    }

    pub fn set_accept_callback(&self, cb: AcceptCallback) {
        *self.on_accept.lock().unwrap() = Some(cb);
    }

    /// Enables accept readiness. Loop-thread only (first registration).
    pub fn listen(&self) {
        self.channel.enable_read();
    }

    /// Drains the accept queue. Edge-triggered readiness means every pending
    /// connection must be taken before returning.
    fn handle_accept(&self) {
        let cb = self.on_accept.lock().unwrap().clone();
        loop {
            let accepted = self.listener.lock().unwrap().accept();
            match accepted {
                Ok((stream, addr)) => {
                    if let Some(cb) = &cb {
                        cb(stream, addr);
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => {
                    warn!(%err, "accept failed");
                    break;
                }
            }
        }
    }
}
