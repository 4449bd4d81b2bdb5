use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{Arc, Mutex, Weak},
};

use gyre_utils::mint_id;
use mio::net::TcpStream;
use tracing::{debug, info};

use crate::{
    acceptor::Acceptor,
    connection::{ConnCallback, Connection, MessageCallback},
    error::SetupError,
    event_loop::EventLoop,
    loop_thread::LoopThreadPool,
    socket::Socket,
};

#[derive(Clone, Default)]
struct UserCallbacks {
    connected: Option<ConnCallback>,
    message: Option<MessageCallback>,
    outer_close: Option<ConnCallback>,
    any_event: Option<ConnCallback>,
}

struct ServerInner {
    base_loop: Arc<EventLoop>,
    acceptor: Arc<Acceptor>,
    pool: Mutex<LoopThreadPool>,
    /// Registry of live connections, keyed by id. Owned by the base loop:
    /// insertion happens on accept, erasure is posted there by inner close.
    conns: Mutex<HashMap<String, Arc<Connection>>>,
    callbacks: Mutex<UserCallbacks>,
    idle_timeout: Mutex<Option<u64>>,
}

/// Lifecycle glue: acceptor on the base loop, a pool of worker loops, the
/// connection registry and the user callback surface.
///
/// `start` never returns; worker threads have no shutdown path and live
/// until process exit.
pub struct TcpServer {
    inner: Arc<ServerInner>,
}

impl TcpServer {
    pub fn bind(port: u16) -> Result<Self, SetupError> {
        let base_loop = EventLoop::new();
        let acceptor = Acceptor::bind(&base_loop, port)?;
        let pool = LoopThreadPool::new(Arc::clone(&base_loop));

        let inner = Arc::new(ServerInner {
            base_loop,
            acceptor: Arc::clone(&acceptor),
            pool: Mutex::new(pool),
            conns: Mutex::new(HashMap::new()),
            callbacks: Mutex::new(UserCallbacks::default()),
            idle_timeout: Mutex::new(None),
        });

        let weak: Weak<ServerInner> = Arc::downgrade(&inner);
        acceptor.set_accept_callback(Arc::new(move |stream, addr| {
            if let Some(inner) = weak.upgrade() {
                handle_accept(&inner, stream, addr);
            }
        }));

        info!(port, "server bound");
        Ok(Self { inner })
    }

    /// Worker count; call before [`start`](Self::start).
    pub fn set_thread_num(&self, num: usize) {
        self.inner.pool.lock().unwrap().set_thread_num(num);
    }

    /// Pins workers to cores, one entry per worker in spawn order; call
    /// before [`start`](Self::start). Pinning is best-effort.
    pub fn pin_to_cores(&self, cores: Vec<usize>) {
        self.inner.pool.lock().unwrap().pin_to_cores(cores);
    }

    /// Evict connections idle for `timeout` seconds.
    pub fn enable_idle_release(&self, timeout: u64) {
        *self.inner.idle_timeout.lock().unwrap() = Some(timeout);
    }

    pub fn set_connected_callback(&self, cb: ConnCallback) {
        self.inner.callbacks.lock().unwrap().connected = Some(cb);
    }

    pub fn set_message_callback(&self, cb: MessageCallback) {
        self.inner.callbacks.lock().unwrap().message = Some(cb);
    }

    pub fn set_outer_close_callback(&self, cb: ConnCallback) {
        self.inner.callbacks.lock().unwrap().outer_close = Some(cb);
    }

    pub fn set_any_event_callback(&self, cb: ConnCallback) {
        self.inner.callbacks.lock().unwrap().any_event = Some(cb);
    }

    /// Schedules `task` on the base loop's wheel, `timeout` ticks out, under
    /// a fresh id.
    pub fn run_task(&self, task: impl FnOnce() + Send + 'static, timeout: u64) {
        self.inner.base_loop.schedule(mint_id(), timeout, task);
    }

    /// Spawns the workers, opens the accept gate and parks this thread in
    /// the base loop forever.
    pub fn start(&self) {
        self.inner.pool.lock().unwrap().start();
        self.inner.acceptor.listen();
        self.inner.base_loop.run_loop();
    }
}

/// Runs on the base loop per accepted stream: mint an id, pick a worker,
/// assemble the connection, hand it its callbacks, register it, establish.
fn handle_accept(inner: &Arc<ServerInner>, stream: TcpStream, addr: SocketAddr) {
    let id = mint_id();
    let worker = inner.pool.lock().unwrap().next_loop();
    let conn = Connection::new(worker, id.clone(), Socket::from_stream(stream));
    debug!(%addr, fd = conn.fd(), id = %id, "client connected");

    {
        let cbs = inner.callbacks.lock().unwrap();
        if let Some(cb) = &cbs.connected {
            conn.set_connected_callback(Arc::clone(cb));
        }
        if let Some(cb) = &cbs.message {
            conn.set_message_callback(Arc::clone(cb));
        }
        if let Some(cb) = &cbs.outer_close {
            conn.set_outer_close_callback(Arc::clone(cb));
        }
        if let Some(cb) = &cbs.any_event {
            conn.set_any_event_callback(Arc::clone(cb));
        }
    }

    // Registry erasure must happen on the base loop, which owns the map.
    let weak: Weak<ServerInner> = Arc::downgrade(inner);
    conn.set_inner_close_callback(Arc::new(move |conn| {
        let Some(inner) = weak.upgrade() else {
            return;
        };
        let id = conn.id().to_owned();
        let target = Arc::clone(&inner);
        inner.base_loop.run(move || {
            target.conns.lock().unwrap().remove(&id);
        });
    }));

    if let Some(timeout) = *inner.idle_timeout.lock().unwrap() {
        conn.enable_idle_release(timeout);
    }
    conn.establish();

    inner.conns.lock().unwrap().insert(id, conn);
}
