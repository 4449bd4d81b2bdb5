use std::{
    any::Any,
    mem,
    os::fd::RawFd,
    sync::{
        Arc, Mutex, Weak,
        atomic::{AtomicBool, AtomicU8, Ordering},
    },
};

use tracing::{debug, trace};

use crate::{
    buffer::Buffer,
    channel::Channel,
    event_loop::EventLoop,
    socket::{IoStatus, Socket},
};

/// Per-readiness recv scratch size.
const READ_CHUNK: usize = 64 * 1024;

/// Connection lifecycle, strictly monotone toward `Disconnected`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ConnStatus {
    Connecting = 0,
    Connected = 1,
    /// Shut down requested while the output buffer still drains.
    Disconnecting = 2,
    Disconnected = 3,
}

impl ConnStatus {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Connecting,
            1 => Self::Connected,
            2 => Self::Disconnecting,
            _ => Self::Disconnected,
        }
    }
}

pub type ConnCallback = Arc<dyn Fn(&Arc<Connection>) + Send + Sync>;
pub type MessageCallback = Arc<dyn Fn(&Arc<Connection>, &mut Buffer) + Send + Sync>;

#[derive(Clone, Default)]
struct UserCallbacks {
    connected: Option<ConnCallback>,
    message: Option<MessageCallback>,
    outer_close: Option<ConnCallback>,
    any_event: Option<ConnCallback>,
    inner_close: Option<ConnCallback>,
}

/// Callback set swapped in by [`Connection::switch_protocol`]. The inner
/// close callback is server plumbing and survives protocol switches.
#[derive(Clone, Default)]
pub struct ProtocolCallbacks {
    pub connected: Option<ConnCallback>,
    pub message: Option<MessageCallback>,
    pub outer_close: Option<ConnCallback>,
    pub any_event: Option<ConnCallback>,
}

struct ConnIo {
    socket: Socket,
    input: Buffer,
    output: Buffer,
}

/// One accepted client: channel, byte pipelines, protocol slot, lifecycle.
///
/// Every public mutator marshals its body onto the owning loop, so state is
/// only ever touched from that thread; the mutexes exist to make the handle
/// shareable, not to arbitrate races. The channel's closures hold a strong
/// handle back to the connection — `release` clears them to break the cycle.
///
/// The io lock is never held across a user callback. Message delivery checks
/// the input buffer out, runs the callback, and merges the unread remainder
/// back, so a callback may reenter `send`/`shutdown` freely.
pub struct Connection {
    id: String,
    fd: RawFd,
    self_weak: Weak<Connection>,
    ev_loop: Arc<EventLoop>,
    channel: Arc<Channel>,
    status: AtomicU8,
    idle_release: AtomicBool,
    io: Mutex<ConnIo>,
    context: Mutex<Option<Box<dyn Any + Send>>>,
    callbacks: Mutex<UserCallbacks>,
}

impl Connection {
    /// Wires a freshly accepted socket to `ev_loop`. Read interest stays off
    /// until [`establish`](Self::establish) so the idle timer exists before
    /// the first readiness can try to refresh it.
    pub fn new(ev_loop: Arc<EventLoop>, id: String, socket: Socket) -> Arc<Self> {
        let fd = socket.raw_fd();
        let channel = Channel::new(&ev_loop, fd);
        let conn = Arc::new_cyclic(|self_weak| Self {
            id,
            fd,
            self_weak: self_weak.clone(),
            ev_loop,
            channel: Arc::clone(&channel),
            status: AtomicU8::new(ConnStatus::Connecting as u8),
            idle_release: AtomicBool::new(false),
            io: Mutex::new(ConnIo { socket, input: Buffer::new(), output: Buffer::new() }),
            context: Mutex::new(None),
            callbacks: Mutex::new(UserCallbacks::default()),
        });

        // Strong handles on purpose: the channel keeps the connection alive
        // until release clears these slots.
        let hook = |f: fn(&Connection)| {
            let me = Arc::clone(&conn);
            Arc::new(move || f(&me)) as Arc<dyn Fn() + Send + Sync>
        };
        channel.set_read_callback(hook(Self::on_read));
        channel.set_write_callback(hook(Self::on_write));
        channel.set_close_callback(hook(Self::on_close));
        channel.set_error_callback(hook(Self::on_error));
        channel.set_any_callback(hook(Self::on_any));

        conn
    }

    #[inline]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn status(&self) -> ConnStatus {
        ConnStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub fn event_loop(&self) -> &Arc<EventLoop> {
        &self.ev_loop
    }

    pub fn set_connected_callback(&self, cb: ConnCallback) {
        self.callbacks.lock().unwrap().connected = Some(cb);
    }

    pub fn set_message_callback(&self, cb: MessageCallback) {
        self.callbacks.lock().unwrap().message = Some(cb);
    }

    pub fn set_outer_close_callback(&self, cb: ConnCallback) {
        self.callbacks.lock().unwrap().outer_close = Some(cb);
    }

    pub fn set_any_event_callback(&self, cb: ConnCallback) {
        self.callbacks.lock().unwrap().any_event = Some(cb);
    }

    pub fn set_inner_close_callback(&self, cb: ConnCallback) {
        self.callbacks.lock().unwrap().inner_close = Some(cb);
    }

    /// Stores an opaque protocol context on the connection.
    pub fn set_context(&self, context: Box<dyn Any + Send>) {
        *self.context.lock().unwrap() = Some(context);
    }

    /// Runs `f` over the protocol context slot. The caller that attached the
    /// value is the one downcasting, so no type metadata is kept here.
    pub fn with_context<R>(&self, f: impl FnOnce(&mut Option<Box<dyn Any + Send>>) -> R) -> R {
        f(&mut self.context.lock().unwrap())
    }

    /// Completes the handshake: Connecting → Connected, read interest on,
    /// user connected callback.
    pub fn establish(&self) {
        let me = self.shared();
        self.ev_loop.run(move || me.establish_in_loop());
    }

    /// Queues `data` for delivery. Bytes are staged into an owned buffer
    /// before marshaling so the caller's slice may die immediately.
    pub fn send(&self, data: &[u8]) {
        let mut staged = Buffer::new();
        staged.write(data);
        let me = self.shared();
        self.ev_loop.run(move || me.send_in_loop(&staged));
    }

    /// Begins an orderly close: residual input is delivered, pending output
    /// drains, then the connection releases.
    pub fn shutdown(&self) {
        let me = self.shared();
        self.ev_loop.run(move || me.shutdown_in_loop());
    }

    /// Arms (or re-arms) the idle eviction timer at `timeout` ticks.
    pub fn enable_idle_release(&self, timeout: u64) {
        let me = self.shared();
        self.ev_loop.run(move || me.enable_idle_in_loop(timeout));
    }

    pub fn disable_idle_release(&self) {
        let me = self.shared();
        self.ev_loop.run(move || me.disable_idle_in_loop());
    }

    /// Atomically swaps the protocol context and the user callback set.
    /// Loop-thread only: a half-switched parser must never see bytes.
    pub fn switch_protocol(&self, context: Box<dyn Any + Send>, callbacks: ProtocolCallbacks) {
        self.ev_loop.assert_in_loop();
        let me = self.shared();
        self.ev_loop.run(move || {
            *me.context.lock().unwrap() = Some(context);
            let mut cbs = me.callbacks.lock().unwrap();
            cbs.connected = callbacks.connected;
            cbs.message = callbacks.message;
            cbs.outer_close = callbacks.outer_close;
            cbs.any_event = callbacks.any_event;
        });
    }

    /// Tears the connection down now, regardless of buffered data.
    pub fn release(&self) {
        let me = self.shared();
        self.ev_loop.run(move || me.release_in_loop());
    }

    // Owning handle for marshaled closures and callback invocations. Live
    // for as long as anything can call us: handlers clone the channel hooks.
    fn shared(&self) -> Arc<Self> {
        self.self_weak.upgrade().expect("connection used after last handle dropped")
    }

    // Monotone status advance; never moves backward.
    fn raise_status(&self, to: ConnStatus) -> ConnStatus {
        ConnStatus::from_u8(self.status.fetch_max(to as u8, Ordering::AcqRel))
    }

    fn establish_in_loop(&self) {
        let prev = self.raise_status(ConnStatus::Connected);
        assert_eq!(prev, ConnStatus::Connecting, "establish on a live connection");
        self.channel.enable_read();
        let cb = self.callbacks.lock().unwrap().connected.clone();
        if let Some(cb) = cb {
            cb(&self.shared());
        }
    }

    fn send_in_loop(&self, staged: &Buffer) {
        if self.status() == ConnStatus::Disconnected {
            return;
        }
        self.io.lock().unwrap().output.write(staged.readable_slice());
        if !self.channel.is_writing() {
            self.channel.enable_write();
        }
    }

    fn shutdown_in_loop(&self) {
        if self.status() == ConnStatus::Disconnected {
            return;
        }
        self.raise_status(ConnStatus::Disconnecting);
        self.deliver_input();
        let pending = self.io.lock().unwrap().output.readable() > 0;
        if pending {
            if !self.channel.is_writing() {
                self.channel.enable_write();
            }
            // Drained-or-error in on_write finishes the release.
            return;
        }
        self.release_in_loop();
    }

    fn enable_idle_in_loop(&self, timeout: u64) {
        self.idle_release.store(true, Ordering::Release);
        if self.ev_loop.has_timer(&self.id) {
            self.ev_loop.refresh(self.id.clone());
        } else {
            let me = self.shared();
            self.ev_loop.schedule(self.id.clone(), timeout, move || me.release());
        }
    }

    fn disable_idle_in_loop(&self) {
        self.idle_release.store(false, Ordering::Release);
        self.ev_loop.cancel(self.id.clone());
    }

    /// Terminal teardown. Channel callbacks are cleared first so the cycle
    /// through the closures breaks and no further dispatch reaches us; the
    /// outer close callback runs before the inner one so the user sees the
    /// handle while the registry still holds it.
    fn release_in_loop(&self) {
        if self.raise_status(ConnStatus::Disconnected) == ConnStatus::Disconnected {
            return;
        }
        let peer = self.io.lock().unwrap().socket.peer_addr();
        debug!(fd = self.fd, id = %self.id, ?peer, "releasing connection");

        self.channel.clear_callbacks();
        self.channel.disable_all();
        self.channel.remove();
        self.io.lock().unwrap().socket.close();

        if self.idle_release.load(Ordering::Acquire) && self.ev_loop.has_timer(&self.id) {
            self.disable_idle_in_loop();
        }

        let (outer, inner) = {
            let cbs = self.callbacks.lock().unwrap();
            (cbs.outer_close.clone(), cbs.inner_close.clone())
        };
        let me = self.shared();
        if let Some(cb) = outer {
            cb(&me);
        }
        if let Some(cb) = inner {
            cb(&me);
        }
    }

    fn on_read(&self) {
        let status = self.status();
        if status == ConnStatus::Disconnected || status == ConnStatus::Disconnecting {
            return;
        }

        let mut gone = false;
        {
            let mut io = self.io.lock().unwrap();
            let mut chunk = [0u8; READ_CHUNK];
            // Edge-triggered poller: drain until the kernel runs dry.
            loop {
                match io.socket.recv(&mut chunk) {
                    IoStatus::Transferred(n) => {
                        trace!(fd = self.fd, n, "recv");
                        io.input.write(&chunk[..n]);
                    }
                    IoStatus::Again => break,
                    IoStatus::Gone => {
                        gone = true;
                        break;
                    }
                }
            }
        }

        if gone {
            self.shutdown_in_loop();
            return;
        }
        self.deliver_input();
    }

    fn on_write(&self) {
        if self.status() == ConnStatus::Disconnected {
            return;
        }

        let mut gone = false;
        let mut drained = false;
        {
            let mut io = self.io.lock().unwrap();
            loop {
                if io.output.readable() == 0 {
                    drained = true;
                    break;
                }
                let ConnIo { socket, output, .. } = &mut *io;
                match socket.send(output.readable_slice()) {
                    IoStatus::Transferred(n) => output.advance_read(n),
                    IoStatus::Again => break,
                    IoStatus::Gone => {
                        gone = true;
                        break;
                    }
                }
            }
        }

        if gone {
            // Flush whatever the peer already sent to the user, then drop.
            self.deliver_input();
            self.release_in_loop();
            return;
        }
        if drained {
            self.channel.disable_write();
            if self.status() == ConnStatus::Disconnecting {
                self.release_in_loop();
            }
        }
    }

    fn on_close(&self) {
        self.deliver_input();
        self.release_in_loop();
    }

    fn on_error(&self) {
        self.on_close();
    }

    fn on_any(&self) {
        if self.status() == ConnStatus::Disconnected {
            return;
        }
        if self.idle_release.load(Ordering::Acquire) {
            self.ev_loop.refresh(self.id.clone());
        }
        let cb = self.callbacks.lock().unwrap().any_event.clone();
        if let Some(cb) = cb {
            cb(&self.shared());
        }
    }

    /// Checks the input buffer out, hands it to the message callback, and
    /// merges the unread tail back afterwards.
    fn deliver_input(&self) {
        let mut input = {
            let mut io = self.io.lock().unwrap();
            if io.input.readable() == 0 {
                return;
            }
            mem::take(&mut io.input)
        };
        let cb = self.callbacks.lock().unwrap().message.clone();
        if let Some(cb) = cb {
            cb(&self.shared(), &mut input);
        }
        if input.readable() > 0 {
            let mut io = self.io.lock().unwrap();
            // Single-threaded access: nothing refilled the slot while the
            // buffer was checked out.
            debug_assert_eq!(io.input.readable(), 0);
            io.input = input;
        }
    }
}
