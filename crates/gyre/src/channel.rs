use std::{
    os::fd::RawFd,
    sync::{Arc, Mutex, Weak},
};

use bitflags::bitflags;
use mio::event::Event;

use crate::event_loop::EventLoop;

bitflags! {
    /// Interest and readiness bits for one descriptor.
    ///
    /// Only `READABLE` and `WRITABLE` are ever requested; the rest arrive
    /// unsolicited from the demultiplexer.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct EventSet: u8 {
        const READABLE = 1 << 0;
        const WRITABLE = 1 << 1;
        const ERROR    = 1 << 2;
        const HUP      = 1 << 3;
        const READ_HUP = 1 << 4;
        const PRIORITY = 1 << 5;
    }
}

impl EventSet {
    pub(crate) fn from_mio(event: &Event) -> Self {
        let mut set = Self::empty();
        if event.is_readable() {
            set |= Self::READABLE;
        }
        if event.is_writable() {
            set |= Self::WRITABLE;
        }
        if event.is_error() {
            set |= Self::ERROR;
        }
        if event.is_read_closed() {
            set |= Self::READ_HUP;
        }
        if event.is_read_closed() && event.is_write_closed() {
            set |= Self::HUP;
        }
        if event.is_priority() {
            set |= Self::PRIORITY;
        }
        set
    }
}

pub type EventCallback = Arc<dyn Fn() + Send + Sync>;

#[derive(Clone, Default)]
struct Callbacks {
    read: Option<EventCallback>,
    write: Option<EventCallback>,
    error: Option<EventCallback>,
    close: Option<EventCallback>,
    any: Option<EventCallback>,
}

/// Binding between one descriptor and its readiness callbacks.
///
/// The owner of the fd constructs the channel, wires callbacks, then toggles
/// interest; every interest change is forwarded to the owning loop's poller.
/// Callback slots hold shared closures so dispatch can run them without
/// keeping the slot lock, which lets a handler clear or replace callbacks
/// reentrantly (release does exactly that).
pub struct Channel {
    fd: RawFd,
    self_weak: Weak<Channel>,
    ev_loop: Weak<EventLoop>,
    interest: Mutex<EventSet>,
    ready: Mutex<EventSet>,
    callbacks: Mutex<Callbacks>,
}

impl Channel {
    pub fn new(ev_loop: &Arc<EventLoop>, fd: RawFd) -> Arc<Self> {
        Arc::new_cyclic(|self_weak| Self {
            fd,
            self_weak: self_weak.clone(),
            ev_loop: Arc::downgrade(ev_loop),
            interest: Mutex::new(EventSet::empty()),
            ready: Mutex::new(EventSet::empty()),
            callbacks: Mutex::new(Callbacks::default()),
        })
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn set_read_callback(&self, cb: EventCallback) {
        self.callbacks.lock().unwrap().read = Some(cb);
    }

    pub fn set_write_callback(&self, cb: EventCallback) {
        self.callbacks.lock().unwrap().write = Some(cb);
    }

    pub fn set_error_callback(&self, cb: EventCallback) {
        self.callbacks.lock().unwrap().error = Some(cb);
    }

    pub fn set_close_callback(&self, cb: EventCallback) {
        self.callbacks.lock().unwrap().close = Some(cb);
    }

    pub fn set_any_callback(&self, cb: EventCallback) {
        self.callbacks.lock().unwrap().any = Some(cb);
    }

    /// Drops every callback closure. Breaks the ownership cycle between a
    /// connection and its channel at teardown.
    pub fn clear_callbacks(&self) {
        *self.callbacks.lock().unwrap() = Callbacks::default();
    }

    pub fn is_reading(&self) -> bool {
        self.interest.lock().unwrap().contains(EventSet::READABLE)
    }

    pub fn is_writing(&self) -> bool {
        self.interest.lock().unwrap().contains(EventSet::WRITABLE)
    }

    pub fn enable_read(&self) {
        self.interest.lock().unwrap().insert(EventSet::READABLE);
        self.update();
    }

    pub fn enable_write(&self) {
        self.interest.lock().unwrap().insert(EventSet::WRITABLE);
        self.update();
    }

    pub fn disable_read(&self) {
        self.interest.lock().unwrap().remove(EventSet::READABLE);
        self.update();
    }

    pub fn disable_write(&self) {
        self.interest.lock().unwrap().remove(EventSet::WRITABLE);
        self.update();
    }

    pub fn disable_all(&self) {
        *self.interest.lock().unwrap() = EventSet::empty();
        self.update();
    }

    /// Deletes the descriptor from the owning loop's poller.
    pub fn remove(&self) {
        let (Some(ev_loop), Some(me)) = (self.ev_loop.upgrade(), self.self_weak.upgrade()) else {
            return;
        };
        ev_loop.remove_interest(&me);
    }

    pub fn interest_set(&self) -> EventSet {
        *self.interest.lock().unwrap()
    }

    pub(crate) fn set_ready(&self, ready: EventSet) {
        *self.ready.lock().unwrap() = ready;
    }

    /// Dispatches the ready set to the callbacks.
    ///
    /// Order: read-ish (readable, read hang-up, priority) before write,
    /// error only when neither fired, hang-up always checked last. `on_any`
    /// follows read/write but precedes error/close.
    pub fn handle_event(&self) {
        let ready = *self.ready.lock().unwrap();
        let cbs = self.callbacks.lock().unwrap().clone();

        if ready.intersects(EventSet::READABLE | EventSet::READ_HUP | EventSet::PRIORITY) {
            if let Some(cb) = &cbs.read {
                cb();
            }
            if let Some(cb) = &cbs.any {
                cb();
            }
        } else if ready.contains(EventSet::WRITABLE) {
            if let Some(cb) = &cbs.write {
                cb();
            }
            if let Some(cb) = &cbs.any {
                cb();
            }
        } else if ready.contains(EventSet::ERROR) {
            if let Some(cb) = &cbs.any {
                cb();
            }
            if let Some(cb) = &cbs.error {
                cb();
            }
        }

        if ready.contains(EventSet::HUP) {
            if let Some(cb) = &cbs.any {
                cb();
            }
            if let Some(cb) = &cbs.close {
                cb();
            }
        }
    }

    fn update(&self) {
        let (Some(ev_loop), Some(me)) = (self.ev_loop.upgrade(), self.self_weak.upgrade()) else {
            return;
        };
        ev_loop.update_interest(&me);
    }
}
