use std::{
    io, mem,
    os::fd::{AsRawFd, FromRawFd, OwnedFd},
    sync::{Arc, Mutex, Weak},
    thread::{self, ThreadId},
};

use tracing::trace;

use crate::{
    channel::Channel,
    error::{FatalKind, die},
    poller::Poller,
    timing_wheel::TimingWheel,
};

pub type Task = Box<dyn FnOnce() + Send>;

/// Thread-pinned reactor: blocks on the poller, dispatches ready channels,
/// then drains the cross-thread task queue.
///
/// The owning thread is whichever thread ran [`EventLoop::new`]; the poller,
/// the wheel and task dequeue are only ever touched from it. `run` and the
/// timer surface are safe from any thread because they route through the
/// task queue, waking the poller through an eventfd.
pub struct EventLoop {
    thread_id: ThreadId,
    self_weak: Weak<EventLoop>,
    poller: Mutex<Poller>,
    tasks: Mutex<Vec<Task>>,
    wakeup_fd: OwnedFd,
    wheel: TimingWheel,
    /// Loop-owned channels for the wakeup and timer descriptors. Kept so
    /// they outlive every readiness delivery that names them.
    own_channels: Mutex<Vec<Arc<Channel>>>,
}

impl EventLoop {
    /// Builds a loop owned by the current thread and registers its wakeup
    /// and wheel-clock descriptors. Infrastructure failures here are fatal.
    pub fn new() -> Arc<Self> {
        let ev_loop = Arc::new_cyclic(|self_weak| {
            let poller = match Poller::new() {
                Ok(p) => p,
                Err(err) => die(FatalKind::PollCreate, &err),
            };
            let wakeup_fd = match create_event_fd() {
                Ok(fd) => fd,
                Err(err) => die(FatalKind::WakeupCreate, &err),
            };
            Self {
                thread_id: thread::current().id(),
                self_weak: self_weak.clone(),
                poller: Mutex::new(poller),
                tasks: Mutex::new(Vec::new()),
                wakeup_fd,
                wheel: TimingWheel::new(),
                own_channels: Mutex::new(Vec::new()),
            }
        });
        ev_loop.install_wakeup_channel();
        ev_loop.install_wheel_channel();
        ev_loop
    }

    /// Wait → dispatch → drain, forever. Must run on the owning thread.
    pub fn run_loop(&self) {
        self.assert_in_loop();
        let mut ready = Vec::with_capacity(64);
        loop {
            ready.clear();
            self.poller.lock().unwrap().wait(&mut ready);
            for channel in &ready {
                channel.handle_event();
            }
            self.drain_tasks();
        }
    }

    /// Runs `task` inline when called on the owning thread, otherwise
    /// enqueues it and wakes the loop.
    pub fn run(&self, task: impl FnOnce() + Send + 'static) {
        if self.is_in_loop() {
            task();
        } else {
            self.enqueue(Box::new(task));
        }
    }

    pub fn enqueue(&self, task: Task) {
        self.tasks.lock().unwrap().push(task);
        self.write_wakeup();
    }

    #[inline]
    pub fn is_in_loop(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    pub fn assert_in_loop(&self) {
        assert!(self.is_in_loop(), "called off the owning loop thread");
    }

    /// Forwards an interest change to the poller. Owner thread only.
    pub fn update_interest(&self, channel: &Arc<Channel>) {
        self.assert_in_loop();
        self.poller.lock().unwrap().update(channel);
    }

    /// Deletes a channel from the poller. Owner thread only.
    pub fn remove_interest(&self, channel: &Arc<Channel>) {
        self.assert_in_loop();
        self.poller.lock().unwrap().remove(channel);
    }

    /// Schedules `main` on this loop's wheel, marshaling to the owner.
    pub fn schedule(&self, id: String, timeout: u64, main: impl FnOnce() + Send + 'static) {
        let me = self.shared();
        self.run(move || me.wheel.schedule(id, timeout, main));
    }

    pub fn refresh(&self, id: String) {
        let me = self.shared();
        self.run(move || me.wheel.refresh(&id));
    }

    pub fn cancel(&self, id: String) {
        let me = self.shared();
        self.run(move || me.wheel.cancel(&id));
    }

    /// Unsynchronized wheel membership probe; owner thread only.
    pub fn has_timer(&self, id: &str) -> bool {
        self.assert_in_loop();
        self.wheel.has(id)
    }

    fn drain_tasks(&self) {
        let tasks = mem::take(&mut *self.tasks.lock().unwrap());
        for task in tasks {
            task();
        }
    }

    // Owning handle for closures; the loop is alive whenever this runs.
    fn shared(&self) -> Arc<Self> {
        self.self_weak.upgrade().expect("event loop gone while in use")
    }

    fn install_wakeup_channel(&self) {
        let channel = Channel::new(&self.shared(), self.wakeup_fd.as_raw_fd());
        let weak = self.self_weak.clone();
        channel.set_read_callback(Arc::new(move || {
            if let Some(ev_loop) = weak.upgrade() {
                ev_loop.drain_wakeup();
            }
        }));
        channel.enable_read();
        self.own_channels.lock().unwrap().push(channel);
    }

    fn install_wheel_channel(&self) {
        let channel = Channel::new(&self.shared(), self.wheel.timer_fd());
        let weak = self.self_weak.clone();
        channel.set_read_callback(Arc::new(move || {
            if let Some(ev_loop) = weak.upgrade() {
                ev_loop.wheel.on_tick();
            }
        }));
        channel.enable_read();
        self.own_channels.lock().unwrap().push(channel);
    }

    /// Unblocks the poller: bumps the eventfd counter by one.
    fn write_wakeup(&self) {
        let one: u64 = 1;
        let n = unsafe {
            libc::write(
                self.wakeup_fd.as_raw_fd(),
                std::ptr::from_ref(&one).cast::<libc::c_void>(),
                mem::size_of::<u64>(),
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) {
                return;
            }
            die(FatalKind::WakeupWrite, &err);
        }
    }

    /// Resets the eventfd counter; the value is noise, the edge did the work.
    fn drain_wakeup(&self) {
        let mut count: u64 = 0;
        let n = unsafe {
            libc::read(
                self.wakeup_fd.as_raw_fd(),
                std::ptr::from_mut(&mut count).cast::<libc::c_void>(),
                mem::size_of::<u64>(),
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) {
                return;
            }
            die(FatalKind::WakeupRead, &err);
        }
        trace!(count, "wakeup drained");
    }
}

fn create_event_fd() -> io::Result<OwnedFd> {
    let fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}
