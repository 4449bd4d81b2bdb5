use std::{
    sync::{
        Arc, Condvar, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
};

use gyre_utils::thread_boot;

use crate::event_loop::EventLoop;

struct LoopSlot {
    ev_loop: Mutex<Option<Arc<EventLoop>>>,
    ready: Condvar,
}

/// One worker thread hosting one [`EventLoop`].
///
/// The loop must be constructed on the thread that drives it (thread
/// affinity is recorded at construction), so the spawned thread builds it
/// and publishes the handle through a condvar-guarded slot. Workers never
/// terminate; the process exits around them.
pub struct LoopThread {
    slot: Arc<LoopSlot>,
}

impl LoopThread {
    pub fn spawn(core: Option<usize>) -> Self {
        let slot = Arc::new(LoopSlot { ev_loop: Mutex::new(None), ready: Condvar::new() });
        let published = Arc::clone(&slot);
        thread::Builder::new()
            .name("gyre-loop".into())
            .spawn(move || {
                thread_boot(core);
                let ev_loop = EventLoop::new();
                {
                    let mut guard = published.ev_loop.lock().unwrap();
                    *guard = Some(Arc::clone(&ev_loop));
                    published.ready.notify_all();
                }
                ev_loop.run_loop();
            })
            .expect("couldn't spawn loop thread");
        Self { slot }
    }

    /// Blocks until the worker has published its loop.
    pub fn event_loop(&self) -> Arc<EventLoop> {
        let mut guard = self.slot.ev_loop.lock().unwrap();
        while guard.is_none() {
            guard = self.slot.ready.wait(guard).unwrap();
        }
        Arc::clone(guard.as_ref().unwrap())
    }
}

/// Fixed-size set of worker loops with round-robin handout.
pub struct LoopThreadPool {
    base_loop: Arc<EventLoop>,
    thread_num: usize,
    cores: Option<Vec<usize>>,
    threads: Vec<LoopThread>,
    loops: Vec<Arc<EventLoop>>,
    next: AtomicUsize,
}

impl LoopThreadPool {
    pub fn new(base_loop: Arc<EventLoop>) -> Self {
        Self {
            base_loop,
            thread_num: 0,
            cores: None,
            threads: Vec::new(),
            loops: Vec::new(),
            next: AtomicUsize::new(0),
        }
    }

    /// Worker count; must be set before [`start`](Self::start).
    pub fn set_thread_num(&mut self, num: usize) {
        self.thread_num = num;
    }

    /// Optional core assignment, one entry per worker in spawn order.
    pub fn pin_to_cores(&mut self, cores: Vec<usize>) {
        self.cores = Some(cores);
    }

    pub fn start(&mut self) {
        for i in 0..self.thread_num {
            let core = self.cores.as_ref().and_then(|cores| cores.get(i).copied());
            let thread = LoopThread::spawn(core);
            self.loops.push(thread.event_loop());
            self.threads.push(thread);
        }
    }

    /// Round-robin worker pick; the base loop itself when no workers exist.
    pub fn next_loop(&self) -> Arc<EventLoop> {
        if self.loops.is_empty() {
            return Arc::clone(&self.base_loop);
        }
        let i = self.next.fetch_add(1, Ordering::Relaxed) % self.loops.len();
        Arc::clone(&self.loops[i])
    }
}
