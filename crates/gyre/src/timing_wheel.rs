use std::{
    collections::HashMap,
    io, mem,
    os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd},
    sync::{
        Arc, Mutex, Weak,
        atomic::{AtomicBool, Ordering},
    },
};

use crate::error::{FatalKind, die};

/// Slot count; one slot per second of horizon. Timeouts must be strictly
/// smaller.
pub const WHEEL_SLOTS: usize = 60;

type TimerFn = Box<dyn FnOnce() + Send>;
type TimerIndex = Arc<Mutex<HashMap<String, Weak<TimerEntry>>>>;

/// One scheduled task, expiry driven by reference-count destruction.
///
/// Strong refs live only in wheel slots; when the last one drops with the
/// bucket, the main closure runs (unless canceled) and the id leaves the
/// index. Cancelation never digs the entry out of its slots, it just makes
/// the eventual drop silent.
struct TimerEntry {
    id: String,
    timeout: u64,
    canceled: AtomicBool,
    main: Mutex<Option<TimerFn>>,
    index: TimerIndex,
}

impl Drop for TimerEntry {
    fn drop(&mut self) {
        if !self.canceled.load(Ordering::Acquire) {
            if let Some(main) = self.main.lock().unwrap().take() {
                main();
            }
        }
        self.index.lock().unwrap().remove(&self.id);
    }
}

struct Rotor {
    tick: usize,
    buckets: Vec<Vec<Arc<TimerEntry>>>,
}

/// Hashed-hierarchical-lite timing wheel driven by a 1 Hz kernel timer.
///
/// All mutation happens on the owning loop's thread; the loop marshals for
/// callers. Buckets are drained out of the rotor lock before entries drop so
/// expiry bodies may re-enter the wheel to cancel.
pub struct TimingWheel {
    timer_fd: OwnedFd,
    rotor: Mutex<Rotor>,
    index: TimerIndex,
}

impl TimingWheel {
    /// Creates the wheel and arms its periodic 1 s timer descriptor.
    /// Timer-fd creation failure is fatal.
    pub fn new() -> Self {
        let timer_fd = match create_timer_fd() {
            Ok(fd) => fd,
            Err(err) => die(FatalKind::TimerCreate, &err),
        };
        Self {
            timer_fd,
            rotor: Mutex::new(Rotor {
                tick: 0,
                buckets: (0..WHEEL_SLOTS).map(|_| Vec::new()).collect(),
            }),
            index: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    #[inline]
    pub fn timer_fd(&self) -> RawFd {
        self.timer_fd.as_raw_fd()
    }

    /// Readiness handler for the timer descriptor: one kernel read yields
    /// the elapsed tick count, the cursor advances that many times.
    pub fn on_tick(&self) {
        let elapsed = self.read_timer_fd();
        self.advance(elapsed);
    }

    /// Advances the cursor `ticks` times, expiring each slot it lands on.
    pub fn advance(&self, ticks: u64) {
        for _ in 0..ticks {
            let expired = {
                let mut rotor = self.rotor.lock().unwrap();
                rotor.tick = (rotor.tick + 1) % WHEEL_SLOTS;
                let tick = rotor.tick;
                mem::take(&mut rotor.buckets[tick])
            };
            // Dropping outside the lock: entries fire here, FIFO per slot.
            drop(expired);
        }
    }

    /// Schedules `main` to run `timeout` ticks from now under `id`.
    ///
    /// An id already present keeps its original task, matching refresh
    /// semantics where the first registration owns the timeout.
    pub fn schedule(&self, id: String, timeout: u64, main: impl FnOnce() + Send + 'static) {
        assert!(
            (timeout as usize) < WHEEL_SLOTS,
            "timeout {timeout} outside wheel horizon"
        );
        let entry = Arc::new(TimerEntry {
            id: id.clone(),
            timeout,
            canceled: AtomicBool::new(false),
            main: Mutex::new(Some(Box::new(main))),
            index: Arc::clone(&self.index),
        });
        {
            let mut rotor = self.rotor.lock().unwrap();
            let slot = (rotor.tick + timeout as usize) % WHEEL_SLOTS;
            rotor.buckets[slot].push(Arc::clone(&entry));
        }
        self.index.lock().unwrap().entry(id).or_insert_with(|| Arc::downgrade(&entry));
    }

    /// Extends a live task's lifetime by its original timeout.
    pub fn refresh(&self, id: &str) {
        let entry = {
            let index = self.index.lock().unwrap();
            index.get(id).and_then(Weak::upgrade)
        };
        let Some(entry) = entry else {
            return;
        };
        let mut rotor = self.rotor.lock().unwrap();
        let slot = (rotor.tick + entry.timeout as usize) % WHEEL_SLOTS;
        rotor.buckets[slot].push(entry);
    }

    /// Flags a live task so its eventual drop skips the main closure.
    pub fn cancel(&self, id: &str) {
        let entry = {
            let index = self.index.lock().unwrap();
            index.get(id).and_then(Weak::upgrade)
        };
        if let Some(entry) = entry {
            entry.canceled.store(true, Ordering::Release);
        }
    }

    /// Owner-thread-only membership check.
    pub fn has(&self, id: &str) -> bool {
        self.index.lock().unwrap().contains_key(id)
    }

    fn read_timer_fd(&self) -> u64 {
        let mut elapsed: u64 = 0;
        let n = unsafe {
            libc::read(
                self.timer_fd.as_raw_fd(),
                std::ptr::from_mut(&mut elapsed).cast::<libc::c_void>(),
                mem::size_of::<u64>(),
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if matches!(
                err.kind(),
                io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
            ) {
                return 0;
            }
            die(FatalKind::TimerRead, &err);
        }
        elapsed
    }
}

impl Default for TimingWheel {
    fn default() -> Self {
        Self::new()
    }
}

fn create_timer_fd() -> io::Result<OwnedFd> {
    unsafe {
        let fd = libc::timerfd_create(libc::CLOCK_MONOTONIC, libc::TFD_CLOEXEC | libc::TFD_NONBLOCK);
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let second = libc::timespec { tv_sec: 1, tv_nsec: 0 };
        let spec = libc::itimerspec { it_interval: second, it_value: second };
        if libc::timerfd_settime(fd, 0, &spec, std::ptr::null_mut()) < 0 {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err);
        }
        Ok(OwnedFd::from_raw_fd(fd))
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    fn recorder(log: &Arc<Mutex<Vec<&'static str>>>, tag: &'static str) -> impl FnOnce() + Send + use<> {
        let log = Arc::clone(log);
        move || log.lock().unwrap().push(tag)
    }

    #[test]
    fn fires_after_timeout_ticks() {
        let wheel = TimingWheel::new();
        let fired = Arc::new(AtomicBool::new(false));
        let f = Arc::clone(&fired);
        wheel.schedule("t".into(), 3, move || f.store(true, Ordering::SeqCst));

        wheel.advance(2);
        assert!(!fired.load(Ordering::SeqCst));
        wheel.advance(1);
        assert!(fired.load(Ordering::SeqCst));
        assert!(!wheel.has("t"));
    }

    #[test]
    fn slot_order_is_fifo() {
        let wheel = TimingWheel::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        wheel.schedule("a".into(), 5, recorder(&log, "a"));
        wheel.schedule("b".into(), 5, recorder(&log, "b"));
        wheel.advance(5);
        assert_eq!(*log.lock().unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn refresh_postpones_by_original_timeout() {
        let wheel = TimingWheel::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        wheel.schedule("a".into(), 5, recorder(&log, "a"));
        wheel.schedule("b".into(), 5, recorder(&log, "b"));

        wheel.advance(4);
        wheel.refresh("a");
        wheel.advance(1);
        assert_eq!(*log.lock().unwrap(), vec!["b"]);
        wheel.advance(4);
        assert_eq!(*log.lock().unwrap(), vec!["b", "a"]);
    }

    #[test]
    fn cancel_suppresses_main_but_releases_id() {
        let wheel = TimingWheel::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        wheel.schedule("t".into(), 2, move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        wheel.cancel("t");
        wheel.advance(2);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert!(!wheel.has("t"));
    }

    #[test]
    fn expiry_body_may_cancel_another_task() {
        let wheel = Arc::new(TimingWheel::new());
        let w = Arc::clone(&wheel);
        let victim_ran = Arc::new(AtomicBool::new(false));
        let v = Arc::clone(&victim_ran);
        wheel.schedule("victim".into(), 3, move || v.store(true, Ordering::SeqCst));
        wheel.schedule("killer".into(), 1, move || w.cancel("victim"));

        wheel.advance(3);
        assert!(!victim_ran.load(Ordering::SeqCst));
    }

    #[test]
    #[should_panic(expected = "outside wheel horizon")]
    fn timeout_must_fit_the_horizon() {
        let wheel = TimingWheel::new();
        wheel.schedule("t".into(), WHEEL_SLOTS as u64, || {});
    }
}
