use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
        mpsc,
    },
    thread,
    time::{Duration, Instant},
};

use gyre::LoopThread;

fn wait_until(deadline: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    cond()
}

#[test]
fn cross_thread_tasks_run_once_in_enqueue_order() {
    let lt = LoopThread::spawn(None);
    let ev = lt.event_loop();

    let log = Arc::new(Mutex::new(Vec::new()));
    for i in 0..10 {
        let log = Arc::clone(&log);
        ev.run(move || log.lock().unwrap().push(i));
    }

    assert!(wait_until(Duration::from_secs(5), || log.lock().unwrap().len() == 10));
    assert_eq!(*log.lock().unwrap(), (0..10).collect::<Vec<_>>());
}

#[test]
fn run_from_owner_thread_is_inline_and_synchronous() {
    let lt = LoopThread::spawn(None);
    let ev = lt.event_loop();
    let (tx, rx) = mpsc::channel();

    let inner_loop = Arc::clone(&ev);
    ev.run(move || {
        // Already on the owner: the nested run must have completed before
        // the outer task continues.
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        inner_loop.run(move || flag.store(true, Ordering::SeqCst));
        tx.send(ran.load(Ordering::SeqCst)).unwrap();
    });

    assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
}

#[test]
fn thread_identity_is_visible() {
    let lt = LoopThread::spawn(None);
    let ev = lt.event_loop();
    assert!(!ev.is_in_loop());

    let (tx, rx) = mpsc::channel();
    let probe = Arc::clone(&ev);
    ev.run(move || {
        probe.assert_in_loop();
        tx.send(probe.is_in_loop()).unwrap();
    });
    assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
}

#[test]
fn wheel_timer_fires_on_the_kernel_clock() {
    let lt = LoopThread::spawn(None);
    let ev = lt.event_loop();

    let fired = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&fired);
    ev.schedule("tick".into(), 1, move || flag.store(true, Ordering::SeqCst));

    assert!(wait_until(Duration::from_secs(5), || fired.load(Ordering::SeqCst)));
}

#[test]
fn canceled_timer_stays_silent() {
    let lt = LoopThread::spawn(None);
    let ev = lt.event_loop();

    let fired = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&fired);
    ev.schedule("doomed".into(), 2, move || flag.store(true, Ordering::SeqCst));
    ev.cancel("doomed".into());

    thread::sleep(Duration::from_secs(4));
    assert!(!fired.load(Ordering::SeqCst));
}

#[test]
fn refresh_postpones_expiry() {
    let lt = LoopThread::spawn(None);
    let ev = lt.event_loop();

    let fired = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&fired);
    ev.schedule("slide".into(), 2, move || flag.store(true, Ordering::SeqCst));

    // A 2-tick task left alone fires within 2 s; refreshing twice a second
    // keeps pushing the deadline out, so 4 s of refreshes must stay silent.
    for _ in 0..8 {
        thread::sleep(Duration::from_millis(500));
        ev.refresh("slide".into());
        assert!(!fired.load(Ordering::SeqCst), "timer fired despite refreshes");
    }

    assert!(wait_until(Duration::from_secs(6), || fired.load(Ordering::SeqCst)));
}
