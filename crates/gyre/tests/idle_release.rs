use std::{
    io::{Read, Write},
    net::TcpStream,
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use gyre::TcpServer;

fn spawn_echo_with_idle(port: u16, idle_timeout: u64) {
    thread::spawn(move || {
        let server = TcpServer::bind(port).expect("bind echo server");
        server.set_thread_num(2);
        server.enable_idle_release(idle_timeout);
        server.set_message_callback(Arc::new(|conn, buf| {
            let data = buf.readable_slice().to_vec();
            buf.advance_read(data.len());
            conn.send(&data);
        }));
        server.start();
    });
}

fn connect(port: u16) -> TcpStream {
    for _ in 0..100 {
        if let Ok(stream) = TcpStream::connect(("127.0.0.1", port)) {
            return stream;
        }
        thread::sleep(Duration::from_millis(20));
    }
    panic!("server on port {port} never came up");
}

/// Blocks until the server closes the connection; returns how long it took.
fn wait_for_eof(stream: &mut TcpStream, limit: Duration) -> Duration {
    stream.set_read_timeout(Some(limit)).unwrap();
    let start = Instant::now();
    let mut sink = [0u8; 256];
    loop {
        match stream.read(&mut sink) {
            Ok(0) => return start.elapsed(),
            Ok(_) => {}
            Err(err) => panic!("expected eof, got {err}"),
        }
    }
}

#[test]
fn silent_connection_is_evicted() {
    spawn_echo_with_idle(24741, 2);
    let mut stream = connect(24741);

    stream.write_all(b"ping").unwrap();
    let mut got = [0u8; 4];
    stream.read_exact(&mut got).unwrap();
    assert_eq!(&got, b"ping");

    let waited = wait_for_eof(&mut stream, Duration::from_secs(10));
    // Tick granularity is one second; eviction is never immediate.
    assert!(waited >= Duration::from_millis(500), "evicted too early: {waited:?}");
}

#[test]
fn traffic_postpones_eviction() {
    spawn_echo_with_idle(24742, 2);
    let mut stream = connect(24742);
    stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();

    // 4.2 s of chatter on a 2 s idle budget: every exchange refreshes the
    // timer, so the connection must survive the whole run.
    for i in 0..7 {
        thread::sleep(Duration::from_millis(600));
        let msg = format!("still here {i}");
        stream.write_all(msg.as_bytes()).unwrap();
        let mut got = vec![0u8; msg.len()];
        stream.read_exact(&mut got).unwrap();
        assert_eq!(got, msg.as_bytes());
    }

    // Silence afterwards lets the eviction land.
    wait_for_eof(&mut stream, Duration::from_secs(10));
}
