use std::sync::Arc;

use clap::Parser;
use gyre::TcpServer;
use gyre_utils::{ignore_sigpipe, init_tracing};
use tracing::debug;

#[derive(Parser, Debug)]
#[command(about = "Echo server on the gyre reactor")]
struct Args {
    #[arg(long, default_value_t = 8080)]
    port: u16,
    /// Worker loop threads; 0 serves connections on the base loop.
    #[arg(long, default_value_t = 3)]
    threads: usize,
    /// Seconds of silence before a connection is evicted.
    #[arg(long, default_value_t = 10)]
    idle_timeout: u64,
    /// Cores to pin workers to, in spawn order (e.g. --cores 1,2,3).
    #[arg(long, value_delimiter = ',')]
    cores: Vec<usize>,
}

fn main() {
    init_tracing();
    ignore_sigpipe();
    let args = Args::parse();

    let server = TcpServer::bind(args.port).expect("couldn't bind echo server");
    server.set_thread_num(args.threads);
    if !args.cores.is_empty() {
        server.pin_to_cores(args.cores.clone());
    }
    server.enable_idle_release(args.idle_timeout);

    server.set_connected_callback(Arc::new(|conn| {
        debug!(fd = conn.fd(), "client connected");
    }));
    server.set_message_callback(Arc::new(|conn, buf| {
        let data = buf.readable_slice().to_vec();
        buf.advance_read(data.len());
        conn.send(&data);
    }));
    server.set_outer_close_callback(Arc::new(|conn| {
        debug!(fd = conn.fd(), "client disconnected");
    }));

    server.start();
}
