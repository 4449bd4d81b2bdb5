use std::{fs, path::PathBuf, sync::Arc};

use clap::Parser;
use gyre_http::HttpServer;
use gyre_utils::{ignore_sigpipe, init_tracing};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(about = "HTTP server on the gyre reactor")]
struct Args {
    #[arg(long, default_value_t = 8080)]
    port: u16,
    /// Worker loop threads; 0 serves connections on the base loop.
    #[arg(long, default_value_t = 3)]
    threads: usize,
    /// Seconds of silence before a connection is evicted.
    #[arg(long, default_value_t = 10)]
    idle_timeout: u64,
    /// Static file root; also receives PUT uploads.
    #[arg(long, default_value = "./wwwroot")]
    base_dir: PathBuf,
}

fn main() {
    init_tracing();
    ignore_sigpipe();
    let args = Args::parse();

    fs::create_dir_all(&args.base_dir).expect("couldn't create base dir");
    let server = HttpServer::bind(args.port, Some(args.idle_timeout))
        .expect("couldn't bind http server");
    server.set_thread_num(args.threads);
    server.set_base_dir(&args.base_dir);

    server.get(
        "/echo",
        Arc::new(|req, resp| {
            resp.set_body(req.body.clone(), "text/plain");
        }),
    );
    server.get(
        "/home",
        Arc::new(|_req, resp| {
            resp.redirect("/echo", 302);
        }),
    );
    let upload_dir = args.base_dir.clone();
    server.put(
        "/put",
        Arc::new(move |req, resp| {
            let target = upload_dir.join("upload.bin");
            match fs::write(&target, &req.body) {
                Ok(()) => info!(bytes = req.body.len(), path = %target.display(), "upload stored"),
                Err(err) => {
                    warn!(%err, "upload failed");
                    resp.status = 500;
                }
            }
        }),
    );
    server.delete(
        "/delete",
        Arc::new(|req, _resp| {
            info!(path = %req.path, "delete requested");
        }),
    );

    server.start();
}
