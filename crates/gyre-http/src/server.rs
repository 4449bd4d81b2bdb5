use std::{
    fs,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use gyre::{Buffer, Connection, SetupError, TcpServer};
use tracing::{debug, info, warn};

use crate::{
    context::{HttpContext, ParseState},
    request::{HttpRequest, Method},
    response::HttpResponse,
    tables::{mime_for_ext, status_reason},
};

const DEFAULT_IDLE_TIMEOUT: u64 = 10;

pub type Handler = Arc<dyn Fn(&HttpRequest, &mut HttpResponse) + Send + Sync>;

#[derive(Default)]
struct Routes {
    get: Vec<(String, Handler)>,
    post: Vec<(String, Handler)>,
    put: Vec<(String, Handler)>,
    delete: Vec<(String, Handler)>,
}

struct HttpState {
    routes: Mutex<Routes>,
    base_dir: Mutex<Option<PathBuf>>,
}

/// HTTP/1.x layer over [`TcpServer`].
///
/// Routing is method-keyed exact matching on the decoded path, with HEAD
/// riding the GET table. When a base dir is set, GET/HEAD requests that
/// resolve to a regular file under it are served statically before the
/// tables are consulted. Keep-alive follows the request's `Connection`
/// header; error responses always close.
pub struct HttpServer {
    server: TcpServer,
    state: Arc<HttpState>,
}

impl HttpServer {
    pub fn bind(port: u16, idle_timeout: Option<u64>) -> Result<Self, SetupError> {
        let server = TcpServer::bind(port)?;
        server.enable_idle_release(idle_timeout.unwrap_or(DEFAULT_IDLE_TIMEOUT));

        let state = Arc::new(HttpState {
            routes: Mutex::new(Routes::default()),
            base_dir: Mutex::new(None),
        });

        server.set_connected_callback(Arc::new(|conn| {
            debug!(fd = conn.fd(), "http client connected");
            conn.set_context(Box::new(HttpContext::new()));
        }));
        let st = Arc::clone(&state);
        server.set_message_callback(Arc::new(move |conn, buf| on_message(&st, conn, buf)));
        server.set_outer_close_callback(Arc::new(|conn| {
            debug!(fd = conn.fd(), "http client closed");
        }));

        Ok(Self { server, state })
    }

    /// Root for static file serving; must be an existing directory.
    pub fn set_base_dir(&self, dir: impl Into<PathBuf>) {
        let dir = dir.into();
        assert!(dir.is_dir(), "base dir {} is not a directory", dir.display());
        *self.state.base_dir.lock().unwrap() = Some(dir);
    }

    pub fn get(&self, path: impl Into<String>, handler: Handler) {
        self.state.routes.lock().unwrap().get.push((path.into(), handler));
    }

    pub fn post(&self, path: impl Into<String>, handler: Handler) {
        self.state.routes.lock().unwrap().post.push((path.into(), handler));
    }

    pub fn put(&self, path: impl Into<String>, handler: Handler) {
        self.state.routes.lock().unwrap().put.push((path.into(), handler));
    }

    pub fn delete(&self, path: impl Into<String>, handler: Handler) {
        self.state.routes.lock().unwrap().delete.push((path.into(), handler));
    }

    pub fn set_thread_num(&self, num: usize) {
        self.server.set_thread_num(num);
    }

    /// Spawns workers and parks the calling thread in the base loop.
    pub fn start(&self) {
        info!("http server starting");
        self.server.start();
    }
}

enum Outcome {
    Incomplete,
    Ready(HttpRequest),
    Error(u16),
}

fn on_message(state: &Arc<HttpState>, conn: &Arc<Connection>, buf: &mut Buffer) {
    while buf.readable() > 0 {
        let outcome = conn.with_context(|slot| {
            let ctx = slot
                .as_mut()
                .and_then(|any| any.downcast_mut::<HttpContext>())
                .expect("connection carries no http context");
            ctx.drive(buf);
            match ctx.state() {
                ParseState::RecvError => {
                    let status = ctx.response_status();
                    ctx.reset();
                    Outcome::Error(status)
                }
                ParseState::RecvOk => {
                    let request = ctx.take_request();
                    ctx.reset();
                    Outcome::Ready(request)
                }
                _ => Outcome::Incomplete,
            }
        });

        match outcome {
            Outcome::Incomplete => return,
            Outcome::Error(status) => {
                let request = HttpRequest::default();
                let mut response = HttpResponse::new(status);
                fill_error_body(state, &mut response);
                send_response(conn, &request, &mut response, false);
                // The stream is unparseable from here on.
                buf.advance_read(buf.readable());
                conn.shutdown();
                return;
            }
            Outcome::Ready(request) => {
                let mut response = HttpResponse::new(200);
                route(state, &request, &mut response);
                if response.status >= 400 && response.body.is_empty() {
                    fill_error_body(state, &mut response);
                }
                let keep_alive = request.is_keep_alive();
                send_response(conn, &request, &mut response, keep_alive);
                if !keep_alive {
                    conn.shutdown();
                    return;
                }
            }
        }
    }
}

fn route(state: &Arc<HttpState>, request: &HttpRequest, response: &mut HttpResponse) {
    if serve_static(state, request, response) {
        return;
    }

    let routes = state.routes.lock().unwrap();
    let table = match request.method {
        Method::Get | Method::Head => &routes.get,
        Method::Post => &routes.post,
        Method::Put => &routes.put,
        Method::Delete => &routes.delete,
        _ => {
            response.status = 405;
            return;
        }
    };
    match table.iter().find(|(path, _)| *path == request.path) {
        Some((_, handler)) => handler(request, response),
        None => response.status = 404,
    }
}

/// Serves `request` from the base dir when it names a regular file there.
/// Returns false to fall through to the dynamic tables.
fn serve_static(state: &Arc<HttpState>, request: &HttpRequest, response: &mut HttpResponse) -> bool {
    if !matches!(request.method, Method::Get | Method::Head) {
        return false;
    }
    let base_dir = state.base_dir.lock().unwrap().clone();
    let Some(base_dir) = base_dir else {
        return false;
    };
    if !is_contained_path(&request.path) {
        return false;
    }

    let real_path = resolve_static_path(&base_dir, &request.path);
    if !real_path.is_file() {
        return false;
    }

    match fs::read(&real_path) {
        Ok(body) => {
            let ext = real_path.extension().and_then(|e| e.to_str()).unwrap_or("");
            response.set_body(body, mime_for_ext(ext));
            true
        }
        Err(err) => {
            warn!(%err, path = %real_path.display(), "static read failed");
            false
        }
    }
}

fn resolve_static_path(base_dir: &Path, req_path: &str) -> PathBuf {
    let mut real = base_dir.join(req_path.trim_start_matches('/'));
    if req_path.ends_with('/') {
        real = real.join("index.html");
    }
    real
}

/// Rejects targets whose `..` segments would climb out of the base dir.
fn is_contained_path(path: &str) -> bool {
    let mut depth: i32 = 0;
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                depth -= 1;
                if depth < 0 {
                    return false;
                }
            }
            _ => depth += 1,
        }
    }
    true
}

/// 404-and-friends body: `404.html` from the base dir when present, else a
/// minimal generated page.
fn fill_error_body(state: &Arc<HttpState>, response: &mut HttpResponse) {
    let fallback = state
        .base_dir
        .lock()
        .unwrap()
        .as_ref()
        .and_then(|dir| fs::read(dir.join("404.html")).ok());
    let body = fallback.unwrap_or_else(|| {
        format!(
            "<html><head><meta http-equiv='Content-Type' \
             content='text/html;charset=utf-8'></head>\
             <body><h1>{}</h1><p>{}</p></body></html>",
            response.status,
            status_reason(response.status)
        )
        .into_bytes()
    });
    response.set_body(body, "text/html");
}

fn send_response(
    conn: &Arc<Connection>,
    request: &HttpRequest,
    response: &mut HttpResponse,
    keep_alive: bool,
) {
    response.set_header("Connection", if keep_alive { "keep-alive" } else { "close" });
    if !response.body.is_empty() {
        if !response.has_header("Content-Length") {
            response.set_header("Content-Length", response.body.len().to_string());
        }
        if !response.has_header("Content-Type") {
            response.set_header("Content-Type", mime_for_ext(""));
        }
    }
    if let Some(url) = response.redirect_url() {
        let url = url.to_owned();
        response.set_header("Location", url);
    }

    conn.send(&response.serialize(&request.version));
}
