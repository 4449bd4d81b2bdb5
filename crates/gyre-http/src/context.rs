use std::mem;

use gyre::Buffer;
use tracing::warn;

use crate::{
    percent::percent_decode,
    request::{HttpRequest, Method},
};

/// Upper bound for one request line or header line.
pub const MAX_LINE_SIZE: usize = 8192;

/// Where the parser stands in the current request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParseState {
    RecvLine,
    RecvHeader,
    RecvBody,
    /// A complete request is ready to take.
    RecvOk,
    /// Unrecoverable for this connection; the status code says why.
    RecvError,
}

/// Incremental HTTP/1.x request parser stored in a connection's context
/// slot.
///
/// [`drive`](Self::drive) consumes whatever the input buffer holds and
/// cascades request line → headers → body, stopping wherever the bytes run
/// out; the next readiness resumes from the recorded state. A short body
/// parks the parser in `RecvBody` with no response, leaving eviction to the
/// connection's idle timer.
pub struct HttpContext {
    state: ParseState,
    status: u16,
    request: HttpRequest,
}

impl Default for HttpContext {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpContext {
    pub fn new() -> Self {
        Self { state: ParseState::RecvLine, status: 200, request: HttpRequest::default() }
    }

    pub fn state(&self) -> ParseState {
        self.state
    }

    /// Status the error response should carry when in `RecvError`.
    pub fn response_status(&self) -> u16 {
        self.status
    }

    /// Hands out the parsed request, leaving a pristine one behind.
    pub fn take_request(&mut self) -> HttpRequest {
        mem::take(&mut self.request)
    }

    /// Consumes as much of `buf` as the current request can use.
    pub fn drive(&mut self, buf: &mut Buffer) {
        if self.state == ParseState::RecvLine {
            self.handle_request_line(buf);
        }
        if self.state == ParseState::RecvHeader {
            self.handle_headers(buf);
        }
        if self.state == ParseState::RecvBody {
            self.handle_body(buf);
        }
    }

    /// Ready for the next request on the same connection.
    pub fn reset(&mut self) {
        self.state = ParseState::RecvLine;
        self.status = 200;
        self.request.clear();
    }

    fn fail(&mut self, status: u16) {
        self.status = status;
        self.state = ParseState::RecvError;
    }

    fn handle_request_line(&mut self, buf: &mut Buffer) {
        let Some(line) = buf.read_line() else {
            // Nothing line-shaped yet; a hoarding peer gets cut off.
            if buf.readable() > MAX_LINE_SIZE {
                self.fail(414);
            }
            return;
        };
        if line.len() > MAX_LINE_SIZE {
            self.fail(414);
            return;
        }
        if !self.parse_request_line(&String::from_utf8_lossy(&line)) {
            warn!("malformed request line");
        }
    }

    fn parse_request_line(&mut self, line: &str) -> bool {
        let line = line.trim_end_matches(['\r', '\n']);
        let mut parts = line.split(' ').filter(|p| !p.is_empty());
        let (Some(method), Some(target), Some(version), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            self.fail(400);
            return false;
        };

        let Some(method) = Method::parse(method) else {
            self.fail(400);
            return false;
        };
        if !version.eq_ignore_ascii_case("HTTP/1.1") && !version.eq_ignore_ascii_case("HTTP/1.0") {
            self.fail(400);
            return false;
        }

        let (raw_path, query) = match target.split_once('?') {
            Some((p, q)) => (p, Some(q)),
            None => (target, None),
        };
        if !raw_path.starts_with('/') {
            self.fail(400);
            return false;
        }
        let Some(path) = percent_decode(raw_path) else {
            self.fail(400);
            return false;
        };

        self.request.method = method;
        self.request.path = path;
        self.request.version = version.to_ascii_uppercase();
        if let Some(query) = query {
            for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
                self.request.set_param(key.into_owned(), value.into_owned());
            }
        }

        self.state = ParseState::RecvHeader;
        true
    }

    fn handle_headers(&mut self, buf: &mut Buffer) {
        loop {
            let Some(line) = buf.read_line() else {
                if buf.readable() > MAX_LINE_SIZE {
                    self.fail(431);
                }
                return;
            };
            if line.len() > MAX_LINE_SIZE {
                self.fail(431);
                return;
            }
            if line == b"\r\n" || line == b"\n" {
                self.state = ParseState::RecvBody;
                return;
            }
            if !self.parse_header_line(&String::from_utf8_lossy(&line)) {
                return;
            }
        }
    }

    fn parse_header_line(&mut self, line: &str) -> bool {
        let line = line.trim_end_matches(['\r', '\n']);
        let Some((key, value)) = line.split_once(':') else {
            self.fail(400);
            return false;
        };
        self.request.set_header(key.trim(), value.trim().to_owned());
        true
    }

    fn handle_body(&mut self, buf: &mut Buffer) {
        let content_length = self.request.content_length();
        if content_length <= self.request.body.len() {
            self.state = ParseState::RecvOk;
            return;
        }

        let missing = content_length - self.request.body.len();
        let take = missing.min(buf.readable());
        self.request.body.extend_from_slice(&buf.readable_slice()[..take]);
        buf.advance_read(take);
        if take == missing {
            self.state = ParseState::RecvOk;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn feed(ctx: &mut HttpContext, bytes: &[u8]) {
        let mut buf = Buffer::new();
        buf.write(bytes);
        ctx.drive(&mut buf);
    }

    #[test]
    fn full_get_in_one_shot() {
        let mut ctx = HttpContext::new();
        feed(
            &mut ctx,
            b"GET /echo?a=1&b=hello%20world HTTP/1.1\r\nConnection: keep-alive\r\nContent-Length: 4\r\n\r\nping",
        );
        assert_eq!(ctx.state(), ParseState::RecvOk);
        let req = ctx.take_request();
        assert_eq!(req.method, Method::Get);
        assert_eq!(req.path, "/echo");
        assert_eq!(req.param("a"), Some("1"));
        assert_eq!(req.param("b"), Some("hello world"));
        assert!(req.is_keep_alive());
        assert_eq!(req.body, b"ping");
    }

    #[test]
    fn resumes_across_partial_reads() {
        let mut ctx = HttpContext::new();
        let mut buf = Buffer::new();

        buf.write(b"POST /submit HT");
        ctx.drive(&mut buf);
        assert_eq!(ctx.state(), ParseState::RecvLine);

        buf.write(b"TP/1.1\r\nContent-Length: 6\r\n");
        ctx.drive(&mut buf);
        assert_eq!(ctx.state(), ParseState::RecvHeader);

        buf.write(b"\r\nabc");
        ctx.drive(&mut buf);
        assert_eq!(ctx.state(), ParseState::RecvBody);

        buf.write(b"def");
        ctx.drive(&mut buf);
        assert_eq!(ctx.state(), ParseState::RecvOk);
        assert_eq!(ctx.take_request().body, b"abcdef");
    }

    #[test]
    fn short_body_waits_without_erroring() {
        let mut ctx = HttpContext::new();
        feed(&mut ctx, b"PUT /put HTTP/1.1\r\nContent-Length: 100\r\n\r\nnine byte");
        assert_eq!(ctx.state(), ParseState::RecvBody);
    }

    #[test]
    fn header_keys_are_case_insensitive() {
        let mut ctx = HttpContext::new();
        feed(&mut ctx, b"GET / HTTP/1.1\r\nCONNECTION: keep-alive\r\n\r\n");
        assert_eq!(ctx.state(), ParseState::RecvOk);
        assert!(ctx.take_request().is_keep_alive());
    }

    #[test]
    fn garbage_request_line_is_bad_request() {
        let mut ctx = HttpContext::new();
        feed(&mut ctx, b"FROB /x HTTP/1.1\r\n\r\n");
        assert_eq!(ctx.state(), ParseState::RecvError);
        assert_eq!(ctx.response_status(), 400);
    }

    #[test]
    fn relative_target_is_rejected() {
        let mut ctx = HttpContext::new();
        feed(&mut ctx, b"GET echo HTTP/1.1\r\n\r\n");
        assert_eq!(ctx.state(), ParseState::RecvError);
        assert_eq!(ctx.response_status(), 400);
    }

    #[test]
    fn oversized_line_is_uri_too_long() {
        let mut ctx = HttpContext::new();
        let mut raw = b"GET /".to_vec();
        raw.extend(std::iter::repeat_n(b'a', MAX_LINE_SIZE + 16));
        feed(&mut ctx, &raw);
        assert_eq!(ctx.state(), ParseState::RecvError);
        assert_eq!(ctx.response_status(), 414);
    }

    #[test]
    fn reset_supports_pipelining() {
        let mut ctx = HttpContext::new();
        let mut buf = Buffer::new();
        buf.write(b"GET /a HTTP/1.1\r\n\r\nGET /b HTTP/1.1\r\n\r\n");

        ctx.drive(&mut buf);
        assert_eq!(ctx.state(), ParseState::RecvOk);
        assert_eq!(ctx.take_request().path, "/a");
        ctx.reset();

        ctx.drive(&mut buf);
        assert_eq!(ctx.state(), ParseState::RecvOk);
        assert_eq!(ctx.take_request().path, "/b");
    }
}
