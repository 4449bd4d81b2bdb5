use std::collections::HashMap;

use crate::tables::status_reason;

/// Response under construction by a route handler.
///
/// Serialized shape: `version SP status SP reason CRLF (header CRLF)* CRLF
/// body`. `Connection`, `Content-Length` and `Content-Type` defaults are
/// filled by the server right before serialization when the handler left
/// them out.
#[derive(Clone, Debug)]
pub struct HttpResponse {
    pub status: u16,
    headers: HashMap<String, String>,
    pub body: Vec<u8>,
    redirect: Option<String>,
}

impl Default for HttpResponse {
    fn default() -> Self {
        Self::new(200)
    }
}

impl HttpResponse {
    pub fn new(status: u16) -> Self {
        Self { status, headers: HashMap::new(), body: Vec::new(), redirect: None }
    }

    pub fn set_header(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.headers.insert(key.into(), value.into());
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    pub fn has_header(&self, key: &str) -> bool {
        self.headers.contains_key(key)
    }

    /// Sets the body and its content type in one go.
    pub fn set_body(&mut self, body: impl Into<Vec<u8>>, content_type: &str) {
        self.body = body.into();
        self.set_header("Content-Type", content_type);
    }

    /// Turns the response into a redirect to `url`.
    pub fn redirect(&mut self, url: impl Into<String>, status: u16) {
        self.status = status;
        self.redirect = Some(url.into());
    }

    pub fn redirect_url(&self) -> Option<&str> {
        self.redirect.as_deref()
    }

    pub fn is_keep_alive(&self) -> bool {
        self.header("Connection").is_some_and(|v| v.eq_ignore_ascii_case("keep-alive"))
    }

    pub fn serialize(&self, version: &str) -> Vec<u8> {
        let mut out = Vec::with_capacity(128 + self.body.len());
        out.extend_from_slice(
            format!("{version} {} {}\r\n", self.status, status_reason(self.status)).as_bytes(),
        );
        for (key, value) in &self.headers {
            out.extend_from_slice(format!("{key}: {value}\r\n").as_bytes());
        }
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&self.body);
        out
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn serialized_shape() {
        let mut resp = HttpResponse::new(200);
        resp.set_body("ping", "text/plain");
        resp.set_header("Content-Length", "4");
        let bytes = resp.serialize("HTTP/1.1");
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Content-Type: text/plain\r\n"));
        assert!(text.contains("Content-Length: 4\r\n"));
        assert!(text.ends_with("\r\n\r\nping"));
    }

    #[test]
    fn unknown_status_still_serializes() {
        let resp = HttpResponse::new(599);
        let text = String::from_utf8(resp.serialize("HTTP/1.1")).unwrap();
        assert!(text.starts_with("HTTP/1.1 599 "));
    }
}
