use crate::net::buffer::Buffer;

fn default_phrase(code: u16) -> Option<&'static str> {
    match code {
        200 => Some("OK"),
        400 => Some("Bad Request"),
        403 => Some("Forbidden"),
        404 => Some("Not Found"),
        500 => Some("Internal Server Error"),
        _ => None,
    }
}

/// Materializes one HTTP/1.1 response. Headers keep insertion order with
/// last-write-wins on duplicate keys; `Content-Length` and `Connection` are
/// injected when the response is written out.
pub struct HttpResponse {
    status_code: u16,
    status_message: Option<String>,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
    keep_alive: bool,
}

impl HttpResponse {
    pub fn new() -> HttpResponse {
        HttpResponse {
            status_code: 200,
            status_message: None,
            headers: Vec::new(),
            body: Vec::new(),
            keep_alive: false,
        }
    }

    pub fn reset(&mut self) {
        self.status_code = 200;
        self.status_message = None;
        self.headers.clear();
        self.body.clear();
        self.keep_alive = false;
    }

    #[inline]
    pub fn status_code(&self) -> u16 {
        self.status_code
    }

    #[inline]
    pub fn set_status_code(&mut self, code: u16) {
        self.status_code = code;
    }

    /// Overrides the phrase derived from the status code.
    #[inline]
    pub fn set_status_message(&mut self, message: impl Into<String>) {
        self.status_message = Some(message.into());
    }

    #[inline]
    pub fn is_keep_alive(&self) -> bool {
        self.keep_alive
    }

    #[inline]
    pub fn set_keep_alive(&mut self, on: bool) {
        self.keep_alive = on;
    }

    #[inline]
    pub fn set_content_type(&mut self, content_type: impl Into<String>) {
        self.set_header("Content-Type", content_type);
    }

    pub fn set_header(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.headers.iter_mut().find(|(name, _)| *name == key) {
            Some(entry) => entry.1 = value,
            None => self.headers.push((key, value)),
        }
    }

    #[inline]
    pub fn set_body(&mut self, body: impl Into<Vec<u8>>) {
        self.body = body.into();
    }

    /// Writes status line, headers and body into `buffer`.
    pub fn append_to_buffer(&mut self, buffer: &mut Buffer) {
        self.set_header("Content-Length", self.body.len().to_string());
        let connection = if self.keep_alive { "keep-alive" } else { "close" };
        self.set_header("Connection", connection);

        buffer.append(b"HTTP/1.1 ");
        buffer.append(self.status_code.to_string().as_bytes());
        buffer.append(b" ");
        match &self.status_message {
            Some(message) => buffer.append(message.as_bytes()),
            None => {
                if let Some(phrase) = default_phrase(self.status_code) {
                    buffer.append(phrase.as_bytes());
                }
            }
        }
        buffer.append(b"\r\n");

        for (key, value) in &self.headers {
            buffer.append(key.as_bytes());
            buffer.append(b": ");
            buffer.append(value.as_bytes());
            buffer.append(b"\r\n");
        }

        buffer.append(b"\r\n");
        if !self.body.is_empty() {
            buffer.append(&self.body);
        }
    }
}

impl Default for HttpResponse {
    fn default() -> HttpResponse {
        HttpResponse::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::request::{HttpRequest, ParseResult};

    fn render(response: &mut HttpResponse) -> String {
        let mut buffer = Buffer::new();
        response.append_to_buffer(&mut buffer);
        buffer.retrieve_all_to_string()
    }

    #[test]
    fn test_basic_response_layout() {
        let mut response = HttpResponse::new();
        response.set_keep_alive(true);
        response.set_content_type("text/html; charset=utf-8");
        response.set_body("<html/>");

        let rendered = render(&mut response);
        assert!(rendered.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(rendered.contains("Content-Type: text/html; charset=utf-8\r\n"));
        assert!(rendered.contains("Content-Length: 7\r\n"));
        assert!(rendered.contains("Connection: keep-alive\r\n"));
        assert!(rendered.ends_with("\r\n\r\n<html/>"));
    }

    #[test]
    fn test_default_phrases() {
        for (code, phrase) in &[
            (200u16, "OK"),
            (400, "Bad Request"),
            (403, "Forbidden"),
            (404, "Not Found"),
            (500, "Internal Server Error"),
        ] {
            let mut response = HttpResponse::new();
            response.set_status_code(*code);
            let rendered = render(&mut response);
            assert!(rendered.starts_with(&format!("HTTP/1.1 {} {}\r\n", code, phrase)));
        }
    }

    #[test]
    fn test_caller_phrase_overrides_table() {
        let mut response = HttpResponse::new();
        response.set_status_code(404);
        response.set_status_message("Gone Fishing");
        assert!(render(&mut response).starts_with("HTTP/1.1 404 Gone Fishing\r\n"));
    }

    #[test]
    fn test_duplicate_header_last_write_wins() {
        let mut response = HttpResponse::new();
        response.set_header("X-Stage", "one");
        response.set_header("X-Stage", "two");

        let rendered = render(&mut response);
        assert!(rendered.contains("X-Stage: two\r\n"));
        assert!(!rendered.contains("X-Stage: one"));
    }

    #[test]
    fn test_close_connection_header() {
        let mut response = HttpResponse::new();
        response.set_keep_alive(false);
        assert!(render(&mut response).contains("Connection: close\r\n"));
    }

    #[test]
    fn test_headers_and_body_roundtrip_through_parser() {
        let mut response = HttpResponse::new();
        response.set_keep_alive(true);
        response.set_content_type("application/json");
        response.set_header("X-Marker", "  padded  ");
        response.set_body("{\"ok\":true}");

        let mut rendered = Buffer::new();
        response.append_to_buffer(&mut rendered);

        // Re-frame the emitted header block and body as a request so the
        // incremental parser can validate them.
        let emitted = rendered.retrieve_all_to_bytes();
        let header_start = emitted.windows(2).position(|w| w == b"\r\n").unwrap() + 2;

        let mut buffer = Buffer::new();
        buffer.append(b"POST /roundtrip HTTP/1.1\r\n");
        buffer.append(&emitted[header_start..]);

        let mut request = HttpRequest::new();
        assert_eq!(request.parse(&mut buffer), ParseResult::Complete);
        assert_eq!(request.header("content-type"), Some("application/json"));
        assert_eq!(request.header("x-marker"), Some("padded"));
        assert_eq!(request.header("connection"), Some("keep-alive"));
        assert!(request.is_keep_alive());
        assert_eq!(request.body(), b"{\"ok\":true}");
        assert_eq!(
            request.header("content-length"),
            Some(request.body().len().to_string().as_str())
        );
    }
}
