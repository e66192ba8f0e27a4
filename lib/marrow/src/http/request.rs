use crate::net::buffer::Buffer;
use hashbrown::HashMap;

/// Requests larger than this are rejected outright.
const MAX_CONTENT_LENGTH: usize = 1 << 30;

/// Outcome of one parser invocation against the input buffer.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ParseResult {
    /// The buffer holds an incomplete request; feed more bytes.
    NeedMore,
    /// One full request is available; the parser stays at `Finish` until
    /// reset.
    Complete,
    /// The request is malformed; respond 400 and close.
    BadRequest,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum ParseState {
    RequestLine,
    Headers,
    Body,
    Finish,
}

/// Incremental HTTP/1.1 request parser. Tolerates arbitrary TCP segmentation:
/// each call resumes where the previous one stopped, consuming only complete
/// lines (and, in the body, only the bytes the declared length still owes).
pub struct HttpRequest {
    method: String,
    path: String,
    version: String,
    headers: HashMap<String, String>,
    body: Vec<u8>,
    keep_alive: bool,
    state: ParseState,
    content_length: usize,
}

impl HttpRequest {
    pub fn new() -> HttpRequest {
        HttpRequest {
            method: String::new(),
            path: String::new(),
            version: String::new(),
            headers: HashMap::new(),
            body: Vec::new(),
            keep_alive: false,
            state: ParseState::RequestLine,
            content_length: 0,
        }
    }

    /// Returns the request to its construction state so the value can be
    /// reused for the next request on a keep-alive connection.
    pub fn reset(&mut self) {
        self.method.clear();
        self.path.clear();
        self.version.clear();
        self.headers.clear();
        self.body.clear();
        self.keep_alive = false;
        self.state = ParseState::RequestLine;
        self.content_length = 0;
    }

    #[inline]
    pub fn method(&self) -> &str {
        &self.method
    }

    #[inline]
    pub fn path(&self) -> &str {
        &self.path
    }

    #[inline]
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Header lookup by lowercased key.
    #[inline]
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    #[inline]
    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    #[inline]
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    #[inline]
    pub fn take_body(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.body)
    }

    #[inline]
    pub fn is_keep_alive(&self) -> bool {
        self.keep_alive
    }

    #[inline]
    pub fn content_length(&self) -> usize {
        self.content_length
    }

    /// Drives the state machine as far as the buffered bytes allow.
    pub fn parse(&mut self, buffer: &mut Buffer) -> ParseResult {
        while self.state != ParseState::Finish {
            if self.state == ParseState::Body {
                if self.body.len() == self.content_length {
                    self.state = ParseState::Finish;
                    break;
                }
                if buffer.readable_bytes() == 0 {
                    return ParseResult::NeedMore;
                }
                // Consume only what the declared length still owes; anything
                // beyond it belongs to the next pipelined request.
                let owed = self.content_length - self.body.len();
                let take = owed.min(buffer.readable_bytes());
                self.body.extend_from_slice(&buffer.peek()[..take]);
                buffer.retrieve(take);
                continue;
            }

            let line = match take_line(buffer) {
                Some(line) => line,
                None => return ParseResult::NeedMore,
            };
            let line = match std::str::from_utf8(&line) {
                Ok(line) => line,
                Err(_) => return ParseResult::BadRequest,
            };

            match self.state {
                ParseState::RequestLine => {
                    if !self.parse_request_line(line) {
                        return ParseResult::BadRequest;
                    }
                    self.state = ParseState::Headers;
                }
                ParseState::Headers => {
                    if line.is_empty() {
                        self.state = if self.content_length > 0 {
                            ParseState::Body
                        } else {
                            ParseState::Finish
                        };
                    } else if !self.parse_header(line) {
                        return ParseResult::BadRequest;
                    }
                }
                _ => self.state = ParseState::Finish,
            }
        }

        self.keep_alive = match self.headers.get("connection") {
            Some(value) => value == "keep-alive",
            None => self.version == "HTTP/1.1",
        };
        ParseResult::Complete
    }

    fn parse_request_line(&mut self, line: &str) -> bool {
        let method_end = match line.find(' ') {
            Some(pos) => pos,
            None => return false,
        };
        let path_end = match line[method_end + 1..].find(' ') {
            Some(pos) => method_end + 1 + pos,
            None => return false,
        };

        self.method = line[..method_end].to_string();
        self.path = line[method_end + 1..path_end].to_string();
        self.version = line[path_end + 1..].to_string();

        !self.method.is_empty()
            && !self.path.is_empty()
            && (self.version == "HTTP/1.1" || self.version == "HTTP/1.0")
    }

    fn parse_header(&mut self, line: &str) -> bool {
        let colon = match line.find(':') {
            Some(pos) => pos,
            None => return false,
        };

        let key = line[..colon].to_ascii_lowercase();
        let value = line[colon + 1..]
            .trim_matches(|c| c == ' ' || c == '\t')
            .to_string();

        if key == "content-length" {
            match value.parse::<usize>() {
                Ok(length) if length <= MAX_CONTENT_LENGTH => self.content_length = length,
                _ => return false,
            }
        }

        self.headers.insert(key, value);
        true
    }
}

impl Default for HttpRequest {
    fn default() -> HttpRequest {
        HttpRequest::new()
    }
}

/// Yields the next CRLF-terminated line (without the CRLF) and consumes it,
/// or `None` when no full line is buffered yet.
fn take_line(buffer: &mut Buffer) -> Option<Vec<u8>> {
    let readable = buffer.peek();
    let end = readable.windows(2).position(|pair| pair == b"\r\n")?;
    let line = readable[..end].to_vec();
    buffer.retrieve(end + 2);
    Some(line)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_all(bytes: &[u8]) -> (HttpRequest, ParseResult) {
        let mut buffer = Buffer::new();
        buffer.append(bytes);
        let mut request = HttpRequest::new();
        let result = request.parse(&mut buffer);
        (request, result)
    }

    const POST_REQUEST: &[u8] = b"POST /predict HTTP/1.1\r\n\
          Host: example.test\r\n\
          Content-Type: application/octet-stream\r\n\
          Content-Length: 4\r\n\
          \r\n\
          IMG!";

    #[test]
    fn test_parse_get_in_one_call() {
        let (request, result) =
            parse_all(b"GET /index.html HTTP/1.1\r\nHost: x\r\nAccept:  text/html \r\n\r\n");

        assert_eq!(result, ParseResult::Complete);
        assert_eq!(request.method(), "GET");
        assert_eq!(request.path(), "/index.html");
        assert_eq!(request.version(), "HTTP/1.1");
        assert_eq!(request.header("host"), Some("x"));
        assert_eq!(request.header("accept"), Some("text/html"));
        assert!(request.body().is_empty());
        assert!(request.is_keep_alive());
    }

    #[test]
    fn test_parse_post_with_body() {
        let (request, result) = parse_all(POST_REQUEST);

        assert_eq!(result, ParseResult::Complete);
        assert_eq!(request.method(), "POST");
        assert_eq!(request.content_length(), 4);
        assert_eq!(request.body(), b"IMG!");
    }

    #[test]
    fn test_segmentation_invariance() {
        // Splitting the byte stream at any offset must produce the same
        // request as a single feed.
        let (reference, _) = parse_all(POST_REQUEST);

        for split in 1..POST_REQUEST.len() {
            let mut request = HttpRequest::new();
            let mut buffer = Buffer::new();

            buffer.append(&POST_REQUEST[..split]);
            let first = request.parse(&mut buffer);
            if first == ParseResult::Complete {
                // The split landed after the full request.
                assert_eq!(split, POST_REQUEST.len());
            } else {
                assert_eq!(first, ParseResult::NeedMore);
            }

            buffer.append(&POST_REQUEST[split..]);
            assert_eq!(request.parse(&mut buffer), ParseResult::Complete, "split {}", split);

            assert_eq!(request.method(), reference.method());
            assert_eq!(request.path(), reference.path());
            assert_eq!(request.version(), reference.version());
            assert_eq!(request.headers().len(), reference.headers().len());
            assert_eq!(request.body(), reference.body());
            assert_eq!(request.is_keep_alive(), reference.is_keep_alive());
        }
    }

    #[test]
    fn test_byte_by_byte_feed() {
        let mut request = HttpRequest::new();
        let mut buffer = Buffer::new();

        for (index, byte) in POST_REQUEST.iter().enumerate() {
            buffer.append(&[*byte]);
            let result = request.parse(&mut buffer);
            if index + 1 < POST_REQUEST.len() {
                assert_eq!(result, ParseResult::NeedMore);
            } else {
                assert_eq!(result, ParseResult::Complete);
            }
        }
        assert_eq!(request.body(), b"IMG!");
    }

    #[test]
    fn test_body_does_not_swallow_next_request() {
        let mut buffer = Buffer::new();
        buffer.append(POST_REQUEST);
        buffer.append(b"GET / HTTP/1.1\r\n\r\n");

        let mut request = HttpRequest::new();
        assert_eq!(request.parse(&mut buffer), ParseResult::Complete);
        assert_eq!(request.body(), b"IMG!");

        request.reset();
        assert_eq!(request.parse(&mut buffer), ParseResult::Complete);
        assert_eq!(request.method(), "GET");
        assert_eq!(request.path(), "/");
    }

    #[test]
    fn test_malformed_request_line() {
        let (_, result) = parse_all(b"NOT HTTP\r\n\r\n");
        assert_eq!(result, ParseResult::BadRequest);

        let (_, result) = parse_all(b"GET /index.html SPDY/3\r\n\r\n");
        assert_eq!(result, ParseResult::BadRequest);
    }

    #[test]
    fn test_malformed_header_line() {
        let (_, result) = parse_all(b"GET / HTTP/1.1\r\nno-colon-here\r\n\r\n");
        assert_eq!(result, ParseResult::BadRequest);
    }

    #[test]
    fn test_invalid_content_length() {
        let (_, result) = parse_all(b"POST / HTTP/1.1\r\nContent-Length: twelve\r\n\r\n");
        assert_eq!(result, ParseResult::BadRequest);

        let (_, result) =
            parse_all(b"POST / HTTP/1.1\r\nContent-Length: 99999999999999999999\r\n\r\n");
        assert_eq!(result, ParseResult::BadRequest);
    }

    #[test]
    fn test_keep_alive_derivation() {
        let (request, _) = parse_all(b"GET / HTTP/1.1\r\n\r\n");
        assert!(request.is_keep_alive());

        let (request, _) = parse_all(b"GET / HTTP/1.0\r\n\r\n");
        assert!(!request.is_keep_alive());

        let (request, _) = parse_all(b"GET / HTTP/1.0\r\nConnection: keep-alive\r\n\r\n");
        assert!(request.is_keep_alive());

        let (request, _) = parse_all(b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n");
        assert!(!request.is_keep_alive());
    }

    #[test]
    fn test_exact_body_in_single_read_completes() {
        let (request, result) = parse_all(b"POST / HTTP/1.1\r\nContent-Length: 3\r\n\r\nabc");
        assert_eq!(result, ParseResult::Complete);
        assert_eq!(request.body(), b"abc");
    }

    #[test]
    fn test_short_body_needs_more() {
        let mut buffer = Buffer::new();
        buffer.append(b"POST / HTTP/1.1\r\nContent-Length: 5\r\n\r\nab");
        let mut request = HttpRequest::new();
        assert_eq!(request.parse(&mut buffer), ParseResult::NeedMore);
        assert_eq!(request.body(), b"ab");

        buffer.append(b"cde");
        assert_eq!(request.parse(&mut buffer), ParseResult::Complete);
        assert_eq!(request.body(), b"abcde");
    }

    #[test]
    fn test_reset_restores_construction_state() {
        let (mut request, result) = parse_all(POST_REQUEST);
        assert_eq!(result, ParseResult::Complete);

        request.reset();
        let fresh = HttpRequest::new();
        assert_eq!(request.method(), fresh.method());
        assert_eq!(request.path(), fresh.path());
        assert_eq!(request.version(), fresh.version());
        assert_eq!(request.headers().len(), 0);
        assert!(request.body().is_empty());
        assert_eq!(request.is_keep_alive(), fresh.is_keep_alive());
        assert_eq!(request.content_length(), 0);
    }
}
