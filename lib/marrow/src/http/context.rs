use crate::http::request::HttpRequest;
use crate::http::response::HttpResponse;

/// Form fields extracted by the body-parsing middlewares.
#[derive(Default)]
pub struct ParsedForm {
    pub image_data: Option<Vec<u8>>,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// Per-request container stored as a connection's user context: the request
/// being parsed, the response under construction and any parsed form data.
/// Lives for one request; reset between keep-alive requests.
#[derive(Default)]
pub struct HttpContext {
    pub request: HttpRequest,
    pub response: HttpResponse,
    pub form: Option<ParsedForm>,
}

impl HttpContext {
    pub fn new() -> HttpContext {
        HttpContext::default()
    }

    pub fn reset(&mut self) {
        self.request.reset();
        self.response.reset();
        self.form = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::request::ParseResult;
    use crate::net::buffer::Buffer;

    #[test]
    fn test_reset_is_indistinguishable_from_fresh() {
        let mut context = HttpContext::new();

        let mut buffer = Buffer::new();
        buffer.append(b"POST /predict HTTP/1.1\r\nContent-Length: 3\r\n\r\nIMG");
        assert_eq!(context.request.parse(&mut buffer), ParseResult::Complete);
        context.response.set_status_code(500);
        context.form = Some(ParsedForm {
            image_data: Some(b"IMG".to_vec()),
            ..ParsedForm::default()
        });

        context.reset();

        let fresh = HttpContext::new();
        assert_eq!(context.request.method(), fresh.request.method());
        assert_eq!(context.request.headers().len(), 0);
        assert_eq!(context.response.status_code(), fresh.response.status_code());
        assert!(context.form.is_none());
    }
}
