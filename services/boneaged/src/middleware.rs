//! The middlewares the application composes into routes: form decoding, the
//! static-file handler and the prediction handler.

use crate::inference::{Dispatcher, InferenceTask};
use crate::static_files::{Served, StaticFileCache};
use atlas::logging::{self, Logger};
use marrow::http::{HttpResponse, Middleware, ParsedForm};
use marrow::net::{Buffer, TcpConnection};
use std::sync::Arc;

fn send_response(conn: &Arc<TcpConnection>, response: &mut HttpResponse) {
    let mut buffer = Buffer::new();
    response.append_to_buffer(&mut buffer);
    conn.send_buffer(&mut buffer);
}

fn send_json(conn: &Arc<TcpConnection>, response: &mut HttpResponse, code: u16, body: &str) {
    response.set_status_code(code);
    response.set_content_type("application/json");
    response.set_body(body);
    send_response(conn, response);
}

fn find_from(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if from > haystack.len() || needle.is_empty() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|window| window == needle)
        .map(|position| from + position)
}

/// Pulls the single image part out of a `multipart/form-data` body: bytes
/// between the end of the first part's header block and the CRLF preceding
/// the next boundary.
fn extract_multipart_image(content_type: &str, body: &[u8]) -> Option<Vec<u8>> {
    if !content_type.starts_with("multipart/form-data") {
        return None;
    }

    let boundary_key = "boundary=";
    let key_pos = content_type.find(boundary_key)?;
    let boundary = format!("--{}", &content_type[key_pos + boundary_key.len()..]);

    let part_start = find_from(body, boundary.as_bytes(), 0)?;
    let headers_end = find_from(body, b"\r\n\r\n", part_start)?;
    let image_start = headers_end + 4;

    let closing = find_from(body, boundary.as_bytes(), image_start)?;
    let image_end = closing.checked_sub(2)?;
    if image_end < image_start {
        return None;
    }
    Some(body[image_start..image_end].to_vec())
}

/// Decodes the image part of a multipart body into `form.image_data`. On any
/// malformation the chain continues without image data and the handler
/// answers with an error.
pub fn parse_multipart(log: &Logger) -> Middleware {
    let log = log.new(logging::o!("middleware" => "parse_multipart"));
    Arc::new(move |context, _conn, next| {
        if let Some(content_type) = context.request.header("content-type") {
            match extract_multipart_image(content_type, context.request.body()) {
                Some(image) => {
                    context
                        .form
                        .get_or_insert_with(ParsedForm::default)
                        .image_data = Some(image);
                }
                None => {
                    logging::error!(log, "malformed multipart body";
                                    "content_type" => content_type);
                }
            }
        }
        next.run(context);
    })
}

fn url_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut decoded = String::with_capacity(bytes.len());
    let mut index = 0;
    while index < bytes.len() {
        match bytes[index] {
            b'%' if index + 2 < bytes.len() => {
                let hex = std::str::from_utf8(&bytes[index + 1..index + 3]).ok();
                match hex.and_then(|hex| u8::from_str_radix(hex, 16).ok()) {
                    Some(value) => {
                        decoded.push(value as char);
                        index += 3;
                    }
                    None => {
                        decoded.push('%');
                        index += 1;
                    }
                }
            }
            b'+' => {
                decoded.push(' ');
                index += 1;
            }
            byte => {
                decoded.push(byte as char);
                index += 1;
            }
        }
    }
    decoded
}

/// Decodes `username`/`password` query parameters into the parsed form.
pub fn parse_url_encoded() -> Middleware {
    Arc::new(move |context, _conn, next| {
        let path = context.request.path().to_string();
        if let Some(query_start) = path.find('?') {
            let form = context.form.get_or_insert_with(ParsedForm::default);
            for pair in path[query_start + 1..].split('&') {
                if let Some(eq) = pair.find('=') {
                    let key = url_decode(&pair[..eq]);
                    let value = url_decode(&pair[eq + 1..]);
                    match key.as_str() {
                        "username" => form.username = Some(value),
                        "password" => form.password = Some(value),
                        _ => {}
                    }
                }
            }
        }
        next.run(context);
    })
}

/// Serves a path from the static cache with mtime revalidation.
pub fn static_file(cache: Arc<StaticFileCache>, log: &Logger) -> Middleware {
    let log = log.new(logging::o!("middleware" => "static_file"));
    Arc::new(move |context, conn, _next| {
        let path = context.request.path().to_string();
        match cache.serve(&path) {
            Served::Hit { bytes, mime } => {
                context.response.set_status_code(200);
                context.response.set_content_type(mime);
                context.response.set_body((*bytes).clone());
            }
            Served::NotFound => {
                logging::warn!(log, "cached file vanished"; "path" => &path);
                context.response.set_status_code(404);
                context.response.set_content_type("text/plain; charset=utf-8");
                context.response.set_body(format!(
                    "404 Not Found: The requested resource '{}' does not exist.",
                    path
                ));
            }
            Served::ReadError => {
                logging::error!(log, "static file read failed"; "path" => &path);
                context.response.set_status_code(500);
                context.response.set_content_type("text/plain; charset=utf-8");
                context
                    .response
                    .set_body("500 Internal Server Error: Failed to load file.");
            }
        }
        send_response(conn, &mut context.response);
    })
}

/// Hands the decoded image to the dispatcher. The completion callback runs on
/// a worker thread and re-posts onto the connection's I/O loop, where it only
/// touches the socket if the connection is still alive.
pub fn predict(dispatcher: Arc<Dispatcher>, log: &Logger) -> Middleware {
    let log = log.new(logging::o!("middleware" => "predict"));
    Arc::new(move |context, conn, _next| {
        let image = context
            .form
            .as_mut()
            .and_then(|form| form.image_data.take());
        let image = match image {
            Some(image) => image,
            None => {
                send_json(
                    conn,
                    &mut context.response,
                    400,
                    "{\"error\": \"Image not found.\"}",
                );
                return;
            }
        };

        let keep_alive = context.request.is_keep_alive();
        let completion_conn = Arc::clone(conn);
        let task = InferenceTask {
            raw_image_data: image,
            on_complete: Box::new(move |result| {
                let conn = completion_conn;
                let handle = conn.loop_handle().clone();
                handle.run_in_loop(move || {
                    if !conn.is_connected() {
                        return;
                    }
                    let mut response = HttpResponse::new();
                    response.set_keep_alive(keep_alive);
                    if result.result_str.is_empty() {
                        send_json(
                            &conn,
                            &mut response,
                            500,
                            "{\"error\": \"Inference failed.\"}",
                        );
                    } else {
                        send_json(&conn, &mut response, 200, &result.result_str);
                    }
                });
            }),
        };

        if dispatcher.post(task).is_err() {
            logging::warn!(log, "prediction rejected, dispatcher closed";
                           "conn" => conn.name());
            send_json(
                conn,
                &mut context.response,
                500,
                "{\"error\": \"Inference unavailable.\"}",
            );
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_multipart_image() {
        let body = b"--ABC\r\n\
                     Content-Disposition: form-data; name=\"file\"\r\n\
                     \r\n\
                     IMGDATA\r\n\
                     --ABC--\r\n";
        let image =
            extract_multipart_image("multipart/form-data; boundary=ABC", body).unwrap();
        assert_eq!(image, b"IMGDATA");
    }

    #[test]
    fn test_extract_rejects_wrong_content_type() {
        assert!(extract_multipart_image("application/json", b"{}").is_none());
    }

    #[test]
    fn test_extract_rejects_missing_boundary_param() {
        assert!(extract_multipart_image("multipart/form-data", b"--X\r\n\r\nD\r\n--X").is_none());
    }

    #[test]
    fn test_extract_rejects_truncated_body() {
        // No closing boundary after the data.
        let body = b"--ABC\r\nheaders\r\n\r\nIMGDATA";
        assert!(extract_multipart_image("multipart/form-data; boundary=ABC", body).is_none());
    }

    #[test]
    fn test_extract_rejects_missing_header_terminator() {
        let body = b"--ABC\r\nIMGDATA--ABC";
        assert!(extract_multipart_image("multipart/form-data; boundary=ABC", body).is_none());
    }

    #[test]
    fn test_extract_empty_part() {
        let body = b"--ABC\r\n\r\n\r\n--ABC--";
        let image =
            extract_multipart_image("multipart/form-data; boundary=ABC", body).unwrap();
        assert_eq!(image, b"");
    }

    #[test]
    fn test_url_decode() {
        assert_eq!(url_decode("plain"), "plain");
        assert_eq!(url_decode("a+b"), "a b");
        assert_eq!(url_decode("%41%2Fb"), "A/b");
        // Malformed escapes pass through.
        assert_eq!(url_decode("100%"), "100%");
        assert_eq!(url_decode("%zz"), "%zz");
    }
}
