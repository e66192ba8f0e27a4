use crate::config::Config;
use crate::inference::Dispatcher;
use crate::middleware;
use crate::static_files::StaticFileCache;
use atlas::logging::{self, Logger};
use marrow::http::{HttpContext, ParseResult, Router};
use marrow::net::{Buffer, TcpConnection, TcpServer};
use marrow::reactor::LoopHandle;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

/// Wires the TCP server, the router, the static cache and the inference
/// dispatcher into the HTTP application: a `GET` route per cached file plus
/// `POST /predict`.
pub struct HttpApplication {
    server: TcpServer,
}

impl HttpApplication {
    /// Must be constructed on the thread that will call
    /// [`HttpApplication::start`].
    pub fn new(
        config: &Config,
        dispatcher: Arc<Dispatcher>,
        log: &Logger,
    ) -> io::Result<HttpApplication> {
        let log = log.new(logging::o!("component" => "http"));

        let listen_addr: SocketAddr = format!("{}:{}", config.server_ip, config.port)
            .parse()
            .map_err(|err| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("bad listen address: {}", err),
                )
            })?;

        let server = TcpServer::new("bone_age", listen_addr, config.num_io_threads, Some(&log))?;
        let cache = Arc::new(StaticFileCache::new(
            config.static_root_path.clone(),
            Some(&log),
        )?);

        let mut router = Router::new(Some(&log));
        router.add_route(
            "POST",
            "/predict",
            vec![
                middleware::parse_multipart(&log),
                middleware::predict(dispatcher, &log),
            ],
        );
        for path in cache.paths() {
            router.add_route(
                "GET",
                &path,
                vec![middleware::static_file(Arc::clone(&cache), &log)],
            );
        }
        let router = Arc::new(router);

        let connection_log = log.clone();
        server.set_connection_callback(Arc::new(move |conn| {
            if conn.is_connected() {
                conn.set_context(HttpContext::new());
                logging::info!(connection_log, "client connected";
                               "conn" => conn.name(), "peer" => %conn.peer_addr());
            } else {
                logging::info!(connection_log, "client quit"; "conn" => conn.name());
            }
        }));

        let message_router = Arc::clone(&router);
        server.set_message_callback(Arc::new(move |conn, input| {
            on_message(&message_router, conn, input);
        }));

        Ok(HttpApplication { server })
    }

    #[inline]
    pub fn listen_addr(&self) -> io::Result<SocketAddr> {
        self.server.listen_addr()
    }

    /// Handle to the acceptor loop, for quitting the server from another
    /// thread.
    #[inline]
    pub fn handle(&self) -> LoopHandle {
        self.server.handle()
    }

    /// Runs the acceptor loop on the calling thread until quit.
    pub fn start(&mut self) {
        self.server.start();
    }
}

/// Feeds buffered bytes through the per-connection parser, routing each
/// completed request. Keep-alive resets the context and keeps parsing;
/// otherwise the connection shuts down after the response drains.
fn on_message(router: &Arc<Router>, conn: &Arc<TcpConnection>, input: &mut Buffer) {
    conn.with_context_mut::<HttpContext, _>(|context| {
        while input.readable_bytes() > 0 {
            match context.request.parse(input) {
                ParseResult::Complete => {
                    let keep_alive = context.request.is_keep_alive();
                    context.response.set_keep_alive(keep_alive);

                    router.route(context, conn);

                    if keep_alive {
                        context.reset();
                    } else {
                        conn.shutdown();
                        break;
                    }
                }
                ParseResult::BadRequest => {
                    conn.send(b"HTTP/1.1 400 Bad Request\r\n\r\n");
                    conn.shutdown();
                    break;
                }
                ParseResult::NeedMore => break,
            }
        }
    });
}
