use crate::http::context::HttpContext;
use crate::net::buffer::Buffer;
use crate::net::connection::TcpConnection;
use atlas::logging::{self, Logger};
use hashbrown::HashMap;
use std::sync::Arc;

/// A request-processing stage. Receives the context, the originating
/// connection and the continuation for the rest of the chain.
pub type Middleware =
    Arc<dyn Fn(&mut HttpContext, &Arc<TcpConnection>, Next<'_>) + Send + Sync>;

/// Explicit continuation over the remaining middleware chain. Calling
/// [`Next::run`] consumes the value, so a middleware can invoke it at most
/// once; not calling it stops the chain.
pub struct Next<'a> {
    chain: &'a [Middleware],
    conn: &'a Arc<TcpConnection>,
}

impl<'a> Next<'a> {
    pub fn run(self, context: &mut HttpContext) {
        if let Some((middleware, rest)) = self.chain.split_first() {
            (middleware.as_ref())(
                context,
                self.conn,
                Next {
                    chain: rest,
                    conn: self.conn,
                },
            );
        }
    }
}

/// Maps `"METHOD:path"` (exact, case-sensitive) to an ordered middleware
/// chain. Lookups that miss run the pre-registered not-found chain.
pub struct Router {
    routes: HashMap<String, Vec<Middleware>>,
    not_found: Vec<Middleware>,
    log: Logger,
}

impl Router {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(log: L) -> Router {
        let log = match log.into() {
            Some(log) => log.new(logging::o!()),
            _ => logging::null(),
        };

        let not_found: Middleware = Arc::new(|context, conn, _next| {
            context.response.set_status_code(404);
            context.response.set_status_message("Not Found");
            context.response.set_content_type("text/plain; charset=utf-8");
            context.response.set_body(format!(
                "404 Not Found: The requested resource '{}' does not exist.",
                context.request.path()
            ));

            let mut buffer = Buffer::new();
            context.response.append_to_buffer(&mut buffer);
            conn.send_buffer(&mut buffer);
        });

        Router {
            routes: HashMap::new(),
            not_found: vec![not_found],
            log,
        }
    }

    pub fn add_route(&mut self, method: &str, path: &str, chain: Vec<Middleware>) {
        logging::debug!(self.log, "route registered";
                        "context" => "add_route", "method" => method, "path" => path);
        self.routes.insert(format!("{}:{}", method, path), chain);
    }

    pub fn route(&self, context: &mut HttpContext, conn: &Arc<TcpConnection>) {
        let key = format!("{}:{}", context.request.method(), context.request.path());
        let chain = self.routes.get(&key).unwrap_or(&self.not_found);
        Next { chain, conn }.run(context);
    }
}
