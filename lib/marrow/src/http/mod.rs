//! Incremental HTTP/1.1 support layered on the TCP engine: request parsing,
//! response building and a middleware router.

pub mod context;
pub mod request;
pub mod response;
pub mod router;

pub use self::context::{HttpContext, ParsedForm};
pub use self::request::{HttpRequest, ParseResult};
pub use self::response::HttpResponse;
pub use self::router::{Middleware, Next, Router};
