//! The concurrent request-processing engine: a multi-reactor event loop over
//! readiness polling, the TCP connection machinery built on top of it, and an
//! incremental HTTP/1.1 layer.

#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]

pub mod http;
pub mod net;
pub mod reactor;
