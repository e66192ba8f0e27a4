//! TCP plumbing: buffered byte transport, the accepting socket, per-connection
//! state and the multi-reactor server that ties them together.

pub mod acceptor;
pub mod buffer;
pub mod connection;
pub mod server;

pub use self::acceptor::Acceptor;
pub use self::buffer::Buffer;
pub use self::connection::{ConnState, TcpConnection};
pub use self::server::TcpServer;
