use crate::net::acceptor::Acceptor;
use crate::net::connection::{
    ConnectionCallback, MessageCallback, TcpConnection, WriteCompleteCallback,
};
use crate::reactor::event_loop::{EventLoop, LoopHandle};
use crate::reactor::loop_pool::{LoopSelector, LoopThreadPool};
use atlas::logging::{self, Logger};
use hashbrown::HashMap;
use mio::net::TcpStream;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// State shared between the server facade and the accept path: the connection
/// table (owned by the acceptor loop, mutated only through tasks posted to
/// it), loop selection and the user callbacks installed on new connections.
struct ServerCore {
    name: String,
    handle: LoopHandle,
    selector: LoopSelector,
    connections: Mutex<HashMap<String, Arc<TcpConnection>>>,
    next_conn_id: AtomicU64,
    connection_cb: Mutex<Option<ConnectionCallback>>,
    message_cb: Mutex<Option<MessageCallback>>,
    write_complete_cb: Mutex<Option<WriteCompleteCallback>>,
    log: Logger,
}

impl ServerCore {
    /// Runs on the acceptor loop for every accepted descriptor: name the
    /// connection, pick the next I/O loop round-robin (falling back to the
    /// acceptor loop for an empty pool), install callbacks and hand the
    /// establish step to the owning loop.
    fn new_connection(core: &Arc<ServerCore>, stream: TcpStream, peer_addr: SocketAddr) {
        core.handle.assert_in_loop_thread();

        let id = core.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let name = format!("{}#{}", core.name, id);
        let io_handle = core
            .selector
            .get_next_loop()
            .unwrap_or_else(|| core.handle.clone());

        let local_addr = stream
            .local_addr()
            .unwrap_or_else(|_| "0.0.0.0:0".parse().expect("unspecified address"));

        let conn = TcpConnection::new(
            io_handle.clone(),
            stream,
            name.clone(),
            local_addr,
            peer_addr,
            Some(&core.log),
        );

        if let Some(callback) = core.connection_cb.lock().unwrap().clone() {
            conn.set_connection_callback(callback);
        }
        if let Some(callback) = core.message_cb.lock().unwrap().clone() {
            conn.set_message_callback(callback);
        }
        if let Some(callback) = core.write_complete_cb.lock().unwrap().clone() {
            conn.set_write_complete_callback(callback);
        }

        let remover = Arc::clone(core);
        conn.set_close_callback(Arc::new(move |conn| {
            ServerCore::remove_connection(&remover, conn);
        }));

        logging::info!(core.log, "connection admitted";
                       "context" => "new_connection", "conn" => &name, "peer" => %peer_addr);

        core.connections
            .lock()
            .unwrap()
            .insert(name, Arc::clone(&conn));

        io_handle.run_in_loop(move || conn.connect_established());
    }

    /// Close handshake tail: erase the table entry on the acceptor loop, then
    /// let the owning I/O loop run the final teardown. The connection is
    /// destroyed when the last strong reference (normally the table entry)
    /// goes away.
    fn remove_connection(core: &Arc<ServerCore>, conn: &Arc<TcpConnection>) {
        let core = Arc::clone(core);
        let conn = Arc::clone(conn);
        let handle = core.handle.clone();

        handle.run_in_loop(move || {
            logging::info!(core.log, "connection removed";
                           "context" => "remove_connection", "conn" => conn.name());
            core.connections.lock().unwrap().remove(conn.name());

            let io_handle = conn.loop_handle().clone();
            io_handle.queue_in_loop(move || conn.connect_destroyed());
        });
    }
}

/// Multi-reactor TCP server: one acceptor loop owned by the caller's thread
/// plus a pool of I/O loops, each owning a disjoint set of connections.
pub struct TcpServer {
    base_loop: EventLoop,
    acceptor: Arc<Mutex<Acceptor>>,
    pool: LoopThreadPool,
    core: Arc<ServerCore>,
    started: bool,
}

impl TcpServer {
    /// Must be constructed on the thread that will call [`TcpServer::start`];
    /// that thread becomes the acceptor loop.
    pub fn new<'a, L: Into<Option<&'a Logger>>>(
        name: &str,
        listen_addr: SocketAddr,
        io_threads: usize,
        log: L,
    ) -> io::Result<TcpServer> {
        let log = match log.into() {
            Some(log) => log.new(logging::o!("server" => name.to_string())),
            _ => logging::null(),
        };

        let base_loop = EventLoop::new(Some(&log))?;
        let handle = base_loop.handle();
        let acceptor = Acceptor::new(&handle, listen_addr, Some(&log))?;
        let pool = LoopThreadPool::new(io_threads, Some(&log));

        let core = Arc::new(ServerCore {
            name: name.to_string(),
            handle,
            selector: pool.selector(),
            connections: Mutex::new(HashMap::new()),
            next_conn_id: AtomicU64::new(1),
            connection_cb: Mutex::new(None),
            message_cb: Mutex::new(None),
            write_complete_cb: Mutex::new(None),
            log,
        });

        {
            let accept_core = Arc::clone(&core);
            acceptor
                .lock()
                .unwrap()
                .set_new_connection_callback(move |stream, peer_addr| {
                    ServerCore::new_connection(&accept_core, stream, peer_addr);
                });
        }

        Ok(TcpServer {
            base_loop,
            acceptor,
            pool,
            core,
            started: false,
        })
    }

    pub fn set_connection_callback(&self, callback: ConnectionCallback) {
        *self.core.connection_cb.lock().unwrap() = Some(callback);
    }

    pub fn set_message_callback(&self, callback: MessageCallback) {
        *self.core.message_cb.lock().unwrap() = Some(callback);
    }

    pub fn set_write_complete_callback(&self, callback: WriteCompleteCallback) {
        *self.core.write_complete_cb.lock().unwrap() = Some(callback);
    }

    #[inline]
    pub fn listen_addr(&self) -> io::Result<SocketAddr> {
        self.acceptor.lock().unwrap().local_addr()
    }

    /// Handle to the acceptor loop, usable for posting work or quitting the
    /// server from another thread.
    #[inline]
    pub fn handle(&self) -> LoopHandle {
        self.core.handle.clone()
    }

    #[inline]
    pub fn connection_count(&self) -> usize {
        self.core.connections.lock().unwrap().len()
    }

    /// Starts the I/O loop pool and the acceptor, then runs the acceptor loop
    /// on the calling thread until quit.
    pub fn start(&mut self) {
        if !self.started {
            self.started = true;
            self.pool.start();

            let acceptor = Arc::clone(&self.acceptor);
            self.core
                .handle
                .run_in_loop(move || acceptor.lock().unwrap().listen());

            logging::info!(self.core.log, "server started"; "context" => "start");
        }
        self.base_loop.run();
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        let connections: Vec<Arc<TcpConnection>> = self
            .core
            .connections
            .lock()
            .unwrap()
            .drain()
            .map(|(_, conn)| conn)
            .collect();

        for conn in connections {
            let handle = conn.loop_handle().clone();
            handle.run_in_loop(move || conn.connect_destroyed());
        }
    }
}
