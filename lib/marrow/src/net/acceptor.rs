use crate::reactor::channel::Channel;
use crate::reactor::event_loop::LoopHandle;
use atlas::logging::{self, Logger};
use mio::net::{TcpListener, TcpStream};
use std::fs::File;
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::AsRawFd;
use std::sync::{Arc, Mutex, Weak};

pub type NewConnectionCallback = Box<dyn FnMut(TcpStream, SocketAddr) + Send>;

/// Opens the descriptor reserved for accept-queue shedding under descriptor
/// exhaustion.
fn open_idle_fd() -> Option<File> {
    File::open("/dev/null").ok()
}

/// The listening socket wrapped as a read-interest channel on the acceptor
/// loop. Binding happens at construction (non-blocking, `SO_REUSEADDR`);
/// [`Acceptor::listen`] installs the read interest. Accepted descriptors are
/// handed to the new-connection callback together with the peer address.
pub struct Acceptor {
    handle: LoopHandle,
    listener: TcpListener,
    channel: Arc<Channel>,
    new_connection: Option<NewConnectionCallback>,
    idle_fd: Option<File>,
    listening: bool,
    log: Logger,
}

impl Acceptor {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(
        handle: &LoopHandle,
        listen_addr: SocketAddr,
        log: L,
    ) -> io::Result<Arc<Mutex<Acceptor>>> {
        let log = match log.into() {
            Some(log) => log.new(logging::o!("listen_addr" => listen_addr.to_string())),
            _ => logging::null(),
        };

        let listener = TcpListener::bind(listen_addr)?;
        let channel = Channel::new(handle, listener.as_raw_fd(), Some(&log));

        let acceptor = Arc::new(Mutex::new(Acceptor {
            handle: handle.clone(),
            listener,
            channel: Arc::clone(&channel),
            new_connection: None,
            idle_fd: open_idle_fd(),
            listening: false,
            log,
        }));

        let weak: Weak<Mutex<Acceptor>> = Arc::downgrade(&acceptor);
        channel.set_read_callback(move || {
            if let Some(acceptor) = weak.upgrade() {
                acceptor.lock().unwrap().handle_read();
            }
        });

        Ok(acceptor)
    }

    pub fn set_new_connection_callback(
        &mut self,
        callback: impl FnMut(TcpStream, SocketAddr) + Send + 'static,
    ) {
        self.new_connection = Some(Box::new(callback));
    }

    #[inline]
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Starts delivering connections. Acceptor loop thread only.
    pub fn listen(&mut self) {
        if self.listening {
            return;
        }
        self.listening = true;
        self.channel.enable_reading();
        logging::info!(self.log, "listening"; "context" => "listen");
    }

    /// Accepts until the kernel queue is drained. `EINTR` and aborted
    /// connections are retried; descriptor exhaustion sheds one pending
    /// connection through the reserved idle descriptor so the loop does not
    /// spin on a permanently-ready listener.
    fn handle_read(&mut self) {
        self.handle.assert_in_loop_thread();

        loop {
            match self.listener.accept() {
                Ok((stream, peer_addr)) => {
                    logging::trace!(self.log, "connection accepted";
                                    "context" => "handle_read", "peer" => %peer_addr);
                    match self.new_connection.as_mut() {
                        Some(callback) => callback(stream, peer_addr),
                        None => drop(stream),
                    }
                }
                Err(err) => match err.kind() {
                    io::ErrorKind::WouldBlock => break,
                    io::ErrorKind::Interrupted | io::ErrorKind::ConnectionAborted => continue,
                    _ => match err.raw_os_error() {
                        Some(libc::EMFILE) | Some(libc::ENFILE) => {
                            logging::warn!(self.log, "descriptor limit reached, shedding";
                                           "context" => "handle_read");
                            self.shed_pending_connection();
                            break;
                        }
                        _ => {
                            logging::error!(self.log, "accept failed";
                                            "context" => "handle_read", "error" => %err);
                            break;
                        }
                    },
                },
            }
        }
    }

    /// Releases the reserved descriptor, accepts the next pending connection
    /// to pop it from the kernel queue, closes it immediately (signalling the
    /// client), then re-reserves.
    fn shed_pending_connection(&mut self) {
        self.idle_fd = None;
        if let Ok((stream, peer_addr)) = self.listener.accept() {
            logging::warn!(self.log, "pending connection dropped";
                           "context" => "shed", "peer" => %peer_addr);
            drop(stream);
        }
        self.idle_fd = open_idle_fd();
    }
}
