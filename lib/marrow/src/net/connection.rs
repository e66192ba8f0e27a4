use crate::net::buffer::Buffer;
use crate::reactor::channel::Channel;
use crate::reactor::event_loop::LoopHandle;
use atlas::logging::{self, Logger};
use mio::net::TcpStream;
use std::any::Any;
use std::io::{self, Write};
use std::net::{Shutdown, SocketAddr};
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

pub type ConnectionCallback = Arc<dyn Fn(&Arc<TcpConnection>) + Send + Sync>;
pub type MessageCallback = Arc<dyn Fn(&Arc<TcpConnection>, &mut Buffer) + Send + Sync>;
pub type WriteCompleteCallback = Arc<dyn Fn(&Arc<TcpConnection>) + Send + Sync>;
pub type CloseCallback = Arc<dyn Fn(&Arc<TcpConnection>) + Send + Sync>;

/// Connection lifecycle. Transitions are strictly monotone.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(u8)]
pub enum ConnState {
    Connecting = 0,
    Connected = 1,
    Disconnecting = 2,
    Disconnected = 3,
}

#[derive(Default)]
struct ConnCallbacks {
    connection: Option<ConnectionCallback>,
    message: Option<MessageCallback>,
    write_complete: Option<WriteCompleteCallback>,
    close: Option<CloseCallback>,
}

/// One accepted TCP connection, pinned to its I/O loop for life. All buffer,
/// channel and state mutations happen on that loop; `send` and `shutdown` may
/// be called from any thread and post themselves over when necessary.
///
/// Ownership: the server's table holds the long-lived strong reference; the
/// channel ties back weakly, and queued tasks or inference completions hold a
/// strong reference only for the duration of the queued operation.
pub struct TcpConnection {
    name: String,
    handle: LoopHandle,
    socket: TcpStream,
    channel: Arc<Channel>,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    state: AtomicU8,
    input: Mutex<Buffer>,
    output: Mutex<Buffer>,
    callbacks: Mutex<ConnCallbacks>,
    context: Mutex<Option<Box<dyn Any + Send>>>,
    log: Logger,
}

impl TcpConnection {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(
        handle: LoopHandle,
        socket: TcpStream,
        name: String,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
        log: L,
    ) -> Arc<TcpConnection> {
        let conn_log = match log.into() {
            Some(log) => log.new(logging::o!("conn" => name.clone())),
            _ => logging::null(),
        };

        let channel = Channel::new(&handle, socket.as_raw_fd(), Some(&conn_log));

        let conn = Arc::new(TcpConnection {
            name,
            handle,
            socket,
            channel,
            local_addr,
            peer_addr,
            state: AtomicU8::new(ConnState::Connecting as u8),
            input: Mutex::new(Buffer::new()),
            output: Mutex::new(Buffer::new()),
            callbacks: Mutex::new(ConnCallbacks::default()),
            context: Mutex::new(None),
            log: conn_log,
        });

        let read_conn = Arc::downgrade(&conn);
        conn.channel.set_read_callback(move || {
            if let Some(conn) = read_conn.upgrade() {
                conn.handle_read();
            }
        });
        let write_conn = Arc::downgrade(&conn);
        conn.channel.set_write_callback(move || {
            if let Some(conn) = write_conn.upgrade() {
                conn.handle_write();
            }
        });
        let close_conn = Arc::downgrade(&conn);
        conn.channel.set_close_callback(move || {
            if let Some(conn) = close_conn.upgrade() {
                conn.handle_close();
            }
        });
        let error_conn = Arc::downgrade(&conn);
        conn.channel.set_error_callback(move || {
            if let Some(conn) = error_conn.upgrade() {
                conn.handle_error();
            }
        });

        conn
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn loop_handle(&self) -> &LoopHandle {
        &self.handle
    }

    #[inline]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    #[inline]
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    #[inline]
    pub fn state(&self) -> ConnState {
        match self.state.load(Ordering::Acquire) {
            0 => ConnState::Connecting,
            1 => ConnState::Connected,
            2 => ConnState::Disconnecting,
            _ => ConnState::Disconnected,
        }
    }

    #[inline]
    pub fn is_connected(&self) -> bool {
        self.state() == ConnState::Connected
    }

    #[inline]
    fn set_state(&self, state: ConnState) {
        self.state.store(state as u8, Ordering::Release);
    }

    #[inline]
    fn transition(&self, from: ConnState, to: ConnState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn set_connection_callback(&self, callback: ConnectionCallback) {
        self.callbacks.lock().unwrap().connection = Some(callback);
    }

    pub fn set_message_callback(&self, callback: MessageCallback) {
        self.callbacks.lock().unwrap().message = Some(callback);
    }

    pub fn set_write_complete_callback(&self, callback: WriteCompleteCallback) {
        self.callbacks.lock().unwrap().write_complete = Some(callback);
    }

    pub fn set_close_callback(&self, callback: CloseCallback) {
        self.callbacks.lock().unwrap().close = Some(callback);
    }

    /// Installs the opaque per-connection context (the HTTP layer keeps its
    /// parser state here).
    pub fn set_context<T: Any + Send>(&self, value: T) {
        *self.context.lock().unwrap() = Some(Box::new(value));
    }

    /// Runs `f` against the context if one of type `T` is installed.
    pub fn with_context_mut<T: Any + Send, R>(&self, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let mut slot = self.context.lock().unwrap();
        slot.as_mut()?.downcast_mut::<T>().map(f)
    }

    /// Completes the accept handshake on the owning loop: installs the read
    /// interest, ties the channel to this connection and fires the connection
    /// callback.
    pub fn connect_established(self: &Arc<Self>) {
        self.handle.assert_in_loop_thread();
        assert!(self.transition(ConnState::Connecting, ConnState::Connected));

        self.channel.tie(self);
        self.channel.enable_reading();

        logging::debug!(self.log, "connection established";
                        "context" => "connect_established", "peer" => %self.peer_addr);

        let callback = self.callbacks.lock().unwrap().connection.clone();
        if let Some(callback) = callback.as_deref() {
            callback(self);
        }
    }

    /// Final teardown on the owning loop, after the server has dropped its
    /// table entry. Fires the connection callback one last time if the close
    /// path has not already run.
    pub fn connect_destroyed(self: &Arc<Self>) {
        self.handle.assert_in_loop_thread();

        if self.state() == ConnState::Connected {
            self.set_state(ConnState::Disconnected);
            self.channel.disable_all();

            let callback = self.callbacks.lock().unwrap().connection.clone();
            if let Some(callback) = callback.as_deref() {
                callback(self);
            }
        }

        logging::debug!(self.log, "connection destroyed"; "context" => "connect_destroyed");
    }

    /// Sends bytes. On the owning loop this takes the direct-write fast path;
    /// from any other thread the bytes are copied and posted over, arriving
    /// after everything already queued from that thread.
    pub fn send(self: &Arc<Self>, data: &[u8]) {
        if self.state() != ConnState::Connected {
            return;
        }
        if self.handle.is_in_loop_thread() {
            self.send_in_loop(data);
        } else {
            let message = data.to_vec();
            let conn = Arc::clone(self);
            self.handle.run_in_loop(move || {
                if conn.state() == ConnState::Connected {
                    conn.send_in_loop(&message);
                }
            });
        }
    }

    /// Sends and drains a whole buffer, avoiding the copy on the loop-thread
    /// path.
    pub fn send_buffer(self: &Arc<Self>, buffer: &mut Buffer) {
        if self.state() != ConnState::Connected {
            return;
        }
        if self.handle.is_in_loop_thread() {
            self.send_in_loop(buffer.peek());
            buffer.retrieve_all();
        } else {
            let message = buffer.retrieve_all_to_bytes();
            let conn = Arc::clone(self);
            self.handle.run_in_loop(move || {
                if conn.state() == ConnState::Connected {
                    conn.send_in_loop(&message);
                }
            });
        }
    }

    /// Direct write path. With an empty output buffer and no write interest,
    /// attempt one non-blocking write; buffer whatever remains and enable
    /// write interest. `EAGAIN` counts as zero bytes written; a broken pipe
    /// or reset marks the connection faulted and stops buffering.
    fn send_in_loop(self: &Arc<Self>, data: &[u8]) {
        self.handle.assert_in_loop_thread();
        if data.is_empty() {
            return;
        }

        let mut written = 0usize;
        let mut fault = false;
        let mut output = self.output.lock().unwrap();

        if !self.channel.is_writing() && output.readable_bytes() == 0 {
            loop {
                match (&self.socket).write(data) {
                    Ok(count) => {
                        written = count;
                        break;
                    }
                    Err(err) => match err.kind() {
                        io::ErrorKind::Interrupted => continue,
                        io::ErrorKind::WouldBlock => break,
                        _ => {
                            logging::error!(self.log, "direct write failed";
                                            "context" => "send_in_loop", "error" => %err);
                            if err.kind() == io::ErrorKind::BrokenPipe
                                || err.kind() == io::ErrorKind::ConnectionReset
                            {
                                fault = true;
                            }
                            break;
                        }
                    },
                }
            }

            if written == data.len() {
                // Never invoked inline; queued so it runs after this
                // iteration's dispatch.
                self.queue_write_complete();
            }
        }

        if !fault && written < data.len() {
            output.append(&data[written..]);
            if !self.channel.is_writing() {
                self.channel.enable_writing();
            }
        }
    }

    /// Half-closes after the output buffer drains; the read side stays open
    /// until the peer closes.
    pub fn shutdown(self: &Arc<Self>) {
        if self.transition(ConnState::Connected, ConnState::Disconnecting) {
            let conn = Arc::clone(self);
            self.handle.run_in_loop(move || conn.shutdown_in_loop());
        }
    }

    fn shutdown_in_loop(self: &Arc<Self>) {
        self.handle.assert_in_loop_thread();
        if !self.channel.is_writing() {
            if let Err(err) = self.socket.shutdown(Shutdown::Write) {
                logging::error!(self.log, "write shutdown failed";
                                "context" => "shutdown_in_loop", "error" => %err);
            }
        }
    }

    /// Readability: scatter-read until the socket is drained, deliver data to
    /// the message callback, then handle an observed EOF or error. Data seen
    /// together with a close is always delivered first.
    fn handle_read(self: &Arc<Self>) {
        self.handle.assert_in_loop_thread();

        let mut input = self.input.lock().unwrap();
        let mut received = 0usize;
        let mut eof = false;
        let mut fatal = None;

        loop {
            match input.read_from(&self.socket) {
                Ok(0) => {
                    eof = true;
                    break;
                }
                Ok(count) => received += count,
                Err(err) => match err.kind() {
                    io::ErrorKind::WouldBlock => break,
                    io::ErrorKind::Interrupted => continue,
                    _ => {
                        fatal = Some(err);
                        break;
                    }
                },
            }
        }

        if received > 0 {
            let callback = self.callbacks.lock().unwrap().message.clone();
            if let Some(callback) = callback.as_deref() {
                callback(self, &mut input);
            }
        }
        drop(input);

        if eof {
            self.handle_close();
        } else if let Some(err) = fatal {
            logging::error!(self.log, "read failed"; "context" => "handle_read", "error" => %err);
            self.handle_error();
            // Connection-fatal: tear down instead of waiting for a hangup
            // event that an edge-triggered poller may never redeliver.
            self.handle_close();
        }
    }

    /// Writability: drain the output buffer; once empty, drop the write
    /// interest, queue the write-complete callback and finish a pending
    /// half-close.
    fn handle_write(self: &Arc<Self>) {
        self.handle.assert_in_loop_thread();
        if !self.channel.is_writing() {
            logging::trace!(self.log, "spurious write event"; "context" => "handle_write");
            return;
        }

        let mut output = self.output.lock().unwrap();
        loop {
            match output.write_to(&self.socket) {
                Ok(count) => {
                    if output.readable_bytes() == 0 {
                        self.channel.disable_writing();
                        self.queue_write_complete();
                        if self.state() == ConnState::Disconnecting {
                            drop(output);
                            self.shutdown_in_loop();
                        }
                        break;
                    }
                    if count == 0 {
                        break;
                    }
                }
                Err(err) => match err.kind() {
                    io::ErrorKind::WouldBlock => break,
                    io::ErrorKind::Interrupted => continue,
                    _ => {
                        logging::error!(self.log, "buffered write failed";
                                        "context" => "handle_write", "error" => %err);
                        break;
                    }
                },
            }
        }
    }

    /// Peer close. Runs at most once per connection; the close callback is
    /// the server's cue to drop its table entry.
    fn handle_close(self: &Arc<Self>) {
        self.handle.assert_in_loop_thread();
        if self.state() == ConnState::Disconnected {
            return;
        }

        logging::debug!(self.log, "connection closed by peer";
                        "context" => "handle_close", "state" => ?self.state());

        self.set_state(ConnState::Disconnected);
        self.channel.disable_all();

        let (connection_cb, close_cb) = {
            let callbacks = self.callbacks.lock().unwrap();
            (callbacks.connection.clone(), callbacks.close.clone())
        };
        if let Some(callback) = connection_cb.as_deref() {
            callback(self);
        }
        if let Some(callback) = close_cb.as_deref() {
            callback(self);
        }
    }

    fn handle_error(self: &Arc<Self>) {
        let error = self
            .socket
            .take_error()
            .ok()
            .flatten()
            .map(|err| err.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        logging::error!(self.log, "socket error";
                        "context" => "handle_error", "state" => ?self.state(), "error" => error);
    }

    fn queue_write_complete(self: &Arc<Self>) {
        let callback = self.callbacks.lock().unwrap().write_complete.clone();
        if let Some(callback) = callback {
            let conn = Arc::clone(self);
            self.handle.queue_in_loop(move || (callback.as_ref())(&conn));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::event_loop::EventLoop;
    use std::io::Read;
    use std::net::{TcpListener as StdTcpListener, TcpStream as StdTcpStream};
    use std::sync::atomic::AtomicUsize;
    use std::thread;
    use std::time::Duration;

    fn socket_pair() -> (TcpStream, StdTcpStream) {
        let listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = StdTcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();
        (TcpStream::from_std(server), client)
    }

    fn test_connection(event_loop: &EventLoop) -> (Arc<TcpConnection>, StdTcpStream) {
        let (socket, client) = socket_pair();
        let local = socket.local_addr().unwrap();
        let peer = socket.peer_addr().unwrap();
        let conn = TcpConnection::new(
            event_loop.handle(),
            socket,
            "test#1".to_string(),
            local,
            peer,
            None,
        );
        (conn, client)
    }

    #[test]
    fn test_establish_fires_connection_callback() {
        let event_loop = EventLoop::new(None).unwrap();
        let (conn, _client) = test_connection(&event_loop);

        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        conn.set_connection_callback(Arc::new(move |conn| {
            assert!(conn.is_connected());
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        assert_eq!(conn.state(), ConnState::Connecting);
        conn.connect_established();
        assert_eq!(conn.state(), ConnState::Connected);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_direct_send_reaches_peer() {
        let event_loop = EventLoop::new(None).unwrap();
        let (conn, mut client) = test_connection(&event_loop);
        conn.connect_established();

        conn.send(b"hello");

        client
            .set_read_timeout(Some(Duration::from_secs(1)))
            .unwrap();
        let mut received = [0u8; 5];
        client.read_exact(&mut received).unwrap();
        assert_eq!(&received, b"hello");
    }

    #[test]
    fn test_sequential_sends_preserve_order() {
        let event_loop = EventLoop::new(None).unwrap();
        let (conn, mut client) = test_connection(&event_loop);
        conn.connect_established();

        conn.send(b"first ");
        conn.send(b"second");

        client
            .set_read_timeout(Some(Duration::from_secs(1)))
            .unwrap();
        let mut received = [0u8; 12];
        client.read_exact(&mut received).unwrap();
        assert_eq!(&received, b"first second");
    }

    #[test]
    fn test_message_callback_sees_input() {
        let event_loop = EventLoop::new(None).unwrap();
        let (conn, mut client) = test_connection(&event_loop);
        conn.connect_established();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        conn.set_message_callback(Arc::new(move |_conn, input| {
            sink.lock().unwrap().extend_from_slice(input.peek());
            input.retrieve_all();
        }));

        client.write_all(b"ping").unwrap();
        thread::sleep(Duration::from_millis(50));
        conn.handle_read();

        assert_eq!(&*seen.lock().unwrap(), b"ping");
    }

    #[test]
    fn test_close_callback_fires_exactly_once() {
        let event_loop = EventLoop::new(None).unwrap();
        let (conn, client) = test_connection(&event_loop);
        conn.connect_established();

        let closes = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&closes);
        conn.set_close_callback(Arc::new(move |_conn| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        drop(client);
        thread::sleep(Duration::from_millis(50));
        conn.handle_read();
        conn.handle_read();

        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert_eq!(conn.state(), ConnState::Disconnected);
    }

    #[test]
    fn test_shutdown_half_closes_once_drained() {
        let event_loop = EventLoop::new(None).unwrap();
        let (conn, mut client) = test_connection(&event_loop);
        conn.connect_established();

        conn.send(b"bye");
        conn.shutdown();
        assert_eq!(conn.state(), ConnState::Disconnecting);

        client
            .set_read_timeout(Some(Duration::from_secs(1)))
            .unwrap();
        let mut received = Vec::new();
        client.read_to_end(&mut received).unwrap();
        assert_eq!(received, b"bye");
    }

    #[test]
    fn test_send_after_disconnect_is_ignored() {
        let event_loop = EventLoop::new(None).unwrap();
        let (conn, client) = test_connection(&event_loop);
        conn.connect_established();

        drop(client);
        thread::sleep(Duration::from_millis(50));
        conn.handle_read();

        conn.send(b"into the void");
    }

    #[test]
    fn test_context_roundtrip() {
        let event_loop = EventLoop::new(None).unwrap();
        let (conn, _client) = test_connection(&event_loop);

        conn.set_context(41u32);
        let value = conn.with_context_mut(|value: &mut u32| {
            *value += 1;
            *value
        });
        assert_eq!(value, Some(42));
        assert_eq!(conn.with_context_mut(|_: &mut String| ()), None);
    }
}
