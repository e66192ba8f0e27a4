use crate::reactor::event_loop::LoopHandle;
use atlas::logging::{self, Logger};
use mio::{Interest, Token};
use std::any::Any;
use std::ops::BitOr;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};

const READ_INTEREST: u8 = 0b01;
const WRITE_INTEREST: u8 = 0b10;

/// Readiness bits delivered to a channel by one poll wakeup.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct Ready(u8);

impl Ready {
    pub const READABLE: Ready = Ready(0b0000_0001);
    pub const WRITABLE: Ready = Ready(0b0000_0010);
    pub const ERROR: Ready = Ready(0b0000_0100);
    pub const HANGUP: Ready = Ready(0b0000_1000);
    pub const READ_CLOSED: Ready = Ready(0b0001_0000);
    pub const PRIORITY: Ready = Ready(0b0010_0000);

    #[inline]
    pub fn empty() -> Ready {
        Ready(0)
    }

    #[inline]
    pub fn contains(self, other: Ready) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub fn intersects(self, other: Ready) -> bool {
        self.0 & other.0 != 0
    }

    #[inline]
    pub(crate) fn bits(self) -> u8 {
        self.0
    }

    pub(crate) fn from_event(event: &mio::event::Event) -> Ready {
        let mut ready = Ready::empty();
        if event.is_readable() {
            ready = ready | Ready::READABLE;
        }
        if event.is_writable() {
            ready = ready | Ready::WRITABLE;
        }
        if event.is_error() {
            ready = ready | Ready::ERROR;
        }
        if event.is_read_closed() {
            ready = ready | Ready::READ_CLOSED;
            // Both directions closed is a peer hangup, not just a half-close.
            if event.is_write_closed() {
                ready = ready | Ready::HANGUP;
            }
        }
        if event.is_priority() {
            ready = ready | Ready::PRIORITY;
        }
        ready
    }
}

impl BitOr for Ready {
    type Output = Ready;

    #[inline]
    fn bitor(self, rhs: Ready) -> Ready {
        Ready(self.0 | rhs.0)
    }
}

type EventCallback = Box<dyn FnMut() + Send>;

#[derive(Default)]
struct Callbacks {
    read: Option<EventCallback>,
    write: Option<EventCallback>,
    close: Option<EventCallback>,
    error: Option<EventCallback>,
}

/// Binds one file descriptor to one event loop: interest mask, last observed
/// ready mask, the event callbacks and an optional weak `tie` to the owning
/// object.
///
/// Interest mutations must happen on the owning loop thread. The channel never
/// owns the descriptor; whoever holds the socket closes it after the channel
/// has been removed from the poller.
pub struct Channel {
    handle: LoopHandle,
    fd: RawFd,
    token: Token,
    interest: AtomicU8,
    last_ready: AtomicU8,
    callbacks: Mutex<Callbacks>,
    tie: Mutex<Option<Weak<dyn Any + Send + Sync>>>,
    log: Logger,
}

impl Channel {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(
        handle: &LoopHandle,
        fd: RawFd,
        log: L,
    ) -> Arc<Channel> {
        let token = handle.next_token();

        let channel_log = match log.into() {
            Some(log) => log.new(logging::o!("fd" => fd)),
            _ => logging::null(),
        };

        Arc::new(Channel {
            handle: handle.clone(),
            fd,
            token,
            interest: AtomicU8::new(0),
            last_ready: AtomicU8::new(0),
            callbacks: Mutex::new(Callbacks::default()),
            tie: Mutex::new(None),
            log: channel_log,
        })
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    #[inline]
    pub(crate) fn token(&self) -> Token {
        self.token
    }

    #[inline]
    pub fn loop_handle(&self) -> &LoopHandle {
        &self.handle
    }

    pub fn set_read_callback(&self, callback: impl FnMut() + Send + 'static) {
        self.callbacks.lock().unwrap().read = Some(Box::new(callback));
    }

    pub fn set_write_callback(&self, callback: impl FnMut() + Send + 'static) {
        self.callbacks.lock().unwrap().write = Some(Box::new(callback));
    }

    pub fn set_close_callback(&self, callback: impl FnMut() + Send + 'static) {
        self.callbacks.lock().unwrap().close = Some(Box::new(callback));
    }

    pub fn set_error_callback(&self, callback: impl FnMut() + Send + 'static) {
        self.callbacks.lock().unwrap().error = Some(Box::new(callback));
    }

    /// Installs a weak back-reference to the owning object. Once tied, events
    /// are only dispatched while the owner is still alive, which guards
    /// against callbacks racing the owner's destruction.
    pub fn tie<T: Any + Send + Sync>(&self, owner: &Arc<T>) {
        let weak: Weak<T> = Arc::downgrade(owner);
        let weak: Weak<dyn Any + Send + Sync> = weak;
        *self.tie.lock().unwrap() = Some(weak);
    }

    #[inline]
    pub fn is_reading(&self) -> bool {
        self.interest.load(Ordering::Acquire) & READ_INTEREST != 0
    }

    #[inline]
    pub fn is_writing(&self) -> bool {
        self.interest.load(Ordering::Acquire) & WRITE_INTEREST != 0
    }

    #[inline]
    pub fn is_none_interest(&self) -> bool {
        self.interest.load(Ordering::Acquire) == 0
    }

    pub fn enable_reading(self: &Arc<Self>) {
        self.interest.fetch_or(READ_INTEREST, Ordering::AcqRel);
        self.update();
    }

    pub fn disable_reading(self: &Arc<Self>) {
        self.interest.fetch_and(!READ_INTEREST, Ordering::AcqRel);
        self.update();
    }

    pub fn enable_writing(self: &Arc<Self>) {
        self.interest.fetch_or(WRITE_INTEREST, Ordering::AcqRel);
        self.update();
    }

    pub fn disable_writing(self: &Arc<Self>) {
        self.interest.fetch_and(!WRITE_INTEREST, Ordering::AcqRel);
        self.update();
    }

    pub fn disable_all(self: &Arc<Self>) {
        self.interest.store(0, Ordering::Release);
        self.update();
    }

    /// The interest mask in the multiplexer's vocabulary; `None` when the
    /// channel wants nothing and should be removed.
    pub(crate) fn mio_interest(&self) -> Option<Interest> {
        let bits = self.interest.load(Ordering::Acquire);
        match (bits & READ_INTEREST != 0, bits & WRITE_INTEREST != 0) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        }
    }

    /// Ready mask of the most recent dispatch.
    #[inline]
    pub fn last_ready(&self) -> Ready {
        Ready(self.last_ready.load(Ordering::Acquire))
    }

    fn update(self: &Arc<Self>) {
        self.handle.update_channel(self);
    }

    /// Dispatches one poll wakeup. If a tie is installed and the owner is
    /// gone the event is dropped.
    pub fn handle_event(&self, ready: Ready) {
        self.last_ready.store(ready.bits(), Ordering::Release);

        let tie = self.tie.lock().unwrap().clone();
        match tie {
            Some(tie) => match tie.upgrade() {
                Some(_guard) => self.dispatch(ready),
                None => {
                    logging::trace!(self.log, "event dropped, owner gone";
                                    "context" => "handle_event");
                }
            },
            None => self.dispatch(ready),
        }
    }

    /// Fixed dispatch order: a hangup seen together with readable data must
    /// deliver the data before tearing the connection down.
    fn dispatch(&self, ready: Ready) {
        let mut callbacks = self.callbacks.lock().unwrap();

        if ready.contains(Ready::HANGUP) && !ready.contains(Ready::READABLE) {
            if let Some(callback) = callbacks.close.as_mut() {
                callback();
            }
        }
        if ready.contains(Ready::ERROR) {
            if let Some(callback) = callbacks.error.as_mut() {
                callback();
            }
        }
        if ready.intersects(Ready::READABLE | Ready::PRIORITY | Ready::READ_CLOSED) {
            if let Some(callback) = callbacks.read.as_mut() {
                callback();
            }
        }
        if ready.contains(Ready::WRITABLE) {
            if let Some(callback) = callbacks.write.as_mut() {
                callback();
            }
        }
    }
}
