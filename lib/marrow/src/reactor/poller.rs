use crate::reactor::channel::Ready;
use mio::{Events, Poll, Registry, Token, Waker};
use std::io;
use std::time::Duration;

const INITIAL_EVENT_CAPACITY: usize = 16;

/// Readiness polling over the set of registered descriptors. Registration
/// itself goes through a cloned [`Registry`] held by the owning loop; the
/// poller's job is turning a blocking wait into `(token, ready-mask)` pairs.
pub struct Poller {
    poll: Poll,
    events: Events,
    capacity: usize,
}

impl Poller {
    pub fn new() -> io::Result<Poller> {
        Ok(Poller {
            poll: Poll::new()?,
            events: Events::with_capacity(INITIAL_EVENT_CAPACITY),
            capacity: INITIAL_EVENT_CAPACITY,
        })
    }

    /// A shareable handle for registering descriptors with this poller.
    pub fn registry(&self) -> io::Result<Registry> {
        self.poll.registry().try_clone()
    }

    /// Builds the wakeup descriptor delivered under `token`.
    pub fn waker(&self, token: Token) -> io::Result<Waker> {
        Waker::new(self.poll.registry(), token)
    }

    /// Blocks up to `timeout` and appends every ready descriptor to `ready`.
    /// The event array doubles whenever a wakeup filled it completely.
    pub fn poll(
        &mut self,
        timeout: Option<Duration>,
        ready: &mut Vec<(Token, Ready)>,
    ) -> io::Result<()> {
        self.poll.poll(&mut self.events, timeout)?;

        let mut filled = 0;
        for event in self.events.iter() {
            filled += 1;
            ready.push((event.token(), Ready::from_event(event)));
        }

        if filled == self.capacity {
            self.capacity *= 2;
            self.events = Events::with_capacity(self.capacity);
        }
        Ok(())
    }
}
