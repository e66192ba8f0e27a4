use crate::reactor::event_loop::{EventLoop, LoopHandle};
use atlas::logging::Logger;
use std::sync::mpsc;
use std::thread::{self, JoinHandle};

/// Owns one event loop running on its own thread. The loop is constructed on
/// that thread (fixing its thread affinity there) and its handle is passed
/// back before `start` returns. Dropping the guard quits the loop and joins
/// the thread.
pub struct EventLoopThread {
    handle: LoopHandle,
    thread: Option<JoinHandle<()>>,
}

impl EventLoopThread {
    pub fn start<'a, L: Into<Option<&'a Logger>>>(name: &str, log: L) -> EventLoopThread {
        let log: Option<Logger> = log.into().cloned();
        let (tx, rx) = mpsc::channel();

        let thread = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let mut event_loop =
                    EventLoop::new(log.as_ref()).expect("event loop construction failed");
                tx.send(event_loop.handle())
                    .expect("loop handle receiver dropped");
                event_loop.run();
            })
            .expect("event loop thread spawn failed");

        let handle = rx.recv().expect("event loop thread died during startup");

        EventLoopThread {
            handle,
            thread: Some(thread),
        }
    }

    #[inline]
    pub fn handle(&self) -> &LoopHandle {
        &self.handle
    }
}

impl Drop for EventLoopThread {
    fn drop(&mut self) {
        self.handle.quit();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn test_loop_runs_on_its_own_thread() {
        let guard = EventLoopThread::start("test-loop", None);
        assert!(!guard.handle().is_in_loop_thread());

        let (tx, rx) = mpsc::channel();
        guard.handle().run_in_loop(move || {
            tx.send(thread::current().name().map(str::to_string)).unwrap();
        });

        let name = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(name.as_deref(), Some("test-loop"));
    }

    #[test]
    fn test_drop_joins_the_thread() {
        let guard = EventLoopThread::start("short-lived", None);
        let handle = guard.handle().clone();
        drop(guard);

        // The loop is gone; posting is still safe and simply never runs.
        handle.queue_in_loop(|| panic!("must not run"));
    }
}
