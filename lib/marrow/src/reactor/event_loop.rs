use crate::reactor::channel::{Channel, Ready};
use crate::reactor::poller::Poller;
use atlas::logging::{self, Logger};
use hashbrown::HashMap;
use mio::unix::SourceFd;
use mio::{Registry, Token, Waker};
use std::io;
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};

pub(crate) const WAKER_TOKEN: Token = Token(0);

pub type Task = Box<dyn FnOnce() + Send>;

struct LoopShared {
    thread_id: ThreadId,
    registry: Registry,
    waker: Waker,
    pending: Mutex<Vec<Task>>,
    calling_pending: AtomicBool,
    quit: AtomicBool,
    channels: Mutex<HashMap<Token, Arc<Channel>>>,
    next_token: AtomicUsize,
    log: Logger,
}

/// A single-threaded reactor: poll, dispatch ready channels once, then drain
/// queued tasks. The owning thread is fixed at construction; every channel
/// mutation and every callback runs on it. Other threads talk to the loop
/// through its [`LoopHandle`].
pub struct EventLoop {
    poller: Poller,
    shared: Arc<LoopShared>,
    ready: Vec<(Token, Ready)>,
    active: Vec<(Arc<Channel>, Ready)>,
    log: Logger,
}

impl EventLoop {
    /// Must be called on the thread that will run the loop.
    pub fn new<'a, L: Into<Option<&'a Logger>>>(log: L) -> io::Result<EventLoop> {
        let log = match log.into() {
            Some(log) => log.new(logging::o!()),
            _ => logging::null(),
        };

        let poller = Poller::new()?;
        let registry = poller.registry()?;
        let waker = poller.waker(WAKER_TOKEN)?;

        let shared = Arc::new(LoopShared {
            thread_id: thread::current().id(),
            registry,
            waker,
            pending: Mutex::new(Vec::new()),
            calling_pending: AtomicBool::new(false),
            quit: AtomicBool::new(false),
            channels: Mutex::new(HashMap::new()),
            next_token: AtomicUsize::new(1),
            log: log.clone(),
        });

        Ok(EventLoop {
            poller,
            shared,
            ready: Vec::new(),
            active: Vec::new(),
            log,
        })
    }

    #[inline]
    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Runs until [`LoopHandle::quit`] is observed. Each iteration polls,
    /// dispatches every ready channel once, then drains the task queue.
    pub fn run(&mut self) {
        self.handle().assert_in_loop_thread();
        logging::debug!(self.log, "event loop started"; "context" => "run");

        while !self.shared.quit.load(Ordering::Acquire) {
            self.ready.clear();
            if let Err(err) = self.poller.poll(None, &mut self.ready) {
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                logging::error!(self.log, "poll failed"; "context" => "run", "error" => %err);
                continue;
            }

            {
                let channels = self.shared.channels.lock().unwrap();
                for &(token, mask) in &self.ready {
                    if token == WAKER_TOKEN {
                        // The waker resets itself; its only job is to break
                        // the poll so the queue drain below runs.
                        continue;
                    }
                    if let Some(channel) = channels.get(&token) {
                        self.active.push((Arc::clone(channel), mask));
                    }
                }
            }

            for (channel, mask) in self.active.drain(..) {
                channel.handle_event(mask);
            }

            self.drain_pending();
        }

        logging::debug!(self.log, "event loop stopped"; "context" => "run");
    }

    /// Swap-and-drain: tasks posted while draining land in the next
    /// iteration, so one iteration's work stays bounded and posted tasks
    /// cannot starve I/O.
    fn drain_pending(&self) {
        self.shared.calling_pending.store(true, Ordering::Release);

        let tasks: Vec<Task> = mem::take(&mut *self.shared.pending.lock().unwrap());
        for task in tasks {
            task();
        }

        self.shared.calling_pending.store(false, Ordering::Release);
    }
}

/// Cloneable, thread-safe reference to an [`EventLoop`]. Used to post work
/// onto the loop and to mutate channel registrations from the loop thread.
#[derive(Clone)]
pub struct LoopHandle {
    shared: Arc<LoopShared>,
}

impl LoopHandle {
    #[inline]
    pub fn is_in_loop_thread(&self) -> bool {
        thread::current().id() == self.shared.thread_id
    }

    #[inline]
    pub fn assert_in_loop_thread(&self) {
        assert!(
            self.is_in_loop_thread(),
            "loop operation invoked off the owning thread"
        );
    }

    #[inline]
    pub fn is_same_loop(&self, other: &LoopHandle) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Runs `task` synchronously when called on the owning thread, otherwise
    /// enqueues it for the next iteration.
    pub fn run_in_loop(&self, task: impl FnOnce() + Send + 'static) {
        if self.is_in_loop_thread() {
            task();
        } else {
            self.queue_in_loop(task);
        }
    }

    /// Always enqueues. Wakes the loop when called from a foreign thread, or
    /// when the loop is currently draining its queue (so re-posted tasks run
    /// on the next iteration instead of being missed).
    pub fn queue_in_loop(&self, task: impl FnOnce() + Send + 'static) {
        {
            self.shared.pending.lock().unwrap().push(Box::new(task));
        }
        if !self.is_in_loop_thread() || self.shared.calling_pending.load(Ordering::Acquire) {
            self.wake();
        }
    }

    /// Cooperative shutdown: the loop exits after finishing the current
    /// iteration.
    pub fn quit(&self) {
        self.shared.quit.store(true, Ordering::Release);
        if !self.is_in_loop_thread() {
            self.wake();
        }
    }

    fn wake(&self) {
        if let Err(err) = self.shared.waker.wake() {
            logging::error!(self.shared.log, "loop wakeup failed";
                            "context" => "wake", "error" => %err);
        }
    }

    pub(crate) fn next_token(&self) -> Token {
        Token(self.shared.next_token.fetch_add(1, Ordering::Relaxed))
    }

    /// Applies a channel's interest mask to the multiplexer: removed when the
    /// mask is empty, added on first registration, modified otherwise. Loop
    /// thread only.
    pub(crate) fn update_channel(&self, channel: &Arc<Channel>) {
        self.assert_in_loop_thread();

        let token = channel.token();
        let fd = channel.fd();
        let mut channels = self.shared.channels.lock().unwrap();
        let mut source = SourceFd(&fd);

        match channel.mio_interest() {
            None => {
                if channels.remove(&token).is_some() {
                    if let Err(err) = self.shared.registry.deregister(&mut source) {
                        logging::error!(self.shared.log, "channel removal failed";
                                        "context" => "update_channel", "fd" => fd, "error" => %err);
                    }
                }
            }
            Some(interest) => {
                if channels.contains_key(&token) {
                    if let Err(err) = self.shared.registry.reregister(&mut source, token, interest) {
                        logging::error!(self.shared.log, "channel modification failed";
                                        "context" => "update_channel", "fd" => fd, "error" => %err);
                    }
                } else {
                    match self.shared.registry.register(&mut source, token, interest) {
                        Ok(()) => {
                            channels.insert(token, Arc::clone(channel));
                        }
                        Err(err) => {
                            logging::error!(self.shared.log, "channel registration failed";
                                            "context" => "update_channel", "fd" => fd, "error" => %err);
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn test_run_in_loop_synchronous_on_owning_thread() {
        let event_loop = EventLoop::new(None).unwrap();
        let handle = event_loop.handle();

        let (tx, rx) = mpsc::channel();
        handle.run_in_loop(move || tx.send(7).unwrap());
        assert_eq!(rx.try_recv().unwrap(), 7);
    }

    #[test]
    fn test_cross_thread_tasks_run_in_submission_order() {
        let mut event_loop = EventLoop::new(None).unwrap();
        let handle = event_loop.handle();

        let (tx, rx) = mpsc::channel();
        let poster = thread::spawn(move || {
            for value in 0..3 {
                let tx = tx.clone();
                handle.run_in_loop(move || tx.send(value).unwrap());
            }
            handle.quit();
        });

        event_loop.run();
        poster.join().unwrap();

        let order: Vec<i32> = rx.try_iter().collect();
        assert_eq!(order, vec![0, 1, 2]);
    }

    #[test]
    fn test_task_posted_during_drain_runs_next_iteration() {
        let mut event_loop = EventLoop::new(None).unwrap();
        let handle = event_loop.handle();

        let (tx, rx) = mpsc::channel();
        let outer_handle = handle.clone();
        let poster = thread::spawn(move || {
            let inner_handle = outer_handle.clone();
            let inner_tx = tx.clone();
            outer_handle.queue_in_loop(move || {
                let nested_tx = inner_tx.clone();
                let quitter = inner_handle.clone();
                // Posted while the drain is running; must still execute, on a
                // later iteration, instead of being dropped.
                inner_handle.queue_in_loop(move || {
                    nested_tx.send("nested").unwrap();
                    quitter.quit();
                });
                inner_tx.send("outer").unwrap();
            });
        });

        event_loop.run();
        poster.join().unwrap();

        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), "outer");
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), "nested");
    }

    #[test]
    fn test_quit_from_foreign_thread_stops_the_loop() {
        let mut event_loop = EventLoop::new(None).unwrap();
        let handle = event_loop.handle();

        let stopper = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            handle.quit();
        });

        event_loop.run();
        stopper.join().unwrap();
    }
}
