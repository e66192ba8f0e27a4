use crate::reactor::event_loop::LoopHandle;
use crate::reactor::loop_thread::EventLoopThread;
use atlas::logging::{self, Logger};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

struct PoolShared {
    handles: Mutex<Vec<LoopHandle>>,
    next: AtomicUsize,
}

/// N worker event loops, one per thread, selected in strict round-robin
/// order. A pool of size zero is valid; selection then yields nothing and
/// callers fall back to the acceptor loop.
pub struct LoopThreadPool {
    count: usize,
    threads: Vec<EventLoopThread>,
    shared: Arc<PoolShared>,
    log: Logger,
}

impl LoopThreadPool {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(count: usize, log: L) -> LoopThreadPool {
        let log = match log.into() {
            Some(log) => log.new(logging::o!()),
            _ => logging::null(),
        };

        LoopThreadPool {
            count,
            threads: Vec::new(),
            shared: Arc::new(PoolShared {
                handles: Mutex::new(Vec::new()),
                next: AtomicUsize::new(0),
            }),
            log,
        }
    }

    /// Spawns every worker loop. All loops are running when this returns.
    pub fn start(&mut self) {
        for index in 0..self.count {
            let thread = EventLoopThread::start(&format!("io-loop-{}", index), Some(&self.log));
            self.shared
                .handles
                .lock()
                .unwrap()
                .push(thread.handle().clone());
            self.threads.push(thread);
        }

        logging::debug!(self.log, "loop thread pool started";
                        "context" => "start", "loops" => self.count);
    }

    #[inline]
    pub fn get_next_loop(&self) -> Option<LoopHandle> {
        self.selector().get_next_loop()
    }

    /// A cheap handle for round-robin selection, usable after the pool owner
    /// has moved on.
    #[inline]
    pub fn selector(&self) -> LoopSelector {
        LoopSelector {
            shared: Arc::clone(&self.shared),
        }
    }
}

/// Round-robin selection over the pool's loops via an atomic counter.
#[derive(Clone)]
pub struct LoopSelector {
    shared: Arc<PoolShared>,
}

impl LoopSelector {
    pub fn get_next_loop(&self) -> Option<LoopHandle> {
        let handles = self.shared.handles.lock().unwrap();
        if handles.is_empty() {
            return None;
        }
        let index = self.shared.next.fetch_add(1, Ordering::Relaxed);
        Some(handles[index % handles.len()].clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_pool_selects_nothing() {
        let mut pool = LoopThreadPool::new(0, None);
        pool.start();
        assert!(pool.get_next_loop().is_none());
    }

    #[test]
    fn test_round_robin_selection() {
        let mut pool = LoopThreadPool::new(3, None);
        pool.start();

        let first = pool.get_next_loop().unwrap();
        let second = pool.get_next_loop().unwrap();
        let third = pool.get_next_loop().unwrap();
        let wrapped = pool.get_next_loop().unwrap();

        assert!(!first.is_same_loop(&second));
        assert!(!second.is_same_loop(&third));
        assert!(!first.is_same_loop(&third));
        assert!(first.is_same_loop(&wrapped));
    }

    #[test]
    fn test_selector_outlives_borrow_of_pool() {
        let mut pool = LoopThreadPool::new(1, None);
        pool.start();
        let selector = pool.selector();

        let from_pool = pool.get_next_loop().unwrap();
        let from_selector = selector.get_next_loop().unwrap();
        assert!(from_pool.is_same_loop(&from_selector));
    }
}
