use crate::inference::model::Model;
use crate::inference::pipeline::InferencePipeline;
use atlas::logging::{self, Logger};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

const MAX_QUEUE_SIZE: usize = 100;
const MAX_BATCH_SIZE: usize = 8;

/// JSON-encoded assessment, or empty when the image could not be decoded or
/// the model runtime failed.
pub struct InferenceResult {
    pub result_str: String,
}

/// One submitted prediction. Immutable after submission; `on_complete` is
/// invoked from a worker thread exactly once per task that reaches a worker.
pub struct InferenceTask {
    pub raw_image_data: Vec<u8>,
    pub on_complete: Box<dyn FnOnce(InferenceResult) + Send>,
}

impl std::fmt::Debug for InferenceTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InferenceTask")
            .field("raw_image_data", &self.raw_image_data)
            .field("on_complete", &"<closure>")
            .finish()
    }
}

struct DispatchShared {
    queue: Mutex<VecDeque<InferenceTask>>,
    not_empty: Condvar,
    not_full: Condvar,
    closed: AtomicBool,
    worker_count: usize,
    pipeline: InferencePipeline,
    log: Logger,
}

/// Bounded-queue dispatcher feeding M inference workers. Workers form
/// dynamic batches: sized up only under visible backlog, capped to keep
/// memory bounded.
pub struct Dispatcher {
    shared: Arc<DispatchShared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Dispatcher {
    pub fn start(worker_count: usize, model: Arc<dyn Model>, log: &Logger) -> Arc<Dispatcher> {
        let log = log.new(logging::o!("component" => "inference"));
        let shared = Arc::new(DispatchShared {
            queue: Mutex::new(VecDeque::new()),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            closed: AtomicBool::new(false),
            worker_count,
            pipeline: InferencePipeline::new(model, &log),
            log,
        });

        let mut workers = Vec::with_capacity(worker_count);
        for index in 0..worker_count {
            let worker_shared = Arc::clone(&shared);
            let worker = thread::Builder::new()
                .name(format!("infer-{}", index))
                .spawn(move || worker_loop(&worker_shared))
                .expect("inference worker spawn failed");
            workers.push(worker);
        }

        Arc::new(Dispatcher {
            shared,
            workers: Mutex::new(workers),
        })
    }

    /// Submits a task. Blocks while the queue is full; fails once shutdown
    /// has begun, handing the task back to the caller.
    pub fn post(&self, task: InferenceTask) -> Result<(), InferenceTask> {
        let mut queue = self.shared.queue.lock().unwrap();
        while queue.len() >= MAX_QUEUE_SIZE && !self.shared.closed.load(Ordering::Acquire) {
            queue = self.shared.not_full.wait(queue).unwrap();
        }
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(task);
        }

        queue.push_back(task);
        self.shared.not_empty.notify_one();
        Ok(())
    }

    /// Stops the workers. Tasks still queued are dropped without their
    /// callbacks firing; callers must not rely on completion delivery after
    /// shutdown begins.
    pub fn shutdown(&self) {
        self.shared.closed.store(true, Ordering::Release);
        self.shared.not_empty.notify_all();
        self.shared.not_full.notify_all();

        let workers: Vec<JoinHandle<()>> = self.workers.lock().unwrap().drain(..).collect();
        for worker in workers {
            let _ = worker.join();
        }

        let dropped = self.shared.queue.lock().unwrap().len();
        if dropped > 0 {
            logging::warn!(self.shared.log, "queued tasks dropped at shutdown";
                           "context" => "shutdown", "count" => dropped);
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Per-iteration batch size: grow towards `ceil(pending / workers)` in powers
/// of two, but only under visible load, and never past the cap or the backlog
/// itself.
fn batch_size(pending: usize, workers: usize) -> usize {
    let mut size = 1;
    if workers > 0 && pending > workers {
        let desired = (pending + workers - 1) / workers;
        while size << 1 <= desired {
            size <<= 1;
        }
    }
    size.min(MAX_BATCH_SIZE).min(pending).max(1)
}

fn worker_loop(shared: &Arc<DispatchShared>) {
    loop {
        let batch: Vec<InferenceTask> = {
            let mut queue = shared.queue.lock().unwrap();
            loop {
                if shared.closed.load(Ordering::Acquire) {
                    return;
                }
                if !queue.is_empty() {
                    break;
                }
                queue = shared.not_empty.wait(queue).unwrap();
            }

            let size = batch_size(queue.len(), shared.worker_count);
            let batch = queue.drain(..size).collect();
            shared.not_full.notify_one();
            batch
        };

        logging::debug!(shared.log, "batch formed";
                        "context" => "worker", "size" => batch.len());

        // Decode first; failures complete immediately with an empty result
        // and the survivors stay paired with their tasks.
        let mut images = Vec::with_capacity(batch.len());
        let mut pending = Vec::with_capacity(batch.len());
        for task in batch {
            match shared.pipeline.decode(&task.raw_image_data) {
                Some(image) => {
                    images.push(image);
                    pending.push(task);
                }
                None => {
                    logging::error!(shared.log, "image decode failed";
                                    "context" => "worker", "bytes" => task.raw_image_data.len());
                    (task.on_complete)(InferenceResult {
                        result_str: String::new(),
                    });
                }
            }
        }
        if pending.is_empty() {
            continue;
        }

        match shared.pipeline.run(&images) {
            Ok(hands) => {
                for (task, hand) in pending.into_iter().zip(hands) {
                    (task.on_complete)(InferenceResult {
                        result_str: hand.to_json(),
                    });
                }
            }
            Err(err) => {
                logging::error!(shared.log, "model run failed";
                                "context" => "worker", "error" => %err);
                for task in pending {
                    (task.on_complete)(InferenceResult {
                        result_str: String::new(),
                    });
                }
            }
        }
    }
}
