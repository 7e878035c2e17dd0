//! Per-core control-plane runner.
//!
//! A single-consumer FIFO of closures drained by one dedicated worker
//! thread. Control-plane actions that must not interleave (checkpoint
//! creation, meta flush, transfer hooks) are submitted here; the runner
//! guarantees strict submission order and at most one task in flight.

use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{unbounded, Sender};
use parking_lot::Mutex;
use tracing::{debug, warn};

type Task = Box<dyn FnOnce() + Send + 'static>;

enum Message {
    Run(Task),
    Shutdown,
}

/// Single-threaded FIFO task runner. Submission never blocks; tasks run
/// in submission order on a worker thread named after the core label.
///
/// Submission and shutdown both take `&self`: tasks running on the worker
/// may themselves submit follow-up work while a shutdown drains the queue.
pub struct ControlRunner {
    tx: Sender<Message>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ControlRunner {
    /// Spawns the worker thread.
    #[must_use]
    pub fn new(label: &str) -> Self {
        let (tx, rx) = unbounded::<Message>();
        let thread_name = format!("{label}-runner");
        let worker = std::thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                while let Ok(message) = rx.recv() {
                    match message {
                        Message::Run(task) => task(),
                        Message::Shutdown => break,
                    }
                }
                debug!(thread = thread_name, "control runner stopped");
            })
            .expect("spawning a named thread only fails on OS resource exhaustion");
        Self {
            tx,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Enqueues a task. Returns `false` when the runner has shut down.
    pub fn submit(&self, task: impl FnOnce() + Send + 'static) -> bool {
        self.tx.send(Message::Run(Box::new(task))).is_ok()
    }

    /// Enqueues a sleep of `duration`, used as a coalescing window in
    /// front of checkpoint work.
    pub fn submit_delay(&self, duration: Duration) -> bool {
        self.submit(move || std::thread::sleep(duration))
    }

    /// Stops the worker after every already-submitted task has run.
    /// Idempotent; later submissions are rejected.
    pub fn shutdown(&self) {
        if self.tx.send(Message::Shutdown).is_err() {
            return;
        }
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if worker.join().is_err() {
                warn!("control runner worker panicked");
            }
        }
    }
}

impl Drop for ControlRunner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_tasks_run_in_submission_order() {
        let runner = ControlRunner::new("test");
        let seen = Arc::new(Mutex::new(Vec::new()));

        for i in 0..100 {
            let seen = Arc::clone(&seen);
            runner.submit(move || seen.lock().unwrap().push(i));
        }
        runner.shutdown();

        let seen = seen.lock().unwrap();
        assert_eq!(*seen, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn test_shutdown_drains_pending_tasks() {
        let runner = ControlRunner::new("test");
        let count = Arc::new(AtomicUsize::new(0));

        for _ in 0..10 {
            let count = Arc::clone(&count);
            runner.submit(move || {
                count.fetch_add(1, Ordering::SeqCst);
            });
        }
        runner.shutdown();
        assert_eq!(count.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn test_submit_after_shutdown_is_rejected() {
        let runner = ControlRunner::new("test");
        runner.shutdown();
        assert!(!runner.submit(|| {}));
    }

    #[test]
    fn test_delay_precedes_later_tasks() {
        let runner = ControlRunner::new("test");
        let started = std::time::Instant::now();
        let elapsed = Arc::new(Mutex::new(Duration::ZERO));

        runner.submit_delay(Duration::from_millis(50));
        let slot = Arc::clone(&elapsed);
        runner.submit(move || *slot.lock().unwrap() = started.elapsed());
        runner.shutdown();

        assert!(*elapsed.lock().unwrap() >= Duration::from_millis(50));
    }
}
