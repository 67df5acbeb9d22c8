//! A bounded worker-thread pool used only by the [`crate::mutator`] to
//! parallelize construction of multiple workers within one prime or refill
//! batch. Distinct mutator operations remain serialized; only the tasks
//! *within* a single batch run concurrently here.

use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;

type Job = Box<dyn FnOnce() + Send + 'static>;

enum Message {
    NewJob(Job),
    Terminate,
}

struct Handle {
    thread: Option<thread::JoinHandle<()>>,
}

/// Runs batches of construction/cleanup tasks across a small, fixed set of
/// persistent worker threads.
pub struct CreationExecutor {
    sender: mpsc::Sender<Message>,
    handles: Vec<Handle>,
}

impl CreationExecutor {
    /// Creates an executor backed by `size` worker threads. `size` is
    /// clamped to at least 1.
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        let (sender, receiver) = mpsc::channel::<Message>();
        let receiver = Arc::new(Mutex::new(receiver));

        let mut handles = Vec::with_capacity(size);
        for idx in 0..size {
            let receiver = Arc::clone(&receiver);
            let thread = thread::Builder::new()
                .name(format!("scriptpool-creation-{idx}"))
                .spawn(move || loop {
                    let message = receiver.lock().unwrap().recv();
                    match message {
                        Ok(Message::NewJob(job)) => job(),
                        Ok(Message::Terminate) | Err(_) => break,
                    }
                })
                .expect("failed to spawn creation executor thread");
            handles.push(Handle { thread: Some(thread) });
        }

        CreationExecutor { sender, handles }
    }

    /// Runs every task in `tasks` across the executor, blocking until all of
    /// them complete. Results are returned in the same order as `tasks`,
    /// regardless of completion order.
    pub fn run_batch<T, E, F>(&self, tasks: Vec<F>) -> Vec<Result<T, E>>
    where
        F: FnOnce() -> Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
    {
        let n = tasks.len();
        if n == 0 {
            return Vec::new();
        }

        let (tx, rx) = mpsc::channel::<(usize, Result<T, E>)>();
        for (idx, task) in tasks.into_iter().enumerate() {
            let tx = tx.clone();
            let job: Job = Box::new(move || {
                let result = task();
                // The receiver always outlives this send: `run_batch` does
                // not return until it has received `n` results.
                let _ = tx.send((idx, result));
            });
            self.sender
                .send(Message::NewJob(job))
                .expect("creation executor threads terminated unexpectedly");
        }
        drop(tx);

        let mut slots: Vec<Option<Result<T, E>>> = (0..n).map(|_| None).collect();
        for _ in 0..n {
            let (idx, result) = rx.recv().expect("creation executor worker dropped its sender");
            slots[idx] = Some(result);
        }
        slots
            .into_iter()
            .map(|slot| slot.expect("every dispatched index produces exactly one result"))
            .collect()
    }

    /// Runs a single task and waits for its result. A thin convenience over
    /// [`CreationExecutor::run_batch`] for the "first worker alone" step of
    /// prime/refill.
    pub fn run_one<T, E, F>(&self, task: F) -> Result<T, E>
    where
        F: FnOnce() -> Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
    {
        self.run_batch(vec![task]).pop().expect("run_batch(1) returns exactly one result")
    }
}

impl Drop for CreationExecutor {
    fn drop(&mut self) {
        for _ in &self.handles {
            let _ = self.sender.send(Message::Terminate);
        }
        for handle in &mut self.handles {
            if let Some(thread) = handle.thread.take() {
                let _ = thread.join();
            }
        }
    }
}
