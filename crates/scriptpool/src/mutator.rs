//! The pool mutator agent: a single dedicated thread that serializes every
//! state-changing pool operation (prime, flush-one, drain-and-refill) so
//! that a non-thread-safe worker runtime is never touched by more than one
//! mutating call at a time.
//!
//! Dispatch is asynchronous — [`PoolMutatorAgent::dispatch`] returns as soon
//! as the task is enqueued. A caller that needs to know when a task finished
//! supplies (or receives) a [`Completion`] and waits on it explicitly.

use std::sync::mpsc;
use std::thread;

use crate::error::PoolError;

type Task = Box<dyn FnOnce() + Send + 'static>;

/// A one-shot signal bridging the agent's asynchronous dispatch back to a
/// synchronous caller. Always fulfilled exactly once, even when the task it
/// guards fails, so a waiting caller never hangs. Carries the real cause of a
/// fatal failure (rather than a side channel the caller has to poll
/// separately) so a synchronous waiter sees the same `PoolError` that was
/// reported to [`crate::WorkerLifecycle::shutdown_on_error`].
pub struct Completion<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    rx: mpsc::Receiver<Option<PoolError<E>>>,
}

impl<E> Completion<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    /// Blocks until the associated task has finished running, returning the
    /// fatal error it raised, if any.
    pub fn wait(self) -> Option<PoolError<E>> {
        // A closed channel (sender dropped without signaling) only happens if
        // the agent thread itself died; treat that the same as "done, no
        // error to report".
        self.rx.recv().unwrap_or(None)
    }
}

struct CompletionSignal<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    tx: mpsc::Sender<Option<PoolError<E>>>,
}

impl<E> CompletionSignal<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn fire(self, outcome: Option<PoolError<E>>) {
        let _ = self.tx.send(outcome);
    }
}

fn completion_pair<E>() -> (CompletionSignal<E>, Completion<E>)
where
    E: std::error::Error + Send + Sync + 'static,
{
    let (tx, rx) = mpsc::channel();
    (CompletionSignal { tx }, Completion { rx })
}

/// Single-threaded serial executor for mutating pool operations.
pub struct PoolMutatorAgent {
    sender: mpsc::Sender<Task>,
    thread: Option<thread::JoinHandle<()>>,
}

impl PoolMutatorAgent {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::channel::<Task>();
        let thread = thread::Builder::new()
            .name("scriptpool-mutator".to_string())
            .spawn(move || {
                for task in receiver {
                    task();
                }
            })
            .expect("failed to spawn pool mutator thread");

        PoolMutatorAgent {
            sender,
            thread: Some(thread),
        }
    }

    /// Enqueues `task` and returns immediately. The task always runs to
    /// completion on the agent's single thread, strictly after every
    /// previously-dispatched task and strictly before every later one.
    pub fn dispatch<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.sender
            .send(Box::new(task))
            .expect("pool mutator thread terminated unexpectedly");
    }

    /// Enqueues `task`, returning a [`Completion`] the caller may wait on to
    /// learn when it finished and, if it raised a fatal [`PoolError`], what
    /// that cause was.
    pub fn dispatch_with_completion<F, E>(&self, task: F) -> Completion<E>
    where
        F: FnOnce() -> Option<PoolError<E>> + Send + 'static,
        E: std::error::Error + Send + Sync + 'static,
    {
        let (signal, completion) = completion_pair();
        self.dispatch(move || {
            let outcome = task();
            signal.fire(outcome);
        });
        completion
    }
}

impl Default for PoolMutatorAgent {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for PoolMutatorAgent {
    fn drop(&mut self) {
        // Dropping `sender` closes the channel; the agent thread's `for task
        // in receiver` loop ends once the queue drains.
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
