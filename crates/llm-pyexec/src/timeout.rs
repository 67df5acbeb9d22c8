use std::sync::mpsc;
use std::thread;
use std::time::Duration;

/// Run `f` in a new thread. Wait at most `timeout_ns` nanoseconds for it to finish.
///
/// # Returns
/// - `Some(T)` if `f` completed within the timeout.
/// - `None` if the timeout was exceeded. The spawned thread is abandoned (not joined).
///   The thread will terminate on its own when it finishes its work or the process exits.
/// - `None` if the spawned thread panics (channel becomes Disconnected).
///
/// # Thread safety
/// `f` must be `Send + 'static`. The return type `T` must be `Send + 'static`.
///
/// # Abandonment guarantee
/// When `None` is returned, the spawned thread holds no shared references to data
/// that the caller owns exclusively. The `OutputBuffer` inside is reference-counted;
/// the thread's clone of the Arc will be dropped when the thread eventually terminates.
///
/// # Why no SIGALRM / process::exit
/// SIGALRM is not thread-safe on Linux with multi-threading. process::exit kills
/// all threads including the caller. Thread abandonment is the only portable,
/// safe mechanism for interrupting a tight Python loop that never yields.
pub fn run_with_timeout<F, T>(f: F, timeout_ns: u64) -> Option<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let (tx, rx) = mpsc::channel::<T>();

    let _handle = thread::Builder::new()
        .name("pyexec-vm".to_string())
        .spawn(move || {
            let result = f();
            // If send fails, the receiver was dropped (timed out). Ignore.
            let _ = tx.send(result);
        })
        .expect("Failed to spawn execution thread");

    let timeout = Duration::from_nanos(timeout_ns);
    match rx.recv_timeout(timeout) {
        Ok(result) => Some(result),
        Err(mpsc::RecvTimeoutError::Timeout) => None,
        Err(mpsc::RecvTimeoutError::Disconnected) => {
            // Thread panicked without sending. Treat as timeout/error.
            None
        }
    }
}
