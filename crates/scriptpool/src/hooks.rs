//! The caller-supplied collaborator: construction, teardown, and fatal-error
//! notification for one concrete kind of worker.
//!
//! The engine never constructs or destroys a worker itself — it only invokes
//! these hooks, always from the mutator's thread (directly, or via the
//! [`crate::creation::CreationExecutor`] it dispatches construction batches
//! to). Implementors own every detail of what a worker actually *is*; this
//! crate only requires that the handle returned by `create` is `Send`.

use crate::error::PoolError;

/// Constructs and tears down one kind of worker, and is notified when the
/// engine hits a condition it treats as fatal.
pub trait WorkerLifecycle: Send + Sync {
    /// The `Send` handle representing one live worker. This need not be the
    /// underlying runtime object itself — it is legitimate (and is how the
    /// RustPython collaborator in this workspace is built) for `Worker` to be
    /// a lightweight command channel to a dedicated OS thread that privately
    /// owns a non-`Send` interpreter.
    type Worker: Send + 'static;

    /// Opaque, implementation-specific configuration passed through
    /// unmodified to `create`. Implementors whose configuration is
    /// expensive to clone should wrap it in an `Arc` themselves — the engine
    /// clones it once per construction task dispatched to the creation
    /// executor.
    type Config: Clone + Send + Sync + 'static;

    /// The error type raised by `create`/`cleanup`.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Constructs one worker with the given stable `id`. `splay` is advisory:
    /// when `true`, implementations may jitter startup-affecting scheduling
    /// to avoid a thundering herd against a shared downstream resource (e.g.
    /// staggering filesystem-heavy initialization).
    fn create(&self, id: i32, config: &Self::Config, splay: bool) -> Result<Self::Worker, Self::Error>;

    /// Releases a worker's resources. Failures are logged by the caller and
    /// treated as fatal to the pool; this method itself should make a
    /// best-effort attempt rather than panicking.
    fn cleanup(&self, worker: Self::Worker) -> Result<(), Self::Error>;

    /// Notified with the real, already-classified cause whenever the engine
    /// hits a fatal error (construction, mass-borrow, or cleanup failure).
    /// Expected to initiate process-level shutdown (flip a flag the
    /// embedding server polls, signal a supervisor, etc). The default
    /// implementation only logs.
    fn shutdown_on_error(&self, cause: &PoolError<Self::Error>) {
        log::error!("scriptpool: fatal error, initiating shutdown: {cause}");
    }
}
