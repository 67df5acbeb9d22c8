//! Error taxonomy for the pool engine.
//!
//! Every variant here corresponds to a failure mode named in the engine's
//! contract: a timed-out lock acquisition, a failing lifecycle hook observed
//! during construction/borrow/cleanup, or a pool that has already shut down.
//! Construction/borrow/cleanup failures are never recovered locally — the
//! protocol that produced them has already cleared the queue and inserted a
//! pill by the time this value reaches a caller.

use std::time::Duration;
use thiserror::Error;

/// Failure modes of the pool engine, generic over the hook error type `E`
/// supplied by a [`crate::WorkerLifecycle`] implementor.
#[derive(Debug, Error)]
pub enum PoolError<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    /// The exclusive pool lock was not acquired within the configured
    /// timeout, or it was acquired but drain-and-refill's mass-borrow never
    /// collected all `pool-size` workers within the same timeout (some
    /// borrowed worker never came back). Recoverable in both cases: the pool
    /// is left exactly as it was (every worker already collected is put back
    /// before this is raised), and nothing is torn down.
    #[error("timed out after {waited:?} waiting for the pool lock")]
    LockTimeout {
        /// How long the caller waited before giving up.
        waited: Duration,
    },

    /// A `create` hook failed while constructing the worker for `slot`.
    #[error("failed to construct worker for slot {slot}")]
    ConstructionFailure {
        /// The instance id that was being constructed.
        slot: i32,
        /// The underlying cause from the lifecycle hook.
        #[source]
        source: E,
    },

    /// Borrowing a worker back from the queue failed during a mass-borrow
    /// (drain-and-refill's step 2) with a genuine underlying error, as
    /// opposed to a mere timeout (which surfaces as [`PoolError::LockTimeout`]
    /// instead — see its doc comment). Kept for taxonomy completeness per the
    /// engine's error contract; the `std`-backed
    /// [`crate::queue::BoundedWorkerQueue`] in this workspace has no failure
    /// mode of its own beyond timeout/pill/shutdown, so no code path in this
    /// crate currently constructs this variant. A `WorkerLifecycle` whose
    /// queue implementation can itself fail would surface it here.
    #[error("failed to borrow worker back from the pool")]
    BorrowFailure {
        /// The underlying cause.
        #[source]
        source: E,
    },

    /// A `cleanup` hook failed while tearing down the worker for `slot`.
    #[error("failed to clean up worker for slot {slot}")]
    CleanupFailure {
        /// The instance id that was being torn down.
        slot: i32,
        /// The underlying cause from the lifecycle hook.
        #[source]
        source: E,
    },

    /// The pool has been shut down; no further workers will ever be
    /// available. Non-fatal to the pool itself, terminal to the caller.
    #[error("pool has shut down")]
    PoolShutdown,

    /// A mass-borrow (drain-and-refill) observed an `ErrorPill` placed by
    /// some earlier fatal error rather than a live worker. The original
    /// cause was already reported to `shutdown_on_error` when the pill was
    /// first inserted; this variant only carries its rendered message
    /// onward since the original `E` is not reconstructable from a pill.
    #[error("pool already poisoned: {0}")]
    AlreadyPoisoned(#[source] PillCause),
}

impl<E> PoolError<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    /// Whether this error represents a fatal pool condition (one that clears
    /// the queue and inserts an [`crate::queue::Element::ErrorPill`]), as
    /// opposed to a recoverable per-call failure.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, PoolError::LockTimeout { .. } | PoolError::PoolShutdown)
    }
}

/// Clone-friendly cause carried by an `ErrorPill`, once the original `E` has
/// already been reported to the fatal-error hook and formatted. Pills are
/// shared across every borrower that observes them, so the cause is kept as
/// a rendered message plus the discriminant rather than re-exposing `E`
/// (which may not be `Clone`).
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct PillCause {
    message: String,
}

impl PillCause {
    /// Captures a [`PoolError`] as a pill cause, preserving its `Display`
    /// rendering (including the `source()` chain) since `E` itself is not
    /// required to be `Clone`.
    pub fn capture<E>(error: &PoolError<E>) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        PillCause {
            message: format!("{error}"),
        }
    }
}
