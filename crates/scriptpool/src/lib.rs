//! scriptpool: a managed pool of heavyweight, single-threaded worker
//! instances, with prime / borrow / return / flush-one / drain-and-refill
//! lifecycle management and poison-pill fail-stop signaling.
//!
//! The engine never constructs or tears down a worker itself — callers
//! supply a [`WorkerLifecycle`] and the engine invokes it only from the
//! [`mutator::PoolMutatorAgent`]'s thread (directly, or via a batch on the
//! [`creation::CreationExecutor`] it dispatches construction to).

pub mod context;
pub mod creation;
pub mod error;
pub mod hooks;
pub mod mutator;
pub mod protocols;
pub mod queue;

pub use context::{PoolConfig, PoolContext};
pub use error::{PillCause, PoolError};
pub use hooks::WorkerLifecycle;
pub use mutator::{Completion, PoolMutatorAgent};
pub use protocols::{
    default_pool_size, default_pool_size_for_host, drain_and_refill, flush_for_shutdown,
    flush_one, next_instance_id, prime,
};
pub use queue::{BorrowOutcome, BoundedWorkerQueue, LockTimeoutError, PoolLockGuard, Worker};
