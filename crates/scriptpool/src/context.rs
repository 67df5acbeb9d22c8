//! The composite that ties configuration, the worker queue, the mutator
//! agent, the creation executor, and a lifecycle collaborator into one pool.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::creation::CreationExecutor;
use crate::hooks::WorkerLifecycle;
use crate::mutator::PoolMutatorAgent;
use crate::queue::BoundedWorkerQueue;

/// Engine-level configuration, generic over the lifecycle's own opaque
/// worker configuration `C` (the equivalent of this system's original
/// `gem-home` / `ruby-load-path` style settings — passed through to `create`
/// unread).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig<C> {
    /// Number of workers the pool holds once primed.
    pub pool_size: usize,
    /// How long `lock_with_timeout` (and thus drain-and-refill) waits for
    /// the exclusive pool lock before giving up.
    pub flush_timeout_ms: u64,
    /// Advisory flag passed through to `create`, asking the lifecycle to
    /// jitter startup scheduling to avoid a thundering herd.
    pub splay_instance_flush: bool,
    /// Opaque configuration forwarded unmodified to every `create` call.
    pub worker_config: C,
}

impl<C> PoolConfig<C> {
    /// Builds a config with the CPU-count-derived default pool size and a
    /// five-second flush timeout.
    pub fn new(worker_config: C) -> Self {
        PoolConfig {
            pool_size: crate::protocols::default_pool_size_for_host(),
            flush_timeout_ms: 5_000,
            splay_instance_flush: false,
            worker_config,
        }
    }

    pub fn flush_timeout(&self) -> Duration {
        Duration::from_millis(self.flush_timeout_ms)
    }
}

/// The pool itself: configuration plus the engine components that implement
/// its lifecycle protocols.
pub struct PoolContext<H: WorkerLifecycle> {
    pub(crate) config: PoolConfig<H::Config>,
    pub(crate) queue: Arc<BoundedWorkerQueue<H::Worker>>,
    pub(crate) agent: PoolMutatorAgent,
    pub(crate) executor: Arc<CreationExecutor>,
    pub(crate) lifecycle: Arc<H>,
}

impl<H: WorkerLifecycle> PoolContext<H> {
    /// Builds a pool context. Does not construct any workers — call
    /// [`crate::protocols::prime`] to fill it.
    pub fn new(lifecycle: H, config: PoolConfig<H::Config>) -> Self {
        let pool_size = config.pool_size.max(1);
        PoolContext {
            queue: Arc::new(BoundedWorkerQueue::new(pool_size)),
            agent: PoolMutatorAgent::new(),
            executor: Arc::new(CreationExecutor::new(pool_size)),
            lifecycle: Arc::new(lifecycle),
            config,
        }
    }

    pub fn pool_size(&self) -> usize {
        self.config.pool_size.max(1)
    }

    pub fn flush_timeout(&self) -> Duration {
        self.config.flush_timeout()
    }

    pub fn queue(&self) -> &BoundedWorkerQueue<H::Worker> {
        &self.queue
    }

    /// A cloned handle on the same queue, for a caller (e.g. a lifecycle's
    /// own borrow/return adapter) that needs to hold onto it past the
    /// lifetime of this context reference.
    pub fn queue_handle(&self) -> Arc<BoundedWorkerQueue<H::Worker>> {
        Arc::clone(&self.queue)
    }

    pub fn lifecycle(&self) -> &H {
        &self.lifecycle
    }

    pub fn config(&self) -> &PoolConfig<H::Config> {
        &self.config
    }

    /// Idle workers currently available to borrow.
    pub fn idle_count(&self) -> usize {
        self.queue.idle_count()
    }
}
