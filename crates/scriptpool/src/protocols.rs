//! Orchestration protocols built on top of the queue, hooks, mutator agent
//! and creation executor: prime, flush-one, drain-and-refill, and
//! flush-for-shutdown.

use std::sync::Arc;

use crate::context::PoolContext;
use crate::error::{PillCause, PoolError};
use crate::hooks::WorkerLifecycle;
use crate::mutator::Completion;
use crate::queue::{BorrowOutcome, BoundedWorkerQueue, Worker};

/// Default pool size for a host with `cpu_count` logical CPUs: 1 for one or
/// two CPUs, 2 for three, 3 for four, 4 for five or more.
pub fn default_pool_size(cpu_count: usize) -> usize {
    match cpu_count {
        0 | 1 | 2 => 1,
        3 => 2,
        4 => 3,
        _ => 4,
    }
}

/// [`default_pool_size`] applied to the host's actual logical CPU count, as
/// reported by [`std::thread::available_parallelism`]. Falls back to 1 if
/// the platform cannot report it.
pub fn default_pool_size_for_host() -> usize {
    let cpus = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
    default_pool_size(cpus)
}

/// `next = k + pool_size`, wrapped modulo `pool_size` if it would overflow
/// `i32::MAX`. IDs keep a stable residue modulo `pool_size` across
/// generations; `0` is accepted as an ordinary id after a wrap, never
/// special-cased.
pub fn next_instance_id(current: i32, pool_size: usize) -> i32 {
    let pool_size = pool_size.max(1) as i64;
    let next = current as i64 + pool_size;
    if next > i32::MAX as i64 {
        (next % pool_size) as i32
    } else {
        next as i32
    }
}

fn construct_one<H: WorkerLifecycle>(ctx: &PoolContext<H>, id: i32, splay: bool) -> Result<Worker<H::Worker>, H::Error> {
    let handle = ctx.lifecycle().create(id, &ctx.config().worker_config, splay)?;
    Ok(Worker {
        id,
        created_at: std::time::Instant::now(),
        handle,
    })
}

/// Constructs workers for `ids` following the "first alone, then the rest in
/// parallel" rule: the first id is built as its own batch (it may perform
/// filesystem-touching initialization the remaining ids depend on), then the
/// rest are built in one parallel batch. Returns the first construction
/// failure encountered, in `ids` order, if any.
fn construct_batch<H: WorkerLifecycle>(
    ctx: &PoolContext<H>,
    ids: &[i32],
) -> Result<Vec<Worker<H::Worker>>, (i32, H::Error)> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }

    let splay = ctx.config().splay_instance_flush;
    let first_id = ids[0];

    let lifecycle = Arc::clone(&ctx.lifecycle);
    let config = ctx.config().worker_config.clone();
    let first_result = ctx.executor.run_one(move || {
        let handle = lifecycle.create(first_id, &config, splay)?;
        Ok::<_, H::Error>(Worker {
            id: first_id,
            created_at: std::time::Instant::now(),
            handle,
        })
    });

    let mut workers = match first_result {
        Ok(worker) => vec![worker],
        Err(e) => return Err((first_id, e)),
    };

    if ids.len() > 1 {
        let tasks: Vec<_> = ids[1..]
            .iter()
            .map(|&id| {
                let lifecycle = Arc::clone(&ctx.lifecycle);
                let config = ctx.config().worker_config.clone();
                move || -> Result<Worker<H::Worker>, H::Error> {
                    let handle = lifecycle.create(id, &config, splay)?;
                    Ok(Worker {
                        id,
                        created_at: std::time::Instant::now(),
                        handle,
                    })
                }
            })
            .collect();

        for (id, result) in ids[1..].iter().zip(ctx.executor.run_batch(tasks)) {
            match result {
                Ok(worker) => workers.push(worker),
                Err(e) => return Err((*id, e)),
            }
        }
    }

    Ok(workers)
}

/// Clears the queue, inserts an `ErrorPill` carrying `error`, and notifies
/// the lifecycle's fatal-error hook — the shared tail of every fatal path
/// (construction, mass-borrow, and cleanup failures alike).
fn raise_fatal_on<H: WorkerLifecycle>(
    queue: &BoundedWorkerQueue<H::Worker>,
    lifecycle: &H,
    error: PoolError<H::Error>,
) -> PoolError<H::Error> {
    queue.clear();
    queue.insert_error_pill(PillCause::capture(&error));
    lifecycle.shutdown_on_error(&error);
    error
}

fn raise_fatal<H: WorkerLifecycle>(ctx: &PoolContext<H>, error: PoolError<H::Error>) -> PoolError<H::Error> {
    raise_fatal_on(&ctx.queue, ctx.lifecycle(), error)
}

/// Fills an empty pool. A no-op (logged, successful) if the pool already has
/// no remaining capacity — e.g. it was already primed, or was constructed
/// with zero capacity.
pub fn prime<H: WorkerLifecycle>(ctx: &PoolContext<H>) -> Result<(), PoolError<H::Error>> {
    let total = ctx.queue.remaining_capacity();
    if total == 0 {
        log::debug!("scriptpool: prime called on a pool with no remaining capacity, no-op");
        return Ok(());
    }

    let ids: Vec<i32> = (1..=total as i32).collect();
    log::info!("scriptpool: priming {} worker(s)", ids.len());

    match construct_batch(ctx, &ids) {
        Ok(workers) => {
            for worker in workers {
                ctx.queue.offer(worker);
            }
            Ok(())
        }
        Err((slot, source)) => Err(raise_fatal(ctx, PoolError::ConstructionFailure { slot, source })),
    }
}

/// Replaces a single worker the caller already holds with a freshly
/// constructed one, computing the new id via [`next_instance_id`]. Returns
/// the new worker; the caller is responsible for placing it back into
/// circulation (typically by returning it to the queue it came from).
pub fn flush_one<H: WorkerLifecycle>(
    ctx: &PoolContext<H>,
    old: Worker<H::Worker>,
) -> Result<Completion<H::Error>, PoolError<H::Error>> {
    let pool_size = ctx.pool_size();
    let new_id = next_instance_id(old.id, pool_size);
    let lifecycle = Arc::clone(&ctx.lifecycle);
    let queue = Arc::clone(&ctx.queue);
    let config = ctx.config().worker_config.clone();
    let splay = ctx.config().splay_instance_flush;

    let completion = ctx.agent.dispatch_with_completion(move || -> Option<PoolError<H::Error>> {
        let old_id = old.id;
        if let Err(source) = lifecycle.cleanup(old.handle) {
            let error = PoolError::CleanupFailure { slot: old_id, source };
            return Some(raise_fatal_on(&queue, lifecycle.as_ref(), error));
        }
        match lifecycle.create(new_id, &config, splay) {
            Ok(handle) => {
                queue.offer(Worker {
                    id: new_id,
                    created_at: std::time::Instant::now(),
                    handle,
                });
                None
            }
            Err(source) => {
                let error = PoolError::ConstructionFailure { slot: new_id, source };
                Some(raise_fatal_on(&queue, lifecycle.as_ref(), error))
            }
        }
    });

    Ok(completion)
}

/// Replaces every worker in the pool. If `refill` is `false` this behaves as
/// a pure drain: after the drained workers are cleaned up, a
/// [`crate::queue::BoundedWorkerQueue::insert_shutdown_pill`] marks the pool
/// as permanently unavailable. Returns a [`Completion`] the caller may wait
/// on to know when cleanup (and, if requested, refill) has finished; it is
/// always fulfilled, even on failure.
pub fn drain_and_refill<H: WorkerLifecycle>(ctx: &PoolContext<H>, refill: bool) -> Result<Completion<H::Error>, PoolError<H::Error>> {
    let timeout = ctx.flush_timeout();
    let guard = ctx
        .queue
        .lock_with_timeout(timeout)
        .map_err(|e| PoolError::LockTimeout { waited: e.waited })?;

    let pool_size = ctx.pool_size();
    let mut drained = Vec::with_capacity(pool_size);
    for _ in 0..pool_size {
        match guard.borrow(timeout) {
            Ok(worker) => drained.push(worker),
            Err(BorrowOutcome::Timeout) => {
                // A worker never came back in time. Unlike a failing `create`
                // or `cleanup` hook, this is not evidence the pool itself is
                // corrupted — some caller is just holding a worker past the
                // flush timeout — so it is recoverable: put back whatever was
                // already collected, release the lock, and leave the pool
                // exactly as it was before this call. Surfaced as the same
                // `LockTimeout` a caller would see if the exclusive lock
                // itself had never been granted — from the caller's
                // perspective both mean "could not complete the drain within
                // the flush timeout, nothing was torn down."
                for worker in drained {
                    ctx.queue.offer(worker);
                }
                guard.unlock();
                return Err(PoolError::LockTimeout { waited: timeout });
            }
            Err(BorrowOutcome::Pill(cause)) => {
                // Another fatal error already poisoned the pool; surface it
                // rather than masking it with our own.
                guard.unlock();
                return Err(PoolError::AlreadyPoisoned(cause));
            }
            Err(BorrowOutcome::Shutdown) => {
                guard.unlock();
                return Err(PoolError::PoolShutdown);
            }
        }
    }

    // Release the pool lock before cleanup/refill begins: borrowers may
    // immediately attempt to borrow again (and will block on the now-empty
    // queue, or a pill, until refill completes).
    guard.unlock();

    let lifecycle = Arc::clone(&ctx.lifecycle);
    let queue = Arc::clone(&ctx.queue);
    let executor = Arc::clone(&ctx.executor);
    let config = ctx.config().worker_config.clone();
    let splay = ctx.config().splay_instance_flush;
    let new_ids: Vec<i32> = (1..=pool_size as i32).collect();

    let completion = ctx.agent.dispatch_with_completion(move || -> Option<PoolError<H::Error>> {
        // Finish cleaning up every drained worker before deciding whether to
        // treat the batch as fatal: a failure partway through must not leave
        // the remaining old workers leaked.
        let mut cleanup_failure: Option<(i32, H::Error)> = None;
        for worker in drained {
            if let Err(source) = lifecycle.cleanup(worker.handle) {
                if cleanup_failure.is_none() {
                    cleanup_failure = Some((worker.id, source));
                }
            }
        }
        if let Some((slot, source)) = cleanup_failure {
            let error = PoolError::CleanupFailure { slot, source };
            return Some(raise_fatal_on(&queue, lifecycle.as_ref(), error));
        }

        if !refill {
            queue.insert_shutdown_pill();
            return None;
        }

        let first_id = new_ids[0];
        let first_config = config.clone();
        let first_lifecycle = Arc::clone(&lifecycle);
        let first_result = executor.run_one(move || {
            let handle = first_lifecycle.create(first_id, &first_config, splay)?;
            Ok::<_, H::Error>(Worker {
                id: first_id,
                created_at: std::time::Instant::now(),
                handle,
            })
        });

        let mut fatal: Option<(i32, H::Error)> = None;
        match first_result {
            Ok(worker) => {
                queue.offer(worker);
            }
            Err(e) => fatal = Some((first_id, e)),
        }

        if fatal.is_none() && new_ids.len() > 1 {
            let tasks: Vec<_> = new_ids[1..]
                .iter()
                .map(|&id| {
                    let lifecycle = Arc::clone(&lifecycle);
                    let config = config.clone();
                    move || -> Result<Worker<H::Worker>, H::Error> {
                        let handle = lifecycle.create(id, &config, splay)?;
                        Ok(Worker {
                            id,
                            created_at: std::time::Instant::now(),
                            handle,
                        })
                    }
                })
                .collect();

            for (id, result) in new_ids[1..].iter().zip(executor.run_batch(tasks)) {
                match result {
                    Ok(worker) => {
                        queue.offer(worker);
                    }
                    Err(e) => {
                        fatal = Some((*id, e));
                        break;
                    }
                }
            }
        }

        if let Some((slot, source)) = fatal {
            let error = PoolError::ConstructionFailure { slot, source };
            return Some(raise_fatal_on(&queue, lifecycle.as_ref(), error));
        }

        None
    });

    Ok(completion)
}

/// Drains the pool without refilling it, then marks it permanently
/// unavailable. Idempotent against repeated shutdown signals: a second
/// caller simply queues behind the first on the pool lock, and the
/// shutdown pill already in place (once the first caller finishes) ensures
/// any later borrow still terminates cleanly.
pub fn flush_for_shutdown<H: WorkerLifecycle>(ctx: &PoolContext<H>) -> Result<(), PoolError<H::Error>> {
    let completion = drain_and_refill(ctx, false)?;
    if let Some(error) = completion.wait() {
        return Err(error);
    }
    Ok(())
}
