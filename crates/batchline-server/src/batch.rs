//! Batch formation and dispatch.
//!
//! Exactly one batcher loop runs per process: it owns the right to move
//! tasks out of `queued`, which is what makes duplicate dispatch impossible.
//! Formed batches are handed to dispatcher tasks bounded by a semaphore;
//! each dispatcher drives one batch end-to-end and settles every member.
//!
//! The batcher never holds a lock while waiting: it suspends on queue
//! emptiness, on the inter-arrival timeout, and on semaphore availability.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::{Semaphore, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::BatchSettings;
use crate::engine::EngineAdapter;
use crate::queue::PriorityQueue;
use crate::stats::StatsCollector;
use crate::store::{Settlement, TaskStore};
use crate::task::{Task, TaskResult};

/// Backoff after an unexpected scheduler error, so a persistent fault cannot
/// spin the loop.
const ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Everything the batcher and dispatchers share. Cheap to clone; all members
/// are reference-counted.
#[derive(Clone)]
pub struct SchedulerCtx {
    pub queue: Arc<PriorityQueue>,
    pub store: Arc<TaskStore>,
    pub stats: Arc<StatsCollector>,
    pub adapter: Arc<EngineAdapter>,
    pub slots: Arc<Semaphore>,
    pub settings: BatchSettings,
    pub shutdown_grace: Duration,
}

/// A formed batch on its way to the engine.
pub struct Batch {
    pub batch_id: String,
    pub tasks: Vec<Task>,
    pub formed_at: Instant,
}

/// The single batch-formation loop. Runs until the shutdown signal flips,
/// then fails whatever is still queued after the grace period.
pub async fn run_batcher(ctx: SchedulerCtx, mut shutdown: watch::Receiver<bool>) {
    info!(
        max_batch_size = ctx.settings.max_batch_size,
        batch_wait_ms = ctx.settings.batch_wait_timeout.as_millis() as u64,
        max_concurrent_batches = ctx.settings.max_concurrent_batches,
        "batcher started"
    );

    loop {
        if *shutdown.borrow() {
            break;
        }
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ctx.queue.wait_nonempty() => {}
        }
        if *shutdown.borrow() {
            break;
        }

        let Some(batch) = form_batch(&ctx).await else {
            continue;
        };

        // Blocks while MAX_CONCURRENT_BATCHES batches are in flight. The
        // permit travels with the dispatcher task and frees on settle.
        let permit = match ctx.slots.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                error!("dispatcher semaphore closed; stopping batcher");
                tokio::time::sleep(ERROR_BACKOFF).await;
                break;
            }
        };
        let dispatch_ctx = ctx.clone();
        tokio::spawn(async move {
            dispatch_batch(dispatch_ctx, batch, permit).await;
        });
    }

    drain_on_shutdown(&ctx).await;
    info!("batcher stopped");
}

/// Drain the queue into one batch, waiting out the remainder of the batching
/// window for more arrivals when the first drain comes up short. The window
/// is measured from the first drained task, so a steady trickle of arrivals
/// cannot defer dispatch indefinitely.
async fn form_batch(ctx: &SchedulerCtx) -> Option<Batch> {
    let max = ctx.settings.max_batch_size;
    let window = ctx.settings.batch_wait_timeout;

    let t0 = Instant::now();
    let mut seen = ctx.queue.arrival_seq();
    let mut picked = ctx.queue.drain_up_to(max, crate::task::Priority::Low).await;
    if picked.is_empty() {
        return None;
    }
    // Top-ups admit only the seed class or better: a high-seeded batch never
    // absorbs normal or low tasks while it waits out its window.
    let floor = picked[0].priority;

    while picked.len() < max {
        let elapsed = t0.elapsed();
        if elapsed >= window {
            break;
        }
        let advanced = ctx.queue.await_arrival(seen, window - elapsed).await;
        if advanced == seen {
            break;
        }
        seen = advanced;
        let more = ctx.queue.drain_up_to(max - picked.len(), floor).await;
        picked.extend(more);
    }

    // Claim every drained task. A failed claim cannot happen by construction
    // (only this loop moves tasks out of `queued`) and is skipped, not fatal.
    let mut tasks = Vec::with_capacity(picked.len());
    for queued in picked {
        match ctx.store.claim(&queued.task_id).await {
            Ok(task) => tasks.push(task),
            Err(err) => {
                warn!(task_id = %queued.task_id, error = %err, "skipping unclaimable task");
            }
        }
    }
    if tasks.is_empty() {
        return None;
    }

    let batch_id = Uuid::new_v4().to_string();
    debug!(
        batch_id = %batch_id,
        batch_size = tasks.len(),
        window_ms = t0.elapsed().as_millis() as u64,
        "formed batch"
    );
    Some(Batch { batch_id, tasks, formed_at: t0 })
}

/// Execute one batch and settle all its tasks. Runs inside its own spawned
/// task, holding one dispatcher slot for its whole lifetime.
async fn dispatch_batch(
    ctx: SchedulerCtx,
    batch: Batch,
    _permit: tokio::sync::OwnedSemaphorePermit,
) {
    let size = batch.tasks.len();
    info!(batch_id = %batch.batch_id, batch_size = size, "dispatching batch");

    let outcome = ctx.adapter.execute(&batch.batch_id, &batch.tasks).await;

    // One timestamp for the whole batch, captured right after it returns.
    let settled_at = Utc::now();
    let settled_instant = Instant::now();

    match outcome {
        Ok(replies) => {
            for (task, reply) in batch.tasks.iter().zip(replies) {
                let settlement = match reply {
                    Ok(reply) => {
                        ctx.stats.record_completion(reply.source);
                        Settlement::Completed(TaskResult {
                            response: reply.response,
                            tokens_generated: reply.tokens_generated,
                            source: reply.source,
                            batch_id: batch.batch_id.clone(),
                            batch_size: size,
                        })
                    }
                    Err(err) => {
                        ctx.stats.record_failure();
                        Settlement::Failed(err.to_string())
                    }
                };
                settle(&ctx, &task.task_id, settlement, settled_at, settled_instant).await;
            }
        }
        Err(err) => {
            error!(batch_id = %batch.batch_id, error = %err, "batch execution failed");
            for task in &batch.tasks {
                ctx.stats.record_failure();
                settle(
                    &ctx,
                    &task.task_id,
                    Settlement::Failed(err.to_string()),
                    settled_at,
                    settled_instant,
                )
                .await;
            }
        }
    }

    ctx.stats.record_batch(size);
    info!(
        batch_id = %batch.batch_id,
        batch_size = size,
        elapsed_ms = batch.formed_at.elapsed().as_millis() as u64,
        "batch settled"
    );
}

async fn settle(
    ctx: &SchedulerCtx,
    task_id: &str,
    settlement: Settlement,
    at: chrono::DateTime<Utc>,
    instant: Instant,
) {
    if let Err(err) = ctx.store.settle(task_id, settlement, at, instant).await {
        // A stale transition here is an invariant violation, not user error.
        error!(task_id = %task_id, error = %err, "failed to settle task");
    }
}

/// Give in-flight batches the grace period, then fail everything still
/// queued with a `"shutdown"` reason.
async fn drain_on_shutdown(ctx: &SchedulerCtx) {
    let deadline = Instant::now() + ctx.shutdown_grace;
    let total = ctx.settings.max_concurrent_batches;
    while ctx.slots.available_permits() < total && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let leftovers = ctx.queue.drain_all().await;
    if leftovers.is_empty() {
        return;
    }
    warn!(count = leftovers.len(), "failing tasks still queued at shutdown");
    for queued in leftovers {
        match ctx.store.fail_queued(&queued.task_id, "shutdown").await {
            Ok(()) => ctx.stats.record_failure(),
            Err(err) => {
                warn!(task_id = %queued.task_id, error = %err, "could not fail queued task")
            }
        }
    }
}
