//! Dynamic batching front end for text-generation inference.
//!
//! The service accepts authenticated HTTP submissions, coalesces them into
//! batches under size and time bounds, and executes each batch against an
//! upstream OpenAI-compatible engine or a deterministic mock. All
//! collaborators are owned by [`Service`], constructed once in `main` and
//! shared by reference; background loops are tied to one shutdown signal.

pub mod api;
pub mod auth;
pub mod batch;
pub mod config;
pub mod engine;
pub mod error;
pub mod middleware;
pub mod openai;
pub mod queue;
pub mod stats;
pub mod store;
pub mod task;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::{Router, middleware as axum_middleware, routing::{get, post}};
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinHandle;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

use crate::auth::Authenticator;
use crate::batch::{SchedulerCtx, run_batcher};
use crate::config::Settings;
use crate::engine::EngineAdapter;
use crate::queue::PriorityQueue;
use crate::stats::StatsCollector;
use crate::store::TaskStore;

/// Interval between task-store eviction sweeps.
const EVICTION_TICK: Duration = Duration::from_secs(60);

/// Root of the service: every collaborator lives here, nothing is global.
pub struct Service {
    pub settings: Settings,
    pub store: Arc<TaskStore>,
    pub queue: Arc<PriorityQueue>,
    pub stats: Arc<StatsCollector>,
    pub adapter: Arc<EngineAdapter>,
    pub authenticator: Arc<Authenticator>,
    pub slots: Arc<Semaphore>,
    shutdown: watch::Sender<bool>,
}

/// Join handles for the background loops, so `main` can wait for the
/// batcher's shutdown drain.
pub struct Workers {
    pub batcher: JoinHandle<()>,
    pub eviction: JoinHandle<()>,
}

impl Service {
    pub async fn new(settings: Settings) -> Result<Arc<Self>> {
        settings.validate()?;

        let adapter = Arc::new(EngineAdapter::from_settings(&settings.engine)?);
        adapter.probe().await;

        let store = Arc::new(TaskStore::new(
            Duration::from_secs(settings.capacity.task_retention_seconds),
            settings.capacity.task_max_retained,
        ));
        let queue = Arc::new(PriorityQueue::new(settings.capacity.queue_max_depth));
        let stats = Arc::new(StatsCollector::new(settings.batch.max_batch_size));
        let authenticator = Arc::new(Authenticator::new(&settings.auth));
        let slots = Arc::new(Semaphore::new(settings.batch.max_concurrent_batches));
        let (shutdown, _) = watch::channel(false);

        info!(mode = adapter.mode(), "service constructed");
        Ok(Arc::new(Self {
            settings,
            store,
            queue,
            stats,
            adapter,
            authenticator,
            slots,
            shutdown,
        }))
    }

    fn scheduler_ctx(&self) -> SchedulerCtx {
        SchedulerCtx {
            queue: self.queue.clone(),
            store: self.store.clone(),
            stats: self.stats.clone(),
            adapter: self.adapter.clone(),
            slots: self.slots.clone(),
            settings: self.settings.batch.clone(),
            shutdown_grace: self.settings.shutdown_grace,
        }
    }

    /// Launch the batcher and the store-eviction loop.
    pub fn spawn_workers(self: &Arc<Self>) -> Workers {
        let batcher = tokio::spawn(run_batcher(self.scheduler_ctx(), self.shutdown.subscribe()));

        let store = self.store.clone();
        let mut shutdown = self.shutdown.subscribe();
        let eviction = tokio::spawn(async move {
            let mut tick = tokio::time::interval(EVICTION_TICK);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tick.tick() => store.evict().await,
                }
            }
        });

        Workers { batcher, eviction }
    }

    /// Build the full router with middleware applied.
    pub fn router(self: &Arc<Self>) -> Router {
        Router::new()
            .route("/", get(api::root))
            .route("/token", post(api::issue_token))
            .route("/inference/async", post(api::submit_async))
            .route("/inference/batch", post(api::submit_batch))
            .route("/tasks", get(api::list_tasks))
            .route("/tasks/{task_id}", get(api::get_task))
            .route("/health", get(api::health))
            .route("/stats", get(api::stats))
            .route("/v1/chat/completions", post(api::chat_completions))
            .route("/v1/completions", post(api::completions))
            .route("/v1/models", get(api::list_models))
            .fallback(api::not_found)
            .layer(axum_middleware::from_fn(middleware::correlation_id_middleware))
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
            .with_state(self.clone())
    }

    /// Serve until the shutdown signal flips.
    pub async fn serve(self: &Arc<Self>, listener: tokio::net::TcpListener) -> Result<()> {
        let app = self.router();
        let mut shutdown = self.shutdown.subscribe();
        info!(addr = %listener.local_addr()?, "serving");
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.changed().await;
            })
            .await?;
        Ok(())
    }

    /// Flip the shutdown signal. The batcher stops draining, in-flight
    /// batches get the grace period, queued tasks are failed.
    pub fn begin_shutdown(&self) {
        let _ = self.shutdown.send(true);
    }
}

