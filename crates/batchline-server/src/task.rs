//! Task records and their wire representation.
//!
//! A task is created at submission, claimed exactly once by the batcher, and
//! settled exactly once by the dispatcher. The record keeps wall-clock
//! timestamps for the wire and monotonic instants for duration math.

use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Queue lane for a task. Order of variants is drain order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

/// Where a completion came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseSource {
    #[serde(rename = "real")]
    Real,
    #[serde(rename = "mock")]
    Mock,
    #[serde(rename = "mock-fallback")]
    MockFallback,
}

/// Bounded generation options; defaults applied at validation time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationParams {
    pub max_tokens: u32,
    pub temperature: f32,
    pub model: String,
}

pub const DEFAULT_MAX_TOKENS: u32 = 100;
pub const DEFAULT_TEMPERATURE: f32 = 0.7;
pub const DEFAULT_MODEL: &str = "mock-model";

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            max_tokens: DEFAULT_MAX_TOKENS,
            temperature: DEFAULT_TEMPERATURE,
            model: DEFAULT_MODEL.to_string(),
        }
    }
}

/// Successful outcome attached to a completed task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub response: String,
    pub tokens_generated: u32,
    pub source: ResponseSource,
    pub batch_id: String,
    pub batch_size: usize,
}

#[derive(Debug, Clone)]
pub struct Task {
    pub task_id: String,
    pub principal: String,
    pub priority: Priority,
    pub prompt: String,
    pub params: GenerationParams,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Monotonic companions to the wall-clock timestamps.
    pub started_instant: Option<Instant>,
    pub completed_instant: Option<Instant>,
    pub result: Option<TaskResult>,
    pub error: Option<String>,
}

impl Task {
    pub fn new(principal: &str, priority: Priority, prompt: String, params: GenerationParams) -> Self {
        Self {
            task_id: Uuid::new_v4().to_string(),
            principal: principal.to_string(),
            priority,
            prompt,
            params,
            status: TaskStatus::Queued,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            started_instant: None,
            completed_instant: None,
            result: None,
            error: None,
        }
    }

    /// Seconds spent processing, from the monotonic clock. Present only for
    /// terminal tasks that were actually claimed.
    pub fn processing_time(&self) -> Option<f64> {
        match (self.started_instant, self.completed_instant) {
            (Some(started), Some(completed)) => {
                Some(completed.saturating_duration_since(started).as_secs_f64())
            }
            _ => None,
        }
    }

    pub fn record(&self) -> TaskRecord {
        TaskRecord {
            task_id: self.task_id.clone(),
            status: self.status,
            priority: self.priority,
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
            processing_time: self.processing_time(),
            result: self.result.clone(),
            error: self.error.clone(),
        }
    }
}

/// The task as returned by `GET /tasks/{task_id}`.
#[derive(Debug, Clone, Serialize)]
pub struct TaskRecord {
    pub task_id: String,
    pub status: TaskStatus,
    pub priority: Priority,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing_time: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<TaskResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
