//! Engine adapter: one contract, two constructions.
//!
//! The mode is decided once at startup. A real-mode adapter never degrades to
//! mock mode as a whole; individual upstream failures fall back per task when
//! fallback is enabled.

use std::time::Duration;

use futures::future::join_all;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::EngineSettings;
use crate::openai::{ChatCompletionRequest, ChatCompletionResponse, ChatMessage};
use crate::task::{DEFAULT_MODEL, ResponseSource, Task};

#[derive(Debug, Error)]
pub enum EngineError {
    /// Per-task upstream timeout; the reason string doubles as the task's
    /// failure reason.
    #[error("timeout")]
    Timeout,
    #[error("upstream error: {0}")]
    Upstream(String),
    #[error("malformed upstream response: {0}")]
    Malformed(String),
}

/// Per-task outcome of a batch execution. `batch_id` and `batch_size` are
/// attached by the dispatcher, not here.
#[derive(Debug, Clone)]
pub struct EngineReply {
    pub response: String,
    pub tokens_generated: u32,
    pub source: ResponseSource,
}

pub enum EngineAdapter {
    Mock(MockEngine),
    Upstream(UpstreamEngine),
}

impl EngineAdapter {
    pub fn from_settings(settings: &EngineSettings) -> anyhow::Result<Self> {
        if settings.use_real_upstream {
            Ok(Self::Upstream(UpstreamEngine::new(settings)?))
        } else {
            Ok(Self::Mock(MockEngine::default()))
        }
    }

    pub fn mode(&self) -> &'static str {
        match self {
            Self::Mock(_) => "mock",
            Self::Upstream(_) => "real",
        }
    }

    /// Model name reported on `/v1/models`.
    pub fn served_model(&self) -> &str {
        match self {
            Self::Mock(_) => DEFAULT_MODEL,
            Self::Upstream(engine) => &engine.model,
        }
    }

    /// Startup connectivity probe. Failure is logged and tolerated; the
    /// adapter keeps serving through the fallback path.
    pub async fn probe(&self) {
        if let Self::Upstream(engine) = self {
            engine.probe().await;
        }
    }

    /// Run one batch. The outer `Result` is an adapter-level crash that fails
    /// the whole batch; the inner results settle each task independently.
    pub async fn execute(
        &self,
        batch_id: &str,
        tasks: &[Task],
    ) -> Result<Vec<Result<EngineReply, EngineError>>, EngineError> {
        match self {
            Self::Mock(engine) => Ok(engine.execute(batch_id, tasks).await),
            Self::Upstream(engine) => Ok(engine.execute(batch_id, tasks).await),
        }
    }
}

/// Rough token count used by the mock: whitespace-separated words.
fn approx_tokens(prompt: &str) -> u32 {
    prompt.split_whitespace().count() as u32
}

/// Deterministic reply for one task. Shared with the upstream adapter's
/// fallback path, which is what keeps fallback responses recognizable.
fn mock_reply(batch_id: &str, task: &Task, source: ResponseSource) -> EngineReply {
    let short_id = &batch_id[..batch_id.len().min(8)];
    EngineReply {
        response: format!("[Batched mock response {short_id}] Mock response to: {}", task.prompt),
        tokens_generated: (approx_tokens(&task.prompt) * 2).min(task.params.max_tokens),
        source,
    }
}

/// Simulates GPU batching: one cooperative sleep per batch, sized by the
/// batch, then deterministic per-task text.
pub struct MockEngine {
    base_latency: Duration,
    per_item_latency: Duration,
}

impl Default for MockEngine {
    fn default() -> Self {
        Self { base_latency: Duration::from_millis(500), per_item_latency: Duration::from_millis(50) }
    }
}

impl MockEngine {
    #[cfg(test)]
    pub fn with_latency(base: Duration, per_item: Duration) -> Self {
        Self { base_latency: base, per_item_latency: per_item }
    }

    pub async fn execute(
        &self,
        batch_id: &str,
        tasks: &[Task],
    ) -> Vec<Result<EngineReply, EngineError>> {
        let latency = self.base_latency + self.per_item_latency * tasks.len() as u32;
        tokio::time::sleep(latency).await;
        tasks.iter().map(|task| Ok(mock_reply(batch_id, task, ResponseSource::Mock))).collect()
    }
}

/// Proxies each task to the upstream chat-completions endpoint, in parallel
/// within the batch, substituting a mock completion per failed task when
/// fallback is enabled.
pub struct UpstreamEngine {
    client: reqwest::Client,
    base_url: String,
    model: String,
    fallback_enabled: bool,
}

impl UpstreamEngine {
    pub fn new(settings: &EngineSettings) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(settings.request_timeout).build()?;
        Ok(Self {
            client,
            base_url: settings.upstream_url.trim_end_matches('/').to_string(),
            model: settings.upstream_model.clone(),
            fallback_enabled: settings.fallback_enabled,
        })
    }

    pub async fn probe(&self) {
        let url = format!("{}/v1/models", self.base_url);
        match self.client.get(&url).send().await {
            Ok(response) if response.status().is_success() => {
                info!(url = %url, "upstream engine reachable");
            }
            Ok(response) => {
                warn!(url = %url, status = %response.status(), "upstream probe returned an error; serving with fallback");
            }
            Err(error) => {
                warn!(url = %url, error = %error, "upstream probe failed; serving with fallback");
            }
        }
    }

    pub async fn execute(
        &self,
        batch_id: &str,
        tasks: &[Task],
    ) -> Vec<Result<EngineReply, EngineError>> {
        join_all(tasks.iter().map(|task| self.call_one(batch_id, task))).await
    }

    /// One upstream call. Any failure is either converted into a mock
    /// fallback for this task alone or returned as this task's error.
    async fn call_one(&self, batch_id: &str, task: &Task) -> Result<EngineReply, EngineError> {
        match self.request(task).await {
            Ok(reply) => Ok(reply),
            Err(error) => {
                if self.fallback_enabled {
                    warn!(
                        task_id = %task.task_id,
                        error = %error,
                        "upstream call failed; substituting mock fallback"
                    );
                    Ok(mock_reply(batch_id, task, ResponseSource::MockFallback))
                } else {
                    Err(error)
                }
            }
        }
    }

    async fn request(&self, task: &Task) -> Result<EngineReply, EngineError> {
        // The submission default is a placeholder, not a real upstream model.
        let model = if task.params.model == DEFAULT_MODEL {
            self.model.clone()
        } else {
            task.params.model.clone()
        };
        let payload = ChatCompletionRequest {
            model: Some(model),
            messages: vec![ChatMessage { role: "user".to_string(), content: task.prompt.clone() }],
            max_tokens: Some(task.params.max_tokens),
            temperature: Some(task.params.temperature),
        };

        let url = format!("{}/v1/chat/completions", self.base_url);
        let response = self.client.post(&url).json(&payload).send().await.map_err(|e| {
            if e.is_timeout() {
                EngineError::Timeout
            } else {
                EngineError::Upstream(e.to_string())
            }
        })?;

        if !response.status().is_success() {
            return Err(EngineError::Upstream(format!("status {}", response.status())));
        }

        let body: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| EngineError::Malformed(e.to_string()))?;
        let choice = body
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| EngineError::Malformed("no choices in response".to_string()))?;

        Ok(EngineReply {
            response: choice.message.content,
            tokens_generated: body.usage.completion_tokens,
            source: ResponseSource::Real,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{GenerationParams, Priority};

    fn task(prompt: &str, max_tokens: u32) -> Task {
        Task::new(
            "alice",
            Priority::Normal,
            prompt.into(),
            GenerationParams { max_tokens, ..GenerationParams::default() },
        )
    }

    #[tokio::test]
    async fn mock_reply_is_deterministic() {
        let engine = MockEngine::with_latency(Duration::ZERO, Duration::ZERO);
        let tasks = vec![task("What is Python?", 100)];
        let replies = engine.execute("0123456789abcdef", &tasks).await;

        let reply = replies[0].as_ref().unwrap();
        assert_eq!(
            reply.response,
            "[Batched mock response 01234567] Mock response to: What is Python?"
        );
        assert_eq!(reply.tokens_generated, 6);
        assert_eq!(reply.source, ResponseSource::Mock);
    }

    #[tokio::test]
    async fn mock_tokens_clamp_to_max_tokens() {
        let engine = MockEngine::with_latency(Duration::ZERO, Duration::ZERO);
        let tasks = vec![task("one two three four five", 4)];
        let replies = engine.execute("b", &tasks).await;
        assert_eq!(replies[0].as_ref().unwrap().tokens_generated, 4);
    }

    #[test]
    fn adapter_mode_follows_settings() {
        let mock = EngineAdapter::from_settings(&EngineSettings::default()).unwrap();
        assert_eq!(mock.mode(), "mock");

        let real = EngineAdapter::from_settings(&EngineSettings {
            use_real_upstream: true,
            ..EngineSettings::default()
        })
        .unwrap();
        assert_eq!(real.mode(), "real");
        assert_eq!(real.served_model(), "Qwen/Qwen2.5-Coder-7B-Instruct");
    }

    #[test]
    fn timeout_error_reads_as_timeout() {
        assert_eq!(EngineError::Timeout.to_string(), "timeout");
    }
}
