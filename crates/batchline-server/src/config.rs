//! Service configuration loaded from the environment.
//!
//! Every tunable has an environment key and a default; `Settings::from_env`
//! reads and validates all of them in one pass so a misconfigured process
//! fails at startup instead of at first use.

use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// Batch-formation and dispatch tuning.
#[derive(Debug, Clone, Serialize)]
pub struct BatchSettings {
    /// Upper bound on tasks per batch.
    pub max_batch_size: usize,
    /// Longest a partial batch waits for more arrivals, measured from the
    /// first drained task.
    #[serde(with = "secs_f64")]
    pub batch_wait_timeout: Duration,
    /// Batches allowed in flight at once.
    pub max_concurrent_batches: usize,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            max_batch_size: 32,
            batch_wait_timeout: Duration::from_millis(100),
            max_concurrent_batches: 4,
        }
    }
}

/// Upstream engine selection and connection tuning.
#[derive(Debug, Clone, Serialize)]
pub struct EngineSettings {
    /// True selects the real upstream adapter; false the deterministic mock.
    pub use_real_upstream: bool,
    pub upstream_url: String,
    /// Model name forwarded upstream when the caller does not pick one.
    pub upstream_model: String,
    #[serde(with = "secs_f64")]
    pub request_timeout: Duration,
    /// Substitute a mock completion when an individual upstream call fails.
    pub fallback_enabled: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            use_real_upstream: false,
            upstream_url: "http://localhost:8000".to_string(),
            upstream_model: "Qwen/Qwen2.5-Coder-7B-Instruct".to_string(),
            request_timeout: Duration::from_secs(60),
            fallback_enabled: true,
        }
    }
}

/// Token signing and the seeded demo credential.
#[derive(Debug, Clone)]
pub struct AuthSettings {
    pub jwt_secret: String,
    pub jwt_algorithm: String,
    pub jwt_expiration_minutes: i64,
    pub demo_user: String,
    pub demo_password: String,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            jwt_secret: "change-this-to-a-random-secret-key".to_string(),
            jwt_algorithm: "HS256".to_string(),
            jwt_expiration_minutes: 30,
            demo_user: "demo".to_string(),
            demo_password: "demo-password".to_string(),
        }
    }
}

/// Queue and task-store capacity limits.
#[derive(Debug, Clone, Serialize)]
pub struct CapacitySettings {
    pub queue_max_depth: usize,
    pub task_retention_seconds: u64,
    pub task_max_retained: usize,
    pub max_prompt_chars: usize,
}

impl Default for CapacitySettings {
    fn default() -> Self {
        Self {
            queue_max_depth: 10_000,
            task_retention_seconds: 3_600,
            task_max_retained: 100_000,
            max_prompt_chars: 8_192,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub batch: BatchSettings,
    pub engine: EngineSettings,
    pub auth: AuthSettings,
    pub capacity: CapacitySettings,
    pub shutdown_grace: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            batch: BatchSettings::default(),
            engine: EngineSettings::default(),
            auth: AuthSettings::default(),
            capacity: CapacitySettings::default(),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

impl Settings {
    /// Read every setting from the environment, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut settings = Self {
            shutdown_grace: Duration::from_secs(read("SHUTDOWN_GRACE_SECONDS", 5u64)?),
            ..Self::default()
        };

        settings.batch.max_batch_size = read("VLLM_MAX_BATCH_SIZE", 32usize)?;
        let wait_secs = read("VLLM_BATCH_WAIT_TIMEOUT", 0.1f64)?;
        if !wait_secs.is_finite() || wait_secs < 0.0 {
            return Err(invalid("VLLM_BATCH_WAIT_TIMEOUT", "must be a non-negative number"));
        }
        settings.batch.batch_wait_timeout = Duration::from_secs_f64(wait_secs);
        settings.batch.max_concurrent_batches = read("VLLM_MAX_CONCURRENT_BATCHES", 4usize)?;

        settings.engine.use_real_upstream = read("USE_REAL_VLLM", false)?;
        if let Ok(url) = std::env::var("REAL_VLLM_URL") {
            settings.engine.upstream_url = url;
        }
        if let Ok(model) = std::env::var("REAL_VLLM_MODEL") {
            settings.engine.upstream_model = model;
        }
        settings.engine.request_timeout = Duration::from_secs(read("VLLM_REQUEST_TIMEOUT", 60u64)?);
        settings.engine.fallback_enabled = read("VLLM_FALLBACK_ENABLED", true)?;

        if let Ok(secret) = std::env::var("JWT_SECRET_KEY") {
            settings.auth.jwt_secret = secret;
        }
        if let Ok(alg) = std::env::var("JWT_ALGORITHM") {
            settings.auth.jwt_algorithm = alg;
        }
        settings.auth.jwt_expiration_minutes = read("JWT_EXPIRATION_MINUTES", 30i64)?;
        if let Ok(user) = std::env::var("AUTH_DEMO_USER") {
            settings.auth.demo_user = user;
        }
        if let Ok(password) = std::env::var("AUTH_DEMO_PASSWORD") {
            settings.auth.demo_password = password;
        }

        settings.capacity.queue_max_depth = read("QUEUE_MAX_DEPTH", 10_000usize)?;
        settings.capacity.task_retention_seconds = read("TASK_RETENTION_SECONDS", 3_600u64)?;
        settings.capacity.task_max_retained = read("TASK_MAX_RETAINED", 100_000usize)?;
        settings.capacity.max_prompt_chars = read("MAX_PROMPT_CHARS", 8_192usize)?;

        settings.validate()?;
        Ok(settings)
    }

    /// Reject configurations the scheduler cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch.max_batch_size == 0 {
            return Err(invalid("VLLM_MAX_BATCH_SIZE", "must be at least 1"));
        }
        if self.batch.max_concurrent_batches == 0 {
            return Err(invalid("VLLM_MAX_CONCURRENT_BATCHES", "must be at least 1"));
        }
        if self.engine.use_real_upstream
            && !self.engine.upstream_url.starts_with("http://")
            && !self.engine.upstream_url.starts_with("https://")
        {
            return Err(invalid("REAL_VLLM_URL", "must be an http(s) URL"));
        }
        if self.auth.jwt_secret.is_empty() {
            return Err(invalid("JWT_SECRET_KEY", "must not be empty"));
        }
        if self.auth.jwt_algorithm != "HS256" {
            return Err(invalid("JWT_ALGORITHM", "only HS256 is supported"));
        }
        if self.auth.jwt_expiration_minutes < 0 {
            return Err(invalid("JWT_EXPIRATION_MINUTES", "must be non-negative"));
        }
        if self.capacity.queue_max_depth == 0 {
            return Err(invalid("QUEUE_MAX_DEPTH", "must be at least 1"));
        }
        if self.capacity.max_prompt_chars == 0 {
            return Err(invalid("MAX_PROMPT_CHARS", "must be at least 1"));
        }
        Ok(())
    }
}

fn invalid(key: &'static str, reason: &str) -> ConfigError {
    ConfigError::Invalid { key, reason: reason.to_string() }
}

/// Parse `key` from the environment, or return `default` when unset.
fn read<T: std::str::FromStr>(key: &'static str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| ConfigError::Invalid { key, reason: e.to_string() }),
        Err(_) => Ok(default),
    }
}

/// Serialize `Duration` fields as fractional seconds on `/health` and
/// `/stats`, matching the environment-key units.
mod secs_f64 {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.batch.max_batch_size, 32);
        assert_eq!(settings.batch.batch_wait_timeout, Duration::from_millis(100));
        assert_eq!(settings.batch.max_concurrent_batches, 4);
        assert_eq!(settings.capacity.queue_max_depth, 10_000);
    }

    #[test]
    fn zero_batch_size_rejected() {
        let mut settings = Settings::default();
        settings.batch.max_batch_size = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn non_hs256_algorithm_rejected() {
        let mut settings = Settings::default();
        settings.auth.jwt_algorithm = "RS256".to_string();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn real_mode_requires_http_url() {
        let mut settings = Settings::default();
        settings.engine.use_real_upstream = true;
        settings.engine.upstream_url = "not-a-url".to_string();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn env_overrides_are_read() {
        // Serialized with other env-reading tests by using unique keys.
        unsafe { std::env::set_var("VLLM_MAX_BATCH_SIZE", "8") };
        unsafe { std::env::set_var("VLLM_BATCH_WAIT_TIMEOUT", "0.25") };
        let settings = Settings::from_env().expect("from_env");
        unsafe { std::env::remove_var("VLLM_MAX_BATCH_SIZE") };
        unsafe { std::env::remove_var("VLLM_BATCH_WAIT_TIMEOUT") };

        assert_eq!(settings.batch.max_batch_size, 8);
        assert_eq!(settings.batch.batch_wait_timeout, Duration::from_millis(250));
    }
}
