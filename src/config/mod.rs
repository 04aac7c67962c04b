use garde::Validate;
use serde::Deserialize;
use std::str::FromStr;
use std::time::Duration;

use crate::models::outcome::FailureKind;
use crate::services::retry::RetryPolicy;

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct AppConfig {
    /// Ops endpoint bind address serving `/health` and `/metrics`.
    #[serde(default = "default_bind_addr")]
    #[garde(skip)]
    pub bind_addr: String,

    /// Identifies this worker's processing list in the broker. Required, and
    /// must stay the same across restarts and container recreation: startup
    /// recovery only reclaims the list named by this id.
    #[garde(length(min = 1, max = 64))]
    pub worker_id: String,

    /// Redis connection string for the frame queue
    #[garde(length(min = 1))]
    pub redis_url: String,

    #[serde(default = "default_frame_queue")]
    #[garde(length(min = 1))]
    pub frame_queue: String,

    #[serde(default = "default_dead_letter_queue")]
    #[garde(length(min = 1))]
    pub dead_letter_queue: String,

    /// List receiving one status reply per settled frame.
    #[serde(default = "default_status_queue")]
    #[garde(length(min = 1))]
    pub status_queue: String,

    /// Replies kept in the status list; older ones are trimmed.
    #[serde(default = "default_status_queue_max_len")]
    #[garde(range(min = 1))]
    pub status_queue_max_len: usize,

    /// PostgreSQL connection string
    #[garde(length(min = 1))]
    pub database_url: String,

    #[serde(default = "default_db_pool_size")]
    #[garde(range(min = 1, max = 512))]
    pub db_pool_size: u32,

    #[serde(default = "default_db_acquire_timeout_ms")]
    #[garde(range(min = 1))]
    pub db_acquire_timeout_ms: u64,

    #[serde(default = "default_persist_timeout_ms")]
    #[garde(range(min = 1))]
    pub persist_timeout_ms: u64,

    /// Model-serving endpoint that scores one frame per request
    #[garde(length(min = 1))]
    pub detector_url: String,

    #[serde(default)]
    #[garde(skip)]
    pub detector_api_token: Option<String>,

    /// Accelerator capacity K: concurrent inferences admitted at once.
    #[serde(default = "default_inference_concurrency")]
    #[garde(range(min = 1, max = 1024))]
    pub inference_concurrency: usize,

    #[serde(default = "default_inference_timeout_ms")]
    #[garde(range(min = 1))]
    pub inference_timeout_ms: u64,

    /// Detections scoring below this are discarded.
    #[serde(default = "default_min_confidence")]
    #[garde(range(min = 0.0, max = 1.0))]
    pub min_confidence: f32,

    #[serde(default = "default_receive_timeout_ms")]
    #[garde(range(min = 1))]
    pub receive_timeout_ms: u64,

    /// Bound on resolving a frame's payload (blob download).
    #[serde(default = "default_payload_timeout_ms")]
    #[garde(range(min = 1))]
    pub payload_timeout_ms: u64,

    #[serde(default = "default_retry_base_ms")]
    #[garde(range(min = 1))]
    pub retry_base_ms: u64,

    #[serde(default = "default_retry_ceiling_ms")]
    #[garde(custom(at_least_base(&self.retry_base_ms)))]
    pub retry_ceiling_ms: u64,

    #[serde(default = "default_max_attempts")]
    #[garde(range(min = 1))]
    pub max_attempts: u32,

    /// Comma separated failure kinds to drop instead of dead-lettering.
    /// Only `data` is accepted.
    #[serde(default)]
    #[garde(skip)]
    pub non_actionable_failures: Vec<String>,

    #[serde(default = "default_shutdown_grace_ms")]
    #[garde(skip)]
    pub shutdown_grace_ms: u64,

    /// Deliveries held in flight at once, queued or inferring or persisting.
    #[serde(default = "default_prefetch")]
    #[garde(range(min = 1))]
    pub prefetch: usize,

    /// Object storage for blob payload references. All four must be set for
    /// blob payloads to resolve.
    #[serde(default)]
    #[garde(skip)]
    pub blob_bucket: Option<String>,

    #[serde(default)]
    #[garde(skip)]
    pub blob_endpoint: Option<String>,

    #[serde(default)]
    #[garde(skip)]
    pub blob_access_key: Option<String>,

    #[serde(default)]
    #[garde(skip)]
    pub blob_secret_key: Option<String>,
}

/// Credentials for the frame blob bucket.
#[derive(Debug, Clone, PartialEq)]
pub struct BlobConfig {
    pub bucket: String,
    pub endpoint: String,
    pub access_key: String,
    pub secret_key: String,
}

fn at_least_base(base: &u64) -> impl FnOnce(&u64, &()) -> garde::Result + '_ {
    move |ceiling, _| {
        if ceiling < base {
            return Err(garde::Error::new(format!(
                "retry ceiling {}ms is below retry base {}ms",
                ceiling, base
            )));
        }
        Ok(())
    }
}

fn default_bind_addr() -> String {
    "0.0.0.0:9100".to_string()
}


fn default_frame_queue() -> String {
    "sensiflow:frames".to_string()
}

fn default_dead_letter_queue() -> String {
    "sensiflow:frames:dead_letter".to_string()
}

fn default_status_queue() -> String {
    "sensiflow:frames:status".to_string()
}

fn default_status_queue_max_len() -> usize {
    100_000
}

fn default_db_pool_size() -> u32 {
    10
}

fn default_db_acquire_timeout_ms() -> u64 {
    5_000
}

fn default_persist_timeout_ms() -> u64 {
    10_000
}

fn default_inference_concurrency() -> usize {
    1
}

fn default_inference_timeout_ms() -> u64 {
    30_000
}

fn default_min_confidence() -> f32 {
    0.25
}

fn default_receive_timeout_ms() -> u64 {
    5_000
}

fn default_payload_timeout_ms() -> u64 {
    10_000
}

fn default_retry_base_ms() -> u64 {
    500
}

fn default_retry_ceiling_ms() -> u64 {
    30_000
}

fn default_max_attempts() -> u32 {
    5
}

fn default_shutdown_grace_ms() -> u64 {
    30_000
}

fn default_prefetch() -> usize {
    8
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_vars(std::env::vars())
    }

    /// Build from an explicit set of variables, then validate.
    pub fn from_vars<I>(vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let config: AppConfig = envy::from_iter(vars)?;
        config.validate().map_err(|r| ConfigError::Invalid(r.to_string()))?;
        // Surface bad failure kinds at startup rather than on first failure.
        config.retry_policy()?;
        Ok(config)
    }

    pub fn retry_policy(&self) -> Result<RetryPolicy, ConfigError> {
        let mut non_actionable = Vec::with_capacity(self.non_actionable_failures.len());
        for name in self.non_actionable_failures.iter().filter(|n| !n.trim().is_empty()) {
            let kind = FailureKind::from_str(name.trim())
                .map_err(|_| ConfigError::UnknownFailureKind(name.clone()))?;
            if kind.is_transient() {
                return Err(ConfigError::TransientNotDroppable(kind));
            }
            non_actionable.push(kind);
        }

        Ok(RetryPolicy::new(
            Duration::from_millis(self.retry_base_ms),
            Duration::from_millis(self.retry_ceiling_ms),
            self.max_attempts,
        )
        .with_non_actionable(non_actionable))
    }

    pub fn blob(&self) -> Option<BlobConfig> {
        Some(BlobConfig {
            bucket: self.blob_bucket.clone()?,
            endpoint: self.blob_endpoint.clone()?,
            access_key: self.blob_access_key.clone()?,
            secret_key: self.blob_secret_key.clone()?,
        })
    }

    pub fn db_acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.db_acquire_timeout_ms)
    }

    pub fn persist_timeout(&self) -> Duration {
        Duration::from_millis(self.persist_timeout_ms)
    }

    pub fn inference_timeout(&self) -> Duration {
        Duration::from_millis(self.inference_timeout_ms)
    }

    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }

    pub fn payload_timeout(&self) -> Duration {
        Duration::from_millis(self.payload_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read configuration from environment: {0}")]
    Env(#[from] envy::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Unknown failure kind in NON_ACTIONABLE_FAILURES: {0}")]
    UnknownFailureKind(String),

    #[error("Transient failure kind '{0}' can never be dropped")]
    TransientNotDroppable(FailureKind),
}
