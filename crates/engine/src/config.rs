//! Configuration management for the Synapse engine
//!
//! Centralized configuration with per-subsystem sections, environment
//! variable overrides, and validation against the timing invariants the
//! segment protocol depends on.

use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::types::ConfigError;

/// Main engine configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// HTTP API configuration
    pub api: ApiConfig,
    /// State store configuration
    pub store: StoreConfig,
    /// Continuation queue configuration
    pub queue: QueueConfig,
    /// Segment / locking / OCC timing knobs
    pub engine: EngineConfig,
    /// Dead-letter queue monitor configuration
    pub dlq: DlqConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// HTTP API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Server bind address
    pub bind_address: String,
    /// Server port
    pub port: u16,
    /// Enable CORS
    pub enable_cors: bool,
    /// Enable per-IP rate limiting (100 req/min)
    pub enable_rate_limiting: bool,
    /// Bearer token for service-to-service endpoints (`/mesh/resume`)
    #[serde(skip_serializing)]
    pub service_token: Option<String>,
    /// Shared key accepted in `x-internal-system-key` for direct step execution
    #[serde(skip_serializing)]
    pub internal_system_key: Option<String>,
    /// Require queue signatures on `/engine/execute-step` (disable only in tests)
    pub require_queue_signature: bool,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1".to_string(),
            port: 8080,
            enable_cors: true,
            enable_rate_limiting: true,
            service_token: None,
            internal_system_key: None,
            require_queue_signature: true,
        }
    }
}

/// What to do when the durable state store is unreachable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StoreFallbackPolicy {
    /// Refuse to operate without the durable store
    #[default]
    FailFast,
    /// Degrade to in-process locking with reduced guarantees (logged)
    FallbackInProcess,
}

/// State store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Path to the sqlite database; `None` selects the default data dir
    pub path: Option<PathBuf>,
    /// Use the in-memory backend (tests, ephemeral deployments)
    pub in_memory: bool,
    /// Behavior when the durable backend is unreachable
    pub fallback_policy: StoreFallbackPolicy,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: None,
            in_memory: false,
            fallback_policy: StoreFallbackPolicy::FailFast,
        }
    }
}

impl StoreConfig {
    /// Default database path: `$XDG_DATA_HOME/synapse/state.db`
    pub fn default_path() -> PathBuf {
        let base = dirs::data_dir().unwrap_or_else(|| PathBuf::from("."));
        base.join("synapse").join("state.db")
    }
}

/// Continuation queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// URL the queue delivers continuation jobs to (`…/engine/execute-step`)
    pub target_url: String,
    /// HMAC secret for signing/verifying deliveries
    #[serde(skip_serializing)]
    pub signing_secret: Option<String>,
    /// Delivery retry attempts
    pub max_delivery_attempts: u32,
    /// Base backoff between delivery attempts
    pub retry_backoff_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            target_url: "http://127.0.0.1:8080/engine/execute-step".to_string(),
            signing_secret: None,
            max_delivery_attempts: 3,
            retry_backoff_ms: 500,
        }
    }
}

/// Timing and concurrency knobs for the segment protocol.
///
/// The invariant `checkpoint_threshold_ms < segment_timeout_ms` must hold
/// strictly, with both under the platform invocation limit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Wall-clock budget for one segment (≤ 9000 on 10-second platforms)
    pub segment_timeout_ms: u64,
    /// Point inside the budget where the cancel signal fires and the machine
    /// prefers checkpointing over starting new work (≤ 7000)
    pub checkpoint_threshold_ms: u64,
    /// Margin subtracted from the remaining budget when bounding tool timeouts
    pub safety_margin_ms: u64,
    /// Coarse per-execution lock TTL
    pub coarse_lock_ttl_s: u64,
    /// Per-step idempotency lock TTL
    pub step_lock_ttl_s: u64,
    /// OCC retry ceiling
    pub max_occ_retries: u32,
    /// OCC base backoff
    pub occ_base_delay_ms: u64,
    /// Default timeout for compensation invocations
    pub compensation_timeout_ms: u64,
    /// Replan marker TTL
    pub replan_marker_ttl_s: u64,
    /// Checkpoint record TTL
    pub checkpoint_ttl_s: u64,
    /// Cancellation tombstone TTL
    pub tombstone_ttl_s: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            segment_timeout_ms: 9_000,
            checkpoint_threshold_ms: 7_000,
            safety_margin_ms: 500,
            coarse_lock_ttl_s: 30,
            step_lock_ttl_s: 3_600,
            max_occ_retries: 5,
            occ_base_delay_ms: 50,
            compensation_timeout_ms: 15_000,
            replan_marker_ttl_s: 300,
            checkpoint_ttl_s: 86_400,
            tombstone_ttl_s: 604_800,
        }
    }
}

impl EngineConfig {
    pub fn segment_timeout(&self) -> Duration {
        Duration::from_millis(self.segment_timeout_ms)
    }

    pub fn checkpoint_threshold(&self) -> Duration {
        Duration::from_millis(self.checkpoint_threshold_ms)
    }
}

/// Dead-letter queue monitor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqConfig {
    /// Idle time after which an in-flight execution counts as a zombie
    pub stall_threshold_s: u64,
    /// Automatic recovery attempts before parking in the DLQ
    pub max_recovery_attempts: u32,
    /// Scan interval for the monitor task
    pub scan_interval_s: u64,
    /// DLQ entry TTL
    pub entry_ttl_s: u64,
}

impl Default for DlqConfig {
    fn default() -> Self {
        Self {
            stall_threshold_s: 600,
            max_recovery_attempts: 3,
            scan_interval_s: 60,
            entry_ttl_s: 604_800,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g. `info`, `synapse_engine=debug`)
    pub level: String,
    /// Emit JSON-structured logs
    pub structured: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            structured: false,
        }
    }
}

impl Config {
    /// Load configuration from environment variables over defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Config::default();

        if let Ok(port) = env::var("SYNAPSE_API_PORT") {
            config.api.port = port.parse().map_err(|_| ConfigError::InvalidValue {
                key: "SYNAPSE_API_PORT".into(),
                reason: format!("not a port number: {port}"),
            })?;
        }
        if let Ok(addr) = env::var("SYNAPSE_BIND_ADDRESS") {
            config.api.bind_address = addr;
        }
        if let Ok(token) = env::var("SYNAPSE_SERVICE_TOKEN") {
            config.api.service_token = Some(token);
        }
        if let Ok(key) = env::var("SYNAPSE_INTERNAL_SYSTEM_KEY") {
            config.api.internal_system_key = Some(key);
        }
        if let Ok(path) = env::var("SYNAPSE_STORE_PATH") {
            config.store.path = Some(PathBuf::from(path));
        }
        if let Ok(url) = env::var("SYNAPSE_QUEUE_TARGET_URL") {
            config.queue.target_url = url;
        }
        if let Ok(secret) = env::var("SYNAPSE_QUEUE_SIGNING_SECRET") {
            config.queue.signing_secret = Some(secret);
        }
        if let Ok(ms) = env::var("SYNAPSE_SEGMENT_TIMEOUT_MS") {
            config.engine.segment_timeout_ms =
                ms.parse().map_err(|_| ConfigError::InvalidValue {
                    key: "SYNAPSE_SEGMENT_TIMEOUT_MS".into(),
                    reason: format!("not a duration in ms: {ms}"),
                })?;
        }
        if let Ok(ms) = env::var("SYNAPSE_CHECKPOINT_THRESHOLD_MS") {
            config.engine.checkpoint_threshold_ms =
                ms.parse().map_err(|_| ConfigError::InvalidValue {
                    key: "SYNAPSE_CHECKPOINT_THRESHOLD_MS".into(),
                    reason: format!("not a duration in ms: {ms}"),
                })?;
        }
        if let Ok(s) = env::var("SYNAPSE_DLQ_STALL_THRESHOLD_S") {
            config.dlq.stall_threshold_s =
                s.parse().map_err(|_| ConfigError::InvalidValue {
                    key: "SYNAPSE_DLQ_STALL_THRESHOLD_S".into(),
                    reason: format!("not a duration in s: {s}"),
                })?;
        }
        if let Ok(level) = env::var("SYNAPSE_LOG_LEVEL") {
            config.logging.level = level;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field invariants.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.engine.checkpoint_threshold_ms >= self.engine.segment_timeout_ms {
            return Err(ConfigError::InvalidValue {
                key: "engine.checkpoint_threshold_ms".into(),
                reason: format!(
                    "must be strictly below segment_timeout_ms ({} >= {})",
                    self.engine.checkpoint_threshold_ms, self.engine.segment_timeout_ms
                ),
            });
        }
        if self.engine.segment_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                key: "engine.segment_timeout_ms".into(),
                reason: "must be positive".into(),
            });
        }
        if self.engine.max_occ_retries == 0 {
            return Err(ConfigError::InvalidValue {
                key: "engine.max_occ_retries".into(),
                reason: "must be at least 1".into(),
            });
        }
        if self.api.require_queue_signature && self.queue.signing_secret.is_none() {
            // Deferred to runtime: the handler rejects unsigned deliveries,
            // so a missing secret only breaks enqueue, not startup.
            tracing::warn!(
                "queue signature required but SYNAPSE_QUEUE_SIGNING_SECRET is unset"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_threshold_must_be_below_segment_timeout() {
        let mut config = Config::default();
        config.engine.checkpoint_threshold_ms = config.engine.segment_timeout_ms;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_spec_defaults() {
        let engine = EngineConfig::default();
        assert!(engine.segment_timeout_ms <= 9_000);
        assert!(engine.checkpoint_threshold_ms <= 7_000);
        assert_eq!(engine.coarse_lock_ttl_s, 30);
        assert_eq!(engine.step_lock_ttl_s, 3_600);
        assert_eq!(engine.max_occ_retries, 5);
        assert_eq!(engine.occ_base_delay_ms, 50);
        let dlq = DlqConfig::default();
        assert_eq!(dlq.stall_threshold_s, 600);
        assert_eq!(dlq.max_recovery_attempts, 3);
    }
}
