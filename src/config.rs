//! Configuration loading from environment variables.
//!
//! Uses the following environment variables:
//! - `FILAMENT_ORCHESTRATOR_URL`: Websocket URL of the orchestrator (required)
//! - `FILAMENT_WORKER_TOKEN`: Credential presented when joining the worker queue (required)
//! - `FILAMENT_CAPACITY`: Number of concurrent sandbox slots (default: num_cpus)
//! - `FILAMENT_MAX_CLAIM`: Upper bound on runs requested per claim (default: capacity)
//! - `FILAMENT_CLAIM_BACKOFF_MIN_MS`: Floor of the idle claim backoff (default: 100)
//! - `FILAMENT_CLAIM_BACKOFF_MAX_MS`: Ceiling of the idle claim backoff (default: 10000)
//! - `FILAMENT_RUN_TIMEOUT_MS`: Default per-run wall-clock ceiling (default: 300000)
//! - `FILAMENT_RUN_MEMORY_LIMIT_MB`: Default sandbox memory ceiling (default: none)
//! - `FILAMENT_REPO_DIR`: Adaptor repo directory (default: ./adaptors)
//! - `FILAMENT_KEEP_UNSUPPORTED`: Keep install dirs of unsupported adaptors (default: false)
//! - `FILAMENT_SANDBOX_BIN`: Sandbox executable to spawn (default: filament-sandbox)
//! - `FILAMENT_NPM_BIN`: Package manager binary for adaptor installs (default: npm)

use std::{env, path::PathBuf, time::Duration};

use anyhow::{Context, Result};

/// Worker configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Websocket URL of the orchestrator
    pub orchestrator_url: String,

    /// Credential presented when joining the worker queue
    pub worker_token: String,

    /// Number of concurrent sandbox slots
    pub capacity: usize,

    /// Upper bound on runs requested per claim
    pub max_claim: usize,

    /// Floor of the idle claim backoff
    pub claim_backoff_min: Duration,

    /// Ceiling of the idle claim backoff
    pub claim_backoff_max: Duration,

    /// Default per-run wall-clock ceiling
    pub run_timeout: Duration,

    /// Default sandbox memory ceiling. None means no ceiling.
    pub run_memory_limit_mb: Option<u64>,

    /// Adaptor repo directory
    pub repo_dir: PathBuf,

    /// Keep install dirs of unsupported adaptors for inspection
    pub keep_unsupported: bool,

    /// Sandbox executable to spawn per step execution
    pub sandbox_bin: PathBuf,

    /// Package manager binary for adaptor installs
    pub npm_bin: String,
}

impl Config {
    /// Load configuration from environment variables
    ///
    /// Loads `.env` file if present, then reads from environment.
    pub fn from_env() -> Result<Self> {
        // Load .env file if it exists
        dotenvy::dotenv().ok();

        let orchestrator_url = env::var("FILAMENT_ORCHESTRATOR_URL")
            .context("FILAMENT_ORCHESTRATOR_URL environment variable is required")?;

        let worker_token = env::var("FILAMENT_WORKER_TOKEN")
            .context("FILAMENT_WORKER_TOKEN environment variable is required")?;

        let capacity = env::var("FILAMENT_CAPACITY")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or_else(num_cpus::get);

        let max_claim = env::var("FILAMENT_MAX_CLAIM")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(capacity);

        let claim_backoff_min = env::var("FILAMENT_CLAIM_BACKOFF_MIN_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(Duration::from_millis(100));

        let claim_backoff_max = env::var("FILAMENT_CLAIM_BACKOFF_MAX_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(Duration::from_millis(10_000));

        let run_timeout = env::var("FILAMENT_RUN_TIMEOUT_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(Duration::from_millis(300_000));

        let run_memory_limit_mb = env::var("FILAMENT_RUN_MEMORY_LIMIT_MB")
            .ok()
            .and_then(|s| s.parse().ok());

        let repo_dir = env::var("FILAMENT_REPO_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("adaptors"));

        let keep_unsupported = env::var("FILAMENT_KEEP_UNSUPPORTED")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);

        let sandbox_bin = env::var("FILAMENT_SANDBOX_BIN")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("filament-sandbox"));

        let npm_bin = env::var("FILAMENT_NPM_BIN").unwrap_or_else(|_| "npm".to_string());

        Ok(Self {
            orchestrator_url,
            worker_token,
            capacity,
            max_claim,
            claim_backoff_min,
            claim_backoff_max,
            run_timeout,
            run_memory_limit_mb,
            repo_dir,
            keep_unsupported,
            sandbox_bin,
            npm_bin,
        })
    }

    /// Create a test configuration with defaults
    pub fn test_config() -> Self {
        Self {
            orchestrator_url: "ws://127.0.0.1:0/worker".to_string(),
            worker_token: "test-token".to_string(),
            capacity: 2,
            max_claim: 2,
            claim_backoff_min: Duration::from_millis(10),
            claim_backoff_max: Duration::from_millis(50),
            run_timeout: Duration::from_millis(5_000),
            run_memory_limit_mb: None,
            repo_dir: PathBuf::from("adaptors"),
            keep_unsupported: false,
            sandbox_bin: PathBuf::from("filament-sandbox"),
            npm_bin: "npm".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_fits_the_claim_invariants() {
        let config = Config::test_config();
        assert!(config.max_claim <= config.capacity);
        assert!(config.claim_backoff_min < config.claim_backoff_max);
    }
}
