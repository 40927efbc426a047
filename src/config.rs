use crate::error::{PlateflowError, Result};

/// Runtime configuration for the coordination core.
///
/// Every field has a usable default so tests and local development need no
/// environment at all; production overrides come from `PLATEFLOW_*`
/// variables via [`PlateflowConfig::from_env`].
#[derive(Debug, Clone)]
pub struct PlateflowConfig {
    pub database_url: String,
    /// Bucket for uploaded microscope images.
    pub image_bucket: String,
    /// Bucket for worker result tables and merged artifacts.
    pub result_bucket: String,
    /// Maximum submissions per logical batch (first attempt + OOM retries).
    pub worker_max_attempts: u32,
    /// Fixed delay between an OOM failure and the resubmission.
    pub retry_backoff_ms: u64,
}

impl Default for PlateflowConfig {
    fn default() -> Self {
        Self {
            database_url: "postgresql://localhost/plateflow_development".to_string(),
            image_bucket: "experiment-images".to_string(),
            result_bucket: "experiment-results".to_string(),
            worker_max_attempts: 3,
            retry_backoff_ms: 500,
        }
    }
}

impl PlateflowConfig {
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(db_url) = std::env::var("DATABASE_URL") {
            config.database_url = db_url;
        }

        if let Ok(bucket) = std::env::var("PLATEFLOW_IMAGE_BUCKET") {
            config.image_bucket = bucket;
        }

        if let Ok(bucket) = std::env::var("PLATEFLOW_RESULT_BUCKET") {
            config.result_bucket = bucket;
        }

        if let Ok(max_attempts) = std::env::var("PLATEFLOW_WORKER_MAX_ATTEMPTS") {
            config.worker_max_attempts = max_attempts.parse().map_err(|e| {
                PlateflowError::Configuration(format!("Invalid worker_max_attempts: {e}"))
            })?;
        }

        if let Ok(backoff) = std::env::var("PLATEFLOW_RETRY_BACKOFF_MS") {
            config.retry_backoff_ms = backoff.parse().map_err(|e| {
                PlateflowError::Configuration(format!("Invalid retry_backoff_ms: {e}"))
            })?;
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_usable() {
        let config = PlateflowConfig::default();
        assert_eq!(config.worker_max_attempts, 3);
        assert!(config.retry_backoff_ms > 0);
        assert_ne!(config.image_bucket, config.result_bucket);
    }
}
