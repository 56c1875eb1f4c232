// crates/jobs/src/config.rs
//! Tuning knobs for the job subsystem, fixed at construction time.

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct JobsConfig {
    /// Upper bound on retained job records. Only terminal records are ever
    /// evicted, so a burst of live jobs may overshoot this.
    pub max_tracked_jobs: usize,
    /// Size of the worker pool for blocking handlers.
    pub blocking_workers: usize,
    /// Byte cap on stored error messages.
    pub error_message_limit: usize,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            max_tracked_jobs: 500,
            blocking_workers: 4,
            error_message_limit: 1024,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = JobsConfig::default();
        assert_eq!(config.max_tracked_jobs, 500);
        assert_eq!(config.blocking_workers, 4);
        assert_eq!(config.error_message_limit, 1024);
    }

    #[test]
    fn test_deserialize_partial() {
        let config: JobsConfig =
            serde_json::from_str(r#"{ "max_tracked_jobs": 10 }"#).unwrap();
        assert_eq!(config.max_tracked_jobs, 10);
        assert_eq!(config.blocking_workers, 4);
    }
}
