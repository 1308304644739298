//! Grading configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{GraderError, Result};
use crate::sequencer::DEFAULT_EXCEPTION_PATIENCE;

/// Knobs shared by every unit of a grading run.
///
/// Missing fields in a config file take their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GradingConfig {
    /// Deadline for one candidate call (milliseconds).
    pub timeout_ms: u64,
    /// Candidate failures tolerated per unit before its remaining trials are skipped.
    pub exception_patience: usize,
    /// Submissions graded concurrently.
    pub workers: usize,
    /// Scale of the final submission grade.
    pub max_grade: f64,
    /// Write sampled failed-trial details into the feedback trail.
    pub log_failed_details: bool,
}

impl Default for GradingConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 10_000,
            exception_patience: DEFAULT_EXCEPTION_PATIENCE,
            workers: 1,
            max_grade: 100.0,
            log_failed_details: true,
        }
    }
}

impl GradingConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers < 1 {
            return Err(GraderError::InvalidConfig("workers must be at least 1".to_string()));
        }
        if self.timeout_ms == 0 {
            return Err(GraderError::InvalidConfig("timeout_ms must be positive".to_string()));
        }
        if self.exception_patience == 0 {
            return Err(GraderError::InvalidConfig(
                "exception_patience must be at least 1".to_string(),
            ));
        }
        if !(self.max_grade.is_finite() && self.max_grade > 0.0) {
            return Err(GraderError::InvalidConfig(format!(
                "max_grade must be a positive number, got {}",
                self.max_grade
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = GradingConfig::default();
        assert_eq!(config.timeout(), Duration::from_secs(10));
        assert_eq!(config.exception_patience, 5);
        assert_eq!(config.workers, 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_workers_rejected() {
        let config = GradingConfig {
            workers: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(GraderError::InvalidConfig(_))));
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"workers": 4, "max_grade": 10.0}}"#).unwrap();

        let config = GradingConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.workers, 4);
        assert_eq!(config.max_grade, 10.0);
        assert_eq!(config.timeout_ms, 10_000);
    }

    #[test]
    fn test_invalid_file_value_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"timeout_ms": 0}}"#).unwrap();
        assert!(GradingConfig::from_json_file(file.path()).is_err());
    }
}
