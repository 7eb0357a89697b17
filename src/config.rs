//! TOML configuration for the cxmedic engine.
//!
//! Layered model: compiled-in defaults, overridden by a TOML file found via
//! the `CXMEDIC_CONFIG` environment variable or the standard system location.
//! Partial files are fine; every section and field falls back on its own.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::detect::anomaly::DetectorConfig;
use crate::detect::slicing::SlicingConfig;
use crate::metrics::MetricKind;

/// A config value the engine refuses to run with.
#[derive(Debug, Error)]
#[error("invalid config: {field}: {reason}")]
pub struct ConfigError {
    pub field: &'static str,
    pub reason: String,
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError {
        field,
        reason: reason.into(),
    }
}

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Root configuration for the cxmedic process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub database: DatabaseConfig,
    pub server: ServerConfig,
    pub detection: DetectionConfig,
    pub detector: DetectorConfig,
    pub slicing: SlicingConfig,
    pub rca: RcaConfig,
    pub logging: LoggingConfig,
}

impl EngineConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// Try to load configuration from, in order:
    /// 1. The path named by the `CXMEDIC_CONFIG` environment variable.
    /// 2. `/etc/cxmedic/cxmedic.toml`.
    /// 3. Fall back to compiled-in defaults.
    pub fn load_or_default() -> Self {
        if let Ok(env_path) = std::env::var("CXMEDIC_CONFIG") {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "CXMEDIC_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let system_path = Path::new("/etc/cxmedic/cxmedic.toml");
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %system_path.display(),
                        error = %e,
                        "system config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Self::default()
    }

    /// Reject configurations the detectors cannot run with. Called once at
    /// startup; a bad value is fatal, not a warning.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let d = &self.detector;
        if d.z_window < 2 {
            return Err(invalid("detector.z_window", "must be at least 2"));
        }
        if !(d.ewma_alpha > 0.0 && d.ewma_alpha < 1.0) {
            return Err(invalid(
                "detector.ewma_alpha",
                format!("{} is outside (0, 1)", d.ewma_alpha),
            ));
        }
        if d.ewma_residual_window < 2 {
            return Err(invalid("detector.ewma_residual_window", "must be at least 2"));
        }
        if d.split_min_segment < 2 {
            return Err(invalid("detector.split_min_segment", "must be at least 2"));
        }
        if !(1..=3).contains(&d.quorum) {
            return Err(invalid(
                "detector.quorum",
                format!("{} is outside 1..=3", d.quorum),
            ));
        }
        if d.high_percentile >= d.medium_percentile {
            return Err(invalid(
                "detector.high_percentile",
                "must be below medium_percentile",
            ));
        }
        if self.slicing.top_n == 0 {
            return Err(invalid("slicing.top_n", "must be at least 1"));
        }
        if self.detection.bucket_secs <= 0 {
            return Err(invalid("detection.bucket_secs", "must be positive"));
        }
        if self.detection.lookback_hours <= 0 {
            return Err(invalid("detection.lookback_hours", "must be positive"));
        }
        if self.detection.watch_metrics.is_empty() {
            return Err(invalid("detection.watch_metrics", "must name at least one metric"));
        }
        if self.rca.hypothesis_timeout_secs == 0 {
            return Err(invalid("rca.hypothesis_timeout_secs", "must be positive"));
        }
        if self.rca.attribution_epochs == 0 {
            return Err(invalid("rca.attribution_epochs", "must be positive"));
        }
        if self.rca.attribution_learning_rate <= 0.0 {
            return Err(invalid("rca.attribution_learning_rate", "must be positive"));
        }
        if self.rca.parallelism == 0 {
            return Err(invalid("rca.parallelism", "must be at least 1"));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Database
// ---------------------------------------------------------------------------

/// SQLite storage location.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("cxmedic.db"),
        }
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

/// HTTP API listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address and port for the HTTP API listener.
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8000".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Detection pass
// ---------------------------------------------------------------------------

/// What a scheduled or CLI-triggered detection pass covers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    /// Series bucket width in seconds. One bucket is one observation.
    pub bucket_secs: i64,
    /// How far back a pass reaches when no explicit range is given.
    pub lookback_hours: i64,
    /// Metrics evaluated by a default pass.
    pub watch_metrics: Vec<MetricKind>,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            bucket_secs: 3600,
            lookback_hours: 24,
            watch_metrics: MetricKind::watchlist(),
        }
    }
}

// ---------------------------------------------------------------------------
// Root cause analysis
// ---------------------------------------------------------------------------

/// Tunables for the RCA evidence methods.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RcaConfig {
    /// Affected-cohort rows required before the attribution model runs.
    pub min_attribution_rows: usize,
    /// Gradient steps for the attribution fit. Fixed count keeps the fit
    /// deterministic.
    pub attribution_epochs: usize,
    pub attribution_learning_rate: f64,
    /// Paired buckets required before a correlation is reported.
    pub correlation_min_buckets: usize,
    /// Absolute Pearson r above which a correlation is flagged as strong.
    pub strong_correlation: f64,
    /// Wall-clock budget per hypothesis before it is abandoned.
    pub hypothesis_timeout_secs: u64,
    /// Hypotheses evaluated concurrently.
    pub parallelism: usize,
}

impl Default for RcaConfig {
    fn default() -> Self {
        Self {
            min_attribution_rows: 30,
            attribution_epochs: 200,
            attribution_learning_rate: 0.1,
            correlation_min_buckets: 10,
            strong_correlation: 0.7,
            hypothesis_timeout_secs: 10,
            parallelism: 4,
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

/// Tracing output configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum tracing level (`trace`, `debug`, `info`, `warn`, `error`).
    pub level: String,
    /// Emit JSON lines instead of the human format.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        let cfg = EngineConfig::default();

        assert_eq!(cfg.database.path, PathBuf::from("cxmedic.db"));
        assert_eq!(cfg.server.bind, "0.0.0.0:8000");

        assert_eq!(cfg.detection.bucket_secs, 3600);
        assert_eq!(cfg.detection.lookback_hours, 24);
        assert_eq!(
            cfg.detection.watch_metrics,
            vec![
                MetricKind::CxScore,
                MetricKind::OnTimeRate,
                MetricKind::CancellationRate
            ]
        );

        assert_eq!(cfg.detector.z_window, 30);
        assert_eq!(cfg.detector.quorum, 2);
        assert_eq!(cfg.slicing.min_orders, 10);
        assert_eq!(cfg.slicing.top_n, 5);

        assert_eq!(cfg.rca.min_attribution_rows, 30);
        assert_eq!(cfg.rca.hypothesis_timeout_secs, 10);

        assert_eq!(cfg.logging.level, "info");
        assert!(!cfg.logging.json);

        cfg.validate().unwrap();
    }

    #[test]
    fn test_parse_example_toml() {
        let toml_str = r#"
[database]
path = "/var/lib/cxmedic/cxmedic.db"

[server]
bind = "127.0.0.1:9000"

[detection]
bucket_secs = 1800
lookback_hours = 48
watch_metrics = ["cx_score", "refund_rate"]

[detector]
z_window = 20
quorum = 3

[slicing]
min_orders = 25
top_n = 3

[rca]
min_attribution_rows = 50
hypothesis_timeout_secs = 30

[logging]
level = "debug"
json = true
"#;

        let cfg: EngineConfig = toml::from_str(toml_str).unwrap();

        assert_eq!(cfg.database.path, PathBuf::from("/var/lib/cxmedic/cxmedic.db"));
        assert_eq!(cfg.server.bind, "127.0.0.1:9000");
        assert_eq!(cfg.detection.bucket_secs, 1800);
        assert_eq!(cfg.detection.lookback_hours, 48);
        assert_eq!(
            cfg.detection.watch_metrics,
            vec![MetricKind::CxScore, MetricKind::RefundRate]
        );
        assert_eq!(cfg.detector.z_window, 20);
        assert_eq!(cfg.detector.quorum, 3);
        // Untouched detector fields keep their defaults.
        assert_eq!(cfg.detector.ewma_min_history, 10);
        assert_eq!(cfg.slicing.min_orders, 25);
        assert_eq!(cfg.slicing.top_n, 3);
        assert_eq!(cfg.rca.min_attribution_rows, 50);
        assert_eq!(cfg.rca.hypothesis_timeout_secs, 30);
        assert_eq!(cfg.logging.level, "debug");
        assert!(cfg.logging.json);

        cfg.validate().unwrap();
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let cfg: EngineConfig = toml::from_str("[server]\nbind = \"10.0.0.1:8080\"\n").unwrap();

        assert_eq!(cfg.server.bind, "10.0.0.1:8080");
        assert_eq!(cfg.database.path, PathBuf::from("cxmedic.db"));
        assert_eq!(cfg.detector.z_threshold, 2.5);
        assert_eq!(cfg.rca.attribution_epochs, 200);
    }

    #[test]
    fn test_empty_toml_uses_all_defaults() {
        let cfg: EngineConfig = toml::from_str("").unwrap();
        assert_eq!(cfg.detection.bucket_secs, 3600);
        assert_eq!(cfg.detector.ewma_alpha, 0.3);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("cxmedic.toml");
        std::fs::write(&path, "[detection]\nbucket_secs = 600\n").unwrap();

        let cfg = EngineConfig::load(&path).unwrap();
        assert_eq!(cfg.detection.bucket_secs, 600);
    }

    #[test]
    fn test_load_missing_file_errors() {
        let result = EngineConfig::load(Path::new("/nonexistent/path/cxmedic.toml"));
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut cfg = EngineConfig::default();
        cfg.detector.ewma_alpha = 1.5;
        let err = cfg.validate().unwrap_err();
        assert_eq!(err.field, "detector.ewma_alpha");

        let mut cfg = EngineConfig::default();
        cfg.detector.quorum = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = EngineConfig::default();
        cfg.detector.high_percentile = 20.0;
        assert!(cfg.validate().is_err());

        let mut cfg = EngineConfig::default();
        cfg.detection.watch_metrics.clear();
        assert!(cfg.validate().is_err());

        let mut cfg = EngineConfig::default();
        cfg.slicing.top_n = 0;
        assert!(cfg.validate().is_err());
    }
}
