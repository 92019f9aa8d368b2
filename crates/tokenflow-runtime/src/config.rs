use crate::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokenflow_engine::{FeedbackLimits, KernelConfig};
use tokenflow_lineage::{CacheConfig, DepthLimits, LineageConfig};

/// Every runtime tunable in one place. `Default` is the single source of
/// the documented defaults; TOML files override field-by-field.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct RuntimeConfig {
    /// Consumed tokens a sink keeps, most recent first.
    pub sink_retention: usize,
    /// Feedback chains deeper than this are blocked.
    pub max_feedback_depth: u32,
    /// Circuit-breaker sliding window, in ticks.
    pub breaker_window: u64,
    /// Feedback count within the window that opens the breaker.
    pub breaker_threshold: usize,
    /// Ticks the breaker stays open once tripped.
    pub breaker_cooldown: u64,
    pub cache: CacheConfig,
    /// Lineage depth that triggers a deep-lineage warning.
    pub lineage_warn_depth: u32,
    /// Lineage depth past which validation reports an error.
    pub lineage_hard_depth: u32,
    /// Bound for path enumeration during contribution analysis.
    pub max_path_depth: usize,
    /// Re-enables the declared-input reachability check.
    pub strict_input_reachability: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        let kernel = KernelConfig::default();
        let depth = DepthLimits::default();
        let lineage = LineageConfig::default();
        Self {
            sink_retention: kernel.sink_retention,
            max_feedback_depth: kernel.feedback.max_depth,
            breaker_window: kernel.feedback.breaker_window,
            breaker_threshold: kernel.feedback.breaker_threshold,
            breaker_cooldown: kernel.feedback.breaker_cooldown,
            cache: CacheConfig::default(),
            lineage_warn_depth: depth.warn,
            lineage_hard_depth: depth.hard,
            max_path_depth: lineage.max_path_depth,
            strict_input_reachability: false,
        }
    }
}

impl RuntimeConfig {
    pub fn kernel(&self) -> KernelConfig {
        KernelConfig {
            sink_retention: self.sink_retention,
            feedback: FeedbackLimits {
                max_depth: self.max_feedback_depth,
                breaker_window: self.breaker_window,
                breaker_threshold: self.breaker_threshold,
                breaker_cooldown: self.breaker_cooldown,
            },
        }
    }

    pub fn lineage(&self) -> LineageConfig {
        LineageConfig {
            depth_limits: DepthLimits {
                warn: self.lineage_warn_depth,
                hard: self.lineage_hard_depth,
            },
            max_path_depth: self.max_path_depth,
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let config: RuntimeConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self).map_err(crate::Error::from)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_centralized() {
        let config = RuntimeConfig::default();
        assert_eq!(config.sink_retention, 10);
        assert_eq!(config.max_feedback_depth, 5);
        assert_eq!(config.lineage_warn_depth, 20);
        assert!(!config.strict_input_reachability);
        assert_eq!(config.kernel().feedback.max_depth, 5);
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = RuntimeConfig::load_from(&dir.path().join("nope.toml")).unwrap();
        assert_eq!(config.sink_retention, RuntimeConfig::default().sink_retention);
    }

    #[test]
    fn test_toml_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokenflow.toml");

        let mut config = RuntimeConfig::default();
        config.max_feedback_depth = 9;
        config.strict_input_reachability = true;
        config.save_to(&path).unwrap();

        let loaded = RuntimeConfig::load_from(&path).unwrap();
        assert_eq!(loaded.max_feedback_depth, 9);
        assert!(loaded.strict_input_reachability);
        assert_eq!(loaded.breaker_window, config.breaker_window);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.toml");
        std::fs::write(&path, "max_feedback_depth = 3\n").unwrap();
        let loaded = RuntimeConfig::load_from(&path).unwrap();
        assert_eq!(loaded.max_feedback_depth, 3);
        assert_eq!(loaded.sink_retention, 10);
    }
}
