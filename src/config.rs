//! Runtime configuration, loaded once at startup from environment variables.

use serde::Serialize;
use std::time::Duration;

/// Replay and diff settings.
#[derive(Debug, Clone, Serialize)]
pub struct ReplayConfig {
    /// Label used for the main script in diffs.
    pub main_script_label: String,
    /// Unchanged lines shown around each diff hunk.
    pub diff_context: usize,
    /// Upper bound on causation links followed when locating a lineage root.
    pub max_lineage_hops: usize,
    /// Delay before a submitted replay becomes eligible to start.
    pub quiet_period: Duration,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            main_script_label: "Jenkinsfile".to_string(),
            diff_context: 3,
            max_lineage_hops: 10_000,
            quiet_period: Duration::ZERO,
        }
    }
}

impl ReplayConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            main_script_label: std::env::var("PIPELINE_REPLAY_MAIN_LABEL")
                .unwrap_or(defaults.main_script_label),
            diff_context: env_parse("PIPELINE_REPLAY_DIFF_CONTEXT", defaults.diff_context),
            max_lineage_hops: env_parse("PIPELINE_REPLAY_MAX_LINEAGE_HOPS", defaults.max_lineage_hops),
            quiet_period: Duration::from_millis(env_parse(
                "PIPELINE_REPLAY_QUIET_PERIOD_MS",
                defaults.quiet_period.as_millis() as u64,
            )),
        }
    }
}

/// Interpreter settings.
#[derive(Debug, Clone, Serialize)]
pub struct EngineConfig {
    /// Plain ticks allowed per `resume` before yielding.
    pub max_ticks_per_resume: usize,
    /// Drive loops give up after this many resumes without finishing.
    pub max_drive_rounds: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_ticks_per_resume: 10_000,
            max_drive_rounds: 100_000,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_ticks_per_resume: env_parse(
                "PIPELINE_REPLAY_MAX_TICKS",
                defaults.max_ticks_per_resume,
            ),
            max_drive_rounds: env_parse("PIPELINE_REPLAY_MAX_DRIVE_ROUNDS", defaults.max_drive_rounds),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ReplayConfig::default();
        assert_eq!(config.main_script_label, "Jenkinsfile");
        assert_eq!(config.diff_context, 3);
        assert_eq!(config.quiet_period, Duration::ZERO);
        assert!(EngineConfig::default().max_ticks_per_resume > 0);
    }

    #[test]
    fn test_env_parse_falls_back_on_garbage() {
        std::env::set_var("PIPELINE_REPLAY_TEST_GARBAGE", "not-a-number");
        assert_eq!(env_parse("PIPELINE_REPLAY_TEST_GARBAGE", 7usize), 7);
        std::env::set_var("PIPELINE_REPLAY_TEST_NUMBER", " 12 ");
        assert_eq!(env_parse("PIPELINE_REPLAY_TEST_NUMBER", 7usize), 12);
    }
}
