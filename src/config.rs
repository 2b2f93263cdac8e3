use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    pub link: LinkConfig,
    pub input: InputConfig,
    pub output: OutputConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    pub command_timeout_ms: u64,
    pub sync_rounds: usize,           // ReadClock round trips per sync, min-RTT sample wins
    pub drift_warn_threshold_us: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InputConfig {
    pub repetitions: usize,
    pub sync_after_repetitions: usize, // 0 = never resync mid-run
    pub start_delay_ms: u64,
    pub observation_timeout_ms: u64,
    pub max_protocol_failures: usize,  // consecutive malformed NOTE replies before giving up
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub repetitions: usize,
    pub note_interval_ms: u64,                 // also the lead time before the first note
    pub detection_timeout_ms: u64,
    pub sync_after_repetitions: Option<usize>,
    pub note: Vec<u8>,
}

impl Default for LinkConfig {
    fn default() -> Self {
        LinkConfig {
            command_timeout_ms: 1000,
            sync_rounds: 10,
            drift_warn_threshold_us: 1000,
        }
    }
}

impl Default for InputConfig {
    fn default() -> Self {
        InputConfig {
            repetitions: 100,
            sync_after_repetitions: 100,
            start_delay_ms: 300,
            observation_timeout_ms: 1000,
            max_protocol_failures: 3,
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        OutputConfig {
            repetitions: 10,
            note_interval_ms: 300,
            detection_timeout_ms: 1000,
            sync_after_repetitions: None,
            note: vec![0x90, 99, 0],
        }
    }
}

impl LinkConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

/// Milliseconds to microseconds, clamped at `i64::MAX`.
pub fn ms_to_us(ms: u64) -> i64 {
    i64::try_from(ms).unwrap_or(i64::MAX).saturating_mul(1000)
}

impl InputConfig {
    pub fn observation_timeout_us(&self) -> i64 {
        ms_to_us(self.observation_timeout_ms)
    }
}

impl OutputConfig {
    pub fn note_interval_us(&self) -> i64 {
        ms_to_us(self.note_interval_ms)
    }

    /// Whole-run bound: every note slot plus the detection grace period.
    pub fn run_timeout_us(&self) -> i64 {
        let slots = self.note_interval_ms.saturating_mul(self.repetitions as u64);
        ms_to_us(slots.saturating_add(self.detection_timeout_ms))
    }
}

impl SystemConfig {
    /// Loads a JSON config file. Missing fields keep their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config = serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = SystemConfig::default();
        assert_eq!(config.input.repetitions, 100);
        assert_eq!(config.input.sync_after_repetitions, 100);
        assert_eq!(config.input.observation_timeout_ms, 1000);
        assert_eq!(config.output.repetitions, 10);
        assert_eq!(config.output.note_interval_ms, 300);
        assert_eq!(config.output.note, vec![0x90, 99, 0]);
        assert_eq!(config.output.sync_after_repetitions, None);
        assert_eq!(config.link.command_timeout(), Duration::from_secs(1));
    }

    #[test]
    fn test_run_timeout() {
        let output = OutputConfig::default();
        // 10 * 300ms + 1000ms
        assert_eq!(output.run_timeout_us(), 4_000_000);
    }

    #[test]
    fn test_timeouts_saturate_on_extreme_values() {
        let output = OutputConfig {
            repetitions: usize::MAX,
            note_interval_ms: u64::MAX / 2,
            detection_timeout_ms: u64::MAX,
            ..OutputConfig::default()
        };
        assert_eq!(output.run_timeout_us(), i64::MAX);
        assert_eq!(output.note_interval_us(), i64::MAX);

        let input = InputConfig { observation_timeout_ms: u64::MAX, ..InputConfig::default() };
        assert_eq!(input.observation_timeout_us(), i64::MAX);
        assert_eq!(ms_to_us(i64::MAX as u64 / 1000), (i64::MAX / 1000) * 1000);
    }

    #[test]
    fn test_load_partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "input": {{ "repetitions": 250 }}, "output": {{ "sync_after_repetitions": 20 }} }}"#).unwrap();

        let config = SystemConfig::load(file.path()).unwrap();
        assert_eq!(config.input.repetitions, 250);
        assert_eq!(config.input.sync_after_repetitions, 100);
        assert_eq!(config.output.sync_after_repetitions, Some(20));
        assert_eq!(config.link, LinkConfig::default());
    }

    #[test]
    fn test_load_reports_path_on_bad_json() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();

        let err = SystemConfig::load(file.path()).unwrap_err();
        assert!(format!("{:#}", err).contains("Failed to parse config"));
    }
}
