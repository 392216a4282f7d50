use crate::expressive::ExpressiveSpec;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] ron::error::SpannedError),
    #[error("invalid `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Bar telemetry sent as control changes at every bar boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub bar_cc_enabled: bool,
    pub bar_cc_index: u8,
    pub bar_cc_countdown: u8,
    pub bar_cc_section: u8,
    pub telemetry_channel: u8,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            bar_cc_enabled: false,
            bar_cc_index: 20,
            bar_cc_countdown: 21,
            bar_cc_section: 22,
            telemetry_channel: 15,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Ticks per quarter note, used for files and for real-time steps alike.
    pub resolution: u32,
    pub late_drop_ms: u64,
    /// Note-ons at or below this velocity are ornaments.
    pub ghost_vel_max: u8,
    pub lookahead_s: f64,
    pub tick_s: f64,
    pub panic_enabled: bool,
    pub drop_late_ornaments: bool,
    pub send_timeout_ms: u64,
    /// How long a stop request waits for the scheduler loop to hand over.
    pub stop_timeout_ms: u64,
    pub expressive: ExpressiveSpec,
    pub telemetry: TelemetryConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            resolution: crate::timing::DEFAULT_RESOLUTION,
            late_drop_ms: 20,
            ghost_vel_max: 30,
            lookahead_s: 0.01,
            tick_s: 0.002,
            panic_enabled: true,
            drop_late_ornaments: true,
            send_timeout_ms: 50,
            stop_timeout_ms: 1000,
            expressive: ExpressiveSpec::default(),
            telemetry: TelemetryConfig::default(),
        }
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        Self::from_ron(&text)
    }

    pub fn from_ron(text: &str) -> Result<Self, ConfigError> {
        let config: Config = ron::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.resolution == 0 || self.resolution > i16::MAX as u32 {
            return Err(invalid("resolution", "must be within 1..=32767"));
        }
        if self.ghost_vel_max > 127 {
            return Err(invalid("ghost_vel_max", "must be at most 127"));
        }
        if !(self.tick_s.is_finite() && self.tick_s > 0.0) {
            return Err(invalid("tick_s", "must be a positive number of seconds"));
        }
        if !(self.lookahead_s.is_finite() && self.lookahead_s >= 0.0) {
            return Err(invalid("lookahead_s", "must not be negative"));
        }
        if self.send_timeout_ms == 0 {
            return Err(invalid("send_timeout_ms", "must be positive"));
        }

        let expressive = &self.expressive;
        if !(0.0..=1.0).contains(&expressive.swing) {
            return Err(invalid("expressive.swing", "must be within 0..=1"));
        }
        if !(expressive.subdivision_beats.is_finite() && expressive.subdivision_beats > 0.0) {
            return Err(invalid("expressive.subdivision_beats", "must be positive"));
        }
        if !(expressive.humanize_ms.is_finite() && expressive.humanize_ms >= 0.0) {
            return Err(invalid("expressive.humanize_ms", "must not be negative"));
        }
        if expressive.humanize_vel > 127 {
            return Err(invalid("expressive.humanize_vel", "must be at most 127"));
        }

        let telemetry = &self.telemetry;
        if telemetry.telemetry_channel > 15 {
            return Err(invalid("telemetry.telemetry_channel", "must be within 0..=15"));
        }
        for (field, cc) in [
            ("telemetry.bar_cc_index", telemetry.bar_cc_index),
            ("telemetry.bar_cc_countdown", telemetry.bar_cc_countdown),
            ("telemetry.bar_cc_section", telemetry.bar_cc_section),
        ] {
            if cc > 127 {
                return Err(invalid(field, "must be a controller number within 0..=127"));
            }
        }
        Ok(())
    }

    pub fn late_drop(&self) -> Duration {
        Duration::from_millis(self.late_drop_ms)
    }

    pub fn lookahead(&self) -> Duration {
        Duration::from_secs_f64(self.lookahead_s)
    }

    pub fn tick(&self) -> Duration {
        Duration::from_secs_f64(self.tick_s)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn partial_ron_falls_back_to_defaults() {
        let config = Config::from_ron(
            "(late_drop_ms: 35, expressive: (swing: 0.6, seed: 11), telemetry: (bar_cc_enabled: true))",
        )
        .unwrap();
        assert_eq!(config.late_drop(), Duration::from_millis(35));
        assert_eq!(config.expressive.swing, 0.6);
        assert_eq!(config.expressive.subdivision_beats, 0.5);
        assert!(config.telemetry.bar_cc_enabled);
        assert_eq!(config.telemetry.bar_cc_index, 20);
        assert_eq!(config.resolution, 480);
    }

    #[test]
    fn rejects_impossible_values() {
        let err = Config::from_ron("(tick_s: 0.0)").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "tick_s", .. }));

        let err = Config::from_ron("(telemetry: (telemetry_channel: 16))").unwrap_err();
        assert!(err.to_string().contains("telemetry_channel"));

        let err = Config::from_ron("(expressive: (swing: 1.5))").unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                field: "expressive.swing",
                ..
            }
        ));
    }

    #[test]
    fn malformed_ron_is_a_parse_error() {
        assert!(matches!(
            Config::from_ron("(resolution: \"lots\")"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn loads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("beatline.ron");
        std::fs::write(&path, "(resolution: 960, panic_enabled: false)").unwrap();
        let config = Config::load(&path).unwrap();
        assert_eq!(config.resolution, 960);
        assert!(!config.panic_enabled);
    }
}
