//! Session configuration: fixed for the lifetime of a controller.
//! Loaded from JSON; validated once before the device is touched.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Error, Result};
use crate::paradigm::ParadigmProfile;

/// Largest output voltage the processor's DAC produces.
pub const DEVICE_MAX_VOLTS: f64 = 10.0;

const DEFAULT_POLL_INTERVAL_MS: u64 = 100;
const DEFAULT_TRIGGER_DURATION_MS: f64 = 5.0;
const DEFAULT_BUTTON_HOLD_MS: f64 = 200.0;

/// Circuit sample-rate selector. The processor only runs at these three rates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SampleRate {
    #[serde(rename = "24k")]
    Khz24,
    #[serde(rename = "48k")]
    Khz48,
    #[serde(rename = "97k")]
    Khz97,
}

impl SampleRate {
    /// Selector code passed with the circuit image.
    pub fn selector(self) -> u8 {
        match self {
            SampleRate::Khz24 => 2,
            SampleRate::Khz48 => 3,
            SampleRate::Khz97 => 4,
        }
    }

    /// Nominal rate in Hz. The rate reported by the running circuit wins.
    pub fn nominal_hz(self) -> f64 {
        match self {
            SampleRate::Khz24 => 24_414.0625,
            SampleRate::Khz48 => 48_828.125,
            SampleRate::Khz97 => 97_656.25,
        }
    }
}

/// Output volts at full scale, per channel. `channel2 == 0` marks channel 2 unused.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScalingFactors {
    pub channel1: f64,
    #[serde(default)]
    pub channel2: f64,
}

impl ScalingFactors {
    pub fn new(channel1: f64, channel2: f64) -> Self {
        Self { channel1, channel2 }
    }

    fn validate(&self) -> Result<()> {
        if !(self.channel1 > 0.0 && self.channel1 <= DEVICE_MAX_VOLTS) {
            return Err(Error::InvalidConfig(format!(
                "channel 1 scaling {} V outside (0, {DEVICE_MAX_VOLTS}]",
                self.channel1
            )));
        }
        if !(self.channel2 >= 0.0 && self.channel2 <= DEVICE_MAX_VOLTS) {
            return Err(Error::InvalidConfig(format!(
                "channel 2 scaling {} V outside [0, {DEVICE_MAX_VOLTS}]",
                self.channel2
            )));
        }
        Ok(())
    }
}

/// Compiled circuit image plus the descriptor words it must report back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitImage {
    pub path: PathBuf,
    pub descriptor: Vec<i32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimingConfig {
    /// Position poll interval during blocking playback.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Upper bound on blocking playback. `None` waits indefinitely.
    #[serde(default)]
    pub max_blocking_wait_ms: Option<u64>,
}

fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            max_blocking_wait_ms: None,
        }
    }
}

impl TimingConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn max_blocking_wait(&self) -> Option<Duration> {
        self.max_blocking_wait_ms.map(Duration::from_millis)
    }
}

/// Log output format for [`crate::init_tracing`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Paradigm name, resolved through [`ParadigmProfile::resolve`].
    pub paradigm: String,
    pub sample_rate: SampleRate,
    pub scaling: ScalingFactors,
    #[serde(default = "default_trigger_duration_ms")]
    pub trigger_duration_ms: f64,
    #[serde(default = "default_button_hold_ms")]
    pub button_hold_ms: f64,
    /// XOR applied by the circuit to raw button lines (active-low boxes use all ones).
    #[serde(default)]
    pub button_xor_mask: u32,
    pub circuit: CircuitImage,
    #[serde(default)]
    pub timing: TimingConfig,
    #[serde(default)]
    pub log_format: LogFormat,
}

fn default_trigger_duration_ms() -> f64 {
    DEFAULT_TRIGGER_DURATION_MS
}

fn default_button_hold_ms() -> f64 {
    DEFAULT_BUTTON_HOLD_MS
}

impl SessionConfig {
    pub fn new(
        paradigm: impl Into<String>,
        sample_rate: SampleRate,
        scaling: ScalingFactors,
        circuit: CircuitImage,
    ) -> Self {
        Self {
            paradigm: paradigm.into(),
            sample_rate,
            scaling,
            trigger_duration_ms: DEFAULT_TRIGGER_DURATION_MS,
            button_hold_ms: DEFAULT_BUTTON_HOLD_MS,
            button_xor_mask: 0,
            circuit,
            timing: TimingConfig::default(),
            log_format: LogFormat::default(),
        }
    }

    /// Read a JSON session file.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: SessionConfig = serde_json::from_str(&raw)?;
        info!(path = %path.display(), paradigm = %config.paradigm, "session_config_loaded");
        Ok(config)
    }

    /// Check every field and resolve the paradigm. Touches nothing on the device.
    pub fn validate(&self) -> Result<ParadigmProfile> {
        let profile = ParadigmProfile::resolve(&self.paradigm)?;
        self.scaling.validate()?;
        if !(self.trigger_duration_ms > 0.0) {
            return Err(Error::InvalidConfig(format!(
                "trigger duration must be positive, got {} ms",
                self.trigger_duration_ms
            )));
        }
        if !(self.button_hold_ms > 0.0) {
            return Err(Error::InvalidConfig(format!(
                "button hold duration must be positive, got {} ms",
                self.button_hold_ms
            )));
        }
        if self.circuit.descriptor.is_empty() {
            return Err(Error::InvalidConfig(
                "circuit descriptor must not be empty".into(),
            ));
        }
        if self.timing.poll_interval_ms == 0 {
            return Err(Error::InvalidConfig("poll interval must be non-zero".into()));
        }
        Ok(profile)
    }
}

/// Convert a duration in milliseconds into whole samples at `fs`, never below one.
pub fn ms_to_samples(ms: f64, fs: f64) -> u32 {
    ((ms * fs / 1000.0).round() as u32).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn circuit() -> CircuitImage {
        CircuitImage {
            path: PathBuf::from("circuits/playback.rcx"),
            descriptor: vec![3, 1, 4],
        }
    }

    #[test]
    fn defaults_fill_optional_fields() {
        let raw = r#"{
            "paradigm": "mono",
            "sample_rate": "48k",
            "scaling": { "channel1": 2.5 },
            "circuit": { "path": "c.rcx", "descriptor": [1, 2] }
        }"#;
        let cfg: SessionConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(cfg.sample_rate, SampleRate::Khz48);
        assert_eq!(cfg.scaling.channel2, 0.0);
        assert_eq!(cfg.timing.poll_interval(), Duration::from_millis(100));
        assert_eq!(cfg.timing.max_blocking_wait(), None);
        assert_eq!(cfg.log_format, LogFormat::Pretty);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn load_from_file_round_trips_through_disk() {
        let cfg = SessionConfig::new(
            "stereo",
            SampleRate::Khz97,
            ScalingFactors::new(1.0, 1.0),
            circuit(),
        );
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(serde_json::to_string(&cfg).unwrap().as_bytes())
            .unwrap();
        let loaded = SessionConfig::load_from_file(file.path()).unwrap();
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn missing_file_is_configuration_error() {
        let err = SessionConfig::load_from_file(Path::new("/nonexistent/session.json"))
            .unwrap_err();
        assert_eq!(err.class(), crate::ErrorClass::Configuration);
    }

    #[test]
    fn rejects_unknown_paradigm() {
        let cfg = SessionConfig::new(
            "quad",
            SampleRate::Khz24,
            ScalingFactors::new(1.0, 0.0),
            circuit(),
        );
        assert!(matches!(cfg.validate(), Err(Error::UnsupportedParadigm(p)) if p == "quad"));
    }

    #[test]
    fn rejects_scaling_out_of_range() {
        for scaling in [
            ScalingFactors::new(0.0, 0.0),
            ScalingFactors::new(10.5, 0.0),
            ScalingFactors::new(1.0, -0.1),
            ScalingFactors::new(f64::NAN, 0.0),
        ] {
            let cfg = SessionConfig::new("mono", SampleRate::Khz24, scaling, circuit());
            assert!(matches!(cfg.validate(), Err(Error::InvalidConfig(_))), "{scaling:?}");
        }
    }

    #[test]
    fn rejects_non_positive_durations() {
        let mut cfg = SessionConfig::new(
            "mono",
            SampleRate::Khz24,
            ScalingFactors::new(1.0, 0.0),
            circuit(),
        );
        cfg.trigger_duration_ms = 0.0;
        assert!(matches!(cfg.validate(), Err(Error::InvalidConfig(_))));

        cfg.trigger_duration_ms = 1.0;
        cfg.button_hold_ms = -3.0;
        assert!(matches!(cfg.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn ms_to_samples_rounds_and_floors_at_one() {
        assert_eq!(ms_to_samples(1.0, 48_828.125), 49);
        assert_eq!(ms_to_samples(0.001, 24_414.0625), 1);
    }
}
