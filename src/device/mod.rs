//! Device boundary: synchronous, tag-addressed access to the playback processor.
//! The controller is the only caller; it never issues overlapping requests.
//! `sim` provides an in-memory processor for tests and dry runs.

pub mod sim;

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::config::SampleRate;

/// Status word reported by a connected processor with a circuit loaded and running.
pub const STATUS_RUNNING: u32 = 0b111;

/// Named regions and registers. Fixed protocol; must match the loaded circuit.
pub mod tags {
    pub const AUDIO_CH1: &str = "audio1";
    pub const AUDIO_CH2: &str = "audio2";
    pub const TRIGGER_INDEX: &str = "trigIdx";
    pub const TRIGGER_VALUE: &str = "trigVal";
    pub const BUTTON_VALUE: &str = "buttonVal";
    pub const BUTTON_SAMPLE: &str = "buttonSample";
    pub const CIRCUIT_INFO: &str = "circuitInfo";

    pub const STOP_SAMPLE: &str = "stopSample";
    pub const STIM_SIZE: &str = "stimSize";
    pub const SCALE_CH1: &str = "scale1";
    pub const SCALE_CH2: &str = "scale2";
    pub const TRIGGER_DURATION: &str = "trigDuration";
    pub const BUTTON_HOLD: &str = "holdDuration";
    pub const XOR_MASK: &str = "xorMask";
    pub const EVENT_VALUE: &str = "eventVal";

    pub const AUDIO_CH1_INDEX: &str = "audio1Index";
    pub const AUDIO_CH2_INDEX: &str = "audio2Index";
    pub const TRIGGER_INDEX_POS: &str = "trigIdxIndex";
    pub const TRIGGER_VALUE_POS: &str = "trigValIndex";
    pub const PRESS_COUNT: &str = "nPress";
}

/// Software-issued pulses wired to fixed circuit actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SoftTrigger {
    Rewind,
    Rearm,
    Play,
    Event,
}

impl SoftTrigger {
    /// Trigger line number on the processor.
    pub fn number(self) -> u8 {
        match self {
            SoftTrigger::Rewind => 1,
            SoftTrigger::Rearm => 2,
            SoftTrigger::Play => 3,
            SoftTrigger::Event => 4,
        }
    }
}

/// Word format of a buffer transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WordFormat {
    F32,
    I32,
    I16,
}

/// Typed payload for a buffer write.
#[derive(Debug, Clone, Copy)]
pub enum BufferData<'a> {
    F32(&'a [f32]),
    I32(&'a [i32]),
    I16(&'a [i16]),
}

impl BufferData<'_> {
    pub fn len(&self) -> usize {
        match self {
            BufferData::F32(d) => d.len(),
            BufferData::I32(d) => d.len(),
            BufferData::I16(d) => d.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn format(&self) -> WordFormat {
        match self {
            BufferData::F32(_) => WordFormat::F32,
            BufferData::I32(_) => WordFormat::I32,
            BufferData::I16(_) => WordFormat::I16,
        }
    }
}

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("connection failed: {0}")]
    ConnectFailed(String),

    #[error("failed to load circuit {path}: {reason}")]
    CircuitLoad { path: PathBuf, reason: String },

    #[error("failed to start circuit: {0}")]
    RunFailed(String),

    #[error("device not connected")]
    NotConnected,

    #[error("unknown tag '{0}'")]
    UnknownTag(String),

    #[error("short read from '{tag}': wanted {expected} words, got {actual}")]
    ShortRead {
        tag: String,
        expected: usize,
        actual: usize,
    },
}

/// Tag-based processor boundary.
///
/// Writes report success as a flag, mirroring the processor's own API; the
/// controller turns a `false` into a typed fault naming the region.
pub trait Device: Send {
    fn connect(&mut self) -> Result<(), DeviceError>;

    fn load_circuit(&mut self, path: &Path, rate: SampleRate) -> Result<(), DeviceError>;

    /// Actual sample rate of the running circuit, in Hz.
    fn sample_rate(&self) -> f64;

    fn run(&mut self) -> Result<(), DeviceError>;

    fn status(&self) -> u32;

    fn set_scalar(&mut self, tag: &str, value: f64) -> bool;

    fn get_scalar(&mut self, tag: &str) -> Result<f64, DeviceError>;

    fn zero_region(&mut self, tag: &str) -> bool;

    fn write_buffer(&mut self, tag: &str, offset: usize, data: BufferData<'_>) -> bool;

    /// Read `count` words stored as `source`, widened to f64.
    fn read_buffer(
        &mut self,
        tag: &str,
        offset: usize,
        count: usize,
        source: WordFormat,
    ) -> Result<Vec<f64>, DeviceError>;

    fn soft_trigger(&mut self, trigger: SoftTrigger) -> bool;

    fn halt(&mut self);

    fn disconnect(&mut self);
}
