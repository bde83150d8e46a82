//! Error types for the playback controller.
//! Variants are grouped by how the caller is expected to react; see [`ErrorClass`].

use std::time::Duration;

use thiserror::Error;

use crate::device::{DeviceError, SoftTrigger};
use crate::state_machine::PlaybackState;

/// Error type for controller operations.
#[derive(Error, Debug)]
pub enum Error {
    // --- configuration (fatal at construction, no circuit loaded) ---
    #[error("unsupported paradigm: {0}")]
    UnsupportedParadigm(String),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    // --- integrity (fatal at construction, connection torn down) ---
    #[error("circuit descriptor mismatch: expected {expected:?}, device reports {actual:?}")]
    CircuitVersionMismatch { expected: Vec<i32>, actual: Vec<i32> },

    #[error("device not running (status {status})")]
    DeviceNotRunning { status: u32 },

    // --- validation (rejected before any device write) ---
    #[error("stimulus has no samples")]
    EmptyStimulus,

    #[error("channel {channel} has {len} samples, channel 1 has {expected}")]
    RaggedChannels {
        channel: usize,
        len: usize,
        expected: usize,
    },

    #[error("trigger {position} has sample index {index}, must be within 1..={sample_count}")]
    TriggerIndexOutOfRange {
        position: usize,
        index: i64,
        sample_count: usize,
    },

    #[error("audio sample {sample} on channel {channel} is {value}, magnitude must be <= 1.0")]
    AudioOutOfRange {
        channel: usize,
        sample: usize,
        value: f64,
    },

    #[error("trigger {position} has negative value {value}")]
    NegativeTriggerValue { position: usize, value: i64 },

    #[error("trigger {position} has value {value}, device words hold at most {max}")]
    TriggerValueOutOfRange { position: usize, value: i64, max: i64 },

    #[error("trigger schedule has {count} entries, limit is {max}")]
    TooManyTriggers { count: usize, max: usize },

    #[error("stimulus has {samples} samples, paradigm allows {max}")]
    StimulusTooLong { samples: usize, max: usize },

    #[error("stimulus has {actual} channels, paradigm expects {expected}")]
    ChannelCountMismatch { expected: usize, actual: usize },

    // --- device writes (sequence aborted, device left partially written) ---
    #[error("write to buffer '{buffer}' failed")]
    BufferWriteFault { buffer: &'static str },

    #[error("write to register '{register}' failed")]
    RegisterWriteFault { register: &'static str },

    #[error("soft trigger {0:?} was not accepted")]
    TriggerFault(SoftTrigger),

    // --- consistency (auto non-clearing reset already performed) ---
    #[error("{pair} indices diverged: {expected} vs {actual}")]
    BufferMisalignment {
        pair: &'static str,
        expected: i64,
        actual: i64,
    },

    #[error("buffers did not rewind, position after reset is {position}")]
    BufferRewindFault { position: i64 },

    // --- sequencing (rejected before touching the device) ---
    #[error("controller is not connected")]
    NotConnected,

    #[error("no stimulus loaded")]
    NoStimulusLoaded,

    #[error("stop sample {stop} is behind current position {position}, rewind first")]
    StopPointAlreadyPassed { stop: u64, position: u64 },

    #[error("stop sample 0 is not playable, samples start at 1")]
    ZeroStopPoint,

    #[error("stop sample {stop} is beyond the loaded stimulus ({stim_size} samples)")]
    StopPointBeyondStimulus { stop: u64, stim_size: u64 },

    #[error("invalid transition: {from} -> {to}")]
    InvalidTransition {
        from: PlaybackState,
        to: PlaybackState,
    },

    // --- blocking playback ---
    #[error("blocking playback interrupted")]
    Interrupted,

    #[error("blocking playback did not finish within {waited:?}")]
    PlaybackTimedOut { waited: Duration },

    // --- device boundary ---
    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error("config io: {0}")]
    Io(#[from] std::io::Error),

    #[error("config parse: {0}")]
    ConfigParse(#[from] serde_json::Error),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse error taxonomy. Decides whether a caller may retry, must reload,
/// or has to rebuild the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Configuration,
    Integrity,
    Validation,
    DeviceWrite,
    Consistency,
    Sequencing,
    Interrupted,
    Device,
}

impl Error {
    pub fn class(&self) -> ErrorClass {
        use Error::*;
        match self {
            UnsupportedParadigm(_) | InvalidConfig(_) | Io(_) | ConfigParse(_) => {
                ErrorClass::Configuration
            }
            CircuitVersionMismatch { .. } | DeviceNotRunning { .. } => ErrorClass::Integrity,
            EmptyStimulus
            | RaggedChannels { .. }
            | TriggerIndexOutOfRange { .. }
            | AudioOutOfRange { .. }
            | NegativeTriggerValue { .. }
            | TriggerValueOutOfRange { .. }
            | TooManyTriggers { .. }
            | StimulusTooLong { .. }
            | ChannelCountMismatch { .. } => ErrorClass::Validation,
            BufferWriteFault { .. } | RegisterWriteFault { .. } | TriggerFault(_) => {
                ErrorClass::DeviceWrite
            }
            BufferMisalignment { .. } | BufferRewindFault { .. } => ErrorClass::Consistency,
            NotConnected
            | NoStimulusLoaded
            | StopPointAlreadyPassed { .. }
            | ZeroStopPoint
            | StopPointBeyondStimulus { .. }
            | InvalidTransition { .. } => ErrorClass::Sequencing,
            Interrupted | PlaybackTimedOut { .. } => ErrorClass::Interrupted,
            Device(_) => ErrorClass::Device,
        }
    }

    /// Whether the failure leaves device contents suspect. The controller moves
    /// to [`PlaybackState::Error`] for these.
    pub fn taints_device(&self) -> bool {
        matches!(
            self.class(),
            ErrorClass::DeviceWrite | ErrorClass::Consistency | ErrorClass::Device
        )
    }
}
