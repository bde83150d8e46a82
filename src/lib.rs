//! stimctl: stimulus playback controller for tag-based real-time audio processors.
//! Loads audio + trigger schedules into device memory, runs the
//! play / pause / rewind / reset state machine, emits digital events, and
//! reads button presses time-locked to playback position.

pub mod buffers;
pub mod cancellation;
pub mod config;
pub mod controller;
pub mod device;
pub mod error;
pub mod events;
pub mod metrics;
pub mod paradigm;
pub mod state_machine;
pub mod stimulus;
pub mod timing;

pub use buffers::{PlaybackPosition, LEADING_PAD_SAMPLES, SENTINEL_SLOTS};
pub use cancellation::InterruptHandle;
pub use config::{
    CircuitImage, LogFormat, SampleRate, ScalingFactors, SessionConfig, TimingConfig,
    DEVICE_MAX_VOLTS,
};
pub use controller::Controller;
pub use device::sim::SimulatedDevice;
pub use device::{BufferData, Device, DeviceError, SoftTrigger, WordFormat};
pub use error::{Error, ErrorClass, Result};
pub use events::{ButtonPress, ButtonPresses};
pub use paradigm::{ParadigmId, ParadigmProfile, SampleEncoding};
pub use state_machine::PlaybackState;
pub use stimulus::{StimulusBuffer, Trigger, TriggerSchedule, MAX_TRIGGERS};
pub use timing::{Clock, ManualClock, SystemClock};

/// Install the global tracing subscriber. `RUST_LOG` overrides `default_filter`.
/// Safe to call more than once; later calls are ignored.
pub fn init_tracing(default_filter: &str, format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true);
    let installed = match format {
        LogFormat::Pretty => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    if installed.is_ok() {
        tracing::info!(?format, "tracing initialized");
    }
}
