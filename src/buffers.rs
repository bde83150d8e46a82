//! Buffer manager: owns the device handle and every named region on it.
//! Keeps the paired position counters (audio ch1/ch2, trigger index/value)
//! honest and sequences the rewind / clear / re-arm reset.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::device::{tags, BufferData, Device, SoftTrigger};
use crate::error::{Error, Result};
use crate::paradigm::ParadigmProfile;
use crate::timing::{Clock, TRIGGER_SETTLE};

/// Zero-valued samples written ahead of the stimulus on every channel.
/// Suppresses the click the output stage produces on the first sample.
pub const LEADING_PAD_SAMPLES: usize = 1;
/// Slots reserved after the stimulus for the device's end-of-buffer marker.
pub const SENTINEL_SLOTS: usize = 1;
/// Declared-size register value meaning "nothing loaded".
pub const EMPTY_DECLARED_SIZE: f64 = 1.0;

/// Device-side playback counters at one instant.
///
/// Channel 1 and the trigger index are always read. On a full check, stereo
/// paradigms also read the trigger-value counter, and channel 2 when it has
/// its own buffer. Mono never compares counter pairs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PlaybackPosition {
    pub audio_ch1: i64,
    pub audio_ch2: Option<i64>,
    pub trigger_index: i64,
    pub trigger_value: Option<i64>,
}

impl PlaybackPosition {
    /// Current sample on channel 1.
    pub fn sample(&self) -> u64 {
        self.audio_ch1.max(0) as u64
    }

    pub fn is_zero(&self) -> bool {
        self.first_nonzero().is_none()
    }

    fn first_nonzero(&self) -> Option<i64> {
        [
            Some(self.audio_ch1),
            self.audio_ch2,
            Some(self.trigger_index),
            self.trigger_value,
        ]
        .into_iter()
        .flatten()
        .find(|&v| v != 0)
    }

    /// First diverging counter pair, if any.
    fn misalignment(&self) -> Option<(&'static str, i64, i64)> {
        if let Some(ch2) = self.audio_ch2 {
            if ch2 != self.audio_ch1 {
                return Some(("audio channels", self.audio_ch1, ch2));
            }
        }
        if let Some(value) = self.trigger_value {
            if value != self.trigger_index {
                return Some(("trigger buffers", self.trigger_index, value));
            }
        }
        None
    }
}

pub struct BufferManager<D: Device> {
    device: D,
    profile: ParadigmProfile,
    clock: Arc<dyn Clock>,
    /// Logical sample count of the loaded stimulus, pad included. 0 = empty.
    stim_size: u64,
    status: String,
}

impl<D: Device> BufferManager<D> {
    pub fn new(device: D, profile: ParadigmProfile, clock: Arc<dyn Clock>) -> Self {
        Self {
            device,
            profile,
            clock,
            stim_size: 0,
            status: "not connected".to_string(),
        }
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    pub fn profile(&self) -> &ParadigmProfile {
        &self.profile
    }

    pub fn stim_size(&self) -> u64 {
        self.stim_size
    }

    pub(crate) fn set_stim_size(&mut self, stim_size: u64) {
        self.stim_size = stim_size;
    }

    /// Human-readable playback status.
    pub fn status(&self) -> &str {
        &self.status
    }

    pub(crate) fn set_status(&mut self, status: impl Into<String>) {
        self.status = status.into();
    }

    pub(crate) fn sleep(&self, duration: std::time::Duration) {
        self.clock.sleep(duration);
    }

    /// Rewind the playhead, optionally clear stimulus regions, always clear
    /// the response log, re-arm, and verify every counter reads zero.
    pub fn reset_buffers(&mut self, clear: bool) -> Result<PlaybackPosition> {
        self.status = "stopped at index 0".to_string();

        self.fire(SoftTrigger::Rewind)?;
        self.sleep(TRIGGER_SETTLE);

        if clear {
            self.zero(tags::AUDIO_CH1)?;
            if self.profile.has_separate_channel2() {
                self.zero(tags::AUDIO_CH2)?;
            }
            self.zero(tags::TRIGGER_INDEX)?;
            self.zero(tags::TRIGGER_VALUE)?;
            self.set_register(tags::STOP_SAMPLE, 0.0)?;
            self.set_register(tags::STIM_SIZE, EMPTY_DECLARED_SIZE)?;
            self.stim_size = 0;
        }

        self.zero(tags::BUTTON_VALUE)?;
        self.zero(tags::BUTTON_SAMPLE)?;

        self.fire(SoftTrigger::Rearm)?;
        self.sleep(TRIGGER_SETTLE);

        // A misaligned readout here is a failed rewind, not a reason to reset again.
        let position = self.read_position(true)?;
        if let Some(stuck) = position.first_nonzero() {
            warn!(?position, "buffer_rewind_fault");
            return Err(Error::BufferRewindFault { position: stuck });
        }
        info!(clear, stim_size = self.stim_size, "buffers_reset");
        Ok(position)
    }

    /// Read the playback counters. With `verify_all`, paired counters are
    /// compared; a mismatch rewinds (without clearing) and is reported.
    pub fn check_position(&mut self, verify_all: bool) -> Result<PlaybackPosition> {
        let position = self.read_position(verify_all)?;
        if let Some((pair, expected, actual)) = position.misalignment() {
            warn!(pair, expected, actual, "buffer_misalignment");
            self.reset_buffers(false)?;
            return Err(Error::BufferMisalignment {
                pair,
                expected,
                actual,
            });
        }
        Ok(position)
    }

    fn read_position(&mut self, verify_all: bool) -> Result<PlaybackPosition> {
        let audio_ch1 = self.read_counter(tags::AUDIO_CH1_INDEX)?;
        let trigger_index = self.read_counter(tags::TRIGGER_INDEX_POS)?;
        let stereo = self.profile.channel_count == 2;
        let audio_ch2 = if verify_all && self.profile.has_separate_channel2() {
            Some(self.read_counter(tags::AUDIO_CH2_INDEX)?)
        } else {
            None
        };
        let trigger_value = if verify_all && stereo {
            Some(self.read_counter(tags::TRIGGER_VALUE_POS)?)
        } else {
            None
        };
        let position = PlaybackPosition {
            audio_ch1,
            audio_ch2,
            trigger_index,
            trigger_value,
        };
        debug!(?position, "position_read");
        Ok(position)
    }

    pub(crate) fn read_counter(&mut self, tag: &str) -> Result<i64> {
        Ok(self.device.get_scalar(tag)?.round() as i64)
    }

    pub(crate) fn fire(&mut self, trigger: SoftTrigger) -> Result<()> {
        if self.device.soft_trigger(trigger) {
            Ok(())
        } else {
            Err(Error::TriggerFault(trigger))
        }
    }

    pub(crate) fn set_register(&mut self, register: &'static str, value: f64) -> Result<()> {
        if self.device.set_scalar(register, value) {
            Ok(())
        } else {
            Err(Error::RegisterWriteFault { register })
        }
    }

    pub(crate) fn zero(&mut self, buffer: &'static str) -> Result<()> {
        if self.device.zero_region(buffer) {
            Ok(())
        } else {
            Err(Error::BufferWriteFault { buffer })
        }
    }

    pub(crate) fn write(&mut self, buffer: &'static str, data: BufferData<'_>) -> Result<()> {
        if self.device.write_buffer(buffer, 0, data) {
            debug!(buffer, words = data.len(), "buffer_written");
            Ok(())
        } else {
            Err(Error::BufferWriteFault { buffer })
        }
    }
}
