//! Button-press log readout.
//! The circuit appends (value, sample) pairs while playing; the press counter
//! it reports is authoritative for how many entries are valid.

use serde::Serialize;
use tracing::debug;

use crate::buffers::BufferManager;
use crate::device::{tags, Device, DeviceError, WordFormat};
use crate::error::Result;

/// One press. `value` is a bit-mask, one bit per physical button, already
/// normalized by the session's XOR mask. `sample` is 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ButtonPress {
    pub value: u32,
    pub sample: u64,
}

impl ButtonPress {
    /// Button numbers (1-based) set in `value`.
    pub fn buttons(&self) -> impl Iterator<Item = u32> + '_ {
        (0..u32::BITS)
            .filter(move |bit| self.value & (1 << bit) != 0)
            .map(|bit| bit + 1)
    }
}

/// Result of polling the press log. `NoPresses` is distinct from an empty list:
/// the log was read and nothing has been recorded yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ButtonPresses {
    NoPresses,
    Presses(Vec<ButtonPress>),
}

impl ButtonPresses {
    pub fn len(&self) -> usize {
        match self {
            ButtonPresses::NoPresses => 0,
            ButtonPresses::Presses(p) => p.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_slice(&self) -> &[ButtonPress] {
        match self {
            ButtonPresses::NoPresses => &[],
            ButtonPresses::Presses(p) => p,
        }
    }
}

/// Read every recorded press, shifting device sample indices (0-based) to 1-based.
pub fn read_button_presses<D: Device>(buffers: &mut BufferManager<D>) -> Result<ButtonPresses> {
    let count = buffers.read_counter(tags::PRESS_COUNT)?.max(0) as usize;
    if count == 0 {
        return Ok(ButtonPresses::NoPresses);
    }

    let device = buffers.device_mut();
    let values = device.read_buffer(tags::BUTTON_VALUE, 0, count, WordFormat::I32)?;
    let samples = device.read_buffer(tags::BUTTON_SAMPLE, 0, count, WordFormat::I32)?;
    for (tag, got) in [(tags::BUTTON_VALUE, values.len()), (tags::BUTTON_SAMPLE, samples.len())] {
        if got != count {
            return Err(DeviceError::ShortRead {
                tag: tag.to_string(),
                expected: count,
                actual: got,
            }
            .into());
        }
    }

    let presses: Vec<ButtonPress> = values
        .into_iter()
        .zip(samples)
        .map(|(value, sample)| ButtonPress {
            value: value as u32,
            sample: (sample.max(0.0) as u64) + 1,
        })
        .collect();
    debug!(count = presses.len(), "button_presses_read");
    Ok(ButtonPresses::Presses(presses))
}
