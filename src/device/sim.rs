//! In-memory playback processor.
//! Models named regions, position counters, soft triggers and button presses
//! closely enough to drive the controller end to end, plus fault injection.
//! Clones share state, so a test can keep one handle while the controller owns another.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use super::{tags, BufferData, Device, DeviceError, SoftTrigger, WordFormat};
use crate::config::SampleRate;

const STATUS_CONNECTED: u32 = 0b001;
const STATUS_LOADED: u32 = 0b010;
const STATUS_RUNNING: u32 = 0b100;

/// Samples the simulated playhead advances per channel-1 position read.
pub const DEFAULT_ADVANCE_PER_READ: i64 = 2_441;

/// One boundary call, as seen by the processor.
#[derive(Debug, Clone, PartialEq)]
pub enum SimOp {
    SetScalar { tag: String, value: f64 },
    Zero(String),
    Write { tag: String, len: usize, format: WordFormat },
    Trigger(SoftTrigger),
}

struct SimState {
    connected: bool,
    circuit: Option<(PathBuf, SampleRate)>,
    running: bool,
    descriptor: Vec<i32>,
    status_override: Option<u32>,
    fail_connect: bool,

    scalars: HashMap<String, f64>,
    buffers: HashMap<String, Vec<f64>>,
    failing_writes: HashSet<String>,

    index: i64,
    playing: bool,
    advance_per_read: i64,
    ch2_skew: i64,
    trigger_value_skew: i64,
    stuck_rewind: bool,

    presses: Vec<(u32, i64)>,
    events: Vec<f64>,
    journal: Vec<SimOp>,
}

impl SimState {
    fn scalar(&self, tag: &str) -> f64 {
        self.scalars.get(tag).copied().unwrap_or(0.0)
    }

    /// Advance the playhead if running. Halts one past a stop register that
    /// lies inside the stimulus, otherwise wraps to 0 past the declared size.
    fn tick(&mut self) {
        if !self.playing {
            return;
        }
        self.index += self.advance_per_read;
        let declared = self.scalar(tags::STIM_SIZE) as i64;
        let stop = self.scalar(tags::STOP_SAMPLE) as i64;
        if self.index > stop && stop + 1 < declared {
            self.index = stop + 1;
            self.playing = false;
        } else if self.index >= declared {
            self.index = 0;
            self.playing = false;
        }
    }

    /// Triggers passed so far: schedule entries at or before the playhead.
    fn trigger_position(&self) -> i64 {
        let Some(indexes) = self.buffers.get(tags::TRIGGER_INDEX) else {
            return 0;
        };
        indexes
            .iter()
            .take_while(|&&i| i >= 1.0)
            .filter(|&&i| (i as i64) <= self.index)
            .count() as i64
    }
}

#[derive(Clone)]
pub struct SimulatedDevice {
    inner: Arc<Mutex<SimState>>,
}

impl SimulatedDevice {
    /// A processor whose circuit reports `descriptor` from its info region.
    pub fn new(descriptor: Vec<i32>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(SimState {
                connected: false,
                circuit: None,
                running: false,
                descriptor,
                status_override: None,
                fail_connect: false,
                scalars: HashMap::new(),
                buffers: HashMap::new(),
                failing_writes: HashSet::new(),
                index: 0,
                playing: false,
                advance_per_read: DEFAULT_ADVANCE_PER_READ,
                ch2_skew: 0,
                trigger_value_skew: 0,
                stuck_rewind: false,
                presses: Vec::new(),
                events: Vec::new(),
                journal: Vec::new(),
            })),
        }
    }

    // --- fault injection ---

    pub fn fail_connect(&self) {
        self.inner.lock().fail_connect = true;
    }

    /// Report this status word instead of the computed one.
    pub fn force_status(&self, status: u32) {
        self.inner.lock().status_override = Some(status);
    }

    /// Make writes and zeroing of `tag` report failure.
    pub fn fail_writes_to(&self, tag: &str) {
        self.inner.lock().failing_writes.insert(tag.to_string());
    }

    /// Offset channel-2 position readout until the next rewind trigger.
    pub fn skew_channel2(&self, by: i64) {
        self.inner.lock().ch2_skew = by;
    }

    /// Offset trigger-value position readout until the next rewind trigger.
    pub fn skew_trigger_value(&self, by: i64) {
        self.inner.lock().trigger_value_skew = by;
    }

    /// Ignore rewind triggers.
    pub fn stick_rewind(&self) {
        self.inner.lock().stuck_rewind = true;
    }

    pub fn set_advance_per_read(&self, samples: i64) {
        self.inner.lock().advance_per_read = samples;
    }

    /// Place the playhead directly (stopped).
    pub fn seek(&self, index: i64) {
        let mut s = self.inner.lock();
        s.index = index;
        s.playing = false;
    }

    /// Record a button press at a zero-based device sample.
    pub fn press(&self, value: u32, raw_sample: i64) {
        self.inner.lock().presses.push((value, raw_sample));
    }

    // --- inspection ---

    pub fn is_connected(&self) -> bool {
        self.inner.lock().connected
    }

    pub fn is_running(&self) -> bool {
        self.inner.lock().running
    }

    pub fn is_playing(&self) -> bool {
        self.inner.lock().playing
    }

    pub fn playhead(&self) -> i64 {
        self.inner.lock().index
    }

    pub fn scalar(&self, tag: &str) -> f64 {
        self.inner.lock().scalar(tag)
    }

    pub fn buffer(&self, tag: &str) -> Vec<f64> {
        self.inner.lock().buffers.get(tag).cloned().unwrap_or_default()
    }

    pub fn events(&self) -> Vec<f64> {
        self.inner.lock().events.clone()
    }

    pub fn journal(&self) -> Vec<SimOp> {
        self.inner.lock().journal.clone()
    }

    pub fn triggers_fired(&self) -> Vec<SoftTrigger> {
        self.inner
            .lock()
            .journal
            .iter()
            .filter_map(|op| match op {
                SimOp::Trigger(t) => Some(*t),
                _ => None,
            })
            .collect()
    }

    pub fn clear_journal(&self) {
        self.inner.lock().journal.clear();
    }
}

impl Device for SimulatedDevice {
    fn connect(&mut self) -> Result<(), DeviceError> {
        let mut s = self.inner.lock();
        if s.fail_connect {
            return Err(DeviceError::ConnectFailed("no processor on interface".into()));
        }
        s.connected = true;
        Ok(())
    }

    fn load_circuit(&mut self, path: &Path, rate: SampleRate) -> Result<(), DeviceError> {
        let mut s = self.inner.lock();
        if !s.connected {
            return Err(DeviceError::NotConnected);
        }
        s.circuit = Some((path.to_path_buf(), rate));
        debug!(path = %path.display(), selector = rate.selector(), "sim_circuit_loaded");
        Ok(())
    }

    fn sample_rate(&self) -> f64 {
        self.inner
            .lock()
            .circuit
            .as_ref()
            .map(|(_, rate)| rate.nominal_hz())
            .unwrap_or(0.0)
    }

    fn run(&mut self) -> Result<(), DeviceError> {
        let mut s = self.inner.lock();
        if s.circuit.is_none() {
            return Err(DeviceError::RunFailed("no circuit loaded".into()));
        }
        s.running = true;
        Ok(())
    }

    fn status(&self) -> u32 {
        let s = self.inner.lock();
        if let Some(status) = s.status_override {
            return status;
        }
        let mut status = 0;
        if s.connected {
            status |= STATUS_CONNECTED;
        }
        if s.circuit.is_some() {
            status |= STATUS_LOADED;
        }
        if s.running {
            status |= STATUS_RUNNING;
        }
        status
    }

    fn set_scalar(&mut self, tag: &str, value: f64) -> bool {
        let mut s = self.inner.lock();
        if !s.connected || s.failing_writes.contains(tag) {
            return false;
        }
        if tag == tags::STOP_SAMPLE && value == 0.0 {
            s.playing = false;
        }
        s.scalars.insert(tag.to_string(), value);
        s.journal.push(SimOp::SetScalar {
            tag: tag.to_string(),
            value,
        });
        true
    }

    fn get_scalar(&mut self, tag: &str) -> Result<f64, DeviceError> {
        let mut s = self.inner.lock();
        if !s.connected {
            return Err(DeviceError::NotConnected);
        }
        let value = match tag {
            tags::AUDIO_CH1_INDEX => {
                s.tick();
                s.index as f64
            }
            tags::AUDIO_CH2_INDEX => (s.index + s.ch2_skew) as f64,
            tags::TRIGGER_INDEX_POS => s.trigger_position() as f64,
            tags::TRIGGER_VALUE_POS => (s.trigger_position() + s.trigger_value_skew) as f64,
            tags::PRESS_COUNT => s.presses.len() as f64,
            other => s.scalar(other),
        };
        Ok(value)
    }

    fn zero_region(&mut self, tag: &str) -> bool {
        let mut s = self.inner.lock();
        if !s.connected || s.failing_writes.contains(tag) {
            return false;
        }
        if tag == tags::BUTTON_VALUE || tag == tags::BUTTON_SAMPLE {
            s.presses.clear();
        }
        if let Some(buf) = s.buffers.get_mut(tag) {
            buf.iter_mut().for_each(|v| *v = 0.0);
        }
        s.journal.push(SimOp::Zero(tag.to_string()));
        true
    }

    fn write_buffer(&mut self, tag: &str, offset: usize, data: BufferData<'_>) -> bool {
        let mut s = self.inner.lock();
        if !s.connected || s.failing_writes.contains(tag) {
            return false;
        }
        let words: Vec<f64> = match data {
            BufferData::F32(d) => d.iter().map(|&v| f64::from(v)).collect(),
            BufferData::I32(d) => d.iter().map(|&v| f64::from(v)).collect(),
            BufferData::I16(d) => d.iter().map(|&v| f64::from(v)).collect(),
        };
        let buf = s.buffers.entry(tag.to_string()).or_default();
        if buf.len() < offset + words.len() {
            buf.resize(offset + words.len(), 0.0);
        }
        buf[offset..offset + words.len()].copy_from_slice(&words);
        s.journal.push(SimOp::Write {
            tag: tag.to_string(),
            len: data.len(),
            format: data.format(),
        });
        true
    }

    fn read_buffer(
        &mut self,
        tag: &str,
        offset: usize,
        count: usize,
        _source: WordFormat,
    ) -> Result<Vec<f64>, DeviceError> {
        let s = self.inner.lock();
        if !s.connected {
            return Err(DeviceError::NotConnected);
        }
        let words: Vec<f64> = match tag {
            tags::CIRCUIT_INFO => s.descriptor.iter().map(|&v| f64::from(v)).collect(),
            tags::BUTTON_VALUE => s.presses.iter().map(|&(v, _)| f64::from(v)).collect(),
            tags::BUTTON_SAMPLE => s.presses.iter().map(|&(_, i)| i as f64).collect(),
            other => s
                .buffers
                .get(other)
                .cloned()
                .ok_or_else(|| DeviceError::UnknownTag(other.to_string()))?,
        };
        // Fixed-size device memory reads back zeros past the written words.
        Ok((offset..offset + count)
            .map(|i| words.get(i).copied().unwrap_or(0.0))
            .collect())
    }

    fn soft_trigger(&mut self, trigger: SoftTrigger) -> bool {
        let mut s = self.inner.lock();
        if !s.running {
            return false;
        }
        match trigger {
            SoftTrigger::Rewind => {
                if !s.stuck_rewind {
                    s.index = 0;
                    s.playing = false;
                    s.ch2_skew = 0;
                    s.trigger_value_skew = 0;
                }
            }
            SoftTrigger::Rearm => {}
            SoftTrigger::Play => {
                s.playing = s.scalar(tags::STOP_SAMPLE) > 0.0;
            }
            SoftTrigger::Event => {
                let value = s.scalar(tags::EVENT_VALUE);
                s.events.push(value);
            }
        }
        s.journal.push(SimOp::Trigger(trigger));
        true
    }

    fn halt(&mut self) {
        let mut s = self.inner.lock();
        s.running = false;
        s.playing = false;
    }

    fn disconnect(&mut self) {
        let mut s = self.inner.lock();
        s.connected = false;
        s.running = false;
        s.playing = false;
    }
}
