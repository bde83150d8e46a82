//! Stimulus loading: validate an audio + trigger payload, encode it for the
//! paradigm, and write it to the device after a clearing reset.
//!
//! Validation completes before the first device write, so a rejected payload
//! leaves the device untouched. A write failure part-way through leaves the
//! device partially written; the next position check or reload reveals it.

use serde::Serialize;
use tracing::{info, warn};

use crate::buffers::{BufferManager, LEADING_PAD_SAMPLES, SENTINEL_SLOTS};
use crate::config::ScalingFactors;
use crate::device::{tags, BufferData, Device};
use crate::error::{Error, Result};
use crate::paradigm::{ParadigmProfile, SampleEncoding};

/// Largest trigger schedule the trigger buffers hold.
pub const MAX_TRIGGERS: usize = 2290;

/// End-of-schedule marker appended after the last real trigger.
pub const SENTINEL_TRIGGER: Trigger = Trigger {
    sample: -1,
    value: 0,
};

/// Trigger emitted at the first sample when the caller supplies none.
pub const DEFAULT_TRIGGER: Trigger = Trigger {
    sample: 1,
    value: 1,
};

/// Full-scale multiplier for 16-bit packing.
const I16_SCALE: f64 = 32_768.0;

/// Per-channel audio, samples in [-1, 1].
#[derive(Debug, Clone, PartialEq)]
pub struct StimulusBuffer {
    channels: Vec<Vec<f64>>,
}

impl StimulusBuffer {
    /// Build from per-channel sample vectors. Channels must be the same length.
    pub fn new(channels: Vec<Vec<f64>>) -> Result<Self> {
        let expected = channels.first().map(Vec::len).unwrap_or(0);
        if let Some((idx, ch)) = channels
            .iter()
            .enumerate()
            .find(|(_, ch)| ch.len() != expected)
        {
            return Err(Error::RaggedChannels {
                channel: idx + 1,
                len: ch.len(),
                expected,
            });
        }
        Ok(Self { channels })
    }

    pub fn mono(samples: Vec<f64>) -> Self {
        Self {
            channels: vec![samples],
        }
    }

    pub fn stereo(left: Vec<f64>, right: Vec<f64>) -> Result<Self> {
        Self::new(vec![left, right])
    }

    pub fn sample_count(&self) -> usize {
        self.channels.first().map(Vec::len).unwrap_or(0)
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn channel(&self, idx: usize) -> Option<&[f64]> {
        self.channels.get(idx).map(Vec::as_slice)
    }
}

/// One digital trigger: `value` is emitted when playback reaches `sample` (1-based).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Trigger {
    pub sample: i64,
    pub value: i64,
}

impl Trigger {
    pub fn new(sample: i64, value: i64) -> Self {
        Self { sample, value }
    }
}

impl From<(i64, i64)> for Trigger {
    fn from((sample, value): (i64, i64)) -> Self {
        Self { sample, value }
    }
}

/// Ordered trigger schedule.
pub type TriggerSchedule = Vec<Trigger>;

/// Device-ready audio words, leading pad included.
#[derive(Debug, Clone, PartialEq)]
pub enum EncodedAudio {
    /// One single-precision buffer per channel.
    Separate(Vec<Vec<f32>>),
    /// Both channels quantized to 16 bits, frame-interleaved in one buffer.
    Interleaved(Vec<i16>),
}

/// Validate a payload against the paradigm. Returns the schedule to write,
/// with the default trigger synthesized when `triggers` is empty.
pub fn validate(
    profile: &ParadigmProfile,
    audio: &StimulusBuffer,
    triggers: &[Trigger],
) -> Result<TriggerSchedule> {
    let sample_count = audio.sample_count();
    if sample_count == 0 {
        return Err(Error::EmptyStimulus);
    }

    for (position, t) in triggers.iter().enumerate() {
        if t.sample < 1 || t.sample > sample_count as i64 {
            return Err(Error::TriggerIndexOutOfRange {
                position,
                index: t.sample,
                sample_count,
            });
        }
    }

    for (channel, samples) in audio.channels.iter().enumerate() {
        if let Some((sample, &value)) = samples
            .iter()
            .enumerate()
            .find(|(_, v)| !(v.abs() <= 1.0))
        {
            return Err(Error::AudioOutOfRange {
                channel: channel + 1,
                sample,
                value,
            });
        }
    }

    let schedule: TriggerSchedule = if triggers.is_empty() {
        vec![DEFAULT_TRIGGER]
    } else {
        triggers.to_vec()
    };

    if let Some((position, t)) = schedule.iter().enumerate().find(|(_, t)| t.value < 0) {
        return Err(Error::NegativeTriggerValue {
            position,
            value: t.value,
        });
    }

    if let Some((position, t)) = schedule
        .iter()
        .enumerate()
        .find(|(_, t)| i32::try_from(t.value).is_err())
    {
        return Err(Error::TriggerValueOutOfRange {
            position,
            value: t.value,
            max: i64::from(i32::MAX),
        });
    }

    if schedule.len() > MAX_TRIGGERS {
        return Err(Error::TooManyTriggers {
            count: schedule.len(),
            max: MAX_TRIGGERS,
        });
    }

    if sample_count > profile.max_samples {
        return Err(Error::StimulusTooLong {
            samples: sample_count,
            max: profile.max_samples,
        });
    }

    if audio.channel_count() != profile.channel_count {
        return Err(Error::ChannelCountMismatch {
            expected: profile.channel_count,
            actual: audio.channel_count(),
        });
    }

    Ok(schedule)
}

/// Encode validated audio for the paradigm, prepending the leading pad.
///
/// `Float32Separate` narrows to f32 per channel. `Int16Interleaved` scales by
/// 2^15, clamps to the i16 range, and interleaves frames.
pub fn encode(encoding: SampleEncoding, audio: &StimulusBuffer) -> EncodedAudio {
    match encoding {
        SampleEncoding::Float32Separate => EncodedAudio::Separate(
            audio
                .channels
                .iter()
                .map(|ch| {
                    let mut out = Vec::with_capacity(ch.len() + LEADING_PAD_SAMPLES);
                    out.extend(std::iter::repeat(0.0f32).take(LEADING_PAD_SAMPLES));
                    out.extend(ch.iter().map(|&s| s as f32));
                    out
                })
                .collect(),
        ),
        SampleEncoding::Int16Interleaved => {
            let channels = audio.channel_count();
            let frames = audio.sample_count();
            let mut out = Vec::with_capacity((frames + LEADING_PAD_SAMPLES) * channels);
            out.extend(std::iter::repeat(0i16).take(LEADING_PAD_SAMPLES * channels));
            for frame in 0..frames {
                for ch in &audio.channels {
                    out.push(quantize_i16(ch[frame]));
                }
            }
            EncodedAudio::Interleaved(out)
        }
    }
}

fn quantize_i16(sample: f64) -> i16 {
    (sample * I16_SCALE)
        .round()
        .clamp(f64::from(i16::MIN), f64::from(i16::MAX)) as i16
}

/// Split a schedule into the device's index/value arrays, sentinel appended.
/// Entries that do not fit a 32-bit device word are rejected, never truncated.
pub fn trigger_arrays(schedule: &[Trigger]) -> Result<(Vec<i32>, Vec<i32>)> {
    let mut indexes = Vec::with_capacity(schedule.len() + 1);
    let mut values = Vec::with_capacity(schedule.len() + 1);
    for (position, t) in schedule
        .iter()
        .chain(std::iter::once(&SENTINEL_TRIGGER))
        .enumerate()
    {
        let index = i32::try_from(t.sample).map_err(|_| Error::TriggerIndexOutOfRange {
            position,
            index: t.sample,
            sample_count: i32::MAX as usize,
        })?;
        let value = i32::try_from(t.value).map_err(|_| Error::TriggerValueOutOfRange {
            position,
            value: t.value,
            max: i64::from(i32::MAX),
        })?;
        indexes.push(index);
        values.push(value);
    }
    Ok((indexes, values))
}

/// Loads stimuli for one session's paradigm and scaling.
pub struct StimulusLoader {
    profile: ParadigmProfile,
    scaling: ScalingFactors,
}

impl StimulusLoader {
    pub fn new(profile: ParadigmProfile, scaling: ScalingFactors) -> Self {
        Self { profile, scaling }
    }

    /// Validate, reset, and write `audio` + `triggers`. On success the
    /// buffer manager's stim size covers the stimulus plus its leading pad.
    pub fn load<D: Device>(
        &self,
        buffers: &mut BufferManager<D>,
        audio: &StimulusBuffer,
        triggers: &[Trigger],
    ) -> Result<()> {
        let schedule = validate(&self.profile, audio, triggers)?;
        if triggers.is_empty() {
            info!("no triggers supplied, using default trigger at sample 1");
        }
        if self.profile.channel_count == 2 && self.scaling.channel2 == 0.0 {
            let silent = audio.channel(1).is_some_and(|ch| ch.iter().all(|&s| s == 0.0));
            if !silent {
                warn!("channel 2 carries signal but its scaling is 0 V");
            }
        }

        let encoded = encode(self.profile.encoding, audio);
        let (indexes, values) = trigger_arrays(&schedule)?;
        let sample_count = audio.sample_count();

        buffers.reset_buffers(true)?;

        let declared = sample_count + LEADING_PAD_SAMPLES + SENTINEL_SLOTS;
        buffers.set_register(tags::STIM_SIZE, declared as f64)?;
        buffers.set_stim_size((sample_count + LEADING_PAD_SAMPLES) as u64);

        match &encoded {
            EncodedAudio::Separate(channels) => {
                for (buffer, data) in [tags::AUDIO_CH1, tags::AUDIO_CH2].into_iter().zip(channels) {
                    buffers.write(buffer, BufferData::F32(data))?;
                }
            }
            EncodedAudio::Interleaved(words) => {
                buffers.write(tags::AUDIO_CH1, BufferData::I16(words))?;
            }
        }

        buffers.write(tags::TRIGGER_INDEX, BufferData::I32(&indexes))?;
        buffers.write(tags::TRIGGER_VALUE, BufferData::I32(&values))?;

        info!(
            paradigm = %self.profile.id,
            samples = sample_count,
            triggers = schedule.len(),
            stim_size = buffers.stim_size(),
            "stimulus_loaded"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paradigm::ParadigmId;
    use approx::assert_relative_eq;

    fn mono() -> ParadigmProfile {
        ParadigmProfile::for_id(ParadigmId::Mono)
    }

    #[test]
    fn empty_schedule_gets_default_trigger() {
        let audio = StimulusBuffer::mono(vec![0.0; 10]);
        let schedule = validate(&mono(), &audio, &[]).unwrap();
        assert_eq!(schedule, vec![Trigger::new(1, 1)]);
    }

    #[test]
    fn trigger_index_bounds_both_directions() {
        let audio = StimulusBuffer::mono(vec![0.0; 10]);
        assert!(matches!(
            validate(&mono(), &audio, &[Trigger::new(0, 1)]),
            Err(Error::TriggerIndexOutOfRange { index: 0, .. })
        ));
        assert!(matches!(
            validate(&mono(), &audio, &[Trigger::new(11, 1)]),
            Err(Error::TriggerIndexOutOfRange { index: 11, sample_count: 10, .. })
        ));
        assert!(validate(&mono(), &audio, &[Trigger::new(10, 1)]).is_ok());
    }

    #[test]
    fn index_check_runs_before_audio_range_check() {
        let audio = StimulusBuffer::mono(vec![2.0; 4]);
        assert!(matches!(
            validate(&mono(), &audio, &[Trigger::new(9, 1)]),
            Err(Error::TriggerIndexOutOfRange { .. })
        ));
    }

    #[test]
    fn audio_magnitude_above_one_or_nan_is_rejected() {
        let audio = StimulusBuffer::mono(vec![0.0, 1.0, -1.0001]);
        assert!(matches!(
            validate(&mono(), &audio, &[]),
            Err(Error::AudioOutOfRange { channel: 1, sample: 2, .. })
        ));
        let audio = StimulusBuffer::mono(vec![f64::NAN]);
        assert!(matches!(validate(&mono(), &audio, &[]), Err(Error::AudioOutOfRange { .. })));
    }

    #[test]
    fn negative_trigger_value_is_rejected() {
        let audio = StimulusBuffer::mono(vec![0.0; 10]);
        assert!(matches!(
            validate(&mono(), &audio, &[Trigger::new(1, 2), Trigger::new(5, -3)]),
            Err(Error::NegativeTriggerValue { position: 1, value: -3 })
        ));
    }

    #[test]
    fn trigger_value_must_fit_device_word() {
        let audio = StimulusBuffer::mono(vec![0.0; 10]);
        let max = i64::from(i32::MAX);
        assert!(validate(&mono(), &audio, &[Trigger::new(1, max)]).is_ok());
        assert!(matches!(
            validate(&mono(), &audio, &[Trigger::new(1, 2), Trigger::new(3, max + 1)]),
            Err(Error::TriggerValueOutOfRange { position: 1, value: 2_147_483_648, .. })
        ));
        assert!(matches!(
            validate(&mono(), &audio, &[Trigger::new(1, 5_000_000_000)]),
            Err(Error::TriggerValueOutOfRange { .. })
        ));
    }

    #[test]
    fn trigger_arrays_refuse_to_truncate() {
        let (_, values) = trigger_arrays(&[Trigger::new(1, i64::from(i32::MAX))]).unwrap();
        assert_eq!(values, vec![i32::MAX, 0]);
        assert!(matches!(
            trigger_arrays(&[Trigger::new(1, 5_000_000_000)]),
            Err(Error::TriggerValueOutOfRange { position: 0, value: 5_000_000_000, .. })
        ));
    }

    #[test]
    fn trigger_count_boundary() {
        let audio = StimulusBuffer::mono(vec![0.0; MAX_TRIGGERS + 1]);
        let at_limit: Vec<Trigger> = (1..=MAX_TRIGGERS as i64)
            .map(|i| Trigger::new(i, 1))
            .collect();
        assert_eq!(validate(&mono(), &audio, &at_limit).unwrap().len(), MAX_TRIGGERS);

        let over: Vec<Trigger> = (1..=MAX_TRIGGERS as i64 + 1)
            .map(|i| Trigger::new(i, 1))
            .collect();
        assert!(matches!(
            validate(&mono(), &audio, &over),
            Err(Error::TooManyTriggers { count: 2291, max: 2290 })
        ));
    }

    #[test]
    fn stimulus_length_boundary() {
        let profile = mono();
        let at_limit = StimulusBuffer::mono(vec![0.0; profile.max_samples]);
        assert!(validate(&profile, &at_limit, &[]).is_ok());
        drop(at_limit);

        let over = StimulusBuffer::mono(vec![0.0; profile.max_samples + 1]);
        assert!(matches!(
            validate(&profile, &over, &[]),
            Err(Error::StimulusTooLong { samples: 8_380_001, max: 8_380_000 })
        ));
    }

    #[test]
    fn channel_count_must_match_paradigm() {
        let stereo = ParadigmProfile::for_id(ParadigmId::Stereo);
        let audio = StimulusBuffer::mono(vec![0.0; 8]);
        assert!(matches!(
            validate(&stereo, &audio, &[]),
            Err(Error::ChannelCountMismatch { expected: 2, actual: 1 })
        ));
    }

    #[test]
    fn ragged_channels_are_rejected_at_construction() {
        assert!(matches!(
            StimulusBuffer::stereo(vec![0.0; 3], vec![0.0; 2]),
            Err(Error::RaggedChannels { channel: 2, len: 2, expected: 3 })
        ));
    }

    #[test]
    fn float_encoding_pads_each_channel() {
        let audio = StimulusBuffer::stereo(vec![0.5, -0.25], vec![0.1, 0.2]).unwrap();
        let EncodedAudio::Separate(chs) = encode(SampleEncoding::Float32Separate, &audio) else {
            panic!("expected separate channels");
        };
        assert_eq!(chs.len(), 2);
        assert_eq!(chs[0], vec![0.0, 0.5, -0.25]);
        assert_relative_eq!(chs[1][2], 0.2f32);
        assert_eq!(chs[1][0], 0.0);
    }

    #[test]
    fn packed_encoding_interleaves_and_clamps() {
        let audio = StimulusBuffer::stereo(vec![1.0, 0.5], vec![-1.0, -0.5]).unwrap();
        let EncodedAudio::Interleaved(words) = encode(SampleEncoding::Int16Interleaved, &audio)
        else {
            panic!("expected interleaved words");
        };
        assert_eq!(words, vec![0, 0, 32767, -32768, 16384, -16384]);
    }

    #[test]
    fn trigger_arrays_end_with_sentinel() {
        let (idx, val) = trigger_arrays(&[Trigger::new(1, 1), Trigger::new(10, 5)]).unwrap();
        assert_eq!(idx, vec![1, 10, -1]);
        assert_eq!(val, vec![1, 5, 0]);
    }
}
