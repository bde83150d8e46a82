//! Paradigm profiles: channel count, capacity and transfer encoding per paradigm.

use std::fmt;
use std::str::FromStr;

use serde::Serialize;

use crate::error::Error;

/// Sample capacity of the processor's audio memory in single-buffer layouts.
const FULL_CAPACITY: usize = 8_380_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ParadigmId {
    Mono,
    Stereo,
    StereoPacked16,
}

impl fmt::Display for ParadigmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParadigmId::Mono => write!(f, "mono"),
            ParadigmId::Stereo => write!(f, "stereo"),
            ParadigmId::StereoPacked16 => write!(f, "stereo16"),
        }
    }
}

impl FromStr for ParadigmId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mono" => Ok(ParadigmId::Mono),
            "stereo" => Ok(ParadigmId::Stereo),
            "stereo16" => Ok(ParadigmId::StereoPacked16),
            _ => Err(Error::UnsupportedParadigm(s.to_string())),
        }
    }
}

/// How samples travel to the device.
///
/// `Float32Separate` keeps full single precision but splits memory across one
/// buffer per channel. `Int16Interleaved` quantizes to 16 bits and packs both
/// channels into one buffer, which doubles stereo capacity. The paradigm picks
/// the trade-off; the loader never changes it behind the caller's back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SampleEncoding {
    Float32Separate,
    Int16Interleaved,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ParadigmProfile {
    pub id: ParadigmId,
    pub channel_count: usize,
    pub max_samples: usize,
    pub encoding: SampleEncoding,
}

impl ParadigmProfile {
    /// Resolve a paradigm name (`mono`, `stereo`, `stereo16`).
    pub fn resolve(name: &str) -> Result<Self, Error> {
        Ok(Self::for_id(name.parse()?))
    }

    pub fn for_id(id: ParadigmId) -> Self {
        match id {
            ParadigmId::Mono => Self {
                id,
                channel_count: 1,
                max_samples: FULL_CAPACITY,
                encoding: SampleEncoding::Float32Separate,
            },
            ParadigmId::Stereo => Self {
                id,
                channel_count: 2,
                max_samples: FULL_CAPACITY / 2,
                encoding: SampleEncoding::Float32Separate,
            },
            ParadigmId::StereoPacked16 => Self {
                id,
                channel_count: 2,
                max_samples: FULL_CAPACITY,
                encoding: SampleEncoding::Int16Interleaved,
            },
        }
    }

    /// Whether channel 2 has its own audio buffer and position counter.
    pub fn has_separate_channel2(&self) -> bool {
        self.channel_count == 2 && self.encoding == SampleEncoding::Float32Separate
    }
}
