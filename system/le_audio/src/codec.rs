// Copyright 2024, The Android Open Source Project
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Codec identifiers and the LTV structures carried in ASCS operations:
//! Codec Specific Configuration (Assigned Numbers - 6.12.5) and
//! Metadata (Assigned Numbers - 6.12.6).

use crate::reader::Reader;
use crate::types::AudioContexts;
use crate::writer::Writer;
use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::FromPrimitive;
use thiserror::Error;

/// Errors raised while decoding characteristic values
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("Buffer too short while reading {0}")]
    Truncated(&'static str),
    #[error("Unknown ASE state 0x{0:02x}")]
    UnknownAseState(u8),
    #[error("Unknown control point opcode 0x{0:02x}")]
    UnknownOpcode(u8),
    #[error("Invalid {field}: 0x{value:x}")]
    InvalidValue { field: &'static str, value: u32 },
}

/// Coding format of the LC3 codec
pub const CODING_FORMAT_LC3: u8 = 0x06;
/// Coding format of transparent data
pub const CODING_FORMAT_TRANSPARENT: u8 = 0x03;

/// Codec_ID, as defined in Core Vol 4, Part E - 7.8.109
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CodecId {
    pub coding_format: u8,
    pub company_id: u16,
    pub vendor_codec_id: u16,
}

impl CodecId {
    /// Standard LC3 codec
    pub const LC3: CodecId =
        CodecId { coding_format: CODING_FORMAT_LC3, company_id: 0, vendor_codec_id: 0 };
    /// Transparent data, the codec runs on the host
    pub const TRANSPARENT: CodecId =
        CodecId { coding_format: CODING_FORMAT_TRANSPARENT, company_id: 0, vendor_codec_id: 0 };

    pub(crate) fn read(r: &mut Reader) -> Option<Self> {
        Some(Self {
            coding_format: r.read_u8()?,
            company_id: r.read_u16()?,
            vendor_codec_id: r.read_u16()?,
        })
    }

    pub(crate) fn write(&self, w: &mut Writer) {
        w.write_u8(self.coding_format);
        w.write_u16(self.company_id);
        w.write_u16(self.vendor_codec_id);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u8)]
#[allow(missing_docs)]
pub enum SamplingFrequency {
    Hz8000 = 0x01,
    Hz11025 = 0x02,
    Hz16000 = 0x03,
    Hz22050 = 0x04,
    Hz24000 = 0x05,
    Hz32000 = 0x06,
    Hz44100 = 0x07,
    Hz48000 = 0x08,
    Hz88200 = 0x09,
    Hz96000 = 0x0a,
    Hz176400 = 0x0b,
    Hz192000 = 0x0c,
    Hz384000 = 0x0d,
}

impl SamplingFrequency {
    /// Frequency in Hz
    pub fn hz(self) -> u32 {
        match self {
            Self::Hz8000 => 8000,
            Self::Hz11025 => 11025,
            Self::Hz16000 => 16000,
            Self::Hz22050 => 22050,
            Self::Hz24000 => 24000,
            Self::Hz32000 => 32000,
            Self::Hz44100 => 44100,
            Self::Hz48000 => 48000,
            Self::Hz88200 => 88200,
            Self::Hz96000 => 96000,
            Self::Hz176400 => 176400,
            Self::Hz192000 => 192000,
            Self::Hz384000 => 384000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u8)]
#[allow(missing_docs)]
pub enum FrameDuration {
    Us7500 = 0x00,
    Us10000 = 0x01,
}

impl FrameDuration {
    /// Duration in microseconds
    pub fn us(self) -> u32 {
        match self {
            Self::Us7500 => 7500,
            Self::Us10000 => 10000,
        }
    }
}

const LTV_SAMPLING_FREQUENCY: u8 = 0x01;
const LTV_FRAME_DURATION: u8 = 0x02;
const LTV_AUDIO_CHANNEL_ALLOCATION: u8 = 0x03;
const LTV_OCTETS_PER_CODEC_FRAME: u8 = 0x04;
const LTV_CODEC_FRAME_BLOCKS_PER_SDU: u8 = 0x05;

const LTV_METADATA_STREAMING_AUDIO_CONTEXTS: u8 = 0x02;
const LTV_METADATA_CCID_LIST: u8 = 0x05;

/// Iterate over the (type, value) entries of an LTV buffer
fn for_each_ltv(
    buf: &[u8],
    mut f: impl FnMut(u8, &[u8]) -> Result<(), ParseError>,
) -> Result<(), ParseError> {
    let mut r = Reader::new(buf);
    while r.remaining() > 0 {
        let ltv = r.read_lv().ok_or(ParseError::Truncated("LTV entry"))?;
        let Some((&ty, value)) = ltv.split_first() else {
            continue;
        };
        f(ty, value)?;
    }
    Ok(())
}

fn ltv_value<const N: usize>(ty: u8, value: &[u8]) -> Result<u32, ParseError> {
    if value.len() != N {
        return Err(ParseError::InvalidValue { field: "LTV length", value: ty.into() });
    }
    Ok(value.iter().rev().fold(0u32, |v, byte| (v << 8) | *byte as u32))
}

/// Codec Specific Configuration of an LC3 stream
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CodecConfiguration {
    pub sampling_frequency: Option<SamplingFrequency>,
    pub frame_duration: Option<FrameDuration>,
    pub audio_channel_allocation: Option<u32>,
    pub octets_per_codec_frame: Option<u16>,
    pub codec_frame_blocks_per_sdu: Option<u8>,
}

impl CodecConfiguration {
    /// Encode as LTV, in ascending type order
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::with_capacity(16);
        if let Some(v) = self.sampling_frequency {
            w.put(&[2, LTV_SAMPLING_FREQUENCY, v as u8]);
        }
        if let Some(v) = self.frame_duration {
            w.put(&[2, LTV_FRAME_DURATION, v as u8]);
        }
        if let Some(v) = self.audio_channel_allocation {
            w.put(&[5, LTV_AUDIO_CHANNEL_ALLOCATION]);
            w.write_u32(v);
        }
        if let Some(v) = self.octets_per_codec_frame {
            w.put(&[3, LTV_OCTETS_PER_CODEC_FRAME]);
            w.write_u16(v);
        }
        if let Some(v) = self.codec_frame_blocks_per_sdu {
            w.put(&[2, LTV_CODEC_FRAME_BLOCKS_PER_SDU, v]);
        }
        w.into_vec()
    }

    /// Decode from LTV, unknown types are skipped
    pub fn decode(buf: &[u8]) -> Result<Self, ParseError> {
        let mut config = Self::default();
        for_each_ltv(buf, |ty, value| {
            match ty {
                LTV_SAMPLING_FREQUENCY => {
                    let code = ltv_value::<1>(ty, value)?;
                    config.sampling_frequency = Some(
                        SamplingFrequency::from_u32(code)
                            .ok_or(ParseError::InvalidValue {
                                field: "sampling frequency",
                                value: code,
                            })?,
                    );
                }
                LTV_FRAME_DURATION => {
                    let code = ltv_value::<1>(ty, value)?;
                    config.frame_duration = Some(
                        FrameDuration::from_u32(code)
                            .ok_or(ParseError::InvalidValue {
                                field: "frame duration",
                                value: code,
                            })?,
                    );
                }
                LTV_AUDIO_CHANNEL_ALLOCATION => {
                    config.audio_channel_allocation = Some(ltv_value::<4>(ty, value)?);
                }
                LTV_OCTETS_PER_CODEC_FRAME => {
                    config.octets_per_codec_frame = Some(ltv_value::<2>(ty, value)? as u16);
                }
                LTV_CODEC_FRAME_BLOCKS_PER_SDU => {
                    config.codec_frame_blocks_per_sdu = Some(ltv_value::<1>(ty, value)? as u8);
                }
                _ => log::debug!("Skipping codec configuration type 0x{:02x}", ty),
            }
            Ok(())
        })?;
        Ok(config)
    }

    /// Sampling frequency in Hz, 0 when unset
    pub fn sampling_frequency_hz(&self) -> u32 {
        self.sampling_frequency.map_or(0, SamplingFrequency::hz)
    }

    /// Frame duration in microseconds, 0 when unset
    pub fn frame_duration_us(&self) -> u32 {
        self.frame_duration.map_or(0, FrameDuration::us)
    }

    /// Octets per codec frame, 0 when unset
    pub fn octets_per_codec_frame(&self) -> u16 {
        self.octets_per_codec_frame.unwrap_or(0)
    }

    /// Absent means one block per SDU
    pub fn codec_frame_blocks_per_sdu(&self) -> u8 {
        self.codec_frame_blocks_per_sdu.unwrap_or(1)
    }

    /// Number of audio channels, one per allocated location (mono when unallocated)
    pub fn channel_count(&self) -> u8 {
        match self.audio_channel_allocation {
            Some(allocation) if allocation != 0 => allocation.count_ones() as u8,
            _ => 1,
        }
    }

    /// Octets of one SDU carrying every channel of this configuration
    pub fn max_sdu_size(&self) -> u16 {
        self.octets_per_codec_frame()
            * self.channel_count() as u16
            * self.codec_frame_blocks_per_sdu() as u16
    }

    /// SDU interval in microseconds
    pub fn sdu_interval_us(&self) -> u32 {
        self.frame_duration_us() * self.codec_frame_blocks_per_sdu() as u32
    }
}

/// Metadata attached to Enable and Update Metadata operations
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata {
    pub streaming_audio_contexts: AudioContexts,
    pub ccid_list: Vec<u8>,
}

impl Metadata {
    /// Metadata for `streaming_audio_contexts`
    pub fn new(streaming_audio_contexts: AudioContexts, ccid_list: Vec<u8>) -> Self {
        Self { streaming_audio_contexts, ccid_list }
    }

    /// Encode as LTV. The CCID list is only present when not empty.
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::with_capacity(4 + 2 + self.ccid_list.len());
        w.put(&[3, LTV_METADATA_STREAMING_AUDIO_CONTEXTS]);
        w.write_u16(self.streaming_audio_contexts.bits());
        if !self.ccid_list.is_empty() {
            let ccids = &self.ccid_list[..self.ccid_list.len().min(u8::MAX as usize - 1)];
            w.put(&[ccids.len() as u8 + 1, LTV_METADATA_CCID_LIST]);
            w.put(ccids);
        }
        w.into_vec()
    }

    /// Decode from LTV, unknown types are skipped
    pub fn decode(buf: &[u8]) -> Result<Self, ParseError> {
        let mut metadata = Self::default();
        for_each_ltv(buf, |ty, value| {
            match ty {
                LTV_METADATA_STREAMING_AUDIO_CONTEXTS => {
                    metadata.streaming_audio_contexts =
                        AudioContexts::from_bits_retain(ltv_value::<2>(ty, value)? as u16);
                }
                LTV_METADATA_CCID_LIST => metadata.ccid_list = value.to_vec(),
                _ => log::debug!("Skipping metadata type 0x{:02x}", ty),
            }
            Ok(())
        })?;
        Ok(metadata)
    }
}
