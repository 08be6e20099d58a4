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

//! Aggregated configuration of the streams of a group, handed to the
//! audio path: which CISes carry which channels, with which codec
//! parameters.

use crate::codec::CodecConfiguration;
use crate::types::{BidirectionalPair, RawAddress};
use thiserror::Error;

/// A CIS carrying audio of the group
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct Stream {
    pub conn_handle: u16,
    pub address: RawAddress,
    pub audio_channel_allocation: u32,
    pub channel_count: u8,
}

/// Streams do not share the same codec parameters
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamConfigurationError {
    #[error("Stream 0x{conn_handle:03x}: {field} {value} differs from {expected}")]
    #[allow(missing_docs)]
    Mismatch { conn_handle: u16, field: &'static str, expected: u32, value: u32 },
    #[error("Stream 0x{0:03x} already registered")]
    #[allow(missing_docs)]
    AlreadyPresent(u16),
}

/// Streams of one direction, with their common codec parameters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirectionStreamConfiguration {
    /// In order of addition
    pub streams: Vec<Stream>,
    /// Distinct devices contributing a stream
    pub num_of_devices: u8,
    /// Channels over all the streams
    pub num_of_channels: u8,
    #[allow(missing_docs)]
    pub sample_frequency_hz: u32,
    #[allow(missing_docs)]
    pub frame_duration_us: u32,
    #[allow(missing_docs)]
    pub octets_per_codec_frame: u16,
    #[allow(missing_docs)]
    pub codec_frames_blocks_per_sdu: u8,
    /// Union of the allocations of the streams
    pub audio_channel_allocation: u32,
}

impl DirectionStreamConfiguration {
    #[allow(missing_docs)]
    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    /// Register a stream, its codec parameters must be the ones of the
    /// streams already registered
    pub fn add_stream(
        &mut self,
        address: RawAddress,
        conn_handle: u16,
        codec: &CodecConfiguration,
    ) -> Result<(), StreamConfigurationError> {
        if self.streams.iter().any(|s| s.conn_handle == conn_handle) {
            return Err(StreamConfigurationError::AlreadyPresent(conn_handle));
        }

        if !self.is_empty() {
            let check = |field, expected: u32, value: u32| match expected == value {
                true => Ok(()),
                false => {
                    Err(StreamConfigurationError::Mismatch { conn_handle, field, expected, value })
                }
            };
            check("sampling frequency", self.sample_frequency_hz, codec.sampling_frequency_hz())?;
            check("frame duration", self.frame_duration_us, codec.frame_duration_us())?;
            check(
                "octets per codec frame",
                self.octets_per_codec_frame.into(),
                codec.octets_per_codec_frame().into(),
            )?;
            check(
                "codec frame blocks per SDU",
                self.codec_frames_blocks_per_sdu.into(),
                codec.codec_frame_blocks_per_sdu().into(),
            )?;
        }

        let stream = Stream {
            conn_handle,
            address,
            audio_channel_allocation: codec.audio_channel_allocation.unwrap_or(0),
            channel_count: codec.channel_count(),
        };
        self.streams.push(stream);
        self.sample_frequency_hz = codec.sampling_frequency_hz();
        self.frame_duration_us = codec.frame_duration_us();
        self.octets_per_codec_frame = codec.octets_per_codec_frame();
        self.codec_frames_blocks_per_sdu = codec.codec_frame_blocks_per_sdu();
        self.update_totals();
        Ok(())
    }

    /// Unregister a stream, `false` when unknown. The codec parameters are
    /// cleared with the last stream.
    pub fn remove_stream(&mut self, conn_handle: u16) -> bool {
        let len = self.streams.len();
        self.streams.retain(|s| s.conn_handle != conn_handle);
        self.removed(len)
    }

    /// Unregister the streams of a device, `false` when there is none
    pub fn remove_device(&mut self, address: &RawAddress) -> bool {
        let len = self.streams.len();
        self.streams.retain(|s| &s.address != address);
        self.removed(len)
    }

    fn removed(&mut self, len: usize) -> bool {
        if self.streams.len() == len {
            return false;
        }
        match self.is_empty() {
            true => *self = Default::default(),
            false => self.update_totals(),
        }
        true
    }

    fn update_totals(&mut self) {
        let mut devices: Vec<RawAddress> = self.streams.iter().map(|s| s.address).collect();
        devices.sort();
        devices.dedup();
        self.num_of_devices = devices.len() as u8;
        self.num_of_channels = self.streams.iter().map(|s| s.channel_count).sum();
        self.audio_channel_allocation =
            self.streams.iter().fold(0, |acc, s| acc | s.audio_channel_allocation);
    }
}

/// Streams of a group, per direction
pub type StreamConfiguration = BidirectionalPair<DirectionStreamConfiguration>;
