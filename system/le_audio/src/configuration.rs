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

//! Audio set configurations: how many devices, endpoints and channels are
//! used for a context, with which codec and QoS parameters.

use crate::codec::{CodecConfiguration, CodecId};
use crate::types::{AudioContexts, Direction, TargetLatency, TargetPhy};

/// Codec settings of the endpoints of a set configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodecConfigSetting {
    /// Codec of the ASEs
    pub id: CodecId,
    /// Codec specific configuration, the channel allocation is filled in
    /// per endpoint from the audio locations of the device
    pub params: CodecConfiguration,
    /// Audio channels carried by each endpoint
    pub channel_count_per_ase: u8,
}

/// QoS settings of the endpoints of a set configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QosConfigSetting {
    /// Retransmissions of each SDU
    pub retransmission_number: u8,
    /// In milliseconds
    pub max_transport_latency: u16,
}

/// Endpoints to configure in one direction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetConfiguration {
    /// Direction of the ASEs
    pub direction: Direction,
    /// Number of devices of the group used
    pub device_cnt: u8,
    /// Number of endpoints used on each device
    pub ase_cnt: u8,
    /// Latency requested with Config Codec
    pub target_latency: TargetLatency,
    /// PHY requested with Config Codec
    pub target_phy: TargetPhy,
    /// Codec of each ASE
    pub codec: CodecConfigSetting,
    /// QoS of each ASE
    pub qos: QosConfigSetting,
}

/// Configuration of a group for a context
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioSetConfiguration {
    /// Name, for logs
    pub name: String,
    /// Entries, one per direction and device count
    pub confs: Vec<SetConfiguration>,
}

impl AudioSetConfiguration {
    /// Set configurations of `direction`
    pub fn confs(&self, direction: Direction) -> impl Iterator<Item = &SetConfiguration> {
        self.confs.iter().filter(move |conf| conf.direction == direction)
    }

    /// Total number of endpoints of `direction`, over all devices
    pub fn ase_count(&self, direction: Direction) -> usize {
        self.confs(direction).map(|conf| conf.device_cnt as usize * conf.ase_cnt as usize).sum()
    }
}

/// Selects the configuration of a group, for a context
pub trait AudioSetConfigurationProvider: Send + Sync {
    /// Configuration for `context`, using up to `num_devices` connected
    /// devices. `None` when the context cannot be served.
    fn get_configuration(
        &self,
        context: AudioContexts,
        num_devices: usize,
    ) -> Option<AudioSetConfiguration>;
}

/// Pick `count` channel allocation bits among `locations`, skipping the
/// ones already in `used`. Returns `None` when the device exposes no
/// location, or not enough of them.
pub(crate) fn allocate_audio_locations(locations: u32, used: u32, count: u8) -> Option<u32> {
    let mut allocation = 0u32;
    let mut remaining = locations & !used;
    for _ in 0..count {
        if remaining == 0 {
            return None;
        }
        let bit = remaining & remaining.wrapping_neg();
        allocation |= bit;
        remaining &= !bit;
    }
    Some(allocation)
}
