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

use crate::ascs::CodecConfiguredParameters;
use crate::codec::{CodecConfiguration, CodecId};
use crate::types::{
    AseState, AudioContexts, DataPathState, Direction, TargetLatency, TargetPhy,
    ASE_ID_INVALID,
};
use std::fmt;

/// Marker of an ASE without Connected Isochronous Stream
pub const CIS_ID_INVALID: u8 = 0xff;

/// QoS preferences exposed by the server in the Codec Configured state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct QosPreferences {
    pub supported_framing: u8,
    pub preferred_phy: u8,
    pub preferred_retransmission_number: u8,
    pub max_transport_latency: u16,
    pub presentation_delay_min: u32,
    pub presentation_delay_max: u32,
    pub preferred_presentation_delay_min: u32,
    pub preferred_presentation_delay_max: u32,
}

impl From<&CodecConfiguredParameters> for QosPreferences {
    fn from(p: &CodecConfiguredParameters) -> Self {
        Self {
            supported_framing: p.framing,
            preferred_phy: p.preferred_phy,
            preferred_retransmission_number: p.preferred_retransmission_number,
            max_transport_latency: p.max_transport_latency,
            presentation_delay_min: p.presentation_delay_min,
            presentation_delay_max: p.presentation_delay_max,
            preferred_presentation_delay_min: p.preferred_presentation_delay_min,
            preferred_presentation_delay_max: p.preferred_presentation_delay_max,
        }
    }
}

/// QoS parameters requested with Config QoS
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct AseQosConfiguration {
    pub sdu_interval: u32,
    pub framing: u8,
    pub phy: u8,
    pub max_sdu_size: u16,
    pub retransmission_number: u8,
    pub max_transport_latency: u16,
    pub presentation_delay: u32,
}

/// Audio Stream Endpoint of a remote device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ase {
    /// Identifier assigned by the server, `ASE_ID_INVALID` until read
    pub id: u8,
    #[allow(missing_docs)]
    pub direction: Direction,
    /// ASE characteristic value handle
    pub handle: u16,
    /// ASE characteristic CCC descriptor handle
    pub ccc_handle: u16,

    /// Part of the stream being set up for the group
    pub active: bool,
    /// State last notified by the server
    pub state: AseState,
    #[allow(missing_docs)]
    pub data_path_state: DataPathState,

    #[allow(missing_docs)]
    pub target_latency: TargetLatency,
    #[allow(missing_docs)]
    pub target_phy: TargetPhy,
    #[allow(missing_docs)]
    pub codec_id: CodecId,
    #[allow(missing_docs)]
    pub codec_config: CodecConfiguration,
    /// Context the codec configuration was chosen for
    pub configured_for_context: AudioContexts,
    #[allow(missing_docs)]
    pub qos_preferences: QosPreferences,
    #[allow(missing_docs)]
    pub qos: AseQosConfiguration,

    #[allow(missing_docs)]
    pub cis_id: u8,
    /// CIS connection handle, once the CIG is created
    pub cis_conn_handle: Option<u16>,
    /// LTV encoded metadata
    pub metadata: Vec<u8>,
}

impl Ase {
    #[allow(missing_docs)]
    pub fn new(id: u8, direction: Direction, handle: u16, ccc_handle: u16) -> Self {
        Self {
            id,
            direction,
            handle,
            ccc_handle,
            active: false,
            state: AseState::Idle,
            data_path_state: DataPathState::Idle,
            target_latency: Default::default(),
            target_phy: Default::default(),
            codec_id: Default::default(),
            codec_config: Default::default(),
            configured_for_context: AudioContexts::empty(),
            qos_preferences: Default::default(),
            qos: Default::default(),
            cis_id: CIS_ID_INVALID,
            cis_conn_handle: None,
            metadata: vec![],
        }
    }

    /// The id has been read from the server
    pub fn is_discovered(&self) -> bool {
        self.id != ASE_ID_INVALID
    }

    /// A CIS is assigned, and its connection handle known
    pub fn has_cis(&self) -> bool {
        self.cis_id != CIS_ID_INVALID && self.cis_conn_handle.is_some()
    }

    /// A CIS is establishing, established or disconnecting
    pub fn has_live_cis(&self) -> bool {
        !matches!(self.data_path_state, DataPathState::Idle | DataPathState::CisAssigned)
    }

    /// Leave the stream of the group, the configuration on the server stays
    /// as notified. The CIS assignment is dropped unless the CIS is alive.
    pub fn deactivate(&mut self) {
        self.active = false;
        if !self.has_live_cis() {
            self.release_cis();
        }
    }

    /// Back to the initial Idle values, only the identity is kept
    pub fn reset(&mut self) {
        let live_cis = self.has_live_cis().then_some((
            self.cis_id,
            self.cis_conn_handle,
            self.data_path_state,
        ));
        *self = Self::new(self.id, self.direction, self.handle, self.ccc_handle);
        if let Some((cis_id, cis_conn_handle, data_path_state)) = live_cis {
            self.cis_id = cis_id;
            self.cis_conn_handle = cis_conn_handle;
            self.data_path_state = data_path_state;
        }
    }

    /// Drop the CIS assignment
    pub fn release_cis(&mut self) {
        self.cis_id = CIS_ID_INVALID;
        self.cis_conn_handle = None;
        self.data_path_state = DataPathState::Idle;
    }
}

impl fmt::Display for Ase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ASE 0x{:02x} ({}){} state: {:?}, data path: {:?}, CIS: ",
            self.id,
            self.direction,
            if self.active { " [active]" } else { "" },
            self.state,
            self.data_path_state,
        )?;
        match self.cis_conn_handle {
            Some(handle) => write!(f, "{} (0x{:03x})", self.cis_id, handle),
            None if self.cis_id != CIS_ID_INVALID => write!(f, "{}", self.cis_id),
            None => f.write_str("-"),
        }
    }
}
