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

use crate::ascs::Opcode;
use crate::ase::Ase;
use crate::types::{AseState, AudioContexts, BidirectionalPair, Direction, GroupId, RawAddress};
use std::fmt;

/// ACL connection state of a remote device
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connected,
}

/// LE Audio remote device, with its Audio Stream Endpoints
#[derive(Debug, Clone)]
pub struct Device {
    #[allow(missing_docs)]
    pub address: RawAddress,
    /// Group the device belongs to
    pub group_id: Option<GroupId>,
    #[allow(missing_docs)]
    pub connection_state: ConnectionState,
    /// ACL connection handle, while connected
    pub acl_handle: Option<u16>,
    #[allow(missing_docs)]
    pub encrypted: bool,
    /// ASE Control Point characteristic value handle
    pub ctp_handle: u16,
    /// Endpoints, in the order they have been discovered
    pub ases: Vec<Ase>,
    /// Audio locations of the PACS, per direction
    pub audio_locations: BidirectionalPair<u32>,
    #[allow(missing_docs)]
    pub supported_contexts: BidirectionalPair<AudioContexts>,
    #[allow(missing_docs)]
    pub available_contexts: BidirectionalPair<AudioContexts>,
    /// Sequenced operation waiting for the endpoints to complete it
    pub(crate) pending_operation: Option<Opcode>,
}

impl Device {
    #[allow(missing_docs)]
    pub fn new(address: RawAddress) -> Self {
        Self {
            address,
            group_id: None,
            connection_state: ConnectionState::Disconnected,
            acl_handle: None,
            encrypted: false,
            ctp_handle: 0,
            ases: vec![],
            audio_locations: Default::default(),
            supported_contexts: Default::default(),
            available_contexts: Default::default(),
            pending_operation: None,
        }
    }

    /// Register an endpoint found in the ASCS database of the device
    pub fn add_ase(&mut self, id: u8, direction: Direction, handle: u16, ccc_handle: u16) {
        self.ases.push(Ase::new(id, direction, handle, ccc_handle));
    }

    #[allow(missing_docs)]
    pub fn is_connected(&self) -> bool {
        self.connection_state == ConnectionState::Connected
    }

    /// Index of the endpoint owning the characteristic value `handle`
    pub fn ase_index_by_handle(&self, handle: u16) -> Option<usize> {
        self.ases.iter().position(|ase| ase.handle == handle)
    }

    #[allow(missing_docs)]
    pub fn ase_by_id_mut(&mut self, id: u8) -> Option<&mut Ase> {
        self.ases.iter_mut().find(|ase| ase.id == id)
    }

    #[allow(missing_docs)]
    pub fn active_ases(&self) -> impl Iterator<Item = &Ase> {
        self.ases.iter().filter(|ase| ase.active)
    }

    #[allow(missing_docs)]
    pub fn active_ases_mut(&mut self) -> impl Iterator<Item = &mut Ase> {
        self.ases.iter_mut().filter(|ase| ase.active)
    }

    #[allow(missing_docs)]
    pub fn has_active_ases(&self) -> bool {
        self.ases.iter().any(|ase| ase.active)
    }

    /// All the active endpoints are in `state`, false when none is active
    pub fn have_all_active_ases_same_state(&self, state: AseState) -> bool {
        self.has_active_ases() && self.active_ases().all(|ase| ase.state == state)
    }

    /// At least one active endpoint is in one of `states`
    pub fn has_active_ase_in(&self, states: &[AseState]) -> bool {
        self.active_ases().any(|ase| states.contains(&ase.state))
    }

    /// Common state of the active endpoints, `None` when they differ or
    /// when none is active
    pub fn active_state(&self) -> Option<AseState> {
        let mut ases = self.active_ases();
        let state = ases.next()?.state;
        ases.all(|ase| ase.state == state).then_some(state)
    }

    /// Number of active endpoints in `direction`
    pub fn active_ase_count(&self, direction: Direction) -> usize {
        self.active_ases().filter(|ase| ase.direction == direction).count()
    }

    /// Discovered endpoints in `direction` free to be configured
    pub fn free_ase_count(&self, direction: Direction) -> usize {
        self.ases
            .iter()
            .filter(|ase| !ase.active && ase.is_discovered() && ase.direction == direction)
            .count()
    }

    /// Deactivate every endpoint, dropping the unused CIS assignments
    pub fn deactivate_all_ases(&mut self) {
        self.ases.iter_mut().for_each(Ase::deactivate);
    }

    /// Distinct CIS connection handles used by the endpoints, in order
    pub fn cis_conn_handles(&self) -> Vec<u16> {
        let mut handles = vec![];
        for handle in self.ases.iter().filter_map(|ase| ase.cis_conn_handle) {
            if !handles.contains(&handle) {
                handles.push(handle);
            }
        }
        handles
    }

    /// Every CIS of the device is down
    pub fn have_all_cises_disconnected(&self) -> bool {
        self.ases.iter().all(|ase| !ase.has_live_cis())
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "  Device {} {:?} (ACL: {})",
            self.address,
            self.connection_state,
            self.acl_handle.map_or("-".to_string(), |h| format!("0x{:03x}", h))
        )?;
        for ase in &self.ases {
            writeln!(f, "    {}", ase)?;
        }
        Ok(())
    }
}

/// Registry of the known devices, in the order they have been added
#[derive(Debug, Default)]
pub struct LeAudioDevices {
    devices: Vec<Device>,
}

impl LeAudioDevices {
    /// Add a device, `false` when already known
    pub fn add(&mut self, address: RawAddress) -> bool {
        if self.get(&address).is_some() {
            return false;
        }
        self.devices.push(Device::new(address));
        true
    }

    /// Remove a device, returning it
    pub fn remove(&mut self, address: &RawAddress) -> Option<Device> {
        let index = self.devices.iter().position(|d| &d.address == address)?;
        Some(self.devices.remove(index))
    }

    #[allow(missing_docs)]
    pub fn get(&self, address: &RawAddress) -> Option<&Device> {
        self.devices.iter().find(|d| &d.address == address)
    }

    #[allow(missing_docs)]
    pub fn get_mut(&mut self, address: &RawAddress) -> Option<&mut Device> {
        self.devices.iter_mut().find(|d| &d.address == address)
    }

    #[allow(missing_docs)]
    pub fn iter(&self) -> impl Iterator<Item = &Device> {
        self.devices.iter()
    }

    #[allow(missing_docs)]
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    #[allow(missing_docs)]
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}
