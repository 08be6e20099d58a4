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

use crate::ase::Ase;
use crate::cig::Cig;
use crate::configuration::AudioSetConfiguration;
use crate::device::{Device, LeAudioDevices};
use crate::stream_conf::StreamConfiguration;
use crate::types::{
    AseState, AudioContexts, BidirectionalPair, GroupId, GroupStreamStatus, RawAddress,
};
use log::debug;
use std::collections::BTreeMap;
use std::fmt;

/// Highest CIG id handed out to a group
pub const CIG_ID_MAX: u8 = 0xef;

/// Set of devices streaming together
#[derive(Debug)]
pub struct DeviceGroup {
    #[allow(missing_docs)]
    pub group_id: GroupId,
    /// Members, in order of addition. Devices are owned by the registry.
    members: Vec<RawAddress>,

    /// Last state completed by all the active endpoints
    pub(crate) state: AseState,
    pub(crate) target_state: AseState,

    #[allow(missing_docs)]
    pub cig: Cig,
    #[allow(missing_docs)]
    pub stream_conf: StreamConfiguration,

    /// Configuration in use, and the context it has been chosen for
    pub configuration: Option<AudioSetConfiguration>,
    #[allow(missing_docs)]
    pub configuration_context: AudioContexts,
    /// Streaming contexts advertised in the metadata
    pub metadata_contexts: BidirectionalPair<AudioContexts>,
    /// Content control ids advertised in the metadata
    pub ccids: BidirectionalPair<Vec<u8>>,

    /// A new configuration has been requested while releasing
    pub pending_configuration: bool,
    /// CIS of the data path being set up
    pub(crate) data_path_pending: Option<u16>,
    /// Last status reported to the upper layer
    pub(crate) last_status: Option<GroupStreamStatus>,
}

impl DeviceGroup {
    /// Group driving the CIG `cig_id`
    pub fn new(group_id: GroupId, cig_id: u8) -> Self {
        Self {
            group_id,
            members: vec![],
            state: AseState::Idle,
            target_state: AseState::Idle,
            cig: Cig::new(cig_id),
            stream_conf: Default::default(),
            configuration: None,
            configuration_context: AudioContexts::empty(),
            metadata_contexts: Default::default(),
            ccids: Default::default(),
            pending_configuration: false,
            data_path_pending: None,
            last_status: None,
        }
    }

    /// State completed by all the active endpoints
    pub fn state(&self) -> AseState {
        self.state
    }

    /// State the group is driven to
    pub fn target_state(&self) -> AseState {
        self.target_state
    }

    #[allow(missing_docs)]
    pub fn members(&self) -> &[RawAddress] {
        &self.members
    }

    #[allow(missing_docs)]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub(crate) fn add_member(&mut self, address: RawAddress) {
        if !self.members.contains(&address) {
            self.members.push(address);
        }
    }

    pub(crate) fn remove_member(&mut self, address: &RawAddress) {
        self.members.retain(|a| a != address);
    }

    /// Member devices, in order
    pub fn devices<'a>(&'a self, devices: &'a LeAudioDevices) -> impl Iterator<Item = &'a Device> {
        self.members.iter().filter_map(move |address| devices.get(address))
    }

    /// Active endpoints of all the members
    pub fn active_ases<'a>(&'a self, devices: &'a LeAudioDevices) -> impl Iterator<Item = &'a Ase> {
        self.devices(devices).flat_map(Device::active_ases)
    }

    #[allow(missing_docs)]
    pub fn num_of_connected(&self, devices: &LeAudioDevices) -> usize {
        self.devices(devices).filter(|d| d.is_connected()).count()
    }

    /// First member with active endpoints
    pub fn first_active_device(&self, devices: &LeAudioDevices) -> Option<RawAddress> {
        self.find_device(devices, |_| true)
    }

    /// First member with active endpoints matching `predicate`
    pub fn find_device(
        &self,
        devices: &LeAudioDevices,
        predicate: impl Fn(&Device) -> bool,
    ) -> Option<RawAddress> {
        self.devices(devices).find(|d| d.has_active_ases() && predicate(d)).map(|d| d.address)
    }

    /// Next member with active endpoints, after `address` in member order
    pub fn next_active_device(
        &self,
        devices: &LeAudioDevices,
        address: &RawAddress,
    ) -> Option<RawAddress> {
        self.members
            .iter()
            .skip_while(|a| *a != address)
            .skip(1)
            .filter_map(|a| devices.get(a))
            .find(|d| d.has_active_ases())
            .map(|d| d.address)
    }

    /// Common state of all the active endpoints, the value the group state
    /// follows. `None` when they differ, or when none is active.
    pub fn derived_state(&self, devices: &LeAudioDevices) -> Option<AseState> {
        let mut states = self.active_ases(devices).map(|ase| ase.state);
        let state = states.next()?;
        states.all(|s| s == state).then_some(state)
    }

    /// All the active endpoints are in `state`
    pub fn is_in_state(&self, devices: &LeAudioDevices, state: AseState) -> bool {
        self.derived_state(devices) == Some(state)
    }

    #[allow(missing_docs)]
    pub fn has_active_ases(&self, devices: &LeAudioDevices) -> bool {
        self.active_ases(devices).next().is_some()
    }

    /// Every CIS of the group is down
    pub fn have_all_cises_disconnected(&self, devices: &LeAudioDevices) -> bool {
        self.devices(devices).all(Device::have_all_cises_disconnected)
    }

    /// Member owning the endpoint using the CIS `conn_handle`
    pub fn device_by_cis(&self, devices: &LeAudioDevices, conn_handle: u16) -> Option<RawAddress> {
        self.devices(devices)
            .find(|d| d.ases.iter().any(|ase| ase.cis_conn_handle == Some(conn_handle)))
            .map(|d| d.address)
            .or_else(|| self.cig.cis_by_conn_handle(conn_handle).and_then(|cis| cis.address))
    }

    /// A member is caching a codec configuration
    pub fn has_cached_configuration(&self, devices: &LeAudioDevices) -> bool {
        self.devices(devices)
            .any(|d| d.ases.iter().any(|ase| ase.state == AseState::CodecConfigured))
    }

    /// Human readable state of the group and its members
    pub fn dump(&self, devices: &LeAudioDevices) -> String {
        let mut s = format!("{}", self);
        for device in self.devices(devices) {
            s += &device.to_string();
        }
        s
    }
}

impl fmt::Display for DeviceGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Group {}: state: {:?}, target: {:?}, context: {:?}{}",
            self.group_id,
            self.state,
            self.target_state,
            self.configuration_context,
            if self.pending_configuration { " [pending configuration]" } else { "" },
        )?;
        write!(f, "{}", self.cig)?;
        for (name, conf) in [("sink", &self.stream_conf.sink), ("source", &self.stream_conf.source)]
        {
            if !conf.is_empty() {
                writeln!(
                    f,
                    "  Streams {}: {} devices, {} channels, {} Hz, {} us, allocation 0x{:08x}",
                    name,
                    conf.num_of_devices,
                    conf.num_of_channels,
                    conf.sample_frequency_hz,
                    conf.frame_duration_us,
                    conf.audio_channel_allocation,
                )?;
            }
        }
        Ok(())
    }
}

/// Registry of the groups, by identifier. Each group owns a distinct CIG
/// id, given back when the group is removed.
#[derive(Debug, Default)]
pub struct LeAudioDeviceGroups {
    groups: BTreeMap<GroupId, DeviceGroup>,
}

impl LeAudioDeviceGroups {
    /// Group `group_id`, created when unknown. `None` when every CIG id is
    /// taken.
    pub fn get_or_create(&mut self, group_id: GroupId) -> Option<&mut DeviceGroup> {
        if !self.groups.contains_key(&group_id) {
            let cig_id = self.free_cig_id()?;
            debug!("Group {}: CIG id {}", group_id, cig_id);
            self.groups.insert(group_id, DeviceGroup::new(group_id, cig_id));
        }
        self.groups.get_mut(&group_id)
    }

    /// Lowest CIG id not owned by a group
    fn free_cig_id(&self) -> Option<u8> {
        (0..=CIG_ID_MAX).find(|id| self.groups.values().all(|g| g.cig.cig_id != *id))
    }

    #[allow(missing_docs)]
    pub fn get(&self, group_id: GroupId) -> Option<&DeviceGroup> {
        self.groups.get(&group_id)
    }

    #[allow(missing_docs)]
    pub fn get_mut(&mut self, group_id: GroupId) -> Option<&mut DeviceGroup> {
        self.groups.get_mut(&group_id)
    }

    #[allow(missing_docs)]
    pub fn remove(&mut self, group_id: GroupId) -> Option<DeviceGroup> {
        self.groups.remove(&group_id)
    }

    /// Group owning the CIG `cig_id`
    pub fn by_cig_id(&self, cig_id: u8) -> Option<GroupId> {
        self.groups.values().find(|g| g.cig.cig_id == cig_id).map(|g| g.group_id)
    }

    /// Group owning the CIS `conn_handle`
    pub fn by_cis_conn_handle(
        &self,
        devices: &LeAudioDevices,
        conn_handle: u16,
    ) -> Option<GroupId> {
        self.groups
            .values()
            .find(|g| {
                g.cig.cis_by_conn_handle(conn_handle).is_some()
                    || g.devices(devices)
                        .any(|d| d.ases.iter().any(|ase| ase.cis_conn_handle == Some(conn_handle)))
            })
            .map(|g| g.group_id)
    }

    #[allow(missing_docs)]
    pub fn iter(&self) -> impl Iterator<Item = &DeviceGroup> {
        self.groups.values()
    }
}
