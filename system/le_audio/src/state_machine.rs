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

//! Group stream state machine.
//!
//! Drives the endpoints of the members of a group, one device at a time,
//! through the ASCS state machine towards the target state of the group,
//! and provisions the isochronous channels carrying the audio.

use crate::ascs::{
    AseStateParameters, AseStatus, CodecConfiguredParameters, ConfigCodecParameters,
    ConfigQosParameters, ControlPointNotification, EnabledParameters, MetadataParameters, Opcode,
    Operation, ResponseCode,
};
use crate::ase::Ase;
use crate::callbacks::{AscsClient, StateMachineCallbacks};
use crate::cig::CigCreateError;
use crate::codec::{CodecId, Metadata};
use crate::configuration::{
    allocate_audio_locations, AudioSetConfiguration, AudioSetConfigurationProvider,
    SetConfiguration,
};
use crate::device::{ConnectionState, Device, LeAudioDevices};
use crate::group::{DeviceGroup, LeAudioDeviceGroups};
use crate::iso::{
    CisHandlePair, DataPathDirection, DataPathDirections, DataPathParameters, IsoEvent,
    IsoManager, LinkQualityReport, DATA_PATH_ID_HCI,
};
use crate::status::Status;
use crate::types::{
    AseState, AudioContexts, BidirectionalPair, CigState, DataPathState, Direction, GroupId,
    GroupStreamStatus, RawAddress,
};

use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time;

const DEFAULT_TRANSITION_TIMEOUT_MS: u64 = 3500;

/// Tunables of the state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateMachineConfig {
    /// Time given to a group to reach its target state
    pub transition_timeout: Duration,
    /// Period of the link quality reads of the established CISes, disabled
    /// when `None`
    pub link_quality_check_interval: Option<Duration>,
}

impl Default for StateMachineConfig {
    fn default() -> Self {
        Self {
            transition_timeout: Duration::from_millis(DEFAULT_TRANSITION_TIMEOUT_MS),
            link_quality_check_interval: None,
        }
    }
}

impl StateMachineConfig {
    /// Overrides the transition timeout, in milliseconds
    pub const TRANSITION_TIMEOUT_ENV: &'static str = "LE_AUDIO_STATE_TRANSITION_TIMEOUT_MS";
    /// Enables the link quality reads, period in milliseconds
    pub const LINK_QUALITY_CHECK_INTERVAL_ENV: &'static str =
        "LE_AUDIO_LINK_QUALITY_CHECK_INTERVAL_MS";

    /// Watchdog of the transitions of a group
    pub fn with_transition_timeout(mut self, timeout: Duration) -> Self {
        self.transition_timeout = timeout;
        self
    }

    /// Poll the link quality of streaming CISes every `interval`
    pub fn with_link_quality_check_interval(mut self, interval: Duration) -> Self {
        self.link_quality_check_interval = Some(interval);
        self
    }

    /// Defaults, overridden by the environment
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(timeout) = duration_from_env(Self::TRANSITION_TIMEOUT_ENV) {
            config.transition_timeout = timeout;
        }
        if let Some(interval) = duration_from_env(Self::LINK_QUALITY_CHECK_INTERVAL_ENV) {
            config.link_quality_check_interval = (!interval.is_zero()).then_some(interval);
        }
        config
    }
}

fn duration_from_env(name: &str) -> Option<Duration> {
    let value = std::env::var(name).ok()?;
    match value.parse::<u64>() {
        Ok(ms) => Some(Duration::from_millis(ms)),
        Err(e) => {
            warn!("Ignoring {}={}: {}", name, value, e);
            None
        }
    }
}

/// Errors of the requests made to the state machine
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StateMachineError {
    /// No such group
    #[error("Unknown group {0}")]
    UnknownGroup(GroupId),
    /// No such device
    #[error("Unknown device {0}")]
    UnknownDevice(RawAddress),
    /// The ACL of the device is down
    #[error("{0} is not connected")]
    DeviceNotConnected(RawAddress),
    /// The request is not allowed in the current state of the group
    #[error("Group {group_id}: cannot {operation} in state {state:?}, target {target:?}")]
    IllegalState {
        /// Group the request was made on
        group_id: GroupId,
        /// Rejected request
        operation: &'static str,
        /// Current state of the group
        state: AseState,
        /// Target state of the group
        target: AseState,
    },
    /// Every member of the group is disconnected
    #[error("Group {0}: no connected device")]
    NoActiveDevice(GroupId),
    /// Every CIG id is owned by another group
    #[error("Group {0}: no free CIG id")]
    NoCigId(GroupId),
    /// No configuration of the group serves the context
    #[error("Group {0}: no configuration for {1:?}")]
    NoConfiguration(GroupId, AudioContexts),
    /// Group membership can only change while the device is disconnected
    #[error("{address}: {reason}")]
    Membership {
        /// Device whose membership was to change
        address: RawAddress,
        /// Why the change was refused
        reason: &'static str,
    },
}

/// Expiry of a timer armed by the state machine, given back to
/// `GroupStateMachine::on_timer_event`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerEvent {
    /// The group did not reach its target state. The token identifies the
    /// arming, expiries of disarmed watchdogs are ignored.
    StateTransitionTimeout {
        /// Group of the watchdog
        group_id: GroupId,
        /// Arming the watchdog expired
        token: u64,
    },
    /// Time to read the link quality of a CIS
    LinkQualityCheck {
        /// CIS to read
        conn_handle: u16,
    },
}

/// Unicast client state machine of all the groups.
///
/// Every method must be called from the same task: requests of the upper
/// layer, GATT notifications, ACL events, completions of the isochronous
/// channels manager and timer expiries are all serialized through it.
pub struct GroupStateMachine {
    iso: Arc<dyn IsoManager>,
    gatt: Arc<dyn AscsClient>,
    callbacks: Arc<dyn StateMachineCallbacks>,
    configurations: Arc<dyn AudioSetConfigurationProvider>,
    config: StateMachineConfig,
    timer_tx: mpsc::UnboundedSender<TimerEvent>,
    watchdogs: HashMap<GroupId, (u64, JoinHandle<()>)>,
    next_watchdog_token: u64,
    link_quality_timers: HashMap<u16, JoinHandle<()>>,
    devices: LeAudioDevices,
    groups: LeAudioDeviceGroups,
}

impl GroupStateMachine {
    /// State machine reporting its timer expiries on `timer_tx`. Timers are
    /// spawned on the current tokio runtime.
    pub fn new(
        iso: Arc<dyn IsoManager>,
        gatt: Arc<dyn AscsClient>,
        callbacks: Arc<dyn StateMachineCallbacks>,
        configurations: Arc<dyn AudioSetConfigurationProvider>,
        config: StateMachineConfig,
        timer_tx: mpsc::UnboundedSender<TimerEvent>,
    ) -> Self {
        debug!("State machine config: {:?}", config);
        Self {
            iso,
            gatt,
            callbacks,
            configurations,
            config,
            timer_tx,
            watchdogs: HashMap::new(),
            next_watchdog_token: 0,
            link_quality_timers: HashMap::new(),
            devices: Default::default(),
            groups: Default::default(),
        }
    }

    /// Known devices
    pub fn devices(&self) -> &LeAudioDevices {
        &self.devices
    }

    /// Device `address`
    pub fn device(&self, address: &RawAddress) -> Option<&Device> {
        self.devices.get(address)
    }

    /// Device, to fill in what the discovery of its services found
    pub fn device_mut(&mut self, address: &RawAddress) -> Option<&mut Device> {
        self.devices.get_mut(address)
    }

    /// Group `group_id`
    pub fn group(&self, group_id: GroupId) -> Option<&DeviceGroup> {
        self.groups.get(group_id)
    }

    /// Human readable state of a group, its CIG and its members
    pub fn dump_group(&self, group_id: GroupId) -> Option<String> {
        self.groups.get(group_id).map(|group| group.dump(&self.devices))
    }

    // Devices and membership

    /// Register a device, member of `group_id` when given
    pub fn add_device(
        &mut self,
        address: RawAddress,
        group_id: Option<GroupId>,
    ) -> Result<(), StateMachineError> {
        if !self.devices.add(address) {
            return Err(StateMachineError::Membership { address, reason: "device already known" });
        }
        info!("{}: added", address);
        match group_id {
            Some(group_id) => self.group_add_node(group_id, address),
            None => Ok(()),
        }
    }

    /// Forget a disconnected device. Its group goes away with its last
    /// member.
    pub fn remove_device(&mut self, address: &RawAddress) -> Result<(), StateMachineError> {
        let device = self.devices.get(address).ok_or(StateMachineError::UnknownDevice(*address))?;
        if device.is_connected() {
            return Err(StateMachineError::Membership {
                address: *address,
                reason: "device is connected",
            });
        }
        if let Some(group_id) = device.group_id {
            self.detach_from_group(group_id, address);
        }
        self.devices.remove(address);
        info!("{}: removed", address);
        Ok(())
    }

    /// Add a disconnected device to `group_id`, creating the group if needed
    pub fn group_add_node(
        &mut self,
        group_id: GroupId,
        address: RawAddress,
    ) -> Result<(), StateMachineError> {
        let device = self.devices.get(&address).ok_or(StateMachineError::UnknownDevice(address))?;
        if device.group_id == Some(group_id) {
            return Ok(());
        }
        if device.is_connected() {
            return Err(StateMachineError::Membership {
                address,
                reason: "connected devices cannot change group",
            });
        }
        if let Some(previous) = device.group_id {
            self.detach_from_group(previous, &address);
        }
        let Some(group) = self.groups.get_or_create(group_id) else {
            return Err(StateMachineError::NoCigId(group_id));
        };
        group.add_member(address);
        if let Some(device) = self.devices.get_mut(&address) {
            device.group_id = Some(group_id);
        }
        info!("{}: added to group {}", address, group_id);
        Ok(())
    }

    /// Remove a disconnected device from `group_id`
    pub fn group_remove_node(
        &mut self,
        group_id: GroupId,
        address: RawAddress,
    ) -> Result<(), StateMachineError> {
        let device = self.devices.get(&address).ok_or(StateMachineError::UnknownDevice(address))?;
        if device.group_id != Some(group_id) {
            return Err(StateMachineError::Membership {
                address,
                reason: "device is not a member of the group",
            });
        }
        if device.is_connected() {
            return Err(StateMachineError::Membership {
                address,
                reason: "connected devices cannot change group",
            });
        }
        self.detach_from_group(group_id, &address);
        Ok(())
    }

    fn detach_from_group(&mut self, group_id: GroupId, address: &RawAddress) {
        if let Some(device) = self.devices.get_mut(address) {
            device.group_id = None;
            device.deactivate_all_ases();
        }
        let Some(group) = self.groups.get_mut(group_id) else {
            return;
        };
        group.remove_member(address);
        group.cig.unassign_device(address);
        info!("{}: removed from group {}", address, group_id);
        if group.is_empty() {
            self.cancel_watchdog(group_id);
            self.groups.remove(group_id);
            info!("Group {} removed", group_id);
        }
    }

    /// The ACL of a device is up
    pub fn on_acl_connected(
        &mut self,
        address: RawAddress,
        acl_handle: u16,
    ) -> Result<(), StateMachineError> {
        let device =
            self.devices.get_mut(&address).ok_or(StateMachineError::UnknownDevice(address))?;
        device.connection_state = ConnectionState::Connected;
        device.acl_handle = Some(acl_handle);
        info!("{}: connected, ACL handle 0x{:03x}", address, acl_handle);
        Ok(())
    }

    /// A configuration change will follow the ongoing release: report
    /// `ConfiguredByUser` instead of `Idle` on completion
    pub fn set_pending_configuration(
        &mut self,
        group_id: GroupId,
    ) -> Result<(), StateMachineError> {
        let group =
            self.groups.get_mut(group_id).ok_or(StateMachineError::UnknownGroup(group_id))?;
        group.pending_configuration = true;
        Ok(())
    }

    // Requests of the upper layer

    /// Bring the group to streaming for `context`
    pub fn start_stream(
        &mut self,
        group_id: GroupId,
        context: AudioContexts,
        metadata_contexts: BidirectionalPair<AudioContexts>,
        ccids: BidirectionalPair<Vec<u8>>,
    ) -> Result<(), StateMachineError> {
        let group = self.groups.get(group_id).ok_or(StateMachineError::UnknownGroup(group_id))?;
        if group.num_of_connected(&self.devices) == 0 {
            return Err(StateMachineError::NoActiveDevice(group_id));
        }
        let (state, target) = (group.state, group.target_state);
        info!(
            "Group {}: start stream for {:?}, state: {:?}, target: {:?}",
            group_id, context, state, target
        );

        if state != target {
            if target != AseState::Streaming {
                return Err(self.illegal_state(group_id, "start stream"));
            }
            debug!("Group {}: already starting", group_id);
            if let Some(group) = self.groups.get_mut(group_id) {
                group.metadata_contexts = metadata_contexts;
                group.ccids = ccids;
            }
            return Ok(());
        }

        match state {
            AseState::Streaming => {
                self.update_metadata(group_id, metadata_contexts, ccids);
                Ok(())
            }
            AseState::QosConfigured => self.resume_stream(group_id, metadata_contexts, ccids),
            AseState::CodecConfigured => {
                if group.configuration_context == context
                    && self.start_configured_stream(group_id, context, &metadata_contexts, &ccids)
                {
                    return Ok(());
                }
                self.configure(group_id, context, metadata_contexts, ccids, AseState::Streaming)
            }
            AseState::Idle => {
                self.configure(group_id, context, metadata_contexts, ccids, AseState::Streaming)
            }
            _ => Err(self.illegal_state(group_id, "start stream")),
        }
    }

    /// Configure the codec of the group for `context`, without streaming
    pub fn configure_stream(
        &mut self,
        group_id: GroupId,
        context: AudioContexts,
        metadata_contexts: BidirectionalPair<AudioContexts>,
        ccids: BidirectionalPair<Vec<u8>>,
    ) -> Result<(), StateMachineError> {
        let group = self.groups.get(group_id).ok_or(StateMachineError::UnknownGroup(group_id))?;
        let configurable = |state| matches!(state, AseState::Idle | AseState::CodecConfigured);
        if !configurable(group.state) || !configurable(group.target_state) {
            return Err(self.illegal_state(group_id, "configure stream"));
        }
        if group.num_of_connected(&self.devices) == 0 {
            return Err(StateMachineError::NoActiveDevice(group_id));
        }
        info!("Group {}: configure stream for {:?}", group_id, context);
        self.configure(group_id, context, metadata_contexts, ccids, AseState::CodecConfigured)
    }

    /// Stop the audio of a streaming group, keeping its configuration
    pub fn suspend_stream(&mut self, group_id: GroupId) -> Result<(), StateMachineError> {
        let group = self.groups.get(group_id).ok_or(StateMachineError::UnknownGroup(group_id))?;
        match (group.state, group.target_state) {
            (_, AseState::QosConfigured) => {
                debug!("Group {}: already suspending or suspended", group_id);
                return Ok(());
            }
            (AseState::QosConfigured | AseState::Streaming, AseState::Streaming) => {}
            _ => return Err(self.illegal_state(group_id, "suspend stream")),
        }
        info!("Group {}: suspend stream", group_id);

        self.set_target_state(group_id, AseState::QosConfigured);
        self.report(group_id, GroupStreamStatus::Suspending);
        self.disable_next_device(group_id);
        Ok(())
    }

    /// Release the endpoints of the group, configurations cached by the
    /// devices included
    pub fn stop_stream(&mut self, group_id: GroupId) -> Result<(), StateMachineError> {
        let group = self.groups.get(group_id).ok_or(StateMachineError::UnknownGroup(group_id))?;
        if group.target_state == AseState::Idle {
            debug!("Group {}: already releasing or idle", group_id);
            return Ok(());
        }
        info!("Group {}: stop stream, state: {:?}", group_id, group.state);

        if !group.has_active_ases(&self.devices) {
            let members = group.members().to_vec();
            for address in members.iter() {
                let Some(device) = self.devices.get_mut(address) else {
                    continue;
                };
                if !device.is_connected() {
                    continue;
                }
                for ase in device.ases.iter_mut().filter(|ase| ase.state != AseState::Idle) {
                    ase.active = true;
                }
            }
        }

        self.set_target_state(group_id, AseState::Idle);
        self.report(group_id, GroupStreamStatus::Releasing);
        self.release_next_device(group_id);
        Ok(())
    }

    /// Bring a member which connected late into the running stream of its
    /// group
    pub fn attach_to_stream(
        &mut self,
        group_id: GroupId,
        address: RawAddress,
    ) -> Result<(), StateMachineError> {
        let group = self.groups.get(group_id).ok_or(StateMachineError::UnknownGroup(group_id))?;
        let device = self.devices.get(&address).ok_or(StateMachineError::UnknownDevice(address))?;
        if device.group_id != Some(group_id) {
            return Err(StateMachineError::Membership {
                address,
                reason: "device is not a member of the group",
            });
        }
        if !device.is_connected() {
            return Err(StateMachineError::DeviceNotConnected(address));
        }
        if group.state != AseState::Streaming || group.target_state != AseState::Streaming {
            return Err(self.illegal_state(group_id, "attach to stream"));
        }
        if device.has_active_ases() {
            debug!("{}: already in the stream of group {}", address, group_id);
            return Ok(());
        }
        let context = group.configuration_context;
        let config = group
            .configuration
            .as_ref()
            .ok_or(StateMachineError::NoConfiguration(group_id, context))?;

        // Only the part of the configuration left unused by the other members
        let missing: Vec<SetConfiguration> = config
            .confs
            .iter()
            .filter(|conf| {
                let used = group
                    .devices(&self.devices)
                    .filter(|d| d.active_ase_count(conf.direction) > 0)
                    .count();
                used < conf.device_cnt.into()
            })
            .cloned()
            .collect();

        let (Some(group), Some(device)) =
            (self.groups.get_mut(group_id), self.devices.get_mut(&address))
        else {
            return Err(StateMachineError::UnknownDevice(address));
        };
        let mut activated = 0;
        for conf in &missing {
            if device.free_ase_count(conf.direction) >= conf.ase_cnt.into() {
                activated += activate_device_ases(device, conf, context);
            }
        }
        if activated == 0 {
            return Err(StateMachineError::NoConfiguration(group_id, context));
        }

        group.cig.assign_cis_ids(device);
        if !device.active_ases().all(Ase::has_cis) {
            error!("{}: no CIS of CIG {} left to join the stream", address, group.cig.cig_id);
            group.cig.unassign_device(&address);
            group.cig.cises.retain(|cis| cis.conn_handle.is_some());
            device.deactivate_all_ases();
            return Err(StateMachineError::NoConfiguration(group_id, context));
        }

        info!("{}: joining the stream of group {}", address, group_id);
        self.send_config_codec(address);
        Ok(())
    }

    fn illegal_state(&self, group_id: GroupId, operation: &'static str) -> StateMachineError {
        match self.groups.get(group_id) {
            Some(group) => StateMachineError::IllegalState {
                group_id,
                operation,
                state: group.state,
                target: group.target_state,
            },
            None => StateMachineError::UnknownGroup(group_id),
        }
    }

    fn stop_stream_internal(&mut self, group_id: GroupId) {
        if let Err(e) = self.stop_stream(group_id) {
            warn!("Group {}: cannot stop the stream: {}", group_id, e);
        }
    }

    fn configure(
        &mut self,
        group_id: GroupId,
        context: AudioContexts,
        metadata_contexts: BidirectionalPair<AudioContexts>,
        ccids: BidirectionalPair<Vec<u8>>,
        target: AseState,
    ) -> Result<(), StateMachineError> {
        let group =
            self.groups.get_mut(group_id).ok_or(StateMachineError::UnknownGroup(group_id))?;
        let num_of_connected = group.num_of_connected(&self.devices);
        let config = self
            .configurations
            .get_configuration(context, num_of_connected)
            .ok_or(StateMachineError::NoConfiguration(group_id, context))?;

        let members = group.members().to_vec();
        for address in &members {
            if let Some(device) = self.devices.get_mut(address) {
                device.deactivate_all_ases();
            }
            group.cig.unassign_device(address);
        }
        let activated = activate_ases(&mut self.devices, &members, &config, context);
        if activated == 0 {
            warn!("Group {}: no device can take {}", group_id, config.name);
            return Err(StateMachineError::NoConfiguration(group_id, context));
        }

        if group.cig.state == CigState::None {
            group.cig.release_cis_ids();
        }
        group.cig.recovery_attempted = false;
        group.cig.generate_cis_ids(&config);

        info!("Group {}: configuring {} ASEs with {}", group_id, activated, config.name);
        group.configuration = Some(config);
        group.configuration_context = context;
        group.metadata_contexts = metadata_contexts;
        group.ccids = ccids;
        let first = group.first_active_device(&self.devices);

        self.set_target_state(group_id, target);
        if let Some(first) = first {
            self.send_config_codec(first);
        }
        Ok(())
    }

    /// Stream from the codec configuration left by a configure request, or
    /// cached by the devices. Returns false when the configuration cannot
    /// be used.
    fn start_configured_stream(
        &mut self,
        group_id: GroupId,
        context: AudioContexts,
        metadata_contexts: &BidirectionalPair<AudioContexts>,
        ccids: &BidirectionalPair<Vec<u8>>,
    ) -> bool {
        let Some(group) = self.groups.get_mut(group_id) else {
            return false;
        };
        let Some(config) = group.configuration.clone() else {
            return false;
        };
        let members = group.members().to_vec();
        for address in members.iter() {
            let Some(device) = self.devices.get_mut(address) else {
                continue;
            };
            if !device.is_connected() {
                continue;
            }
            for ase in device.ases.iter_mut().filter(|ase| {
                ase.state == AseState::CodecConfigured && ase.configured_for_context == context
            }) {
                ase.active = true;
            }
        }
        if !group.is_in_state(&self.devices, AseState::CodecConfigured) {
            debug!("Group {}: configuration of {:?} not usable", group_id, context);
            deactivate_members(&mut self.devices, &members);
            return false;
        }

        info!("Group {}: streaming from the codec configuration", group_id);
        group.metadata_contexts = metadata_contexts.clone();
        group.ccids = ccids.clone();
        group.cig.recovery_attempted = false;
        group.cig.generate_cis_ids(&config);

        if let Err(e) = self.create_cig(group_id) {
            warn!("Group {}: cannot create CIG: {:?}", group_id, e);
            deactivate_members(&mut self.devices, &members);
            return false;
        }
        self.set_target_state(group_id, AseState::Streaming);
        true
    }

    fn resume_stream(
        &mut self,
        group_id: GroupId,
        metadata_contexts: BidirectionalPair<AudioContexts>,
        ccids: BidirectionalPair<Vec<u8>>,
    ) -> Result<(), StateMachineError> {
        let group =
            self.groups.get_mut(group_id).ok_or(StateMachineError::UnknownGroup(group_id))?;
        let first = group
            .first_active_device(&self.devices)
            .ok_or(StateMachineError::NoActiveDevice(group_id))?;
        group.metadata_contexts = metadata_contexts;
        group.ccids = ccids;
        let cig_created = group.cig.state == CigState::Created;

        info!("Group {}: resume stream", group_id);
        self.set_target_state(group_id, AseState::Streaming);
        if cig_created {
            self.send_enable(group_id, first);
        } else if let Err(e) = self.create_cig(group_id) {
            error!("Group {}: cannot create CIG: {:?}", group_id, e);
            self.stop_stream_internal(group_id);
        }
        Ok(())
    }

    /// Update the metadata of the streaming endpoints whose metadata
    /// changed
    fn update_metadata(
        &mut self,
        group_id: GroupId,
        metadata_contexts: BidirectionalPair<AudioContexts>,
        ccids: BidirectionalPair<Vec<u8>>,
    ) {
        let Some(group) = self.groups.get_mut(group_id) else {
            return;
        };
        group.metadata_contexts = metadata_contexts;
        group.ccids = ccids;
        let group: &DeviceGroup = group;

        let mut operations = Vec::new();
        for address in group.members() {
            let Some(device) = self.devices.get_mut(address) else {
                continue;
            };
            let params: Vec<_> = device
                .active_ases_mut()
                .filter(|ase| matches!(ase.state, AseState::Enabling | AseState::Streaming))
                .filter_map(|ase| {
                    let metadata = metadata_for(group, ase.direction);
                    (metadata != ase.metadata).then(|| {
                        ase.metadata = metadata.clone();
                        MetadataParameters { ase_id: ase.id, metadata }
                    })
                })
                .collect();
            if !params.is_empty() {
                operations.push((*address, Operation::UpdateMetadata(params)));
            }
        }

        if operations.is_empty() {
            debug!("Group {}: metadata unchanged", group_id);
        }
        for (address, operation) in operations {
            self.send_operation(address, operation, false);
        }
    }

    // Group state

    fn set_target_state(&mut self, group_id: GroupId, target: AseState) {
        let Some(group) = self.groups.get_mut(group_id) else {
            return;
        };
        info!("Group {}: target state {:?} -> {:?}", group_id, group.target_state, target);
        group.target_state = target;
        group.data_path_pending = None;
        for address in group.members() {
            if let Some(device) = self.devices.get_mut(address) {
                device.pending_operation = None;
            }
        }
        self.arm_watchdog(group_id);
    }

    fn update_group_state(&mut self, group_id: GroupId, state: AseState) {
        let Some(group) = self.groups.get_mut(group_id) else {
            return;
        };
        if group.state != state {
            info!("Group {}: state {:?} -> {:?}", group_id, group.state, state);
            group.state = state;
        }
        if state == group.target_state {
            self.cancel_watchdog(group_id);
        }
    }

    fn report(&mut self, group_id: GroupId, status: GroupStreamStatus) {
        info!("Group {}: {:?}", group_id, status);
        if let Some(group) = self.groups.get_mut(group_id) {
            group.last_status = Some(status);
        }
        self.callbacks.status_report(group_id, status);
    }

    fn target_state(&self, group_id: GroupId) -> Option<AseState> {
        self.groups.get(group_id).map(|group| group.target_state)
    }

    // Control point

    fn send_operation(&mut self, address: RawAddress, operation: Operation, sequenced: bool) {
        let Some(device) = self.devices.get_mut(&address) else {
            return;
        };
        if sequenced {
            device.pending_operation = Some(operation.opcode());
        }
        debug!("{}: {:?} ASEs {:?}", address, operation.opcode(), operation.ase_ids());
        self.gatt.write_control_point(address, device.ctp_handle, operation.encode());
    }

    fn send_config_codec(&mut self, address: RawAddress) {
        let Some(device) = self.devices.get(&address) else {
            return;
        };
        let params: Vec<_> = device
            .active_ases()
            .map(|ase| ConfigCodecParameters {
                ase_id: ase.id,
                target_latency: ase.target_latency,
                target_phy: ase.target_phy,
                codec_id: ase.codec_id,
                codec_config: ase.codec_config.clone(),
            })
            .collect();
        if !params.is_empty() {
            self.send_operation(address, Operation::ConfigCodec(params), true);
        }
    }

    fn send_config_qos(&mut self, group_id: GroupId, address: RawAddress) {
        let (Some(group), Some(device)) =
            (self.groups.get(group_id), self.devices.get_mut(&address))
        else {
            return;
        };
        let cig_id = group.cig.cig_id;
        let params: Vec<_> = device
            .active_ases_mut()
            .map(|ase| {
                ase.qos = group.cig.ase_qos(ase);
                ConfigQosParameters {
                    ase_id: ase.id,
                    cig_id,
                    cis_id: ase.cis_id,
                    sdu_interval: ase.qos.sdu_interval,
                    framing: ase.qos.framing,
                    phy: ase.qos.phy,
                    max_sdu: ase.qos.max_sdu_size,
                    retransmission_number: ase.qos.retransmission_number,
                    max_transport_latency: ase.qos.max_transport_latency,
                    presentation_delay: ase.qos.presentation_delay,
                }
            })
            .collect();
        if !params.is_empty() {
            self.send_operation(address, Operation::ConfigQos(params), true);
        }
    }

    fn send_enable(&mut self, group_id: GroupId, address: RawAddress) {
        let (Some(group), Some(device)) =
            (self.groups.get(group_id), self.devices.get_mut(&address))
        else {
            return;
        };
        let params: Vec<_> = device
            .active_ases_mut()
            .map(|ase| {
                ase.metadata = metadata_for(group, ase.direction);
                MetadataParameters { ase_id: ase.id, metadata: ase.metadata.clone() }
            })
            .collect();
        if !params.is_empty() {
            self.send_operation(address, Operation::Enable(params), true);
        }
    }

    fn send_disable(&mut self, address: RawAddress) {
        let Some(device) = self.devices.get(&address) else {
            return;
        };
        let ase_ids: Vec<u8> = device
            .active_ases()
            .filter(|ase| matches!(ase.state, AseState::Enabling | AseState::Streaming))
            .map(|ase| ase.id)
            .collect();
        if !ase_ids.is_empty() {
            self.send_operation(address, Operation::Disable(ase_ids), true);
        }
    }

    fn complete_pending(&mut self, address: RawAddress, opcode: Opcode) -> bool {
        match self.devices.get_mut(&address) {
            Some(device) if device.pending_operation == Some(opcode) => {
                device.pending_operation = None;
                true
            }
            _ => false,
        }
    }

    fn group_has_pending(&self, group_id: GroupId) -> bool {
        self.groups.get(group_id).map_or(false, |group| {
            group.devices(&self.devices).any(|d| d.pending_operation.is_some())
        })
    }

    // Sequencing of the devices

    fn device_codec_configured(&mut self, group_id: GroupId, address: RawAddress) {
        let Some(group) = self.groups.get(group_id) else {
            return;
        };
        if group.state == AseState::Streaming {
            self.send_config_qos(group_id, address);
            return;
        }
        if let Some(next) = group.next_active_device(&self.devices, &address) {
            self.send_config_codec(next);
            return;
        }
        if !group.is_in_state(&self.devices, AseState::CodecConfigured) {
            return;
        }

        let target = group.target_state;
        self.update_group_state(group_id, AseState::CodecConfigured);
        match target {
            AseState::CodecConfigured => {
                self.report(group_id, GroupStreamStatus::ConfiguredByUser);
            }
            AseState::Streaming => {
                let cig_state = self.groups.get(group_id).map(|group| group.cig.state);
                if cig_state == Some(CigState::Removing) {
                    debug!("Group {}: waiting for the removal of the previous CIG", group_id);
                    return;
                }
                if let Err(e) = self.create_cig(group_id) {
                    error!("Group {}: cannot create CIG: {:?}", group_id, e);
                    self.stop_stream_internal(group_id);
                }
            }
            _ => {}
        }
    }

    fn device_qos_configured(&mut self, group_id: GroupId, address: RawAddress) {
        let Some(group) = self.groups.get(group_id) else {
            return;
        };
        if group.state == AseState::Streaming {
            self.send_enable(group_id, address);
            return;
        }
        if let Some(next) = group.next_active_device(&self.devices, &address) {
            self.send_config_qos(group_id, next);
            return;
        }
        if !group.is_in_state(&self.devices, AseState::QosConfigured) {
            return;
        }
        let first = group.first_active_device(&self.devices);
        self.update_group_state(group_id, AseState::QosConfigured);
        if let Some(first) = first {
            self.send_enable(group_id, first);
        }
    }

    fn device_enabled(&mut self, group_id: GroupId, address: RawAddress) {
        self.establish_device_cises(address);
        self.enable_next_device(group_id, address);
    }

    fn enable_next_device(&mut self, group_id: GroupId, address: RawAddress) {
        let Some(group) = self.groups.get(group_id) else {
            return;
        };
        if group.state == AseState::Streaming {
            return;
        }
        if let Some(next) = group.next_active_device(&self.devices, &address) {
            self.send_enable(group_id, next);
        }
    }

    fn disable_next_device(&mut self, group_id: GroupId) {
        let next = self.groups.get(group_id).and_then(|group| {
            group.find_device(&self.devices, |d| {
                d.has_active_ase_in(&[AseState::Enabling, AseState::Streaming])
            })
        });
        match next {
            Some(address) => self.send_disable(address),
            None => self.check_suspend_complete(group_id),
        }
    }

    fn release_next_device(&mut self, group_id: GroupId) {
        loop {
            let Some(address) =
                self.groups.get(group_id).and_then(|g| g.first_active_device(&self.devices))
            else {
                break;
            };
            let Some(device) = self.devices.get_mut(&address) else {
                break;
            };
            for ase in device.active_ases_mut().filter(|ase| ase.state == AseState::Idle) {
                ase.deactivate();
            }
            let ase_ids: Vec<u8> = device
                .active_ases()
                .filter(|ase| ase.state != AseState::Releasing)
                .map(|ase| ase.id)
                .collect();
            if !ase_ids.is_empty() {
                self.send_operation(address, Operation::Release(ase_ids), true);
                return;
            }
            if device.has_active_ases() {
                // Released by the device on its own, wait for the end of it
                device.pending_operation = Some(Opcode::Release);
                return;
            }
        }
        self.check_release_complete(group_id);
    }

    fn suspend_progress(&mut self, group_id: GroupId, address: RawAddress) {
        let Some(device) = self.devices.get(&address) else {
            return;
        };
        let disabled = !device.has_active_ase_in(&[
            AseState::Enabling,
            AseState::Streaming,
            AseState::Disabling,
        ]);
        if disabled {
            self.teardown_device_cises(address);
            self.complete_pending(address, Opcode::Disable);
        }
        if !self.group_has_pending(group_id) {
            self.disable_next_device(group_id);
        }
    }

    fn release_progress(&mut self, group_id: GroupId, address: RawAddress) {
        if self.devices.get(&address).map_or(false, |d| !d.has_active_ases()) {
            self.complete_pending(address, Opcode::Release);
        }
        if !self.group_has_pending(group_id) {
            self.release_next_device(group_id);
        }
    }

    fn check_suspend_complete(&mut self, group_id: GroupId) {
        let Some(group) = self.groups.get(group_id) else {
            return;
        };
        if group.target_state != AseState::QosConfigured
            || group.last_status != Some(GroupStreamStatus::Suspending)
            || !group.is_in_state(&self.devices, AseState::QosConfigured)
            || !group.have_all_cises_disconnected(&self.devices)
        {
            return;
        }
        self.update_group_state(group_id, AseState::QosConfigured);
        self.report(group_id, GroupStreamStatus::Suspended);
    }

    fn check_release_complete(&mut self, group_id: GroupId) {
        let Some(group) = self.groups.get(group_id) else {
            return;
        };
        if group.target_state != AseState::Idle
            || group.last_status != Some(GroupStreamStatus::Releasing)
            || group.has_active_ases(&self.devices)
            || !group.have_all_cises_disconnected(&self.devices)
        {
            return;
        }
        self.cancel_watchdog(group_id);

        let Some(group) = self.groups.get_mut(group_id) else {
            return;
        };
        group.data_path_pending = None;
        if group.cig.state == CigState::Created {
            group.cig.state = CigState::Removing;
            self.iso.remove_cig(group.cig.cig_id, false);
        }
        group.cig.release_cis_ids();
        group.cig.recovery_attempted = false;
        group.stream_conf = Default::default();

        let cached = group.has_cached_configuration(&self.devices);
        let status = if group.pending_configuration {
            group.pending_configuration = false;
            GroupStreamStatus::ConfiguredByUser
        } else if cached {
            GroupStreamStatus::ConfiguredAutonomous
        } else {
            GroupStreamStatus::Idle
        };
        let state = if cached { AseState::CodecConfigured } else { AseState::Idle };
        group.state = state;
        group.target_state = state;
        self.report(group_id, status);
    }

    /// Drop everything of a group left without connected devices
    fn clear_group(&mut self, group_id: GroupId) {
        self.cancel_watchdog(group_id);
        let Some(group) = self.groups.get_mut(group_id) else {
            return;
        };
        info!("Group {}: cleared", group_id);
        group.state = AseState::Idle;
        group.target_state = AseState::Idle;
        group.pending_configuration = false;
        group.data_path_pending = None;
        if group.cig.state == CigState::Created {
            group.cig.state = CigState::Removing;
            self.iso.remove_cig(group.cig.cig_id, false);
        }
        group.cig.release_cis_ids();
        group.cig.recovery_attempted = false;
        let updated: Vec<Direction> = Direction::ALL
            .into_iter()
            .filter(|direction| !group.stream_conf.get(*direction).is_empty())
            .collect();
        group.stream_conf = Default::default();
        let members = group.members().to_vec();
        deactivate_members(&mut self.devices, &members);

        for direction in updated {
            self.callbacks.on_updated_cis_configuration(group_id, direction);
        }
        self.report(group_id, GroupStreamStatus::Idle);
    }

    // ASE notifications

    /// GATT notification of an ASE, or of the control point, of a device
    pub fn process_gatt_notification(&mut self, address: RawAddress, handle: u16, value: &[u8]) {
        let Some(device) = self.devices.get(&address) else {
            warn!("{}: notification from an unknown device", address);
            return;
        };
        if handle == device.ctp_handle {
            self.process_control_point_notification(address, value);
            return;
        }
        let Some(index) = device.ase_index_by_handle(handle) else {
            warn!("{}: notification on unknown handle 0x{:04x}", address, handle);
            return;
        };
        match AseStatus::decode(value) {
            Ok(status) => self.process_ase_status(address, index, status),
            Err(e) => {
                error!("{}: malformed ASE notification on 0x{:04x}: {}", address, handle, e);
                if let Some(group_id) = device.group_id {
                    self.stop_stream_internal(group_id);
                }
            }
        }
    }

    fn process_control_point_notification(&mut self, address: RawAddress, value: &[u8]) {
        let notification = match ControlPointNotification::decode(value) {
            Ok(notification) => notification,
            Err(e) => {
                error!("{}: malformed control point notification: {}", address, e);
                return;
            }
        };
        let mut failed = false;
        for response in &notification.responses {
            if response.response_code == ResponseCode::Success {
                continue;
            }
            error!(
                "{}: control point opcode 0x{:02x} failed on ASE 0x{:02x}: {:?}, reason 0x{:02x}",
                address,
                notification.opcode,
                response.ase_id,
                response.response_code,
                response.reason
            );
            failed = true;
        }
        if !failed {
            return;
        }
        if let Some(group_id) = self.devices.get(&address).and_then(|d| d.group_id) {
            self.stop_stream_internal(group_id);
        }
    }

    fn process_ase_status(&mut self, address: RawAddress, index: usize, status: AseStatus) {
        let Some(device) = self.devices.get_mut(&address) else {
            return;
        };
        let group_id = device.group_id;
        let ase = &mut device.ases[index];
        let state = status.state();

        if !ase.is_discovered() {
            info!(
                "{}: ASE 0x{:02x} ({}) discovered in {:?}",
                address, status.ase_id, ase.direction, state
            );
            ase.id = status.ase_id;
            ase.state = state;
            if let AseStateParameters::CodecConfigured(params) = &status.params {
                cache_codec_configuration(ase, params);
            }
            return;
        }
        if ase.id != status.ase_id {
            warn!(
                "{}: ASE 0x{:02x} notified on the handle of ASE 0x{:02x}",
                address, status.ase_id, ase.id
            );
            return;
        }

        let previous = ase.state;
        debug!(
            "{}: ASE 0x{:02x} ({}) {:?} -> {:?}",
            address, ase.id, ase.direction, previous, state
        );
        let Some(group_id) = group_id else {
            ase.state = state;
            return;
        };
        if !previous.can_transition_to(state, ase.direction) {
            error!(
                "{}: ASE 0x{:02x} ({}) invalid transition {:?} -> {:?}",
                address, ase.id, ase.direction, previous, state
            );
            self.stop_stream_internal(group_id);
            return;
        }

        match status.params {
            AseStateParameters::Idle => self.ase_state_idle(group_id, address, index),
            AseStateParameters::CodecConfigured(params) => {
                self.ase_state_codec_configured(group_id, address, index, previous, params)
            }
            AseStateParameters::QosConfigured(_) => {
                self.ase_state_qos_configured(group_id, address, index, previous)
            }
            AseStateParameters::Enabling(params) => {
                self.ase_state_enabling(group_id, address, index, params)
            }
            AseStateParameters::Streaming(params) => {
                self.ase_state_streaming(group_id, address, index, previous, params)
            }
            AseStateParameters::Disabling(params) => {
                self.ase_state_disabling(group_id, address, index, params)
            }
            AseStateParameters::Releasing => self.ase_state_releasing(group_id, address, index),
        }
    }

    fn ase_state_idle(&mut self, group_id: GroupId, address: RawAddress, index: usize) {
        let Some(device) = self.devices.get_mut(&address) else {
            return;
        };
        let ase = &mut device.ases[index];
        let was_active = ase.active;
        ase.reset();
        self.ase_released(group_id, address, was_active);
    }

    fn ase_released(&mut self, group_id: GroupId, address: RawAddress, was_active: bool) {
        match self.target_state(group_id) {
            Some(AseState::Idle) => self.release_progress(group_id, address),
            Some(_) if was_active => {
                warn!("Group {}: {} released an ASE on its own", group_id, address);
                let Some(group) = self.groups.get_mut(group_id) else {
                    return;
                };
                if group.has_active_ases(&self.devices) {
                    return;
                }
                group.target_state = AseState::Idle;
                self.report(group_id, GroupStreamStatus::Releasing);
                self.check_release_complete(group_id);
            }
            _ => {}
        }
    }

    fn ase_state_codec_configured(
        &mut self,
        group_id: GroupId,
        address: RawAddress,
        index: usize,
        previous: AseState,
        params: CodecConfiguredParameters,
    ) {
        let Some(device) = self.devices.get_mut(&address) else {
            return;
        };
        let ase = &mut device.ases[index];
        cache_codec_configuration(ase, &params);
        ase.state = AseState::CodecConfigured;
        let was_active = ase.active;

        if previous == AseState::Releasing {
            // The device keeps the configuration cached
            ase.deactivate();
            self.ase_released(group_id, address, was_active);
            return;
        }

        let device_configured = device.have_all_active_ases_same_state(AseState::CodecConfigured);
        let Some(group) = self.groups.get_mut(group_id) else {
            return;
        };
        let target = group.target_state;
        match target {
            AseState::Streaming | AseState::CodecConfigured if was_active => {
                if device_configured && self.complete_pending(address, Opcode::ConfigCodec) {
                    self.device_codec_configured(group_id, address);
                }
            }
            AseState::Idle
                if !was_active
                    && group.state == AseState::Idle
                    && !group.has_active_ases(&self.devices) =>
            {
                info!("Group {}: configured by {}", group_id, address);
                group.state = AseState::CodecConfigured;
                group.target_state = AseState::CodecConfigured;
                self.report(group_id, GroupStreamStatus::ConfiguredAutonomous);
            }
            _ => {}
        }
    }

    fn ase_state_qos_configured(
        &mut self,
        group_id: GroupId,
        address: RawAddress,
        index: usize,
        previous: AseState,
    ) {
        let Some(device) = self.devices.get_mut(&address) else {
            return;
        };
        let ase = &mut device.ases[index];
        ase.state = AseState::QosConfigured;
        let was_active = ase.active;
        let device_configured = device.have_all_active_ases_same_state(AseState::QosConfigured);

        match self.target_state(group_id) {
            Some(AseState::Streaming)
                if was_active
                    && matches!(previous, AseState::CodecConfigured | AseState::QosConfigured) =>
            {
                if device_configured && self.complete_pending(address, Opcode::ConfigQos) {
                    self.device_qos_configured(group_id, address);
                }
            }
            Some(AseState::QosConfigured) => self.suspend_progress(group_id, address),
            _ => {}
        }
    }

    fn ase_state_enabling(
        &mut self,
        group_id: GroupId,
        address: RawAddress,
        index: usize,
        params: EnabledParameters,
    ) {
        let Some(device) = self.devices.get_mut(&address) else {
            return;
        };
        let ase = &mut device.ases[index];
        ase.state = AseState::Enabling;
        ase.metadata = params.metadata;
        let device_enabled =
            !device.has_active_ase_in(&[AseState::CodecConfigured, AseState::QosConfigured]);

        match self.target_state(group_id) {
            Some(AseState::Streaming) => {
                if device_enabled && self.complete_pending(address, Opcode::Enable) {
                    self.device_enabled(group_id, address);
                }
            }
            Some(AseState::QosConfigured) => self.suspend_progress(group_id, address),
            _ => {}
        }
    }

    fn ase_state_streaming(
        &mut self,
        group_id: GroupId,
        address: RawAddress,
        index: usize,
        previous: AseState,
        params: EnabledParameters,
    ) {
        let Some(device) = self.devices.get_mut(&address) else {
            return;
        };
        let ase = &mut device.ases[index];
        ase.state = AseState::Streaming;
        ase.metadata = params.metadata;
        if previous == AseState::Streaming {
            return;
        }

        match self.target_state(group_id) {
            Some(AseState::Streaming) => self.check_group_streaming(group_id),
            Some(AseState::QosConfigured) => self.suspend_progress(group_id, address),
            _ => {}
        }
    }

    fn ase_state_disabling(
        &mut self,
        group_id: GroupId,
        address: RawAddress,
        index: usize,
        params: EnabledParameters,
    ) {
        let Some(device) = self.devices.get_mut(&address) else {
            return;
        };
        let ase = &mut device.ases[index];
        ase.state = AseState::Disabling;
        ase.metadata = params.metadata;
        let (ase_id, direction) = (ase.id, ase.direction);

        if self.target_state(group_id) == Some(AseState::Streaming) {
            warn!("Group {}: {} disabled ASE 0x{:02x} on its own", group_id, address, ase_id);
        }
        if direction == Direction::Source {
            self.send_operation(address, Operation::ReceiverStopReady(vec![ase_id]), false);
        }
    }

    fn ase_state_releasing(&mut self, group_id: GroupId, address: RawAddress, index: usize) {
        let Some(device) = self.devices.get_mut(&address) else {
            return;
        };
        device.ases[index].state = AseState::Releasing;
        if device.active_ases().all(|ase| ase.state == AseState::Releasing) {
            self.teardown_device_cises(address);
        }
        if self.target_state(group_id) != Some(AseState::Idle) {
            warn!("Group {}: {} is releasing on its own", group_id, address);
        }
    }

    // Isochronous channels

    fn create_cig(&mut self, group_id: GroupId) -> Result<(), CigCreateError> {
        let Some(group) = self.groups.get_mut(group_id) else {
            return Ok(());
        };
        if group.cig.state != CigState::None {
            return Err(CigCreateError::InvalidState(group.cig.state));
        }
        let members = group.members().to_vec();
        for address in members.iter() {
            let Some(device) = self.devices.get_mut(address) else {
                continue;
            };
            if device.has_active_ases() {
                group.cig.assign_cis_ids(device);
            }
        }

        let ases: Vec<&Ase> = members
            .iter()
            .filter_map(|a| self.devices.get(a))
            .flat_map(Device::active_ases)
            .collect();
        group.cig.update_qos(&ases).map_err(CigCreateError::PresentationDelay)?;
        let params = group.cig.parameters(&ases);
        group.cig.check_create(&params)?;

        info!(
            "Group {}: creating CIG {} with {} CISes",
            group_id,
            group.cig.cig_id,
            params.cis.len()
        );
        group.cig.state = CigState::Creating;
        self.iso.create_cig(group.cig.cig_id, params);
        Ok(())
    }

    /// Completion of a request made to the isochronous channels manager
    pub fn process_iso_event(&mut self, event: IsoEvent) {
        match event {
            IsoEvent::CigCreated { status, cig_id, conn_handles } => {
                self.on_cig_created(status, cig_id, conn_handles)
            }
            IsoEvent::CigRemoved { status, cig_id } => self.on_cig_removed(status, cig_id),
            IsoEvent::CisEstablished { status, conn_handle, .. } => {
                self.on_cis_established(status, conn_handle)
            }
            IsoEvent::CisDisconnected { conn_handle, reason } => {
                self.on_cis_disconnected(conn_handle, reason)
            }
            IsoEvent::DataPathSetup { status, conn_handle } => {
                self.on_data_path_setup(status, conn_handle)
            }
            IsoEvent::DataPathRemoved { status, conn_handle } => {
                self.on_data_path_removed(status, conn_handle)
            }
            IsoEvent::LinkQualityRead { status, conn_handle, report } => {
                on_link_quality_read(status, conn_handle, &report)
            }
        }
    }

    fn on_cig_created(&mut self, status: Status, cig_id: u8, conn_handles: Vec<u16>) {
        let Some(group_id) = self.groups.by_cig_id(cig_id) else {
            warn!("CIG {} created for no group", cig_id);
            return;
        };
        let Some(group) = self.groups.get_mut(group_id) else {
            return;
        };
        if group.cig.state != CigState::Creating {
            warn!(
                "Group {}: unexpected creation of CIG {} in {:?}",
                group_id, cig_id, group.cig.state
            );
            return;
        }

        if status == Status::CommandDisallowed && !group.cig.recovery_attempted {
            warn!("Group {}: CIG {} creation disallowed, removing it first", group_id, cig_id);
            group.cig.state = CigState::Recovering;
            group.cig.recovery_attempted = true;
            self.iso.remove_cig(cig_id, true);
            return;
        }
        if !status.is_success() {
            error!("Group {}: CIG {} creation failed: {:?}", group_id, cig_id, status);
            group.cig.state = CigState::None;
            self.stop_stream_internal(group_id);
            return;
        }

        group.cig.state = CigState::Created;
        group.cig.recovery_attempted = false;
        if group.target_state != AseState::Streaming || !group.has_active_ases(&self.devices) {
            debug!("Group {}: CIG {} no longer needed", group_id, cig_id);
            group.cig.state = CigState::Removing;
            self.iso.remove_cig(cig_id, false);
            return;
        }
        if !group.cig.assign_conn_handles(&conn_handles) {
            error!(
                "Group {}: {} CIS handles for {} CISes",
                group_id,
                conn_handles.len(),
                group.cig.cises.len()
            );
            group.cig.state = CigState::Removing;
            self.iso.remove_cig(cig_id, false);
            self.stop_stream_internal(group_id);
            return;
        }
        info!("Group {}: CIG {} created, handles {:03x?}", group_id, cig_id, conn_handles);

        for address in group.members() {
            let Some(device) = self.devices.get_mut(address) else {
                continue;
            };
            for ase in device.active_ases_mut().filter(|ase| ase.cis_conn_handle.is_none()) {
                if let Some(handle) = group.cig.conn_handle_of(ase.cis_id) {
                    ase.cis_conn_handle = Some(handle);
                    ase.data_path_state = DataPathState::CisAssigned;
                }
            }
        }

        if let Some(first) = group.first_active_device(&self.devices) {
            self.send_config_qos(group_id, first);
        }
    }

    fn on_cig_removed(&mut self, status: Status, cig_id: u8) {
        let Some(group_id) = self.groups.by_cig_id(cig_id) else {
            debug!("CIG {} removed", cig_id);
            return;
        };
        let Some(group) = self.groups.get_mut(group_id) else {
            return;
        };
        let previous = group.cig.state;
        match previous {
            CigState::Recovering => {
                group.cig.state = CigState::None;
                if !status.is_success() {
                    error!("Group {}: CIG {} recovery failed: {:?}", group_id, cig_id, status);
                    self.stop_stream_internal(group_id);
                    return;
                }
                if group.target_state != AseState::Streaming {
                    return;
                }
                info!("Group {}: CIG {} removed, creating it again", group_id, cig_id);
                if let Err(e) = self.create_cig(group_id) {
                    error!("Group {}: cannot create CIG: {:?}", group_id, e);
                    self.stop_stream_internal(group_id);
                }
            }
            CigState::Removing => {
                group.cig.state = CigState::None;
                if status.is_success() {
                    info!("Group {}: CIG {} removed", group_id, cig_id);
                } else {
                    error!("Group {}: CIG {} removal failed: {:?}", group_id, cig_id, status);
                }
                // A stream started during the removal waits for it
                if group.target_state != AseState::Streaming
                    || !group.is_in_state(&self.devices, AseState::CodecConfigured)
                {
                    return;
                }
                info!("Group {}: creating CIG {} for the pending stream", group_id, cig_id);
                if let Err(e) = self.create_cig(group_id) {
                    error!("Group {}: cannot create CIG: {:?}", group_id, e);
                    self.stop_stream_internal(group_id);
                }
            }
            _ => {
                warn!("Group {}: unexpected removal of CIG {} in {:?}", group_id, cig_id, previous)
            }
        }
    }

    fn establish_device_cises(&mut self, address: RawAddress) {
        let Some(device) = self.devices.get_mut(&address) else {
            return;
        };
        let Some(acl_conn_handle) = device.acl_handle else {
            warn!("{}: no ACL to establish the CISes on", address);
            return;
        };
        let mut handles: Vec<CisHandlePair> = Vec::new();
        for ase in device.active_ases_mut() {
            let Some(cis_conn_handle) = ase.cis_conn_handle else {
                continue;
            };
            if ase.data_path_state != DataPathState::CisAssigned {
                continue;
            }
            ase.data_path_state = DataPathState::CisPending;
            if handles.iter().all(|pair| pair.cis_conn_handle != cis_conn_handle) {
                handles.push(CisHandlePair { cis_conn_handle, acl_conn_handle });
            }
        }
        if handles.is_empty() {
            return;
        }
        debug!("{}: establishing {} CISes", address, handles.len());
        self.iso.establish_cis(handles);
    }

    /// Remove the data paths, or disconnect the CISes, of a device
    fn teardown_device_cises(&mut self, address: RawAddress) {
        let Some(device) = self.devices.get_mut(&address) else {
            return;
        };
        for conn_handle in device.cis_conn_handles() {
            let on_cis = |ase: &&mut Ase| ase.cis_conn_handle == Some(conn_handle);
            let mut directions = DataPathDirections::empty();
            let mut established = false;
            for ase in device.ases.iter_mut().filter(on_cis) {
                match ase.data_path_state {
                    DataPathState::DataPathEstablished => {
                        directions |= match ase.direction {
                            Direction::Sink => DataPathDirections::INPUT,
                            Direction::Source => DataPathDirections::OUTPUT,
                        };
                    }
                    DataPathState::CisEstablished => established = true,
                    _ => continue,
                }
                ase.data_path_state = DataPathState::CisDisconnecting;
            }

            if !directions.is_empty() {
                debug!(
                    "{}: removing data paths {:?} of 0x{:03x}",
                    address, directions, conn_handle
                );
                self.iso.remove_iso_data_path(conn_handle, directions);
            } else if established {
                debug!("{}: disconnecting CIS 0x{:03x}", address, conn_handle);
                self.iso.disconnect_cis(conn_handle, Status::RemoteUserTerminatedConnection);
            }
        }
    }

    fn on_cis_established(&mut self, status: Status, conn_handle: u16) {
        let Some(group_id) = self.groups.by_cis_conn_handle(&self.devices, conn_handle) else {
            warn!("CIS 0x{:03x} established for no group", conn_handle);
            return;
        };
        let Some(group) = self.groups.get(group_id) else {
            return;
        };
        let members = group.members().to_vec();
        let streaming = group.target_state == AseState::Streaming;

        if !status.is_success() {
            error!(
                "Group {}: CIS 0x{:03x} establishment failed: {:?}",
                group_id, conn_handle, status
            );
            for address in members.iter() {
                let Some(device) = self.devices.get_mut(address) else {
                    continue;
                };
                for ase in device.ases.iter_mut().filter(|ase| {
                    ase.cis_conn_handle == Some(conn_handle)
                        && ase.data_path_state == DataPathState::CisPending
                }) {
                    ase.data_path_state = DataPathState::CisAssigned;
                }
            }
            self.stop_stream_internal(group_id);
            return;
        }

        let mut owners = Vec::new();
        let mut start_ready = Vec::new();
        for address in members.iter() {
            let Some(device) = self.devices.get_mut(address) else {
                continue;
            };
            let mut used = false;
            for ase in device.ases.iter_mut().filter(|ase| {
                ase.cis_conn_handle == Some(conn_handle)
                    && ase.data_path_state == DataPathState::CisPending
            }) {
                ase.data_path_state = DataPathState::CisEstablished;
                used |= ase.active;
                if ase.active
                    && ase.direction == Direction::Source
                    && ase.state == AseState::Enabling
                {
                    start_ready.push(ase.id);
                }
            }
            if used || device.ases.iter().any(|ase| ase.cis_conn_handle == Some(conn_handle)) {
                owners.push((device.address, used, std::mem::take(&mut start_ready)));
            }
        }
        info!("Group {}: CIS 0x{:03x} established", group_id, conn_handle);

        if !streaming || owners.iter().all(|(_, used, _)| !used) {
            info!("Group {}: CIS 0x{:03x} no longer needed", group_id, conn_handle);
            for (address, _, _) in owners {
                self.teardown_device_cises(address);
            }
            return;
        }

        self.start_link_quality_timer(conn_handle);
        for (address, _, ase_ids) in owners {
            if !ase_ids.is_empty() {
                self.send_operation(address, Operation::ReceiverStartReady(ase_ids), false);
            }
        }
        self.check_group_streaming(group_id);
    }

    fn check_group_streaming(&mut self, group_id: GroupId) {
        let Some(group) = self.groups.get(group_id) else {
            return;
        };
        if group.target_state != AseState::Streaming
            || !group.is_in_state(&self.devices, AseState::Streaming)
        {
            return;
        }
        self.update_group_state(group_id, AseState::Streaming);
        self.start_next_data_path(group_id);
    }

    /// Set up the data paths one at a time, once every CIS of the group is
    /// established
    fn start_next_data_path(&mut self, group_id: GroupId) {
        let Some(group) = self.groups.get_mut(group_id) else {
            return;
        };
        if group.target_state != AseState::Streaming || group.data_path_pending.is_some() {
            return;
        }

        let mut next = None;
        let mut all_established = true;
        for ase in group.active_ases(&self.devices) {
            match ase.data_path_state {
                DataPathState::Idle | DataPathState::CisAssigned | DataPathState::CisPending => {
                    debug!("Group {}: waiting for the CISes", group_id);
                    return;
                }
                DataPathState::CisEstablished
                    if next.is_none() && ase.state == AseState::Streaming =>
                {
                    next = ase.cis_conn_handle.map(|handle| (handle, ase.direction));
                }
                _ => {}
            }
            all_established &= ase.data_path_state == DataPathState::DataPathEstablished;
        }

        if let Some((conn_handle, direction)) = next {
            group.data_path_pending = Some(conn_handle);
            let params = DataPathParameters {
                data_path_direction: match direction {
                    Direction::Sink => DataPathDirection::Input,
                    Direction::Source => DataPathDirection::Output,
                },
                data_path_id: DATA_PATH_ID_HCI,
                codec_id: CodecId::TRANSPARENT,
                controller_delay: 0,
                codec_configuration: Vec::new(),
            };
            debug!(
                "Group {}: setting up the {} data path of 0x{:03x}",
                group_id, direction, conn_handle
            );
            self.iso.setup_iso_data_path(conn_handle, params);
        } else if all_established {
            self.report(group_id, GroupStreamStatus::Streaming);
        }
    }

    fn on_data_path_setup(&mut self, status: Status, conn_handle: u16) {
        let Some(group_id) = self.groups.by_cis_conn_handle(&self.devices, conn_handle) else {
            warn!("Data path of CIS 0x{:03x} set up for no group", conn_handle);
            return;
        };
        let Some(group) = self.groups.get_mut(group_id) else {
            return;
        };
        if group.data_path_pending != Some(conn_handle) {
            warn!("Group {}: unexpected data path of 0x{:03x}", group_id, conn_handle);
            return;
        }
        group.data_path_pending = None;
        if !status.is_success() {
            error!("Group {}: data path of 0x{:03x} failed: {:?}", group_id, conn_handle, status);
            self.stop_stream_internal(group_id);
            return;
        }

        let mut established = None;
        'members: for address in group.members() {
            let Some(device) = self.devices.get_mut(address) else {
                continue;
            };
            for ase in device.active_ases_mut() {
                if ase.cis_conn_handle == Some(conn_handle)
                    && ase.data_path_state == DataPathState::CisEstablished
                    && ase.state == AseState::Streaming
                {
                    ase.data_path_state = DataPathState::DataPathEstablished;
                    established = Some((*address, ase.direction, ase.codec_config.clone()));
                    break 'members;
                }
            }
        }
        let Some((address, direction, codec_config)) = established else {
            warn!("Group {}: no ASE waits for the data path of 0x{:03x}", group_id, conn_handle);
            return;
        };

        if let Err(e) =
            group.stream_conf.get_mut(direction).add_stream(address, conn_handle, &codec_config)
        {
            panic!("Group {}: inconsistent {} stream configuration: {}", group_id, direction, e);
        }
        info!(
            "Group {}: {} data path of 0x{:03x} ({}) established",
            group_id, direction, conn_handle, address
        );
        self.callbacks.on_updated_cis_configuration(group_id, direction);
        self.start_next_data_path(group_id);
    }

    fn on_data_path_removed(&mut self, status: Status, conn_handle: u16) {
        if !status.is_success() {
            warn!("Data path removal of 0x{:03x} failed: {:?}", conn_handle, status);
        }
        let disconnecting = self.devices.iter().any(|d| {
            d.ases.iter().any(|ase| {
                ase.cis_conn_handle == Some(conn_handle)
                    && ase.data_path_state == DataPathState::CisDisconnecting
            })
        });
        if disconnecting {
            debug!("Disconnecting CIS 0x{:03x}", conn_handle);
            self.iso.disconnect_cis(conn_handle, Status::RemoteUserTerminatedConnection);
        }
    }

    fn on_cis_disconnected(&mut self, conn_handle: u16, reason: Status) {
        self.stop_link_quality_timer(conn_handle);
        let Some(group_id) = self.groups.by_cis_conn_handle(&self.devices, conn_handle) else {
            debug!("CIS 0x{:03x} disconnected, reason: {:?}", conn_handle, reason);
            return;
        };
        let Some(group) = self.groups.get_mut(group_id) else {
            return;
        };
        info!("Group {}: CIS 0x{:03x} disconnected, reason: {:?}", group_id, conn_handle, reason);
        if group.data_path_pending == Some(conn_handle) {
            group.data_path_pending = None;
        }
        let updated: Vec<Direction> = Direction::ALL
            .into_iter()
            .filter(|direction| group.stream_conf.get_mut(*direction).remove_stream(conn_handle))
            .collect();

        let local = reason == Status::ConnectionTerminatedByLocalHost;
        for address in group.members() {
            let Some(device) = self.devices.get_mut(address) else {
                continue;
            };
            let on_cis = |ase: &&mut Ase| ase.cis_conn_handle == Some(conn_handle);
            for ase in device.ases.iter_mut().filter(on_cis) {
                if !ase.active {
                    ase.release_cis();
                    continue;
                }
                ase.data_path_state = DataPathState::CisAssigned;
                if !local
                    && ase.direction == Direction::Sink
                    && matches!(ase.state, AseState::Enabling | AseState::Streaming)
                {
                    warn!("{}: sink ASE 0x{:02x} lost its CIS", address, ase.id);
                    ase.state = AseState::QosConfigured;
                }
            }
        }

        let target = group.target_state;
        for direction in updated {
            self.callbacks.on_updated_cis_configuration(group_id, direction);
        }
        match target {
            AseState::Idle => self.check_release_complete(group_id),
            AseState::QosConfigured => self.check_suspend_complete(group_id),
            AseState::Streaming if !local => {
                warn!("Group {}: CIS 0x{:03x} lost while streaming", group_id, conn_handle)
            }
            _ => {}
        }
    }

    // ACL

    /// The ACL of a device went down, its endpoints and CISes are gone
    pub fn process_acl_disconnected(&mut self, address: RawAddress) {
        let Some(device) = self.devices.get_mut(&address) else {
            warn!("{}: disconnection of an unknown device", address);
            return;
        };
        info!("{}: disconnected", address);
        device.connection_state = ConnectionState::Disconnected;
        device.acl_handle = None;
        device.encrypted = false;
        let lost = device.pending_operation.take();
        let conn_handles = device.cis_conn_handles();
        for ase in device.ases.iter_mut() {
            ase.release_cis();
            ase.reset();
        }
        let group_id = device.group_id;
        for conn_handle in &conn_handles {
            self.stop_link_quality_timer(*conn_handle);
        }
        let Some(group_id) = group_id else {
            return;
        };

        let Some(group) = self.groups.get_mut(group_id) else {
            return;
        };
        group.cig.unassign_device(&address);
        if group.data_path_pending.map_or(false, |handle| conn_handles.contains(&handle)) {
            group.data_path_pending = None;
        }
        let updated: Vec<Direction> = Direction::ALL
            .into_iter()
            .filter(|direction| group.stream_conf.get_mut(*direction).remove_device(&address))
            .collect();
        for direction in updated {
            self.callbacks.on_updated_cis_configuration(group_id, direction);
        }

        let Some(group) = self.groups.get(group_id) else {
            return;
        };
        let (state, target) = (group.state, group.target_state);
        if state == AseState::Idle && target == AseState::Idle {
            return;
        }
        let streams_gone = group.num_of_connected(&self.devices) == 0
            || (!group.has_active_ases(&self.devices)
                && matches!(target, AseState::Streaming | AseState::QosConfigured));
        if streams_gone && group.have_all_cises_disconnected(&self.devices) {
            self.clear_group(group_id);
            return;
        }

        match target {
            AseState::Idle => {
                if !self.group_has_pending(group_id) {
                    self.release_next_device(group_id);
                }
            }
            AseState::QosConfigured => {
                if !self.group_has_pending(group_id) {
                    self.disable_next_device(group_id);
                }
            }
            AseState::Streaming | AseState::CodecConfigured => {
                match lost {
                    Some(Opcode::ConfigCodec) => self.device_codec_configured(group_id, address),
                    Some(Opcode::ConfigQos) => self.device_qos_configured(group_id, address),
                    Some(Opcode::Enable) => self.enable_next_device(group_id, address),
                    _ => {}
                }
                if target == AseState::Streaming {
                    if state == AseState::Streaming {
                        self.report(group_id, GroupStreamStatus::Streaming);
                    } else {
                        self.check_group_streaming(group_id);
                    }
                }
            }
            _ => {}
        }
    }

    // Timers

    fn arm_watchdog(&mut self, group_id: GroupId) {
        self.cancel_watchdog(group_id);
        self.next_watchdog_token += 1;
        let token = self.next_watchdog_token;
        let timeout = self.config.transition_timeout;
        let tx = self.timer_tx.clone();
        let handle = tokio::spawn(async move {
            time::sleep(timeout).await;
            let _ = tx.send(TimerEvent::StateTransitionTimeout { group_id, token });
        });
        self.watchdogs.insert(group_id, (token, handle));
    }

    fn cancel_watchdog(&mut self, group_id: GroupId) {
        if let Some((_, handle)) = self.watchdogs.remove(&group_id) {
            handle.abort();
        }
    }

    fn start_link_quality_timer(&mut self, conn_handle: u16) {
        let Some(interval) = self.config.link_quality_check_interval else {
            return;
        };
        self.stop_link_quality_timer(conn_handle);
        let tx = self.timer_tx.clone();
        let handle = tokio::spawn(async move {
            loop {
                time::sleep(interval).await;
                if tx.send(TimerEvent::LinkQualityCheck { conn_handle }).is_err() {
                    break;
                }
            }
        });
        self.link_quality_timers.insert(conn_handle, handle);
    }

    fn stop_link_quality_timer(&mut self, conn_handle: u16) {
        if let Some(handle) = self.link_quality_timers.remove(&conn_handle) {
            handle.abort();
        }
    }

    /// Expiry of a timer armed by the state machine
    pub fn on_timer_event(&mut self, event: TimerEvent) {
        match event {
            TimerEvent::StateTransitionTimeout { group_id, token } => {
                match self.watchdogs.get(&group_id) {
                    Some((armed, _)) if *armed == token => {
                        self.watchdogs.remove(&group_id);
                    }
                    _ => {
                        debug!("Group {}: stale watchdog expiry", group_id);
                        return;
                    }
                }
                if let Some(group) = self.groups.get(group_id) {
                    error!(
                        "Group {}: state transition timeout, state: {:?}, target: {:?}\n{}",
                        group_id,
                        group.state,
                        group.target_state,
                        group.dump(&self.devices)
                    );
                }
                self.callbacks.on_state_transition_timeout(group_id);
            }
            TimerEvent::LinkQualityCheck { conn_handle } => {
                if self.link_quality_timers.contains_key(&conn_handle) {
                    self.iso.read_iso_link_quality(conn_handle);
                }
            }
        }
    }
}

impl Drop for GroupStateMachine {
    fn drop(&mut self) {
        for (_, (_, handle)) in self.watchdogs.drain() {
            handle.abort();
        }
        for (_, handle) in self.link_quality_timers.drain() {
            handle.abort();
        }
    }
}

fn on_link_quality_read(status: Status, conn_handle: u16, report: &LinkQualityReport) {
    if !status.is_success() {
        warn!("Link quality of 0x{:03x} unavailable: {:?}", conn_handle, status);
        return;
    }
    info!(
        "Link quality of 0x{:03x}: tx unacked {}, tx flushed {}, tx last subevent {}, \
         retransmitted {}, crc errors {}, rx unreceived {}, duplicates {}",
        conn_handle,
        report.tx_unacked_packets,
        report.tx_flushed_packets,
        report.tx_last_subevent_packets,
        report.retransmitted_packets,
        report.crc_error_packets,
        report.rx_unreceived_packets,
        report.duplicate_packets
    );
}

fn cache_codec_configuration(ase: &mut Ase, params: &CodecConfiguredParameters) {
    ase.qos_preferences = params.into();
    ase.codec_id = params.codec_id;
    ase.codec_config = params.codec_config.clone();
}

/// Metadata of the Enable and Update Metadata operations of the group
fn metadata_for(group: &DeviceGroup, direction: Direction) -> Vec<u8> {
    let contexts = match *group.metadata_contexts.get(direction) {
        contexts if contexts.is_empty() => group.configuration_context,
        contexts => contexts,
    };
    Metadata::new(contexts, group.ccids.get(direction).clone()).encode()
}

fn deactivate_members(devices: &mut LeAudioDevices, members: &[RawAddress]) {
    for address in members.iter() {
        let Some(device) = devices.get_mut(address) else {
            continue;
        };
        device.deactivate_all_ases();
    }
}

/// Activate endpoints of the connected members for each set configuration,
/// filling the members in order. Returns the number of endpoints activated.
fn activate_ases(
    devices: &mut LeAudioDevices,
    members: &[RawAddress],
    config: &AudioSetConfiguration,
    context: AudioContexts,
) -> usize {
    let mut activated = 0;
    for conf in &config.confs {
        let mut device_cnt = 0;
        for address in members.iter() {
            if device_cnt == conf.device_cnt {
                break;
            }
            let Some(device) = devices.get_mut(address) else {
                continue;
            };
            if !device.is_connected() || device.free_ase_count(conf.direction) < conf.ase_cnt.into()
            {
                continue;
            }
            activated += activate_device_ases(device, conf, context);
            device_cnt += 1;
        }
    }
    activated
}

fn activate_device_ases(
    device: &mut Device,
    conf: &SetConfiguration,
    context: AudioContexts,
) -> usize {
    let locations = *device.audio_locations.get(conf.direction);
    let mut used = device
        .active_ases()
        .filter(|ase| ase.direction == conf.direction)
        .fold(0, |acc, ase| acc | ase.codec_config.audio_channel_allocation.unwrap_or(0));

    let mut activated = 0;
    for ase in device
        .ases
        .iter_mut()
        .filter(|ase| !ase.active && ase.is_discovered() && ase.direction == conf.direction)
        .take(conf.ase_cnt.into())
    {
        ase.active = true;
        ase.target_latency = conf.target_latency;
        ase.target_phy = conf.target_phy;
        ase.codec_id = conf.codec.id;
        ase.codec_config = conf.codec.params.clone();
        if let Some(allocation) =
            allocate_audio_locations(locations, used, conf.codec.channel_count_per_ase)
        {
            ase.codec_config.audio_channel_allocation = Some(allocation);
            used |= allocation;
        }
        ase.configured_for_context = context;
        ase.qos.retransmission_number = conf.qos.retransmission_number;
        ase.qos.max_transport_latency = conf.qos.max_transport_latency;
        activated += 1;
    }
    activated
}
