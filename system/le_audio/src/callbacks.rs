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

//! Interfaces to the upper layer and to the GATT client

use crate::types::{Direction, GroupId, GroupStreamStatus, RawAddress};

/// Upper layer, informed of the progress of the groups
pub trait StateMachineCallbacks: Send + Sync {
    /// The group completed a transition, or started releasing / suspending
    fn status_report(&self, group_id: GroupId, status: GroupStreamStatus);

    /// The group did not reach its target state in time. The state machine
    /// does not act on its own, it's up to the upper layer to stop or retry.
    fn on_state_transition_timeout(&self, group_id: GroupId);

    /// The streams of `direction` have been updated
    fn on_updated_cis_configuration(&self, group_id: GroupId, direction: Direction);
}

/// GATT client of the ASCS of the remote devices
pub trait AscsClient: Send + Sync {
    /// Write, without response, the ASE Control Point of a device
    fn write_control_point(&self, address: RawAddress, handle: u16, value: Vec<u8>);
}
