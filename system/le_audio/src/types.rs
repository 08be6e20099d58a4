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

//! Shared data-types of the LE Audio unicast client.

use bitflags::bitflags;
use num_derive::{FromPrimitive, ToPrimitive};
use std::fmt;

/// Identifier of a coordinated set of devices streaming together
pub type GroupId = i32;

/// Marker for an ASE not yet discovered on the remote
pub const ASE_ID_INVALID: u8 = 0x00;

/// Lowest Max_Transport_Latency accepted by LE Set CIG Parameters (ms)
pub const MAX_TRANSPORT_LATENCY_MIN: u16 = 0x0005;
/// Highest Max_Transport_Latency accepted by LE Set CIG Parameters (ms)
pub const MAX_TRANSPORT_LATENCY_MAX: u16 = 0x0fa0;

/// PHY bits, as used in Set CIG Parameters and the ASCS QoS preferences
pub const PHY_LE_1M: u8 = 0x01;
#[allow(missing_docs)]
pub const PHY_LE_2M: u8 = 0x02;
#[allow(missing_docs)]
pub const PHY_LE_CODED: u8 = 0x04;

/// Bluetooth device address
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RawAddress {
    /// Most significant octet first
    pub address: [u8; 6],
}

impl RawAddress {
    /// Address from its six octets, most significant first
    pub const fn new(address: [u8; 6]) -> Self {
        Self { address }
    }
}

impl fmt::Display for RawAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let a = &self.address;
        write!(f, "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}", a[0], a[1], a[2], a[3], a[4], a[5])
    }
}

impl fmt::Debug for RawAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Direction of an Audio Stream Endpoint, seen from the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Audio flows from us to the remote
    Sink,
    /// Audio flows from the remote to us
    Source,
}

impl Direction {
    /// Both directions, sink first
    pub const ALL: [Direction; 2] = [Direction::Sink, Direction::Source];

    /// The other direction
    pub fn opposite(self) -> Self {
        match self {
            Direction::Sink => Direction::Source,
            Direction::Source => Direction::Sink,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Sink => f.write_str("sink"),
            Direction::Source => f.write_str("source"),
        }
    }
}

/// A value held for each of the two directions
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BidirectionalPair<T> {
    #[allow(missing_docs)]
    pub sink: T,
    #[allow(missing_docs)]
    pub source: T,
}

impl<T> BidirectionalPair<T> {
    /// Pair from both values
    pub fn new(sink: T, source: T) -> Self {
        Self { sink, source }
    }

    /// Value for `direction`
    pub fn get(&self, direction: Direction) -> &T {
        match direction {
            Direction::Sink => &self.sink,
            Direction::Source => &self.source,
        }
    }

    /// Mutable value for `direction`
    pub fn get_mut(&mut self, direction: Direction) -> &mut T {
        match direction {
            Direction::Sink => &mut self.sink,
            Direction::Source => &mut self.source,
        }
    }
}

/// ASE state, as defined in ASCS - 3.1 (values are the wire encoding)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u8)]
#[allow(missing_docs)]
pub enum AseState {
    #[default]
    Idle = 0x00,
    CodecConfigured = 0x01,
    QosConfigured = 0x02,
    Enabling = 0x03,
    Streaming = 0x04,
    Disabling = 0x05,
    Releasing = 0x06,
}

impl AseState {
    /// Whether the remote may move an ASE of `direction` from `self` to `next`
    pub fn can_transition_to(self, next: AseState, direction: Direction) -> bool {
        use AseState::*;
        match (self, next) {
            (Idle, Idle | CodecConfigured) => true,
            (CodecConfigured, CodecConfigured | QosConfigured | Releasing) => true,
            (QosConfigured, CodecConfigured | QosConfigured | Enabling | Releasing) => true,
            (Enabling, Enabling | Streaming | Releasing) => true,
            (Streaming, Streaming | Releasing) => true,
            // A source goes through Disabling, a sink falls back to QoS Configured directly
            (Enabling | Streaming, Disabling) => direction == Direction::Source,
            (Enabling | Streaming, QosConfigured) => direction == Direction::Sink,
            (Disabling, QosConfigured | Releasing) => true,
            (Releasing, Idle | CodecConfigured) => true,
            _ => false,
        }
    }
}

/// Progress of the isochronous channel bound to an ASE. It evolves
/// independently of the ASE protocol state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum DataPathState {
    #[default]
    Idle,
    CisAssigned,
    CisPending,
    CisEstablished,
    DataPathEstablished,
    CisDisconnecting,
}

/// Lifecycle of the Connected Isochronous Group of a device group
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum CigState {
    #[default]
    None,
    Creating,
    Created,
    Removing,
    Recovering,
}

/// Directions carried by a Connected Isochronous Stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum CisType {
    Bidirectional,
    UnidirectionalSink,
    UnidirectionalSource,
}

impl CisType {
    /// Whether the CIS carries audio in `direction`
    pub fn carries(self, direction: Direction) -> bool {
        match self {
            CisType::Bidirectional => true,
            CisType::UnidirectionalSink => direction == Direction::Sink,
            CisType::UnidirectionalSource => direction == Direction::Source,
        }
    }
}

/// Status reported to the upper layer for a group
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum GroupStreamStatus {
    Idle,
    Streaming,
    Releasing,
    Suspending,
    Suspended,
    ConfiguredAutonomous,
    ConfiguredByUser,
}

/// Target latency requested in Config Codec, ASCS - 5.1
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u8)]
#[allow(missing_docs)]
pub enum TargetLatency {
    Lower = 0x01,
    #[default]
    Balanced = 0x02,
    Higher = 0x03,
}

/// Target PHY requested in Config Codec, ASCS - 5.1
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u8)]
#[allow(missing_docs)]
pub enum TargetPhy {
    Le1M = 0x01,
    #[default]
    Le2M = 0x02,
    LeCoded = 0x03,
}

bitflags! {
    /// Audio context types, Assigned Numbers - 6.12.3
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
    pub struct AudioContexts: u16 {
        const UNSPECIFIED = 0x0001;
        const CONVERSATIONAL = 0x0002;
        const MEDIA = 0x0004;
        const GAME = 0x0008;
        const INSTRUCTIONAL = 0x0010;
        const VOICE_ASSISTANTS = 0x0020;
        const LIVE = 0x0040;
        const SOUND_EFFECTS = 0x0080;
        const NOTIFICATIONS = 0x0100;
        const RINGTONE = 0x0200;
        const ALERTS = 0x0400;
        const EMERGENCY_ALARM = 0x0800;
    }
}
