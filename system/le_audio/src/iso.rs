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

//! Interface to the isochronous channels manager of the controller

use crate::codec::CodecId;
use crate::status::Status;
use bitflags::bitflags;

/// Parameters of a CIS, as given to LE Set CIG Parameters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct CisConfiguration {
    pub cis_id: u8,
    pub max_sdu_c_to_p: u16,
    pub max_sdu_p_to_c: u16,
    pub phy_c_to_p: u8,
    pub phy_p_to_c: u8,
    pub rtn_c_to_p: u8,
    pub rtn_p_to_c: u8,
}

/// Parameters of a CIG, as given to LE Set CIG Parameters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct CigParameters {
    pub sdu_interval_c_to_p: u32,
    pub sdu_interval_p_to_c: u32,
    pub worst_case_sca: u8,
    pub packing: u8,
    pub framing: u8,
    pub max_transport_latency_c_to_p: u16,
    pub max_transport_latency_p_to_c: u16,
    pub cis: Vec<CisConfiguration>,
}

/// Pair of handles given to LE Create CIS
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct CisHandlePair {
    pub cis_conn_handle: u16,
    pub acl_conn_handle: u16,
}

/// Direction of an isochronous data path, Part E - 7.8.109
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum DataPathDirection {
    /// Host to Controller
    Input = 0x00,
    /// Controller to Host
    Output = 0x01,
}

bitflags! {
    /// Directions of the data paths to remove, Part E - 7.8.110
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct DataPathDirections: u8 {
        const INPUT = 0x01;
        const OUTPUT = 0x02;
    }
}

/// Data path over HCI
pub const DATA_PATH_ID_HCI: u8 = 0x00;

/// Parameters of LE Setup ISO Data Path
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct DataPathParameters {
    pub data_path_direction: DataPathDirection,
    pub data_path_id: u8,
    pub codec_id: CodecId,
    pub controller_delay: u32,
    pub codec_configuration: Vec<u8>,
}

/// Parameters of a CIS reported by LE CIS Established
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct CisEstablishedParameters {
    pub cig_sync_delay: u32,
    pub cis_sync_delay: u32,
    pub transport_latency_c_to_p: u32,
    pub transport_latency_p_to_c: u32,
    pub phy_c_to_p: u8,
    pub phy_p_to_c: u8,
    pub nse: u8,
    pub bn_c_to_p: u8,
    pub bn_p_to_c: u8,
    pub ft_c_to_p: u8,
    pub ft_p_to_c: u8,
    pub max_pdu_c_to_p: u16,
    pub max_pdu_p_to_c: u16,
    pub iso_interval: u16,
}

/// Counters returned by LE Read ISO Link Quality
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct LinkQualityReport {
    pub tx_unacked_packets: u32,
    pub tx_flushed_packets: u32,
    pub tx_last_subevent_packets: u32,
    pub retransmitted_packets: u32,
    pub crc_error_packets: u32,
    pub rx_unreceived_packets: u32,
    pub duplicate_packets: u32,
}

/// Completion of a request made to the `IsoManager`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IsoEvent {
    /// LE Set CIG Parameters complete, with one handle per CIS
    CigCreated { status: Status, cig_id: u8, conn_handles: Vec<u16> },
    /// LE Remove CIG complete
    CigRemoved { status: Status, cig_id: u8 },
    /// LE CIS Established
    CisEstablished { status: Status, conn_handle: u16, params: CisEstablishedParameters },
    /// Disconnection Complete of a CIS
    CisDisconnected { conn_handle: u16, reason: Status },
    /// LE Setup ISO Data Path complete
    DataPathSetup { status: Status, conn_handle: u16 },
    /// LE Remove ISO Data Path complete
    DataPathRemoved { status: Status, conn_handle: u16 },
    /// LE Read ISO Link Quality complete
    LinkQualityRead { status: Status, conn_handle: u16, report: LinkQualityReport },
}

/// Isochronous channels manager. Requests complete asynchronously, with an
/// `IsoEvent` given back to the state machine.
pub trait IsoManager: Send + Sync {
    /// Create the CIG `cig_id` with its CISes
    fn create_cig(&self, cig_id: u8, params: CigParameters);
    /// A forced removal disconnects the CISes still established
    fn remove_cig(&self, cig_id: u8, force: bool);
    /// Establish the CISes, each on the ACL given with it
    fn establish_cis(&self, handles: Vec<CisHandlePair>);
    /// Disconnect the CIS
    fn disconnect_cis(&self, conn_handle: u16, reason: Status);
    /// Set up one direction of the data path of the CIS
    fn setup_iso_data_path(&self, conn_handle: u16, params: DataPathParameters);
    /// Remove the data path of the CIS in `directions`
    fn remove_iso_data_path(&self, conn_handle: u16, directions: DataPathDirections);
    /// Read the link quality counters of the CIS
    fn read_iso_link_quality(&self, conn_handle: u16);
}
