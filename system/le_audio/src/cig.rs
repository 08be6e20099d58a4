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

//! Connected Isochronous Group of a device group: CIS identifiers and
//! their assignment to the endpoints, and the group-wide QoS.

use crate::ase::{Ase, AseQosConfiguration, CIS_ID_INVALID};
use crate::configuration::AudioSetConfiguration;
use crate::device::Device;
use crate::iso::{CigParameters, CisConfiguration};
use crate::types::{
    BidirectionalPair, CigState, CisType, DataPathState, Direction, RawAddress,
    MAX_TRANSPORT_LATENCY_MIN, PHY_LE_1M, PHY_LE_2M, PHY_LE_CODED,
};
use log::{debug, warn};
use std::fmt;

/// Connected Isochronous Stream of the group
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cis {
    #[allow(missing_docs)]
    pub id: u8,
    #[allow(missing_docs)]
    pub cis_type: CisType,
    /// Handle returned on CIG creation
    pub conn_handle: Option<u16>,
    /// Device the CIS is assigned to
    pub address: Option<RawAddress>,
}

/// QoS of a direction, common to all the endpoints of the group
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct DirectionQos {
    pub sdu_interval: u32,
    pub max_sdu_size: u16,
    pub retransmission_number: u8,
    pub max_transport_latency: u16,
    pub phy: u8,
    pub presentation_delay: u32,
}

impl DirectionQos {
    /// The direction carries audio
    pub fn is_used(&self) -> bool {
        self.sdu_interval != 0
    }
}

/// Reasons for refusing to create a CIG
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CigCreateError {
    /// A CIG already exists, or is being created or removed
    InvalidState(CigState),
    /// No direction has an SDU interval
    NoSduInterval,
    /// No CIS carries any SDU
    NoMaxSdu,
    /// Max transport latency under the protocol minimum
    TransportLatency(Direction, u16),
    /// The presentation delay ranges of the endpoints do not intersect
    PresentationDelay(Direction),
}

/// Connected Isochronous Group
#[derive(Debug, Clone)]
pub struct Cig {
    #[allow(missing_docs)]
    pub cig_id: u8,
    #[allow(missing_docs)]
    pub state: CigState,
    /// Streams, in identifier order
    pub cises: Vec<Cis>,
    /// The stale CIG removal has been tried for the current creation
    pub recovery_attempted: bool,
    #[allow(missing_docs)]
    pub framing: u8,
    #[allow(missing_docs)]
    pub qos: BidirectionalPair<DirectionQos>,
}

impl Cig {
    #[allow(missing_docs)]
    pub fn new(cig_id: u8) -> Self {
        Self {
            cig_id,
            state: CigState::None,
            cises: vec![],
            recovery_attempted: false,
            framing: 0,
            qos: Default::default(),
        }
    }

    /// Create the CIS descriptors needed by `config`: as many bidirectional
    /// CISes as possible, the remaining endpoints get unidirectional ones.
    /// Existing descriptors are kept.
    pub fn generate_cis_ids(&mut self, config: &AudioSetConfiguration) {
        if !self.cises.is_empty() {
            debug!("CIG {}: CIS ids already generated", self.cig_id);
            return;
        }

        let sink = config.ase_count(Direction::Sink);
        let source = config.ase_count(Direction::Source);
        let bidirectional = sink.min(source);
        let types = std::iter::repeat(CisType::Bidirectional)
            .take(bidirectional)
            .chain(std::iter::repeat(CisType::UnidirectionalSink).take(sink - bidirectional))
            .chain(std::iter::repeat(CisType::UnidirectionalSource).take(source - bidirectional));

        self.cises = types
            .enumerate()
            .map(|(id, cis_type)| Cis { id: id as u8, cis_type, conn_handle: None, address: None })
            .collect();
        debug!("CIG {}: generated {} CIS ids for {}", self.cig_id, self.cises.len(), config.name);
    }

    /// Drop all the CIS descriptors
    pub fn release_cis_ids(&mut self) {
        self.cises.clear();
    }

    fn next_free_id(&self) -> u8 {
        (0..=u8::MAX - 1).find(|id| self.cises.iter().all(|cis| cis.id != *id)).unwrap_or(0)
    }

    fn find_free(&self, cis_type: CisType) -> Option<usize> {
        self.cises.iter().position(|cis| cis.address.is_none() && cis.cis_type == cis_type)
    }

    fn allocate(&mut self, cis_type: CisType) -> usize {
        let id = self.next_free_id();
        debug!("CIG {}: allocating CIS {} ({:?})", self.cig_id, id, cis_type);
        self.cises.push(Cis { id, cis_type, conn_handle: None, address: None });
        self.cises.sort_by_key(|cis| cis.id);
        self.cises.iter().position(|cis| cis.id == id).unwrap_or(self.cises.len() - 1)
    }

    fn bind(&mut self, index: usize, address: RawAddress, ase: &mut Ase) {
        let cis = &mut self.cises[index];
        cis.address = Some(address);
        ase.cis_id = cis.id;
        ase.cis_conn_handle = cis.conn_handle;
        if cis.conn_handle.is_some() {
            ase.data_path_state = DataPathState::CisAssigned;
        }
        debug!("{}: ASE 0x{:02x} ({}) uses CIS {}", address, ase.id, ase.direction, cis.id);
    }

    /// Assign a CIS to each active endpoint of the device. A sink and a
    /// source endpoint of the device share a bidirectional CIS when one
    /// is available.
    pub fn assign_cis_ids(&mut self, device: &mut Device) {
        let address = device.address;
        let unassigned = |ases: &[Ase], direction| {
            ases.iter()
                .enumerate()
                .filter(|(_, ase)| {
                    ase.active && ase.direction == direction && ase.cis_id == CIS_ID_INVALID
                })
                .map(|(i, _)| i)
                .collect::<Vec<_>>()
        };

        let mut sources = unassigned(&device.ases, Direction::Source).into_iter();
        for i in unassigned(&device.ases, Direction::Sink) {
            if let Some(index) = self.find_free(CisType::Bidirectional) {
                self.bind(index, address, &mut device.ases[i]);
                if let Some(j) = sources.next() {
                    self.bind(index, address, &mut device.ases[j]);
                }
            } else if let Some(index) = self.find_free(CisType::UnidirectionalSink) {
                self.bind(index, address, &mut device.ases[i]);
            } else {
                warn!("{}: no CIS left for sink ASE 0x{:02x}", address, device.ases[i].id);
                let index = self.allocate(CisType::UnidirectionalSink);
                self.bind(index, address, &mut device.ases[i]);
            }
        }

        for j in sources {
            // Reuse a bidirectional CIS of the device with a free source half
            let shared = self.cises.iter().position(|cis| {
                cis.address == Some(address)
                    && cis.cis_type == CisType::Bidirectional
                    && !device.ases.iter().any(|ase| {
                        ase.direction == Direction::Source && ase.active && ase.cis_id == cis.id
                    })
            });
            let index = match shared
                .or_else(|| self.find_free(CisType::UnidirectionalSource))
                .or_else(|| self.find_free(CisType::Bidirectional))
            {
                Some(index) => index,
                None => {
                    warn!("{}: no CIS left for source ASE 0x{:02x}", address, device.ases[j].id);
                    self.allocate(CisType::UnidirectionalSource)
                }
            };
            self.bind(index, address, &mut device.ases[j]);
        }
    }

    /// Free the CISes assigned to a device
    pub fn unassign_device(&mut self, address: &RawAddress) {
        for cis in self.cises.iter_mut().filter(|cis| cis.address.as_ref() == Some(address)) {
            cis.address = None;
        }
    }

    /// Bind the handles returned on CIG creation, in CIS order
    pub fn assign_conn_handles(&mut self, conn_handles: &[u16]) -> bool {
        if conn_handles.len() != self.cises.len() {
            return false;
        }
        for (cis, &handle) in self.cises.iter_mut().zip(conn_handles) {
            cis.conn_handle = Some(handle);
        }
        true
    }

    #[allow(missing_docs)]
    pub fn cis_by_conn_handle(&self, conn_handle: u16) -> Option<&Cis> {
        self.cises.iter().find(|cis| cis.conn_handle == Some(conn_handle))
    }

    /// Connection handle of the CIS `cis_id`
    pub fn conn_handle_of(&self, cis_id: u8) -> Option<u16> {
        self.cises.iter().find(|cis| cis.id == cis_id).and_then(|cis| cis.conn_handle)
    }

    /// Derive the QoS of the group from its active endpoints. Fails when
    /// the presentation delay ranges of the endpoints do not intersect.
    pub fn update_qos(&mut self, ases: &[&Ase]) -> Result<(), Direction> {
        self.framing = ases.iter().any(|ase| ase.qos_preferences.supported_framing == 1).into();
        for direction in Direction::ALL {
            let ases: Vec<_> = ases.iter().filter(|ase| ase.direction == direction).collect();
            *self.qos.get_mut(direction) = match ases.is_empty() {
                true => Default::default(),
                false => direction_qos(&ases).ok_or(direction)?,
            };
        }
        Ok(())
    }

    /// QoS to configure on an endpoint of the group
    pub fn ase_qos(&self, ase: &Ase) -> AseQosConfiguration {
        let qos = self.qos.get(ase.direction);
        AseQosConfiguration {
            sdu_interval: qos.sdu_interval,
            framing: self.framing,
            phy: qos.phy,
            max_sdu_size: ase.codec_config.max_sdu_size(),
            retransmission_number: qos.retransmission_number,
            max_transport_latency: qos.max_transport_latency,
            presentation_delay: qos.presentation_delay,
        }
    }

    /// Parameters of LE Set CIG Parameters. The size of the SDUs of a CIS
    /// comes from the endpoint using it, a CIS not assigned yet gets the
    /// largest size of the group.
    pub fn parameters(&self, ases: &[&Ase]) -> CigParameters {
        let cis_direction = |cis: &Cis, direction: Direction| {
            let qos = self.qos.get(direction);
            if !cis.cis_type.carries(direction) || !qos.is_used() {
                return (0, 0);
            }
            let max_sdu = ases
                .iter()
                .find(|ase| ase.direction == direction && ase.cis_id == cis.id)
                .map_or(qos.max_sdu_size, |ase| ase.codec_config.max_sdu_size());
            (max_sdu, qos.retransmission_number)
        };
        let phy = |direction| match self.qos.get(direction).phy {
            0 => PHY_LE_2M,
            phy => phy,
        };

        CigParameters {
            sdu_interval_c_to_p: self.qos.sink.sdu_interval,
            sdu_interval_p_to_c: self.qos.source.sdu_interval,
            worst_case_sca: 0,
            packing: 0,
            framing: self.framing,
            max_transport_latency_c_to_p: self.qos.sink.max_transport_latency,
            max_transport_latency_p_to_c: self.qos.source.max_transport_latency,
            cis: self
                .cises
                .iter()
                .map(|cis| {
                    let (max_sdu_c_to_p, rtn_c_to_p) = cis_direction(cis, Direction::Sink);
                    let (max_sdu_p_to_c, rtn_p_to_c) = cis_direction(cis, Direction::Source);
                    CisConfiguration {
                        cis_id: cis.id,
                        max_sdu_c_to_p,
                        max_sdu_p_to_c,
                        phy_c_to_p: phy(Direction::Sink),
                        phy_p_to_c: phy(Direction::Source),
                        rtn_c_to_p,
                        rtn_p_to_c,
                    }
                })
                .collect(),
        }
    }

    /// Check the preconditions of the CIG creation
    pub fn check_create(&self, params: &CigParameters) -> Result<(), CigCreateError> {
        if self.state != CigState::None {
            return Err(CigCreateError::InvalidState(self.state));
        }
        if params.sdu_interval_c_to_p == 0 && params.sdu_interval_p_to_c == 0 {
            return Err(CigCreateError::NoSduInterval);
        }
        if params.cis.iter().all(|cis| cis.max_sdu_c_to_p == 0 && cis.max_sdu_p_to_c == 0) {
            return Err(CigCreateError::NoMaxSdu);
        }
        for direction in Direction::ALL {
            let qos = self.qos.get(direction);
            if qos.is_used() && qos.max_transport_latency < MAX_TRANSPORT_LATENCY_MIN {
                return Err(CigCreateError::TransportLatency(direction, qos.max_transport_latency));
            }
        }
        Ok(())
    }
}

fn direction_qos(ases: &[&&Ase]) -> Option<DirectionQos> {
    let prefs = ases.iter().map(|ase| &ase.qos_preferences);

    let max_transport_latency = ases
        .iter()
        .flat_map(|ase| [ase.qos.max_transport_latency, ase.qos_preferences.max_transport_latency])
        .filter(|&latency| latency != 0)
        .min()
        .unwrap_or(0);

    let phy_mask = prefs
        .clone()
        .map(|p| p.preferred_phy)
        .filter(|&phy| phy != 0)
        .fold(PHY_LE_1M | PHY_LE_2M | PHY_LE_CODED, |acc, phy| acc & phy);
    let phy = [PHY_LE_2M, PHY_LE_1M, PHY_LE_CODED]
        .into_iter()
        .find(|phy| phy_mask & phy != 0)
        .unwrap_or(PHY_LE_2M);

    let pd_min = prefs.clone().map(|p| p.presentation_delay_min).max().unwrap_or(0);
    let pd_max = prefs.clone().map(|p| p.presentation_delay_max).min().unwrap_or(0);
    if pd_min > pd_max {
        warn!("No common presentation delay in [{}, {}]", pd_min, pd_max);
        return None;
    }
    let preferred = match prefs.clone().all(|p| p.preferred_presentation_delay_min != 0) {
        true => prefs.map(|p| p.preferred_presentation_delay_min).max(),
        false => None,
    };
    let presentation_delay =
        preferred.filter(|pd| (pd_min..=pd_max).contains(pd)).unwrap_or(pd_min);

    Some(DirectionQos {
        sdu_interval: ases.iter().map(|ase| ase.codec_config.sdu_interval_us()).max().unwrap_or(0),
        max_sdu_size: ases.iter().map(|ase| ase.codec_config.max_sdu_size()).max().unwrap_or(0),
        retransmission_number: ases
            .iter()
            .map(|ase| ase.qos.retransmission_number)
            .max()
            .unwrap_or(0),
        max_transport_latency,
        phy,
        presentation_delay,
    })
}

impl fmt::Display for Cig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "  CIG {} {:?}", self.cig_id, self.state)?;
        for cis in &self.cises {
            writeln!(
                f,
                "    CIS {} {:?} handle: {} device: {}",
                cis.id,
                cis.cis_type,
                cis.conn_handle.map_or("-".to_string(), |h| format!("0x{:03x}", h)),
                cis.address.map_or("-".to_string(), |a| a.to_string()),
            )?;
        }
        Ok(())
    }
}
