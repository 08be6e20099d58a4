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

//! Audio Stream Control Service characteristic values
//!
//! Operations written to the ASE Control Point, and notifications received
//! from the ASE and ASE Control Point characteristics.

use crate::codec::{CodecConfiguration, CodecId, ParseError};
use crate::reader::Reader;
use crate::types::{AseState, TargetLatency, TargetPhy};
use crate::writer::Writer;
use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::FromPrimitive;

/// ASE Control Point opcodes, as defined in ASCS - Table 5.1
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u8)]
#[allow(missing_docs)]
pub enum Opcode {
    ConfigCodec = 0x01,
    ConfigQos = 0x02,
    Enable = 0x03,
    ReceiverStartReady = 0x04,
    Disable = 0x05,
    ReceiverStopReady = 0x06,
    UpdateMetadata = 0x07,
    Release = 0x08,
}

/// Parameters of one ASE in a Config Codec operation
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct ConfigCodecParameters {
    pub ase_id: u8,
    pub target_latency: TargetLatency,
    pub target_phy: TargetPhy,
    pub codec_id: CodecId,
    pub codec_config: CodecConfiguration,
}

/// Parameters of one ASE in a Config QoS operation
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct ConfigQosParameters {
    pub ase_id: u8,
    pub cig_id: u8,
    pub cis_id: u8,
    pub sdu_interval: u32,
    pub framing: u8,
    pub phy: u8,
    pub max_sdu: u16,
    pub retransmission_number: u8,
    pub max_transport_latency: u16,
    pub presentation_delay: u32,
}

/// Parameters of one ASE in Enable and Update Metadata operations
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct MetadataParameters {
    pub ase_id: u8,
    /// LTV encoded metadata
    pub metadata: Vec<u8>,
}

/// ASE Control Point operation, ASCS - 5
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    /// 5.1  Config Codec
    ConfigCodec(Vec<ConfigCodecParameters>),
    /// 5.2  Config QoS
    ConfigQos(Vec<ConfigQosParameters>),
    /// 5.3  Enable
    Enable(Vec<MetadataParameters>),
    /// 5.4  Receiver Start Ready
    ReceiverStartReady(Vec<u8>),
    /// 5.5  Disable
    Disable(Vec<u8>),
    /// 5.6  Receiver Stop Ready
    ReceiverStopReady(Vec<u8>),
    /// 5.7  Update Metadata
    UpdateMetadata(Vec<MetadataParameters>),
    /// 5.8  Release
    Release(Vec<u8>),
}

impl Operation {
    #[allow(missing_docs)]
    pub fn opcode(&self) -> Opcode {
        match self {
            Self::ConfigCodec(_) => Opcode::ConfigCodec,
            Self::ConfigQos(_) => Opcode::ConfigQos,
            Self::Enable(_) => Opcode::Enable,
            Self::ReceiverStartReady(_) => Opcode::ReceiverStartReady,
            Self::Disable(_) => Opcode::Disable,
            Self::ReceiverStopReady(_) => Opcode::ReceiverStopReady,
            Self::UpdateMetadata(_) => Opcode::UpdateMetadata,
            Self::Release(_) => Opcode::Release,
        }
    }

    /// Identifiers of the ASEs targeted by the operation
    pub fn ase_ids(&self) -> Vec<u8> {
        match self {
            Self::ConfigCodec(v) => v.iter().map(|p| p.ase_id).collect(),
            Self::ConfigQos(v) => v.iter().map(|p| p.ase_id).collect(),
            Self::Enable(v) | Self::UpdateMetadata(v) => v.iter().map(|p| p.ase_id).collect(),
            Self::ReceiverStartReady(v)
            | Self::Disable(v)
            | Self::ReceiverStopReady(v)
            | Self::Release(v) => v.clone(),
        }
    }

    /// Value written to the ASE Control Point
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::with_capacity(32);
        w.write_u8(self.opcode() as u8);
        match self {
            Self::ConfigCodec(v) => {
                w.write_u8(num_ases(v.len()));
                for p in v {
                    w.write_u8(p.ase_id);
                    w.write_u8(p.target_latency as u8);
                    w.write_u8(p.target_phy as u8);
                    p.codec_id.write(&mut w);
                    w.write_lv(&p.codec_config.encode());
                }
            }
            Self::ConfigQos(v) => {
                w.write_u8(num_ases(v.len()));
                for p in v {
                    w.write_u8(p.ase_id);
                    w.write_u8(p.cig_id);
                    w.write_u8(p.cis_id);
                    w.write_u24(p.sdu_interval);
                    w.write_u8(p.framing);
                    w.write_u8(p.phy);
                    w.write_u16(p.max_sdu);
                    w.write_u8(p.retransmission_number);
                    w.write_u16(p.max_transport_latency);
                    w.write_u24(p.presentation_delay);
                }
            }
            Self::Enable(v) | Self::UpdateMetadata(v) => {
                w.write_u8(num_ases(v.len()));
                for p in v {
                    w.write_u8(p.ase_id);
                    w.write_lv(&p.metadata);
                }
            }
            Self::ReceiverStartReady(v)
            | Self::Disable(v)
            | Self::ReceiverStopReady(v)
            | Self::Release(v) => {
                w.write_u8(num_ases(v.len()));
                w.put(v);
            }
        }
        w.into_vec()
    }

    /// Parse a value written to the ASE Control Point
    pub fn decode(data: &[u8]) -> Result<Self, ParseError> {
        let mut r = Reader::new(data);
        let code = r.read_u8().ok_or(ParseError::Truncated("opcode"))?;
        let opcode = Opcode::from_u8(code).ok_or(ParseError::UnknownOpcode(code))?;
        let num = r.read_u8().ok_or(ParseError::Truncated("number of ASEs"))?;

        let op = match opcode {
            Opcode::ConfigCodec => {
                let mut v = Vec::with_capacity(num.into());
                for _ in 0..num {
                    v.push(read_config_codec(&mut r)?);
                }
                Self::ConfigCodec(v)
            }
            Opcode::ConfigQos => {
                let mut v = Vec::with_capacity(num.into());
                for _ in 0..num {
                    v.push(read_config_qos(&mut r).ok_or(ParseError::Truncated("Config QoS"))?);
                }
                Self::ConfigQos(v)
            }
            Opcode::Enable | Opcode::UpdateMetadata => {
                let mut v = Vec::with_capacity(num.into());
                for _ in 0..num {
                    let ase_id = r.read_u8().ok_or(ParseError::Truncated("ASE_ID"))?;
                    let metadata = r.read_lv().ok_or(ParseError::Truncated("Metadata"))?;
                    v.push(MetadataParameters { ase_id, metadata: metadata.to_vec() });
                }
                match opcode {
                    Opcode::Enable => Self::Enable(v),
                    _ => Self::UpdateMetadata(v),
                }
            }
            _ => {
                let ids = r.get(num.into()).ok_or(ParseError::Truncated("ASE_ID"))?.to_vec();
                match opcode {
                    Opcode::ReceiverStartReady => Self::ReceiverStartReady(ids),
                    Opcode::Disable => Self::Disable(ids),
                    Opcode::ReceiverStopReady => Self::ReceiverStopReady(ids),
                    _ => Self::Release(ids),
                }
            }
        };
        Ok(op)
    }
}

fn num_ases(len: usize) -> u8 {
    len.try_into().expect("Too many ASEs in a single operation")
}

fn read_config_codec(r: &mut Reader) -> Result<ConfigCodecParameters, ParseError> {
    let truncated = || ParseError::Truncated("Config Codec");
    let ase_id = r.read_u8().ok_or_else(truncated)?;
    let target_latency = r.read_u8().ok_or_else(truncated)?;
    let target_phy = r.read_u8().ok_or_else(truncated)?;
    let codec_id = CodecId::read(r).ok_or_else(truncated)?;
    let codec_config = r.read_lv().ok_or_else(truncated)?;

    Ok(ConfigCodecParameters {
        ase_id,
        target_latency: TargetLatency::from_u8(target_latency).ok_or(
            ParseError::InvalidValue { field: "target latency", value: target_latency.into() },
        )?,
        target_phy: TargetPhy::from_u8(target_phy)
            .ok_or(ParseError::InvalidValue { field: "target PHY", value: target_phy.into() })?,
        codec_id,
        codec_config: CodecConfiguration::decode(codec_config)?,
    })
}

fn read_config_qos(r: &mut Reader) -> Option<ConfigQosParameters> {
    Some(ConfigQosParameters {
        ase_id: r.read_u8()?,
        cig_id: r.read_u8()?,
        cis_id: r.read_u8()?,
        sdu_interval: r.read_u24()?,
        framing: r.read_u8()?,
        phy: r.read_u8()?,
        max_sdu: r.read_u16()?,
        retransmission_number: r.read_u8()?,
        max_transport_latency: r.read_u16()?,
        presentation_delay: r.read_u24()?,
    })
}

/// Additional ASE parameters of the Codec Configured state, ASCS - Table 4.3
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct CodecConfiguredParameters {
    /// 0x00: Unframed ISOAL PDUs supported, 0x01: not supported
    pub framing: u8,
    pub preferred_phy: u8,
    pub preferred_retransmission_number: u8,
    pub max_transport_latency: u16,
    pub presentation_delay_min: u32,
    pub presentation_delay_max: u32,
    pub preferred_presentation_delay_min: u32,
    pub preferred_presentation_delay_max: u32,
    pub codec_id: CodecId,
    pub codec_config: CodecConfiguration,
}

/// Additional ASE parameters of the QoS Configured state, ASCS - Table 4.4
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct QosConfiguredParameters {
    pub cig_id: u8,
    pub cis_id: u8,
    pub sdu_interval: u32,
    pub framing: u8,
    pub phy: u8,
    pub max_sdu: u16,
    pub retransmission_number: u8,
    pub max_transport_latency: u16,
    pub presentation_delay: u32,
}

/// Additional ASE parameters of the Enabling, Streaming and Disabling
/// states, ASCS - Table 4.5
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct EnabledParameters {
    pub cig_id: u8,
    pub cis_id: u8,
    /// LTV encoded metadata
    pub metadata: Vec<u8>,
}

/// State reported by an ASE, with its state-dependent parameters
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum AseStateParameters {
    Idle,
    CodecConfigured(CodecConfiguredParameters),
    QosConfigured(QosConfiguredParameters),
    Enabling(EnabledParameters),
    Streaming(EnabledParameters),
    Disabling(EnabledParameters),
    Releasing,
}

/// Value of a Sink ASE or Source ASE characteristic, ASCS - 4.1
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AseStatus {
    #[allow(missing_docs)]
    pub ase_id: u8,
    #[allow(missing_docs)]
    pub params: AseStateParameters,
}

impl AseStatus {
    /// State reported
    pub fn state(&self) -> AseState {
        match self.params {
            AseStateParameters::Idle => AseState::Idle,
            AseStateParameters::CodecConfigured(_) => AseState::CodecConfigured,
            AseStateParameters::QosConfigured(_) => AseState::QosConfigured,
            AseStateParameters::Enabling(_) => AseState::Enabling,
            AseStateParameters::Streaming(_) => AseState::Streaming,
            AseStateParameters::Disabling(_) => AseState::Disabling,
            AseStateParameters::Releasing => AseState::Releasing,
        }
    }

    /// Parse a Sink ASE or Source ASE characteristic value
    pub fn decode(data: &[u8]) -> Result<Self, ParseError> {
        let mut r = Reader::new(data);
        let ase_id = r.read_u8().ok_or(ParseError::Truncated("ASE_ID"))?;
        let code = r.read_u8().ok_or(ParseError::Truncated("ASE_State"))?;
        let state = AseState::from_u8(code).ok_or(ParseError::UnknownAseState(code))?;

        let params = match state {
            AseState::Idle => AseStateParameters::Idle,
            AseState::Releasing => AseStateParameters::Releasing,
            AseState::CodecConfigured => {
                AseStateParameters::CodecConfigured(read_codec_configured(&mut r)?)
            }
            AseState::QosConfigured => AseStateParameters::QosConfigured(
                read_qos_configured(&mut r).ok_or(ParseError::Truncated("QoS Configured"))?,
            ),
            AseState::Enabling | AseState::Streaming | AseState::Disabling => {
                let p = EnabledParameters {
                    cig_id: r.read_u8().ok_or(ParseError::Truncated("CIG_ID"))?,
                    cis_id: r.read_u8().ok_or(ParseError::Truncated("CIS_ID"))?,
                    metadata: r.read_lv().ok_or(ParseError::Truncated("Metadata"))?.to_vec(),
                };
                match state {
                    AseState::Enabling => AseStateParameters::Enabling(p),
                    AseState::Streaming => AseStateParameters::Streaming(p),
                    _ => AseStateParameters::Disabling(p),
                }
            }
        };

        Ok(Self { ase_id, params })
    }

    /// Build the characteristic value, as notified by a server
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::with_capacity(32);
        w.write_u8(self.ase_id);
        w.write_u8(self.state() as u8);
        match &self.params {
            AseStateParameters::Idle | AseStateParameters::Releasing => (),
            AseStateParameters::CodecConfigured(p) => {
                w.write_u8(p.framing);
                w.write_u8(p.preferred_phy);
                w.write_u8(p.preferred_retransmission_number);
                w.write_u16(p.max_transport_latency);
                w.write_u24(p.presentation_delay_min);
                w.write_u24(p.presentation_delay_max);
                w.write_u24(p.preferred_presentation_delay_min);
                w.write_u24(p.preferred_presentation_delay_max);
                p.codec_id.write(&mut w);
                w.write_lv(&p.codec_config.encode());
            }
            AseStateParameters::QosConfigured(p) => {
                w.write_u8(p.cig_id);
                w.write_u8(p.cis_id);
                w.write_u24(p.sdu_interval);
                w.write_u8(p.framing);
                w.write_u8(p.phy);
                w.write_u16(p.max_sdu);
                w.write_u8(p.retransmission_number);
                w.write_u16(p.max_transport_latency);
                w.write_u24(p.presentation_delay);
            }
            AseStateParameters::Enabling(p)
            | AseStateParameters::Streaming(p)
            | AseStateParameters::Disabling(p) => {
                w.write_u8(p.cig_id);
                w.write_u8(p.cis_id);
                w.write_lv(&p.metadata);
            }
        }
        w.into_vec()
    }
}

fn read_codec_configured(r: &mut Reader) -> Result<CodecConfiguredParameters, ParseError> {
    let truncated = || ParseError::Truncated("Codec Configured");
    Ok(CodecConfiguredParameters {
        framing: r.read_u8().ok_or_else(truncated)?,
        preferred_phy: r.read_u8().ok_or_else(truncated)?,
        preferred_retransmission_number: r.read_u8().ok_or_else(truncated)?,
        max_transport_latency: r.read_u16().ok_or_else(truncated)?,
        presentation_delay_min: r.read_u24().ok_or_else(truncated)?,
        presentation_delay_max: r.read_u24().ok_or_else(truncated)?,
        preferred_presentation_delay_min: r.read_u24().ok_or_else(truncated)?,
        preferred_presentation_delay_max: r.read_u24().ok_or_else(truncated)?,
        codec_id: CodecId::read(r).ok_or_else(truncated)?,
        codec_config: CodecConfiguration::decode(r.read_lv().ok_or_else(truncated)?)?,
    })
}

fn read_qos_configured(r: &mut Reader) -> Option<QosConfiguredParameters> {
    Some(QosConfiguredParameters {
        cig_id: r.read_u8()?,
        cis_id: r.read_u8()?,
        sdu_interval: r.read_u24()?,
        framing: r.read_u8()?,
        phy: r.read_u8()?,
        max_sdu: r.read_u16()?,
        retransmission_number: r.read_u8()?,
        max_transport_latency: r.read_u16()?,
        presentation_delay: r.read_u24()?,
    })
}

/// Response Code of an ASE Control Point notification, ASCS - Table 5.3
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u8)]
#[allow(missing_docs)]
pub enum ResponseCode {
    Success = 0x00,
    UnsupportedOpcode = 0x01,
    InvalidLength = 0x02,
    InvalidAseId = 0x03,
    InvalidAseStateMachineTransition = 0x04,
    InvalidAseDirection = 0x05,
    UnsupportedAudioCapabilities = 0x06,
    UnsupportedConfigurationParameterValue = 0x07,
    RejectedConfigurationParameterValue = 0x08,
    InvalidConfigurationParameterValue = 0x09,
    UnsupportedMetadata = 0x0a,
    RejectedMetadata = 0x0b,
    InvalidMetadata = 0x0c,
    InsufficientResources = 0x0d,
    UnspecifiedError = 0x0e,
}

/// Response for one ASE of a Control Point operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct ControlPointResponse {
    pub ase_id: u8,
    pub response_code: ResponseCode,
    pub reason: u8,
}

/// ASE Control Point notification, ASCS - 5
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlPointNotification {
    /// Opcode of the operation, kept raw as unsupported opcodes are echoed
    pub opcode: u8,
    #[allow(missing_docs)]
    pub responses: Vec<ControlPointResponse>,
}

impl ControlPointNotification {
    /// Number_of_ASEs used when the operation length was invalid
    const NUM_ASES_INVALID_LENGTH: u8 = 0xff;

    /// Parse an ASE Control Point notification
    pub fn decode(data: &[u8]) -> Result<Self, ParseError> {
        let mut r = Reader::new(data);
        let opcode = r.read_u8().ok_or(ParseError::Truncated("opcode"))?;
        let num = match r.read_u8().ok_or(ParseError::Truncated("number of ASEs"))? {
            Self::NUM_ASES_INVALID_LENGTH => 1,
            num => num,
        };

        let mut responses = Vec::with_capacity(num.into());
        for _ in 0..num {
            let ase_id = r.read_u8().ok_or(ParseError::Truncated("ASE_ID"))?;
            let code = r.read_u8().ok_or(ParseError::Truncated("Response_Code"))?;
            let reason = r.read_u8().ok_or(ParseError::Truncated("Reason"))?;
            responses.push(ControlPointResponse {
                ase_id,
                response_code: ResponseCode::from_u8(code)
                    .unwrap_or(ResponseCode::UnspecifiedError),
                reason,
            });
        }
        Ok(Self { opcode, responses })
    }

    /// Build the notification, as sent by a server
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::with_capacity(2 + 3 * self.responses.len());
        w.write_u8(self.opcode);
        w.write_u8(num_ases(self.responses.len()));
        for rsp in &self.responses {
            w.put(&[rsp.ase_id, rsp.response_code as u8, rsp.reason]);
        }
        w.into_vec()
    }
}
