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

//! Group stream scenarios, played against simulated remote devices and a
//! simulated isochronous channels manager.

use crate::ascs::{
    AseStateParameters, AseStatus, CodecConfiguredParameters, ControlPointNotification,
    ControlPointResponse, EnabledParameters, Opcode, Operation, QosConfiguredParameters,
    ResponseCode,
};
use crate::ase::Ase;
use crate::callbacks::{AscsClient, StateMachineCallbacks};
use crate::codec::{CodecConfiguration, CodecId, FrameDuration, Metadata, SamplingFrequency};
use crate::configuration::{
    AudioSetConfiguration, AudioSetConfigurationProvider, CodecConfigSetting, QosConfigSetting,
    SetConfiguration,
};
use crate::iso::{
    CigParameters, CisHandlePair, DataPathDirection, DataPathDirections, DataPathParameters,
    IsoEvent, IsoManager,
};
use crate::runner::{LeAudioRunner, RunnerError};
use crate::state_machine::{GroupStateMachine, StateMachineConfig, StateMachineError, TimerEvent};
use crate::status::Status;
use crate::types::{
    AseState, AudioContexts, BidirectionalPair, CigState, DataPathState, Direction, GroupId,
    GroupStreamStatus, RawAddress, TargetLatency, TargetPhy, PHY_LE_2M,
};
use crate::utils::init_logging;

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time;

const GROUP: GroupId = 1;
const CIG: u8 = 0;
const CTP_HANDLE: u16 = 0x0010;
const A: RawAddress = RawAddress::new([0xc0, 0x00, 0x00, 0x00, 0x00, 0x0a]);
const B: RawAddress = RawAddress::new([0xc0, 0x00, 0x00, 0x00, 0x00, 0x0b]);

#[derive(Debug, Clone, PartialEq, Eq)]
enum IsoCall {
    CreateCig { cig_id: u8, cis_count: usize },
    RemoveCig { cig_id: u8, force: bool },
    EstablishCis(Vec<CisHandlePair>),
    DisconnectCis(u16, Status),
    SetupDataPath(u16, DataPathDirection),
    RemoveDataPath(u16, DataPathDirections),
    ReadLinkQuality(u16),
}

#[derive(Default)]
struct MockIso {
    calls: Mutex<Vec<IsoCall>>,
    cig_params: Mutex<Option<CigParameters>>,
}

impl MockIso {
    fn calls(&self) -> Vec<IsoCall> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: IsoCall) {
        self.calls.lock().unwrap().push(call);
    }
}

impl IsoManager for MockIso {
    fn create_cig(&self, cig_id: u8, params: CigParameters) {
        self.record(IsoCall::CreateCig { cig_id, cis_count: params.cis.len() });
        *self.cig_params.lock().unwrap() = Some(params);
    }

    fn remove_cig(&self, cig_id: u8, force: bool) {
        self.record(IsoCall::RemoveCig { cig_id, force });
    }

    fn establish_cis(&self, handles: Vec<CisHandlePair>) {
        self.record(IsoCall::EstablishCis(handles));
    }

    fn disconnect_cis(&self, conn_handle: u16, reason: Status) {
        self.record(IsoCall::DisconnectCis(conn_handle, reason));
    }

    fn setup_iso_data_path(&self, conn_handle: u16, params: DataPathParameters) {
        self.record(IsoCall::SetupDataPath(conn_handle, params.data_path_direction));
    }

    fn remove_iso_data_path(&self, conn_handle: u16, directions: DataPathDirections) {
        self.record(IsoCall::RemoveDataPath(conn_handle, directions));
    }

    fn read_iso_link_quality(&self, conn_handle: u16) {
        self.record(IsoCall::ReadLinkQuality(conn_handle));
    }
}

#[derive(Default)]
struct MockGatt {
    writes: Mutex<Vec<(RawAddress, Operation)>>,
}

impl MockGatt {
    fn writes(&self) -> Vec<(RawAddress, Operation)> {
        self.writes.lock().unwrap().clone()
    }
}

impl AscsClient for MockGatt {
    fn write_control_point(&self, address: RawAddress, handle: u16, value: Vec<u8>) {
        assert_eq!(handle, CTP_HANDLE);
        let operation = Operation::decode(&value).expect("malformed control point write");
        self.writes.lock().unwrap().push((address, operation));
    }
}

#[derive(Default)]
struct MockCallbacks {
    statuses: Mutex<Vec<(GroupId, GroupStreamStatus)>>,
    timeouts: Mutex<Vec<GroupId>>,
    updates: Mutex<Vec<(GroupId, Direction)>>,
}

impl StateMachineCallbacks for MockCallbacks {
    fn status_report(&self, group_id: GroupId, status: GroupStreamStatus) {
        self.statuses.lock().unwrap().push((group_id, status));
    }

    fn on_state_transition_timeout(&self, group_id: GroupId) {
        self.timeouts.lock().unwrap().push(group_id);
    }

    fn on_updated_cis_configuration(&self, group_id: GroupId, direction: Direction) {
        self.updates.lock().unwrap().push((group_id, direction));
    }
}

/// LC3 16_2 on `sink_devices` devices, mono sink and source on one device
/// for conversational
struct TestConfigurations {
    sink_devices: u8,
}

fn lc3_16_2() -> CodecConfigSetting {
    CodecConfigSetting {
        id: CodecId::LC3,
        params: CodecConfiguration {
            sampling_frequency: Some(SamplingFrequency::Hz16000),
            frame_duration: Some(FrameDuration::Us10000),
            octets_per_codec_frame: Some(40),
            ..Default::default()
        },
        channel_count_per_ase: 1,
    }
}

fn set_conf(direction: Direction, device_cnt: u8) -> SetConfiguration {
    SetConfiguration {
        direction,
        device_cnt,
        ase_cnt: 1,
        target_latency: TargetLatency::Lower,
        target_phy: TargetPhy::Le2M,
        codec: lc3_16_2(),
        qos: QosConfigSetting { retransmission_number: 2, max_transport_latency: 20 },
    }
}

impl AudioSetConfigurationProvider for TestConfigurations {
    fn get_configuration(
        &self,
        context: AudioContexts,
        _num_devices: usize,
    ) -> Option<AudioSetConfiguration> {
        if context == AudioContexts::MEDIA {
            Some(AudioSetConfiguration {
                name: "OneChanStereoSnk_16_2".to_string(),
                confs: vec![set_conf(Direction::Sink, self.sink_devices)],
            })
        } else if context == AudioContexts::CONVERSATIONAL {
            Some(AudioSetConfiguration {
                name: "SingleDev_OneChanMonoSnk_OneChanMonoSrc_16_2".to_string(),
                confs: vec![set_conf(Direction::Sink, 1), set_conf(Direction::Source, 1)],
            })
        } else {
            None
        }
    }
}

fn contexts(context: AudioContexts) -> BidirectionalPair<AudioContexts> {
    BidirectionalPair::new(context, context)
}

fn no_ccids() -> BidirectionalPair<Vec<u8>> {
    BidirectionalPair::default()
}

/// Register a device of `group_id` with its endpoints, and connect it
fn setup_device(
    sm: &mut GroupStateMachine,
    address: RawAddress,
    group_id: GroupId,
    sinks: &[u8],
    sources: &[u8],
    locations: u32,
) {
    sm.add_device(address, Some(group_id)).unwrap();
    let device = sm.device_mut(&address).unwrap();
    device.ctp_handle = CTP_HANDLE;
    device.audio_locations = BidirectionalPair::new(locations, locations);
    let sinks = sinks.iter().map(|id| (*id, Direction::Sink));
    let sources = sources.iter().map(|id| (*id, Direction::Source));
    for (i, (id, direction)) in sinks.chain(sources).enumerate() {
        let handle = 0x20 + 2 * i as u16;
        device.add_ase(id, direction, handle, handle + 1);
    }
    sm.on_acl_connected(address, 0x40 | address.address[5] as u16).unwrap();
}

fn codec_configured(codec_id: CodecId, codec_config: CodecConfiguration) -> AseStateParameters {
    AseStateParameters::CodecConfigured(CodecConfiguredParameters {
        framing: 0,
        preferred_phy: PHY_LE_2M,
        preferred_retransmission_number: 2,
        max_transport_latency: 100,
        presentation_delay_min: 10000,
        presentation_delay_max: 40000,
        preferred_presentation_delay_min: 0,
        preferred_presentation_delay_max: 0,
        codec_id,
        codec_config,
    })
}

struct Harness {
    sm: GroupStateMachine,
    iso: Arc<MockIso>,
    gatt: Arc<MockGatt>,
    callbacks: Arc<MockCallbacks>,
    timer_rx: mpsc::UnboundedReceiver<TimerEvent>,
    /// Remote devices not answering the control point
    muted: HashSet<RawAddress>,
    held: Vec<(RawAddress, Operation)>,
    writes_seen: usize,
    iso_seen: usize,
    /// Status of the next CIG creations, success when empty
    cig_statuses: VecDeque<Status>,
    /// Remote devices keep their codec configuration on release
    cache_on_release: bool,
}

impl Harness {
    fn new(sink_devices: u8) -> Self {
        Self::with_config(sink_devices, StateMachineConfig::default())
    }

    fn with_config(sink_devices: u8, config: StateMachineConfig) -> Self {
        init_logging();
        let iso = Arc::new(MockIso::default());
        let gatt = Arc::new(MockGatt::default());
        let callbacks = Arc::new(MockCallbacks::default());
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();
        let sm = GroupStateMachine::new(
            iso.clone(),
            gatt.clone(),
            callbacks.clone(),
            Arc::new(TestConfigurations { sink_devices }),
            config,
            timer_tx,
        );
        Self {
            sm,
            iso,
            gatt,
            callbacks,
            timer_rx,
            muted: HashSet::new(),
            held: vec![],
            writes_seen: 0,
            iso_seen: 0,
            cig_statuses: VecDeque::new(),
            cache_on_release: false,
        }
    }

    fn add_sink_device(&mut self, address: RawAddress, locations: u32) {
        setup_device(&mut self.sm, address, GROUP, &[1, 2], &[], locations);
    }

    fn statuses(&self) -> Vec<GroupStreamStatus> {
        let statuses = self.callbacks.statuses.lock().unwrap();
        statuses.iter().filter(|(group_id, _)| *group_id == GROUP).map(|(_, s)| *s).collect()
    }

    fn timeouts(&self) -> Vec<GroupId> {
        self.callbacks.timeouts.lock().unwrap().clone()
    }

    fn opcodes_to(&self, address: RawAddress) -> Vec<Opcode> {
        self.gatt
            .writes()
            .into_iter()
            .filter(|(a, _)| *a == address)
            .map(|(_, op)| op.opcode())
            .collect()
    }

    fn ase(&self, address: RawAddress, ase_id: u8) -> Ase {
        let device = self.sm.device(&address).unwrap();
        device.ases.iter().find(|ase| ase.id == ase_id).unwrap().clone()
    }

    fn state(&self) -> (AseState, AseState) {
        let group = self.sm.group(GROUP).unwrap();
        (group.state(), group.target_state())
    }

    fn start(&mut self, context: AudioContexts) -> Result<(), StateMachineError> {
        self.sm.start_stream(GROUP, context, contexts(context), no_ccids())
    }

    fn notify(&mut self, address: RawAddress, ase_id: u8, params: AseStateParameters) {
        let handle = self.ase(address, ase_id).handle;
        let value = AseStatus { ase_id, params }.encode();
        self.sm.process_gatt_notification(address, handle, &value);
    }

    fn enabled(&self, address: RawAddress, ase_id: u8) -> EnabledParameters {
        let ase = self.ase(address, ase_id);
        EnabledParameters { cig_id: CIG, cis_id: ase.cis_id, metadata: ase.metadata }
    }

    fn qos_configured(&self, address: RawAddress, ase_id: u8) -> AseStateParameters {
        let ase = self.ase(address, ase_id);
        AseStateParameters::QosConfigured(QosConfiguredParameters {
            cig_id: CIG,
            cis_id: ase.cis_id,
            sdu_interval: ase.qos.sdu_interval,
            framing: ase.qos.framing,
            phy: ase.qos.phy,
            max_sdu: ase.qos.max_sdu_size,
            retransmission_number: ase.qos.retransmission_number,
            max_transport_latency: ase.qos.max_transport_latency,
            presentation_delay: ase.qos.presentation_delay,
        })
    }

    /// Behave as an ASCS server receiving `operation`
    fn answer(&mut self, address: RawAddress, operation: Operation) {
        match operation {
            Operation::ConfigCodec(params) => {
                for p in params {
                    self.notify(address, p.ase_id, codec_configured(p.codec_id, p.codec_config));
                }
            }
            Operation::ConfigQos(params) => {
                for p in params {
                    let state = AseStateParameters::QosConfigured(QosConfiguredParameters {
                        cig_id: p.cig_id,
                        cis_id: p.cis_id,
                        sdu_interval: p.sdu_interval,
                        framing: p.framing,
                        phy: p.phy,
                        max_sdu: p.max_sdu,
                        retransmission_number: p.retransmission_number,
                        max_transport_latency: p.max_transport_latency,
                        presentation_delay: p.presentation_delay,
                    });
                    self.notify(address, p.ase_id, state);
                }
            }
            Operation::Enable(params) => {
                for p in params {
                    let enabled = EnabledParameters {
                        metadata: p.metadata,
                        ..self.enabled(address, p.ase_id)
                    };
                    self.notify(address, p.ase_id, AseStateParameters::Enabling(enabled));
                }
            }
            Operation::ReceiverStartReady(ids) => {
                for id in ids {
                    let enabled = self.enabled(address, id);
                    self.notify(address, id, AseStateParameters::Streaming(enabled));
                }
            }
            Operation::UpdateMetadata(params) => {
                for p in params {
                    let enabled = EnabledParameters {
                        metadata: p.metadata,
                        ..self.enabled(address, p.ase_id)
                    };
                    let state = match self.ase(address, p.ase_id).state {
                        AseState::Enabling => AseStateParameters::Enabling(enabled),
                        _ => AseStateParameters::Streaming(enabled),
                    };
                    self.notify(address, p.ase_id, state);
                }
            }
            Operation::Disable(ids) => {
                for id in ids {
                    let state = match self.ase(address, id).direction {
                        Direction::Sink => self.qos_configured(address, id),
                        Direction::Source => {
                            AseStateParameters::Disabling(self.enabled(address, id))
                        }
                    };
                    self.notify(address, id, state);
                }
            }
            Operation::ReceiverStopReady(ids) => {
                for id in ids {
                    let state = self.qos_configured(address, id);
                    self.notify(address, id, state);
                }
            }
            Operation::Release(ids) => {
                for id in &ids {
                    self.notify(address, *id, AseStateParameters::Releasing);
                }
                for id in ids {
                    let ase = self.ase(address, id);
                    let state = match self.cache_on_release {
                        true => codec_configured(ase.codec_id, ase.codec_config),
                        false => AseStateParameters::Idle,
                    };
                    self.notify(address, id, state);
                }
            }
        }
    }

    /// Behave as the isochronous channels manager receiving `call`
    fn complete(&mut self, call: IsoCall) {
        let event = match call {
            IsoCall::CreateCig { cig_id, cis_count } => {
                let status = self.cig_statuses.pop_front().unwrap_or(Status::Success);
                let conn_handles = match status {
                    Status::Success => (0..cis_count as u16).map(|i| 0x60 + i).collect(),
                    _ => vec![],
                };
                IsoEvent::CigCreated { status, cig_id, conn_handles }
            }
            IsoCall::RemoveCig { cig_id, .. } => {
                IsoEvent::CigRemoved { status: Status::Success, cig_id }
            }
            IsoCall::EstablishCis(handles) => {
                for pair in handles {
                    self.sm.process_iso_event(IsoEvent::CisEstablished {
                        status: Status::Success,
                        conn_handle: pair.cis_conn_handle,
                        params: Default::default(),
                    });
                    self.start_sinks(pair.cis_conn_handle);
                }
                return;
            }
            IsoCall::DisconnectCis(conn_handle, _) => IsoEvent::CisDisconnected {
                conn_handle,
                reason: Status::ConnectionTerminatedByLocalHost,
            },
            IsoCall::SetupDataPath(conn_handle, _) => {
                IsoEvent::DataPathSetup { status: Status::Success, conn_handle }
            }
            IsoCall::RemoveDataPath(conn_handle, _) => {
                IsoEvent::DataPathRemoved { status: Status::Success, conn_handle }
            }
            IsoCall::ReadLinkQuality(conn_handle) => IsoEvent::LinkQualityRead {
                status: Status::Success,
                conn_handle,
                report: Default::default(),
            },
        };
        self.sm.process_iso_event(event);
    }

    /// Sink endpoints start streaming as soon as their CIS is up
    fn start_sinks(&mut self, conn_handle: u16) {
        let sinks: Vec<(RawAddress, u8)> = self
            .sm
            .devices()
            .iter()
            .filter(|d| !self.muted.contains(&d.address))
            .flat_map(|d| d.ases.iter().map(move |ase| (d.address, ase)))
            .filter(|(_, ase)| {
                ase.active
                    && ase.direction == Direction::Sink
                    && ase.state == AseState::Enabling
                    && ase.cis_conn_handle == Some(conn_handle)
            })
            .map(|(address, ase)| (address, ase.id))
            .collect();
        for (address, id) in sinks {
            let enabled = self.enabled(address, id);
            self.notify(address, id, AseStateParameters::Streaming(enabled));
        }
    }

    fn pump_gatt(&mut self) -> bool {
        let writes = self.gatt.writes();
        self.held.extend(writes[self.writes_seen..].iter().cloned());
        self.writes_seen = writes.len();
        let (ready, held): (Vec<_>, Vec<_>) =
            std::mem::take(&mut self.held).into_iter().partition(|(a, _)| !self.muted.contains(a));
        self.held = held;
        let progressed = !ready.is_empty();
        for (address, operation) in ready {
            self.answer(address, operation);
        }
        progressed
    }

    fn pump_iso(&mut self) -> bool {
        let calls = self.iso.calls();
        let new = calls[self.iso_seen..].to_vec();
        self.iso_seen = calls.len();
        let progressed = !new.is_empty();
        for call in new {
            self.complete(call);
        }
        progressed
    }

    /// Let the remote devices and the controller answer until nothing
    /// moves anymore
    fn settle(&mut self) {
        while self.pump_gatt() || self.pump_iso() {}
    }

    /// Stream on `devices` connected sink devices
    fn streaming(devices: &[RawAddress]) -> Self {
        let mut h = Harness::new(devices.len() as u8);
        for (i, address) in devices.iter().enumerate() {
            h.add_sink_device(*address, 1 << i);
        }
        h.start(AudioContexts::MEDIA).unwrap();
        h.settle();
        assert_eq!(h.state(), (AseState::Streaming, AseState::Streaming));
        assert_eq!(h.statuses(), vec![GroupStreamStatus::Streaming]);
        h
    }
}

#[tokio::test]
async fn stream_start_and_release() {
    let mut h = Harness::streaming(&[A]);

    assert_eq!(
        h.opcodes_to(A),
        vec![Opcode::ConfigCodec, Opcode::ConfigQos, Opcode::Enable]
    );
    let config_qos = h.gatt.writes().into_iter().find_map(|(_, op)| match op {
        Operation::ConfigQos(params) => Some(params),
        _ => None,
    });
    let config_qos = config_qos.unwrap();
    assert_eq!(config_qos.len(), 1);
    assert_eq!(config_qos[0].cig_id, CIG);
    assert_eq!(config_qos[0].cis_id, 0);
    assert_eq!(config_qos[0].sdu_interval, 10000);
    assert_eq!(config_qos[0].max_sdu, 40);
    assert_eq!(config_qos[0].retransmission_number, 2);
    assert_eq!(config_qos[0].max_transport_latency, 20);
    assert_eq!(config_qos[0].presentation_delay, 10000);

    let cig_params = h.iso.cig_params.lock().unwrap().clone().unwrap();
    assert_eq!(cig_params.sdu_interval_c_to_p, 10000);
    assert_eq!(cig_params.sdu_interval_p_to_c, 0);
    assert_eq!(cig_params.cis[0].max_sdu_c_to_p, 40);
    assert_eq!(cig_params.cis[0].max_sdu_p_to_c, 0);

    let ase = h.ase(A, 1);
    assert_eq!(ase.state, AseState::Streaming);
    assert_eq!(ase.data_path_state, DataPathState::DataPathEstablished);
    assert_eq!(ase.cis_conn_handle, Some(0x60));
    assert_eq!(ase.codec_config.audio_channel_allocation, Some(0x01));
    assert!(!h.ase(A, 2).active);

    let stream_conf = &h.sm.group(GROUP).unwrap().stream_conf;
    assert_eq!(stream_conf.sink.streams.len(), 1);
    assert_eq!(stream_conf.sink.sample_frequency_hz, 16000);
    assert!(stream_conf.source.is_empty());
    assert_eq!(
        *h.callbacks.updates.lock().unwrap(),
        vec![(GROUP, Direction::Sink)]
    );

    h.sm.stop_stream(GROUP).unwrap();
    h.settle();

    assert_eq!(
        h.statuses(),
        vec![GroupStreamStatus::Streaming, GroupStreamStatus::Releasing, GroupStreamStatus::Idle]
    );
    assert_eq!(
        h.iso.calls(),
        vec![
            IsoCall::CreateCig { cig_id: CIG, cis_count: 1 },
            IsoCall::EstablishCis(vec![CisHandlePair {
                cis_conn_handle: 0x60,
                acl_conn_handle: 0x4a
            }]),
            IsoCall::SetupDataPath(0x60, DataPathDirection::Input),
            IsoCall::RemoveDataPath(0x60, DataPathDirections::INPUT),
            IsoCall::DisconnectCis(0x60, Status::RemoteUserTerminatedConnection),
            IsoCall::RemoveCig { cig_id: CIG, force: false },
        ]
    );
    assert_eq!(h.opcodes_to(A).last(), Some(&Opcode::Release));

    // Everything is back to where it started
    assert_eq!(h.state(), (AseState::Idle, AseState::Idle));
    assert_eq!(h.ase(A, 1), Ase::new(1, Direction::Sink, 0x20, 0x21));
    let group = h.sm.group(GROUP).unwrap();
    assert_eq!(group.cig.state, CigState::None);
    assert!(group.cig.cises.is_empty());
    assert!(group.stream_conf.sink.is_empty());
}

#[tokio::test]
async fn acl_loss_of_the_only_device_clears_the_group() {
    let mut h = Harness::streaming(&[A]);

    h.sm.process_acl_disconnected(A);

    assert_eq!(h.statuses(), vec![GroupStreamStatus::Streaming, GroupStreamStatus::Idle]);
    assert_eq!(h.iso.calls().last(), Some(&IsoCall::RemoveCig { cig_id: CIG, force: false }));
    assert_eq!(h.state(), (AseState::Idle, AseState::Idle));
    assert!(h.sm.group(GROUP).unwrap().stream_conf.sink.is_empty());
    assert_eq!(h.ase(A, 1), Ase::new(1, Direction::Sink, 0x20, 0x21));

    // The controller reports the CIS loss afterwards
    h.sm.process_iso_event(IsoEvent::CisDisconnected {
        conn_handle: 0x60,
        reason: Status::ConnectionTimeout,
    });
    h.settle();
    assert_eq!(h.statuses(), vec![GroupStreamStatus::Streaming, GroupStreamStatus::Idle]);
}

#[tokio::test(start_paused = true)]
async fn acl_loss_mid_transition_disarms_the_watchdog() {
    let config = StateMachineConfig::default().with_transition_timeout(Duration::from_secs(1));
    let mut h = Harness::with_config(1, config);
    h.add_sink_device(A, 0x01);
    h.muted.insert(A);

    // Watchdog armed, waiting for the codec configuration of A
    h.start(AudioContexts::MEDIA).unwrap();
    h.settle();
    assert_eq!(h.state(), (AseState::Idle, AseState::Streaming));

    h.sm.process_acl_disconnected(A);
    assert_eq!(h.state(), (AseState::Idle, AseState::Idle));

    let expiry = time::timeout(Duration::from_secs(10), h.timer_rx.recv()).await;
    if let Ok(Some(event)) = expiry {
        h.sm.on_timer_event(event);
    }
    assert!(h.timeouts().is_empty());
}

#[tokio::test]
async fn acl_loss_of_one_member_keeps_streaming() {
    let mut h = Harness::streaming(&[A, B]);
    assert_eq!(h.sm.group(GROUP).unwrap().stream_conf.sink.num_of_devices, 2);

    h.sm.process_acl_disconnected(B);
    h.sm.process_iso_event(IsoEvent::CisDisconnected {
        conn_handle: 0x61,
        reason: Status::ConnectionTimeout,
    });
    h.settle();

    assert_eq!(
        h.statuses(),
        vec![GroupStreamStatus::Streaming, GroupStreamStatus::Streaming]
    );
    assert_eq!(h.state(), (AseState::Streaming, AseState::Streaming));
    let stream_conf = &h.sm.group(GROUP).unwrap().stream_conf;
    assert_eq!(stream_conf.sink.num_of_devices, 1);
    assert_eq!(stream_conf.sink.streams[0].address, A);
}

#[tokio::test]
async fn suspend_disables_one_device_at_a_time() {
    let mut h = Harness::streaming(&[A, B]);

    h.muted.insert(A);
    h.sm.suspend_stream(GROUP).unwrap();
    h.settle();

    assert_eq!(h.opcodes_to(A).last(), Some(&Opcode::Disable));
    assert!(!h.opcodes_to(B).contains(&Opcode::Disable));
    assert_eq!(h.state(), (AseState::Streaming, AseState::QosConfigured));

    h.muted.remove(&A);
    h.settle();

    let writes = h.gatt.writes();
    let disable_a = writes.iter().position(|(a, op)| *a == A && op.opcode() == Opcode::Disable);
    let disable_b = writes.iter().position(|(a, op)| *a == B && op.opcode() == Opcode::Disable);
    assert!(disable_a.unwrap() < disable_b.unwrap());
    assert_eq!(
        h.statuses(),
        vec![
            GroupStreamStatus::Streaming,
            GroupStreamStatus::Suspending,
            GroupStreamStatus::Suspended
        ]
    );
    assert_eq!(h.state(), (AseState::QosConfigured, AseState::QosConfigured));
    for address in [A, B] {
        let ase = h.ase(address, 1);
        assert_eq!(ase.state, AseState::QosConfigured);
        assert_eq!(ase.data_path_state, DataPathState::CisAssigned);
    }
    let group = h.sm.group(GROUP).unwrap();
    assert_eq!(group.cig.state, CigState::Created);
    assert!(group.stream_conf.sink.is_empty());

    // Suspending again is a no-op
    h.sm.suspend_stream(GROUP).unwrap();
    assert_eq!(h.statuses().len(), 3);

    // Resume on the CIG kept
    h.start(AudioContexts::MEDIA).unwrap();
    h.settle();
    assert_eq!(h.statuses().last(), Some(&GroupStreamStatus::Streaming));
    assert_eq!(h.state(), (AseState::Streaming, AseState::Streaming));
    let creations = h.iso.calls().iter().filter(|c| matches!(c, IsoCall::CreateCig { .. })).count();
    assert_eq!(creations, 1);
    assert_eq!(h.sm.group(GROUP).unwrap().stream_conf.sink.num_of_devices, 2);
}

#[tokio::test]
async fn configure_rejected_while_streaming() {
    let mut h = Harness::streaming(&[A]);
    let writes = h.gatt.writes().len();

    let media = contexts(AudioContexts::MEDIA);
    let result = h.sm.configure_stream(GROUP, AudioContexts::MEDIA, media, no_ccids());

    assert_eq!(
        result,
        Err(StateMachineError::IllegalState {
            group_id: GROUP,
            operation: "configure stream",
            state: AseState::Streaming,
            target: AseState::Streaming,
        })
    );
    assert_eq!(h.gatt.writes().len(), writes);
    assert_eq!(h.state(), (AseState::Streaming, AseState::Streaming));
}

#[tokio::test]
async fn cig_creation_recovers_once() {
    let mut h = Harness::new(1);
    h.add_sink_device(A, 0x01);
    h.cig_statuses.push_back(Status::CommandDisallowed);

    h.start(AudioContexts::MEDIA).unwrap();
    h.settle();

    let calls = h.iso.calls();
    assert_eq!(calls[0], IsoCall::CreateCig { cig_id: CIG, cis_count: 1 });
    assert_eq!(calls[1], IsoCall::RemoveCig { cig_id: CIG, force: true });
    assert_eq!(calls[2], IsoCall::CreateCig { cig_id: CIG, cis_count: 1 });
    assert_eq!(h.statuses(), vec![GroupStreamStatus::Streaming]);
    assert_eq!(h.state(), (AseState::Streaming, AseState::Streaming));
}

#[tokio::test]
async fn cig_creation_gives_up_after_one_recovery() {
    let mut h = Harness::new(1);
    h.add_sink_device(A, 0x01);
    h.cig_statuses.extend([Status::CommandDisallowed, Status::CommandDisallowed]);

    h.start(AudioContexts::MEDIA).unwrap();
    h.settle();

    let calls = h.iso.calls();
    let forced = calls.iter().filter(|c| **c == IsoCall::RemoveCig { cig_id: CIG, force: true });
    assert_eq!(forced.count(), 1);
    let creations = calls.iter().filter(|c| matches!(c, IsoCall::CreateCig { .. }));
    assert_eq!(creations.count(), 2);
    assert_eq!(h.statuses(), vec![GroupStreamStatus::Releasing, GroupStreamStatus::Idle]);
    assert_eq!(h.state(), (AseState::Idle, AseState::Idle));
    assert_eq!(h.sm.group(GROUP).unwrap().cig.state, CigState::None);
}

#[tokio::test]
async fn stop_while_cig_creating_removes_the_cig() {
    let mut h = Harness::new(1);
    h.add_sink_device(A, 0x01);

    h.start(AudioContexts::MEDIA).unwrap();
    h.pump_gatt();
    assert_eq!(h.iso.calls(), vec![IsoCall::CreateCig { cig_id: CIG, cis_count: 1 }]);
    assert_eq!(h.sm.group(GROUP).unwrap().cig.state, CigState::Creating);

    // Released before the controller answers
    h.sm.stop_stream(GROUP).unwrap();
    h.pump_gatt();
    assert_eq!(h.state(), (AseState::Idle, AseState::Idle));
    assert_eq!(h.statuses(), vec![GroupStreamStatus::Releasing, GroupStreamStatus::Idle]);

    h.pump_iso();
    assert_eq!(h.iso.calls().last(), Some(&IsoCall::RemoveCig { cig_id: CIG, force: false }));
    assert_eq!(h.sm.group(GROUP).unwrap().cig.state, CigState::Removing);

    // Streams again once the CIG is gone
    h.start(AudioContexts::MEDIA).unwrap();
    h.settle();
    assert_eq!(h.state(), (AseState::Streaming, AseState::Streaming));
    assert_eq!(h.statuses().last(), Some(&GroupStreamStatus::Streaming));
    assert_eq!(
        h.iso.calls()[..3],
        [
            IsoCall::CreateCig { cig_id: CIG, cis_count: 1 },
            IsoCall::RemoveCig { cig_id: CIG, force: false },
            IsoCall::CreateCig { cig_id: CIG, cis_count: 1 },
        ]
    );
    assert_eq!(h.sm.group(GROUP).unwrap().cig.state, CigState::Created);
    assert_eq!(h.ase(A, 1).cis_conn_handle, Some(0x60));
}

#[tokio::test]
async fn cig_handle_mismatch_removes_the_cig() {
    let mut h = Harness::new(1);
    h.add_sink_device(A, 0x01);

    h.start(AudioContexts::MEDIA).unwrap();
    h.pump_gatt();
    h.sm.process_iso_event(IsoEvent::CigCreated {
        status: Status::Success,
        cig_id: CIG,
        conn_handles: vec![0x60, 0x61],
    });
    assert_eq!(
        h.iso.calls().last(),
        Some(&IsoCall::RemoveCig { cig_id: CIG, force: false })
    );
    assert_eq!(h.sm.group(GROUP).unwrap().cig.state, CigState::Removing);
    assert_eq!(h.state().1, AseState::Idle);
}

#[tokio::test]
async fn metadata_update_only_when_changed() {
    let mut h = Harness::streaming(&[A]);
    let writes = h.gatt.writes().len();

    h.start(AudioContexts::MEDIA).unwrap();
    h.settle();
    assert_eq!(h.gatt.writes().len(), writes);

    let game = AudioContexts::MEDIA | AudioContexts::GAME;
    let ccids = BidirectionalPair::new(vec![5], vec![]);
    h.sm.start_stream(GROUP, AudioContexts::MEDIA, contexts(game), ccids.clone()).unwrap();
    h.settle();

    let writes_after = h.gatt.writes();
    assert_eq!(writes_after.len(), writes + 1);
    assert_eq!(
        writes_after[writes],
        (
            A,
            Operation::UpdateMetadata(vec![crate::ascs::MetadataParameters {
                ase_id: 1,
                metadata: Metadata::new(game, vec![5]).encode(),
            }])
        )
    );
    assert_eq!(h.ase(A, 1).metadata, Metadata::new(game, vec![5]).encode());

    h.sm.start_stream(GROUP, AudioContexts::MEDIA, contexts(game), ccids).unwrap();
    h.settle();
    assert_eq!(h.gatt.writes().len(), writes + 1);
    assert_eq!(h.statuses(), vec![GroupStreamStatus::Streaming]);
}

#[tokio::test]
async fn bidirectional_stream_suspend_and_release() {
    let mut h = Harness::new(1);
    setup_device(&mut h.sm, A, GROUP, &[1], &[3], 0x01);

    h.start(AudioContexts::CONVERSATIONAL).unwrap();
    h.settle();

    assert_eq!(h.statuses(), vec![GroupStreamStatus::Streaming]);
    assert_eq!(
        h.opcodes_to(A),
        vec![Opcode::ConfigCodec, Opcode::ConfigQos, Opcode::Enable, Opcode::ReceiverStartReady]
    );
    let calls = h.iso.calls();
    assert_eq!(calls[0], IsoCall::CreateCig { cig_id: CIG, cis_count: 1 });
    assert_eq!(
        calls[1],
        IsoCall::EstablishCis(vec![CisHandlePair { cis_conn_handle: 0x60, acl_conn_handle: 0x4a }])
    );
    assert_eq!(calls[2], IsoCall::SetupDataPath(0x60, DataPathDirection::Input));
    assert_eq!(calls[3], IsoCall::SetupDataPath(0x60, DataPathDirection::Output));
    let stream_conf = &h.sm.group(GROUP).unwrap().stream_conf;
    assert_eq!(stream_conf.sink.streams.len(), 1);
    assert_eq!(stream_conf.source.streams.len(), 1);

    h.sm.suspend_stream(GROUP).unwrap();
    h.settle();

    assert_eq!(
        h.statuses(),
        vec![
            GroupStreamStatus::Streaming,
            GroupStreamStatus::Suspending,
            GroupStreamStatus::Suspended
        ]
    );
    assert_eq!(
        h.opcodes_to(A)[4..],
        [Opcode::Disable, Opcode::ReceiverStopReady]
    );
    assert!(h.iso.calls().contains(&IsoCall::RemoveDataPath(
        0x60,
        DataPathDirections::INPUT | DataPathDirections::OUTPUT
    )));

    h.sm.stop_stream(GROUP).unwrap();
    h.settle();

    assert_eq!(h.statuses().last(), Some(&GroupStreamStatus::Idle));
    assert_eq!(h.ase(A, 1), Ase::new(1, Direction::Sink, 0x20, 0x21));
    assert_eq!(h.ase(A, 3), Ase::new(3, Direction::Source, 0x22, 0x23));
    assert_eq!(h.iso.calls().last(), Some(&IsoCall::RemoveCig { cig_id: CIG, force: false }));
}

#[tokio::test]
async fn configuration_cached_by_the_devices() {
    let mut h = Harness::streaming(&[A]);
    h.cache_on_release = true;

    h.sm.stop_stream(GROUP).unwrap();
    h.settle();

    assert_eq!(h.statuses().last(), Some(&GroupStreamStatus::ConfiguredAutonomous));
    assert_eq!(h.state(), (AseState::CodecConfigured, AseState::CodecConfigured));
    let ase = h.ase(A, 1);
    assert_eq!(ase.state, AseState::CodecConfigured);
    assert!(!ase.active);
    assert_eq!(ase.data_path_state, DataPathState::Idle);

    // Streaming again goes from the cached configuration
    let config_codecs = |h: &Harness| {
        h.opcodes_to(A).into_iter().filter(|op| *op == Opcode::ConfigCodec).count()
    };
    assert_eq!(config_codecs(&h), 1);
    h.start(AudioContexts::MEDIA).unwrap();
    h.settle();
    assert_eq!(config_codecs(&h), 1);
    assert_eq!(h.statuses().last(), Some(&GroupStreamStatus::Streaming));
    assert_eq!(h.state(), (AseState::Streaming, AseState::Streaming));
}

#[tokio::test]
async fn configure_then_stream() {
    let mut h = Harness::new(1);
    h.add_sink_device(A, 0x01);

    h.sm.configure_stream(GROUP, AudioContexts::MEDIA, contexts(AudioContexts::MEDIA), no_ccids())
        .unwrap();
    h.settle();

    assert_eq!(h.statuses(), vec![GroupStreamStatus::ConfiguredByUser]);
    assert_eq!(h.state(), (AseState::CodecConfigured, AseState::CodecConfigured));
    assert!(h.iso.calls().is_empty());

    h.start(AudioContexts::MEDIA).unwrap();
    h.settle();

    assert_eq!(
        h.statuses(),
        vec![GroupStreamStatus::ConfiguredByUser, GroupStreamStatus::Streaming]
    );
    assert_eq!(
        h.opcodes_to(A),
        vec![Opcode::ConfigCodec, Opcode::ConfigQos, Opcode::Enable]
    );
}

#[tokio::test]
async fn pending_configuration_reported_on_release() {
    let mut h = Harness::streaming(&[A]);

    h.sm.stop_stream(GROUP).unwrap();
    h.sm.set_pending_configuration(GROUP).unwrap();
    h.settle();

    assert_eq!(
        h.statuses(),
        vec![
            GroupStreamStatus::Streaming,
            GroupStreamStatus::Releasing,
            GroupStreamStatus::ConfiguredByUser
        ]
    );
    assert!(!h.sm.group(GROUP).unwrap().pending_configuration);
}

#[tokio::test]
async fn late_member_joins_the_stream() {
    let mut h = Harness::new(2);
    h.add_sink_device(A, 0x01);
    h.add_sink_device(B, 0x02);
    h.sm.process_acl_disconnected(B);

    h.start(AudioContexts::MEDIA).unwrap();
    h.settle();
    assert_eq!(h.statuses(), vec![GroupStreamStatus::Streaming]);
    assert_eq!(h.iso.calls()[0], IsoCall::CreateCig { cig_id: CIG, cis_count: 2 });
    assert!(h.opcodes_to(B).is_empty());

    h.sm.on_acl_connected(B, 0x4b).unwrap();
    h.sm.attach_to_stream(GROUP, B).unwrap();
    h.settle();

    assert_eq!(
        h.opcodes_to(B),
        vec![Opcode::ConfigCodec, Opcode::ConfigQos, Opcode::Enable]
    );
    let ase = h.ase(B, 1);
    assert_eq!(ase.state, AseState::Streaming);
    assert_eq!(ase.cis_conn_handle, Some(0x61));
    assert_eq!(ase.codec_config.audio_channel_allocation, Some(0x02));
    assert_eq!(
        h.statuses(),
        vec![GroupStreamStatus::Streaming, GroupStreamStatus::Streaming]
    );
    let stream_conf = &h.sm.group(GROUP).unwrap().stream_conf;
    assert_eq!(stream_conf.sink.num_of_devices, 2);
    assert_eq!(stream_conf.sink.audio_channel_allocation, 0x03);

    // Already in
    h.sm.attach_to_stream(GROUP, B).unwrap();
    assert_eq!(h.opcodes_to(B).len(), 3);
}

#[tokio::test]
async fn configuration_sized_for_more_devices_than_connected() {
    // Three sink devices expected, two present
    let mut h = Harness::new(3);
    h.add_sink_device(A, 0x01);
    h.add_sink_device(B, 0x02);

    h.start(AudioContexts::MEDIA).unwrap();
    h.settle();
    assert_eq!(h.statuses(), vec![GroupStreamStatus::Streaming]);

    // One CIS stays reserved for a late member, nothing runs on it
    let calls = h.iso.calls();
    assert_eq!(calls[0], IsoCall::CreateCig { cig_id: CIG, cis_count: 3 });
    let established: Vec<u16> = calls
        .iter()
        .filter_map(|c| match c {
            IsoCall::EstablishCis(pairs) => Some(pairs.iter().map(|p| p.cis_conn_handle)),
            _ => None,
        })
        .flatten()
        .collect();
    assert_eq!(established, vec![0x60, 0x61]);
    let data_paths = calls.iter().filter(|c| matches!(c, IsoCall::SetupDataPath(..)));
    assert_eq!(data_paths.count(), 2);

    for address in [A, B] {
        assert!(h.ase(address, 1).active);
        assert!(!h.ase(address, 2).active);
        assert_eq!(h.ase(address, 2).cis_conn_handle, None);
    }
    let sink = &h.sm.group(GROUP).unwrap().stream_conf.sink;
    assert_eq!(sink.streams.len(), 2);
    assert_eq!(sink.num_of_devices, 2);
    assert_eq!(sink.num_of_channels, 2);
    assert_eq!(sink.audio_channel_allocation, 0x03);
}

#[tokio::test]
#[should_panic(expected = "inconsistent sink stream configuration")]
async fn data_path_with_conflicting_codec_parameters() {
    let mut h = Harness::new(2);
    h.add_sink_device(A, 0x01);
    h.add_sink_device(B, 0x02);
    h.muted.insert(B);

    h.start(AudioContexts::MEDIA).unwrap();
    h.settle();
    assert_eq!(h.held.len(), 1);

    // B settles on a frame size of its own
    h.muted.remove(&B);
    let Some((address, Operation::ConfigCodec(mut params))) = h.held.pop() else {
        panic!("B should be asked for its codec configuration");
    };
    assert_eq!(address, B);
    params[0].codec_config.octets_per_codec_frame = Some(60);
    h.answer(B, Operation::ConfigCodec(params));
    assert_eq!(h.ase(B, 1).codec_config.octets_per_codec_frame, Some(60));

    // The data path of B does not fit the stream of A
    h.settle();
}

#[tokio::test]
async fn control_point_error_stops_the_group() {
    let mut h = Harness::new(1);
    h.add_sink_device(A, 0x01);
    h.muted.insert(A);

    h.start(AudioContexts::MEDIA).unwrap();
    let failure = ControlPointNotification {
        opcode: Opcode::ConfigCodec as u8,
        responses: vec![ControlPointResponse {
            ase_id: 1,
            response_code: ResponseCode::InvalidConfigurationParameterValue,
            reason: 0x02,
        }],
    };
    h.sm.process_gatt_notification(A, CTP_HANDLE, &failure.encode());
    h.settle();

    assert_eq!(h.statuses(), vec![GroupStreamStatus::Releasing, GroupStreamStatus::Idle]);
    assert_eq!(h.state(), (AseState::Idle, AseState::Idle));
    assert!(!h.ase(A, 1).active);
}

#[tokio::test]
async fn invalid_transition_stops_the_group() {
    let mut h = Harness::streaming(&[A]);

    let state = codec_configured(CodecId::LC3, lc3_16_2().params);
    h.notify(A, 1, state);
    h.settle();

    assert_eq!(
        h.statuses(),
        vec![GroupStreamStatus::Streaming, GroupStreamStatus::Releasing, GroupStreamStatus::Idle]
    );
    assert_eq!(h.opcodes_to(A).last(), Some(&Opcode::Release));
}

#[tokio::test]
async fn ase_discovery() {
    let mut h = Harness::new(1);
    h.sm.add_device(A, Some(GROUP)).unwrap();
    let device = h.sm.device_mut(&A).unwrap();
    device.add_ase(0, Direction::Sink, 0x20, 0x21);
    device.add_ase(0, Direction::Sink, 0x22, 0x23);
    h.sm.on_acl_connected(A, 0x4a).unwrap();

    let idle = AseStatus { ase_id: 4, params: AseStateParameters::Idle };
    h.sm.process_gatt_notification(A, 0x20, &idle.encode());
    let cached = AseStatus { ase_id: 5, params: codec_configured(CodecId::LC3, lc3_16_2().params) };
    h.sm.process_gatt_notification(A, 0x22, &cached.encode());

    let device = h.sm.device(&A).unwrap();
    assert_eq!(device.ases[0].id, 4);
    assert_eq!(device.ases[0].state, AseState::Idle);
    assert_eq!(device.ases[1].id, 5);
    assert_eq!(device.ases[1].state, AseState::CodecConfigured);
    assert_eq!(device.ases[1].codec_config, lc3_16_2().params);
    assert_eq!(device.ases[1].qos_preferences.presentation_delay_max, 40000);
    assert_eq!(device.free_ase_count(Direction::Sink), 2);
    assert!(h.statuses().is_empty());
}

#[tokio::test]
async fn request_errors() {
    let mut h = Harness::new(1);
    assert_eq!(h.start(AudioContexts::MEDIA), Err(StateMachineError::UnknownGroup(GROUP)));

    h.add_sink_device(A, 0x01);
    assert_eq!(
        h.start(AudioContexts::RINGTONE),
        Err(StateMachineError::NoConfiguration(GROUP, AudioContexts::RINGTONE))
    );
    assert!(matches!(
        h.sm.suspend_stream(GROUP),
        Err(StateMachineError::IllegalState { operation: "suspend stream", .. })
    ));
    // Nothing to stop
    h.sm.stop_stream(GROUP).unwrap();
    assert!(h.statuses().is_empty());

    h.sm.process_acl_disconnected(A);
    assert_eq!(h.start(AudioContexts::MEDIA), Err(StateMachineError::NoActiveDevice(GROUP)));
    assert!(h.gatt.writes().is_empty());
}

#[tokio::test]
async fn group_membership() {
    let mut h = Harness::new(2);
    h.add_sink_device(A, 0x01);

    assert!(matches!(
        h.sm.add_device(A, None),
        Err(StateMachineError::Membership { address: A, .. })
    ));
    assert!(matches!(
        h.sm.group_add_node(2, A),
        Err(StateMachineError::Membership { address: A, .. })
    ));
    assert!(matches!(h.sm.remove_device(&A), Err(StateMachineError::Membership { .. })));
    assert_eq!(h.sm.attach_to_stream(GROUP, B), Err(StateMachineError::UnknownDevice(B)));

    h.sm.process_acl_disconnected(A);
    h.sm.group_add_node(2, A).unwrap();
    assert!(h.sm.group(GROUP).is_none());
    assert_eq!(h.sm.group(2).unwrap().members(), &[A]);
    assert_eq!(h.sm.device(&A).unwrap().group_id, Some(2));

    h.sm.add_device(B, Some(2)).unwrap();
    h.sm.group_remove_node(2, B).unwrap();
    assert_eq!(h.sm.group(2).unwrap().members(), &[A]);
    assert!(h.sm.dump_group(2).is_some());

    h.sm.remove_device(&A).unwrap();
    assert!(h.sm.group(2).is_none());
    assert!(h.sm.device(&A).is_none());
}

#[tokio::test(start_paused = true)]
async fn watchdog_reports_stuck_transition() {
    let config = StateMachineConfig::default().with_transition_timeout(Duration::from_secs(1));
    let mut h = Harness::with_config(1, config);
    h.add_sink_device(A, 0x01);
    h.muted.insert(A);

    h.start(AudioContexts::MEDIA).unwrap();
    h.settle();
    let event = h.timer_rx.recv().await.unwrap();
    assert!(matches!(event, TimerEvent::StateTransitionTimeout { group_id: GROUP, .. }));
    h.sm.on_timer_event(event);

    assert_eq!(h.timeouts(), vec![GROUP]);
    assert_eq!(h.state(), (AseState::Idle, AseState::Streaming));

    // A later expiry of the same arming is ignored
    h.sm.on_timer_event(event);
    assert_eq!(h.timeouts(), vec![GROUP]);
}

#[tokio::test(start_paused = true)]
async fn watchdog_disarmed_on_target_reached() {
    let mut h = Harness::streaming(&[A]);

    h.sm.on_timer_event(TimerEvent::StateTransitionTimeout { group_id: GROUP, token: 0 });
    let expiry = time::timeout(Duration::from_secs(60), h.timer_rx.recv()).await;

    assert!(expiry.is_err());
    assert!(h.timeouts().is_empty());
}

#[tokio::test(start_paused = true)]
async fn link_quality_read_while_streaming() {
    let config =
        StateMachineConfig::default().with_link_quality_check_interval(Duration::from_millis(100));
    let mut h = Harness::with_config(1, config);
    h.add_sink_device(A, 0x01);
    h.start(AudioContexts::MEDIA).unwrap();
    h.settle();

    let event = h.timer_rx.recv().await.unwrap();
    assert_eq!(event, TimerEvent::LinkQualityCheck { conn_handle: 0x60 });
    h.sm.on_timer_event(event);
    h.settle();
    assert_eq!(h.iso.calls().last(), Some(&IsoCall::ReadLinkQuality(0x60)));

    h.sm.stop_stream(GROUP).unwrap();
    h.settle();
    let reads = |h: &Harness| {
        h.iso.calls().iter().filter(|c| matches!(c, IsoCall::ReadLinkQuality(_))).count()
    };
    h.sm.on_timer_event(event);
    assert_eq!(reads(&h), 1);
    assert!(time::timeout(Duration::from_secs(1), h.timer_rx.recv()).await.is_err());
}

#[test]
fn config_from_env() {
    std::env::set_var(StateMachineConfig::TRANSITION_TIMEOUT_ENV, "500");
    std::env::set_var(StateMachineConfig::LINK_QUALITY_CHECK_INTERVAL_ENV, "0");
    let config = StateMachineConfig::from_env();
    assert_eq!(config.transition_timeout, Duration::from_millis(500));
    assert_eq!(config.link_quality_check_interval, None);

    std::env::set_var(StateMachineConfig::TRANSITION_TIMEOUT_ENV, "soon");
    std::env::set_var(StateMachineConfig::LINK_QUALITY_CHECK_INTERVAL_ENV, "2000");
    let config = StateMachineConfig::from_env();
    assert_eq!(config.transition_timeout, StateMachineConfig::default().transition_timeout);
    assert_eq!(config.link_quality_check_interval, Some(Duration::from_secs(2)));

    std::env::remove_var(StateMachineConfig::TRANSITION_TIMEOUT_ENV);
    std::env::remove_var(StateMachineConfig::LINK_QUALITY_CHECK_INTERVAL_ENV);
}

#[test]
fn runner_serializes_requests() {
    init_logging();
    let iso = Arc::new(MockIso::default());
    let gatt = Arc::new(MockGatt::default());
    let callbacks = Arc::new(MockCallbacks::default());

    let mut runner = LeAudioRunner::new();
    assert_eq!(runner.post(|_| {}), Err(RunnerError::NotStarted));

    let (iso_, gatt_, callbacks_) = (iso.clone(), gatt.clone(), callbacks.clone());
    runner
        .start(move |timer_tx| {
            GroupStateMachine::new(
                iso_,
                gatt_,
                callbacks_,
                Arc::new(TestConfigurations { sink_devices: 1 }),
                StateMachineConfig::default(),
                timer_tx,
            )
        })
        .unwrap();
    assert_eq!(runner.start(|_| unreachable!()), Err(RunnerError::AlreadyStarted));

    let (tx, rx) = std::sync::mpsc::channel();
    runner
        .post(move |sm| {
            setup_device(sm, A, GROUP, &[1], &[], 0x01);
            let result = sm.start_stream(
                GROUP,
                AudioContexts::MEDIA,
                contexts(AudioContexts::MEDIA),
                no_ccids(),
            );
            let target = sm.group(GROUP).map(|group| group.target_state());
            tx.send((result, target)).unwrap();
        })
        .unwrap();

    assert_eq!(rx.recv().unwrap(), (Ok(()), Some(AseState::Streaming)));
    assert_eq!(gatt.writes().len(), 1);
    assert_eq!(gatt.writes()[0].1.opcode(), Opcode::ConfigCodec);

    runner.stop();
    assert_eq!(runner.post(|_| {}), Err(RunnerError::Ended));
    assert!(iso.calls().is_empty());
    assert!(callbacks.statuses.lock().unwrap().is_empty());
}
