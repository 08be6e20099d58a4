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

//! LE Audio unicast client, group stream state machine
//!
//! The state machine brings the Audio Stream Endpoints (ASEs) of the
//! devices of a group to a common state, one device at a time, and
//! provisions the isochronous channels carrying the audio:
//!
//!    Start / Stop                         ASE Control Point
//!    Suspend / Configure    ___________   writes
//!   ---------------------->|   group   |------------------>  remote
//!                          |   state   |                     devices
//!   <----------------------|  machine  |<------------------  (ASCS)
//!    Status reports        |___________|  ASE notifications
//!                              |    ^
//!           CIG / CIS / data   |    | completion
//!           path requests      v    | events
//!                           ____________
//!                          |    ISO     |
//!                          |  manager   |
//!                          |____________|
//!
//! Every input is serialized on the thread of a [`LeAudioRunner`].

pub mod ascs;
pub mod ase;
pub mod callbacks;
pub mod cig;
pub mod codec;
pub mod configuration;
pub mod device;
pub mod group;
pub mod iso;
pub mod runner;
pub mod state_machine;
pub mod status;
pub mod stream_conf;
pub mod types;
pub mod utils;

mod reader;
mod writer;

#[cfg(test)]
mod tests;

pub use callbacks::{AscsClient, StateMachineCallbacks};
pub use configuration::AudioSetConfigurationProvider;
pub use iso::{IsoEvent, IsoManager};
pub use runner::{LeAudioRunner, RunnerError};
pub use state_machine::{GroupStateMachine, StateMachineConfig, StateMachineError, TimerEvent};
