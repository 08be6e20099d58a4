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

use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::FromPrimitive;

/// Status / Error codes reported by the controller for isochronous
/// procedures, as defined in Part F
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u8)]
#[allow(missing_docs)]
pub enum Status {
    Success = 0x00,
    UnknownHciCommand = 0x01,
    UnknownConnectionIdentifier = 0x02,
    HardwareFailure = 0x03,
    MemoryCapacityExceeded = 0x07,
    ConnectionTimeout = 0x08,
    ConnectionLimitExceeded = 0x09,
    ConnectionAlreadyExists = 0x0B,
    CommandDisallowed = 0x0C,
    ConnectionRejectedLimitedResources = 0x0D,
    UnsupportedFeatureOrParameterValue = 0x11,
    InvalidHciCommandParameters = 0x12,
    RemoteUserTerminatedConnection = 0x13,
    RemoteDeviceTerminatedConnectionLowResources = 0x14,
    RemoteDeviceTerminatedConnectionPowerOff = 0x15,
    ConnectionTerminatedByLocalHost = 0x16,
    UnsupportedRemoteFeature = 0x1A,
    UnspecifiedError = 0x1F,
    LmpResponseTimeout = 0x22,
    InstantPassed = 0x28,
    InsufficientSecurity = 0x2F,
    ControllerBusy = 0x3A,
    ConnectionTerminatedMicFailure = 0x3D,
    ConnectionFailedEstablished = 0x3E,
    LimitReached = 0x43,
    OperationCancelledByHost = 0x44,
}

impl Status {
    /// Status from its code, codes without a dedicated variant map to
    /// `UnspecifiedError`
    pub fn from_code(code: u8) -> Self {
        Self::from_u8(code).unwrap_or(Status::UnspecifiedError)
    }

    #[allow(missing_docs)]
    pub fn is_success(self) -> bool {
        self == Status::Success
    }
}

#[test]
fn test_status_from_code() {
    assert_eq!(Status::from_code(0x00), Status::Success);
    assert_eq!(Status::from_code(0x0c), Status::CommandDisallowed);
    assert_eq!(Status::from_code(0x16), Status::ConnectionTerminatedByLocalHost);
    assert_eq!(Status::from_code(0x2a), Status::UnspecifiedError);
}
