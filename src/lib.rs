// Copyright 2021 The Matrix.org Foundation C.I.C.
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

//! This is the encryption engine for the Commune chat SDK.
//!
//! It implements one cryptographic state machine per device and exposes all
//! the operations a client needs for end-to-end encrypted group messaging:
//! identity key advertisement, pairwise channel setup, group session
//! creation and sharing, message encryption and decryption, replay defence
//! and signed JSON attestation.
//!
//! The engine never talks to a homeserver itself. Key payloads and encrypted
//! events are handed to and received from a transport layer owned by the
//! caller.

#![deny(
    missing_debug_implementations,
    trivial_casts,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_import_braces
)]

mod error;
mod identities;
mod machine;
pub mod olm;
mod requests;
mod session_manager;
pub mod store;
mod types;

pub use error::{
    DeviceError, EventError, MegolmError, MegolmResult, OlmError, OlmResult,
    SessionCreationError, SignatureError,
};
pub use identities::{DeviceKeysIntake, LocalTrust, ReadOnlyDevice};
pub use machine::OlmMachine;
pub use olm::EncryptionSettings;
pub use requests::ToDeviceRequest;
pub use store::{CryptoStore, CryptoStoreError, MemoryStore};
pub use types::{
    CiphertextInfo, DecryptedEvent, DeviceKeys, EncryptedEvent, EncryptedEventContent,
    MegolmV1AesSha2Content, OlmPayload, OlmV1Curve25519AesSha2Content, RoomKeyContent,
    SignedOneTimeKey, ToDeviceEvent, UnsignedDeviceInfo,
};

pub use olm_rs::session::{OlmMessage, PreKeyMessage};
