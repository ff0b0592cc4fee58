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

//! Wire compatible event and key payload types.
//!
//! The transport layer is a collaborator of this crate, not a dependency, so
//! the envelope formats it moves around are defined here.

use std::collections::BTreeMap;

use ruma::{
    identifiers::EventEncryptionAlgorithm, DeviceIdBox, DeviceKeyAlgorithm, DeviceKeyId, RoomId,
    UserId,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single Olm ciphertext and its message type.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CiphertextInfo {
    /// The base64 encoded ciphertext.
    pub body: String,
    /// The Olm message type, 0 for pre-key messages, 1 for normal ones.
    #[serde(rename = "type")]
    pub message_type: u8,
}

/// The content of an `m.room.encrypted` event using the Olm algorithm.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OlmV1Curve25519AesSha2Content {
    /// The encryption algorithm, always `m.olm.v1.curve25519-aes-sha2`.
    pub algorithm: EventEncryptionAlgorithm,
    /// The curve25519 key of the sending device.
    pub sender_key: String,
    /// Per recipient ciphertexts, keyed by the recipient curve25519 key.
    pub ciphertext: BTreeMap<String, CiphertextInfo>,
}

/// The content of an `m.room.encrypted` event using the Megolm algorithm.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MegolmV1AesSha2Content {
    /// The encryption algorithm, always `m.megolm.v1.aes-sha2`.
    pub algorithm: EventEncryptionAlgorithm,
    /// The base64 encoded ciphertext.
    pub ciphertext: String,
    /// The curve25519 key of the sending device.
    pub sender_key: String,
    /// The id of the sending device.
    pub device_id: DeviceIdBox,
    /// The id of the group session that encrypted the message.
    pub session_id: String,
}

/// The content of an `m.room.encrypted` event.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EncryptedEventContent {
    /// A pairwise encrypted event, the ciphertext field is a map.
    OlmV1Curve25519AesSha2(OlmV1Curve25519AesSha2Content),
    /// A group encrypted event, the ciphertext field is a string.
    MegolmV1AesSha2(MegolmV1AesSha2Content),
}

/// An event sent directly to a device, outside of any room.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToDeviceEvent {
    /// The user that sent the event.
    pub sender: UserId,
    /// The type of the event.
    #[serde(rename = "type")]
    pub event_type: String,
    /// The content of the event.
    pub content: Value,
}

/// An encrypted event that was received as part of a room timeline.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EncryptedEvent {
    /// The user that sent the event.
    pub sender: UserId,
    /// The room the event was sent in.
    pub room_id: RoomId,
    /// The encrypted content of the event.
    pub content: EncryptedEventContent,
    /// The globally unique id of the event, if the server assigned one yet.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
}

/// The plaintext payload that is transported inside an Olm message.
///
/// The fields binding the payload to a sender and recipient pair are part of
/// the signed plaintext so a malicious server can't silently reroute the
/// message.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OlmPayload {
    /// The user that encrypted the payload.
    pub sender: UserId,
    /// The device that encrypted the payload.
    pub sender_device: DeviceIdBox,
    /// The long lived keys the sender claims to own.
    pub keys: BTreeMap<DeviceKeyAlgorithm, String>,
    /// The user the payload was encrypted for.
    pub recipient: UserId,
    /// The long lived keys the sender believes the recipient to own.
    pub recipient_keys: BTreeMap<DeviceKeyAlgorithm, String>,
    /// The type of the transported event.
    #[serde(rename = "type")]
    pub event_type: String,
    /// The content of the transported event.
    pub content: Value,
}

/// The content of an `m.room_key` event, carrying a group session key.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RoomKeyContent {
    /// The algorithm the session key should be used with.
    pub algorithm: EventEncryptionAlgorithm,
    /// The room the session is used in.
    pub room_id: RoomId,
    /// The unique id of the session.
    pub session_id: String,
    /// The exported session key.
    pub session_key: String,
    /// The ratchet index the session key was exported at.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain_index: Option<u32>,
}

/// Additional, unsigned, info about a device.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct UnsignedDeviceInfo {
    /// The display name the owner gave the device.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_display_name: Option<String>,
}

impl UnsignedDeviceInfo {
    /// Are there any unsigned fields present.
    pub fn is_empty(&self) -> bool {
        self.device_display_name.is_none()
    }
}

/// The signed identity keys of a device, as advertised to other devices.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeviceKeys {
    /// The user that owns the device.
    pub user_id: UserId,
    /// The unique id of the device.
    pub device_id: DeviceIdBox,
    /// The encryption algorithms the device supports.
    pub algorithms: Vec<EventEncryptionAlgorithm>,
    /// The public identity keys of the device.
    pub keys: BTreeMap<DeviceKeyId, String>,
    /// The self signature over the canonical form of this object.
    pub signatures: BTreeMap<UserId, BTreeMap<DeviceKeyId, String>>,
    /// Additional unsigned info, not covered by the signature.
    #[serde(default, skip_serializing_if = "UnsignedDeviceInfo::is_empty")]
    pub unsigned: UnsignedDeviceInfo,
}

/// A one-time key signed by the fingerprint key of the device that published
/// it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SignedOneTimeKey {
    /// The public curve25519 one-time key.
    pub key: String,
    /// The signature over the canonical form of this object.
    pub signatures: BTreeMap<UserId, BTreeMap<DeviceKeyId, String>>,
}

/// The result of a successful group message decryption.
#[derive(Clone, Debug)]
pub struct DecryptedEvent {
    /// The decrypted event, as it was before it got encrypted.
    pub event: Value,
    /// The ratchet index the message was encrypted at.
    pub message_index: u32,
    /// Keys the sender of the session claimed to own, nothing checked those
    /// claims.
    pub keys_claimed: BTreeMap<DeviceKeyAlgorithm, String>,
    /// Keys that the decryption itself proved, this will only ever contain
    /// the curve25519 key that sent us the session.
    pub keys_proved: BTreeMap<DeviceKeyAlgorithm, String>,
}
