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

use olm_rs::errors::{OlmGroupSessionError, OlmSessionError};
use ruma::{identifiers::Error as IdentifierError, DeviceIdBox, RoomId, UserId};
use serde_json::Error as SerdeError;
use thiserror::Error;

use super::store::CryptoStoreError;

pub type OlmResult<T> = Result<T, OlmError>;
pub type MegolmResult<T> = Result<T, MegolmError>;

/// Error representing a failure during a device to device cryptographic
/// operation.
#[derive(Error, Debug)]
pub enum OlmError {
    /// The event that should have been decrypted is malformed.
    #[error(transparent)]
    EventError(#[from] EventError),

    /// The received decrypted event couldn't be deserialized.
    #[error(transparent)]
    JsonError(#[from] SerdeError),

    /// The underlying Olm session operation returned an error.
    #[error("can't finish Olm Session operation {0}")]
    OlmSession(#[from] OlmSessionError),

    /// The underlying group session operation returned an error.
    #[error("can't finish Olm group session operation {0}")]
    OlmGroupSession(#[from] OlmGroupSessionError),

    /// The storage layer returned an error.
    #[error("failed to read or write to the crypto store {0}")]
    Store(#[from] CryptoStoreError),

    /// The session with a device has become corrupted.
    #[error("decryption failed likely because an Olm session with sender key {0} was wedged")]
    SessionWedged(String),

    /// Encryption failed because the device does not have a valid Olm session
    /// with us.
    #[error(
        "encryption failed because the device does not \
            have a valid Olm session with us"
    )]
    MissingSession,
}

/// Error representing a failure during a group encryption operation.
#[derive(Error, Debug)]
pub enum MegolmError {
    /// The event that should have been decrypted is malformed.
    #[error(transparent)]
    EventError(#[from] EventError),

    /// The received decrypted event couldn't be deserialized.
    #[error(transparent)]
    JsonError(#[from] SerdeError),

    /// Decryption failed because the session needed to decrypt the event is
    /// missing.
    #[error("decryption failed because the session to decrypt the message is missing")]
    MissingSession,

    /// Decryption failed because a message with the same index was already
    /// decrypted in this timeline.
    #[error(
        "decryption failed because the message with index {0} was \
        already decrypted in this timeline"
    )]
    DuplicateMessageIndex(u32),

    /// The underlying group session operation returned an error.
    #[error("can't finish Olm group session operation {0}")]
    OlmGroupSession(#[from] OlmGroupSessionError),

    /// The room where a group session should be shared is not encrypted.
    #[error("The room where a group session should be shared is not encrypted")]
    EncryptionNotEnabled,

    /// The storage layer returned an error.
    #[error(transparent)]
    Store(#[from] CryptoStoreError),
}

#[derive(Error, Debug)]
pub enum EventError {
    #[error("the Olm message has a unsupported type")]
    UnsupportedOlmType,

    #[error("the Encrypted message has been encrypted with a unsupported algorithm.")]
    UnsupportedAlgorithm,

    #[error("the provided JSON value isn't an object")]
    NotAnObject,

    #[error("the Encrypted message doesn't contain a ciphertext for our device")]
    MissingCiphertext,

    #[error("the Encrypted message is missing the signing key of the sender")]
    MissingSigningKey,

    #[error("the Encrypted message is missing the sender key")]
    MissingSenderKey,

    #[error("the Encrypted message is missing the field {0}")]
    MissingField(String),

    #[error(
        "the room id of the room key doesn't match the room id of the \
        decrypted event: expected {0}, got {1}"
    )]
    MismatchedRoom(RoomId, RoomId),
}

/// Error type describing failures that can happen while a device keys claim
/// is taken into the device directory.
#[derive(Error, Debug)]
pub enum DeviceError {
    /// The device keys payload was signed badly or not at all.
    #[error(transparent)]
    InvalidSignature(#[from] SignatureError),

    /// The payload belongs to a different user or device than the one it was
    /// advertised for.
    #[error("the device keys belong to a different user or device than advertised")]
    MismatchedPayload,

    /// A known device advertised new identity keys, the original record is
    /// kept.
    #[error("the device {1} of user {0} advertised new identity keys")]
    IdentityChanged(UserId, DeviceIdBox),
}

/// Error type describin different errors that happen when we check or create
/// signatures for a Matrix JSON object.
#[derive(Error, Debug)]
pub enum SignatureError {
    /// The ID of the signing key isn't a valid key ID.
    #[error("the ID of the signing key is invalid")]
    InvalidKeyId(#[from] IdentifierError),

    /// The signing key that should create or check a signature is missing.
    #[error("the signing key is missing from the object that signed the message")]
    MissingSigningKey,

    /// The provided JSON value that was signed and the signature should be
    /// checked isn't a valid JSON object.
    #[error("the provided JSON value isn't an object")]
    NotAnObject,

    /// The provided JSON object doesn't contain a signatures field.
    #[error("the provided JSON object doesn't contain a signatures field")]
    NoSignatureFound,

    /// The JSON object couldn't be serialized into its canonical form.
    #[error("the JSON object can't be converted to canonical JSON")]
    CanonicalJsonError,

    /// The signature couldn't be verified.
    #[error("the signature didn't match the provided key")]
    VerificationError,

    /// The signed object couldn't be deserialized.
    #[error(transparent)]
    JsonError(#[from] SerdeError),
}

impl From<cjson::Error> for SignatureError {
    fn from(_: cjson::Error) -> Self {
        SignatureError::CanonicalJsonError
    }
}

#[derive(Error, Debug)]
pub enum SessionCreationError {
    #[error(
        "Tried to create a new Olm session, but the signed \
        one-time key is missing"
    )]
    OneTimeKeyMissing,
    #[error("Failed to verify the one-time key signature: {0:?}")]
    InvalidSignature(#[from] SignatureError),
    #[error(
        "Tried to create an Olm session, but the device is missing \
        a curve25519 key"
    )]
    DeviceMissingCurveKey,
    #[error("Error creating new Olm session: {0:?}")]
    OlmError(#[from] OlmSessionError),
    #[error("Failed to store the newly created Olm session: {0}")]
    Store(#[from] CryptoStoreError),
}
