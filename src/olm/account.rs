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

use std::{
    collections::BTreeMap,
    convert::{TryFrom, TryInto},
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicI64, Ordering},
        Arc,
    },
    time::Instant,
};

use olm_rs::{
    account::{IdentityKeys, OlmAccount, OneTimeKeys},
    errors::{OlmAccountError, OlmGroupSessionError, OlmSessionError},
    session::PreKeyMessage,
    PicklingMode,
};
use ruma::{
    identifiers::EventEncryptionAlgorithm, DeviceId, DeviceIdBox, DeviceKeyAlgorithm, DeviceKeyId,
    RoomId, UserId,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Mutex;

use super::{
    utility::canonical_json, EncryptionSettings, GroupSessionKey, InboundGroupSession,
    OutboundGroupSession, Session,
};
use crate::{
    error::SignatureError,
    types::{DeviceKeys, SignedOneTimeKey},
};

/// The encryption algorithms a device running this engine supports.
pub(crate) fn supported_algorithms() -> Vec<EventEncryptionAlgorithm> {
    vec![
        EventEncryptionAlgorithm::OlmV1Curve25519AesSha2,
        EventEncryptionAlgorithm::MegolmV1AesSha2,
    ]
}

/// Account holding the long lived identity keys of a device.
///
/// One of these lives for the whole lifetime of a device, it gets persisted
/// after every mutation and is only destroyed when the device is wiped.
#[derive(Clone)]
pub struct Account {
    pub(crate) user_id: Arc<UserId>,
    pub(crate) device_id: Arc<DeviceIdBox>,
    inner: Arc<Mutex<OlmAccount>>,
    pub(crate) identity_keys: Arc<IdentityKeys>,
    shared: Arc<AtomicBool>,
    /// The number of signed one-time keys we have uploaded to the server. If
    /// this is None, no action will be taken. After a sync request the client
    /// needs to set this for us, depending on the count we will suggest the
    /// client to upload new keys.
    uploaded_signed_key_count: Arc<AtomicI64>,
}

impl fmt::Debug for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Account")
            .field("user_id", &self.user_id)
            .field("device_id", &self.device_id)
            .field("curve25519_key", &self.identity_keys.curve25519())
            .field("ed25519_key", &self.identity_keys.ed25519())
            .field("shared", &self.shared())
            .finish()
    }
}

/// The result of a successful inbound pairwise session creation.
#[derive(Debug)]
pub struct InboundCreationResult {
    /// The newly created session.
    pub session: Session,
    /// The plaintext of the pre-key message that created the session.
    pub plaintext: String,
}

impl Account {
    /// Create a fresh account with new identity keys.
    pub fn new(user_id: &UserId, device_id: &DeviceId) -> Self {
        let account = OlmAccount::new();
        let identity_keys = account.parsed_identity_keys();

        Self {
            user_id: Arc::new(user_id.to_owned()),
            device_id: Arc::new(device_id.into()),
            inner: Arc::new(Mutex::new(account)),
            identity_keys: Arc::new(identity_keys),
            shared: Arc::new(AtomicBool::new(false)),
            uploaded_signed_key_count: Arc::new(AtomicI64::new(0)),
        }
    }

    /// The unique user id that owns this account.
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// The unique device id of the device that holds this account.
    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    /// Get the public parts of the identity keys for the account.
    ///
    /// The keys are created once, at the first construction of the account,
    /// and never change afterwards.
    pub fn identity_keys(&self) -> &IdentityKeys {
        &self.identity_keys
    }

    /// Update the count of one-time keys that the server has for us.
    pub(crate) fn update_uploaded_key_count(&self, new_count: u64) {
        let key_count = i64::try_from(new_count).unwrap_or(i64::MAX);
        self.uploaded_signed_key_count
            .store(key_count, Ordering::Relaxed);
    }

    /// Get the count of one-time keys the server still has for us.
    pub(crate) fn uploaded_key_count(&self) -> i64 {
        self.uploaded_signed_key_count.load(Ordering::Relaxed)
    }

    /// Has the account been shared with the server.
    pub fn shared(&self) -> bool {
        self.shared.load(Ordering::Relaxed)
    }

    /// Mark the account as shared.
    ///
    /// Messages shouldn't be encrypted with the session before it has been
    /// shared.
    pub(crate) fn mark_as_shared(&self) {
        self.shared.store(true, Ordering::Relaxed);
    }

    /// Get the one-time keys of the account.
    ///
    /// This can be empty, keys need to be generated first and those that have
    /// been published to the server are no longer listed.
    pub async fn one_time_keys(&self) -> OneTimeKeys {
        self.inner.lock().await.parsed_one_time_keys()
    }

    /// Generate count number of one-time keys.
    pub async fn generate_one_time_keys_helper(&self, count: usize) {
        self.inner.lock().await.generate_one_time_keys(count);
    }

    /// Get the maximum number of one-time keys the account can hold.
    pub async fn max_one_time_keys(&self) -> usize {
        self.inner.lock().await.max_number_of_one_time_keys()
    }

    /// Should account or one-time keys be uploaded to the server.
    pub async fn should_upload_keys(&self) -> bool {
        if !self.shared() {
            return true;
        }

        // If we have a known key count, check that we have more than
        // max_one_time_keys() / 2, otherwise tell the client to upload more.
        let count = self.uploaded_key_count() as u64;
        let max_keys = self.max_one_time_keys().await as u64;
        let key_count = (max_keys / 2).saturating_sub(count);
        key_count > 0
    }

    /// Generate as many one-time keys as the server is missing.
    ///
    /// Returns the number of newly generated one-time keys. If no keys can be
    /// generated returns an empty error.
    pub(crate) async fn generate_one_time_keys(&self) -> Result<u64, ()> {
        let count = self.uploaded_key_count() as u64;
        let max_keys = self.max_one_time_keys().await;
        let max_on_server = (max_keys as u64) / 2;

        if count >= max_on_server {
            return Err(());
        }

        let key_count = max_on_server - count;
        let key_count: usize = key_count.try_into().unwrap_or(max_keys);

        self.generate_one_time_keys_helper(key_count).await;
        Ok(key_count as u64)
    }

    /// Mark the current set of one-time keys as being published.
    pub async fn mark_keys_as_published(&self) {
        self.inner.lock().await.mark_keys_as_published();
    }

    /// Sign the given string using the accounts signing key.
    ///
    /// Returns the signature as a base64 encoded string.
    pub async fn sign(&self, string: &str) -> String {
        self.inner.lock().await.sign(string)
    }

    /// Sign the given JSON object.
    ///
    /// The object is converted to its canonical form, with any `signatures`
    /// and `unsigned` fields removed, before it's signed.
    pub async fn sign_json(&self, json: &Value) -> Result<String, SignatureError> {
        let canonical_json = canonical_json(json)?;
        Ok(self.sign(&canonical_json).await)
    }

    /// Sign the device keys of the account and get them ready for upload.
    pub(crate) async fn device_keys(&self) -> DeviceKeys {
        let identity_keys = self.identity_keys();

        let mut keys = BTreeMap::new();

        keys.insert(
            DeviceKeyId::from_parts(DeviceKeyAlgorithm::Curve25519, &self.device_id),
            identity_keys.curve25519().to_owned(),
        );
        keys.insert(
            DeviceKeyId::from_parts(DeviceKeyAlgorithm::Ed25519, &self.device_id),
            identity_keys.ed25519().to_owned(),
        );

        let device_keys = json!({
            "user_id": &*self.user_id,
            "device_id": &*self.device_id,
            "algorithms": supported_algorithms(),
            "keys": &keys,
        });

        let signature = self
            .sign_json(&device_keys)
            .await
            .expect("Can't serialize device keys to canonical JSON");

        let mut signatures = BTreeMap::new();
        let mut signature_map = BTreeMap::new();
        signature_map.insert(
            DeviceKeyId::from_parts(DeviceKeyAlgorithm::Ed25519, &self.device_id),
            signature,
        );
        signatures.insert((&*self.user_id).clone(), signature_map);

        DeviceKeys {
            user_id: (&*self.user_id).clone(),
            device_id: (&*self.device_id).clone(),
            algorithms: supported_algorithms(),
            keys,
            signatures,
            unsigned: Default::default(),
        }
    }

    /// Generate, sign and prepare one-time keys to be uploaded.
    ///
    /// If no one-time keys need to be uploaded returns an empty error.
    pub(crate) async fn signed_one_time_keys(
        &self,
    ) -> Result<BTreeMap<String, SignedOneTimeKey>, ()> {
        let _ = self.generate_one_time_keys().await?;

        let one_time_keys = self.one_time_keys().await;
        let mut one_time_key_map = BTreeMap::new();

        for (key_id, key) in one_time_keys.curve25519().iter() {
            let key_json = json!({
                "key": key,
            });

            let signature = self
                .sign_json(&key_json)
                .await
                .expect("Can't serialize one-time key to canonical JSON");

            let mut signature_map = BTreeMap::new();
            signature_map.insert(
                DeviceKeyId::from_parts(DeviceKeyAlgorithm::Ed25519, &self.device_id),
                signature,
            );

            let mut signatures = BTreeMap::new();
            signatures.insert((&*self.user_id).clone(), signature_map);

            let signed_key = SignedOneTimeKey {
                key: key.to_owned(),
                signatures,
            };

            one_time_key_map.insert(format!("signed_curve25519:{}", key_id), signed_key);
        }

        Ok(one_time_key_map)
    }

    /// Create a new session with another account given a one-time key.
    ///
    /// Returns the newly created session or a `OlmSessionError` if creating a
    /// session failed.
    ///
    /// # Arguments
    ///
    /// * `their_identity_key` - The other account's curve25519 identity key.
    ///
    /// * `their_one_time_key` - A one-time key the other account published.
    pub async fn create_outbound_session_helper(
        &self,
        their_identity_key: &str,
        their_one_time_key: &str,
    ) -> Result<Session, OlmSessionError> {
        let session = self
            .inner
            .lock()
            .await
            .create_outbound_session(their_identity_key, their_one_time_key)?;

        let now = Instant::now();
        let session_id = session.session_id();

        Ok(Session {
            user_id: self.user_id.clone(),
            device_id: self.device_id.clone(),
            our_identity_keys: self.identity_keys.clone(),
            inner: Arc::new(Mutex::new(session)),
            session_id: Arc::new(session_id),
            sender_key: Arc::new(their_identity_key.to_owned()),
            creation_time: Arc::new(now),
            last_use_time: Arc::new(now),
        })
    }

    /// Create a new session with another account given a pre-key Olm message.
    ///
    /// The one-time keys that were consumed to create the session are removed
    /// from the account as part of this call, callers need to persist the
    /// account before they persist or use the new session.
    ///
    /// # Arguments
    ///
    /// * `their_identity_key` - The other account's curve25519 identity key.
    ///
    /// * `message` - A pre-key Olm message that was sent to us.
    pub async fn create_inbound_session(
        &self,
        their_identity_key: &str,
        message: PreKeyMessage,
    ) -> Result<Session, OlmSessionError> {
        let account = self.inner.lock().await;
        let session = account.create_inbound_session_from(their_identity_key, message)?;

        account
            .remove_one_time_keys(&session)
            .expect(
                "Session was successfully created but the account doesn't hold a matching one-time key",
            );

        let now = Instant::now();
        let session_id = session.session_id();

        Ok(Session {
            user_id: self.user_id.clone(),
            device_id: self.device_id.clone(),
            our_identity_keys: self.identity_keys.clone(),
            inner: Arc::new(Mutex::new(session)),
            session_id: Arc::new(session_id),
            sender_key: Arc::new(their_identity_key.to_owned()),
            creation_time: Arc::new(now),
            last_use_time: Arc::new(now),
        })
    }

    /// Create a new outbound group session for the given room.
    pub(crate) fn create_outbound_group_session(
        &self,
        room_id: &RoomId,
        settings: EncryptionSettings,
    ) -> OutboundGroupSession {
        OutboundGroupSession::new(
            self.device_id.clone(),
            self.identity_keys.clone(),
            room_id,
            settings,
        )
    }

    /// Create the inbound counterpart of a freshly created outbound group
    /// session, so our own messages can be decrypted as well.
    pub(crate) fn create_inbound_mirror(
        &self,
        room_id: &RoomId,
        session_key: GroupSessionKey,
    ) -> Result<InboundGroupSession, OlmGroupSessionError> {
        InboundGroupSession::new(
            self.identity_keys.curve25519(),
            self.identity_keys.ed25519(),
            room_id,
            session_key,
        )
    }

    /// Store the account as a base64 encoded string.
    ///
    /// # Arguments
    ///
    /// * `pickle_mode` - The mode that was used to pickle the account, either
    /// an unencrypted mode or an encrypted using passphrase.
    pub async fn pickle(&self, pickle_mode: PicklingMode) -> PickledAccount {
        let pickle = AccountPickle(self.inner.lock().await.pickle(pickle_mode));

        PickledAccount {
            user_id: (&*self.user_id).clone(),
            device_id: (&*self.device_id).clone(),
            pickle,
            shared: self.shared(),
            uploaded_signed_key_count: self.uploaded_key_count(),
        }
    }

    /// Restore an account from a previously pickled one.
    ///
    /// # Arguments
    ///
    /// * `pickle` - The pickled version of the Account.
    ///
    /// * `pickle_mode` - The mode that was used to pickle the account, either
    /// an unencrypted mode or an encrypted using passphrase.
    pub fn from_pickle(
        pickle: PickledAccount,
        pickle_mode: PicklingMode,
    ) -> Result<Self, OlmAccountError> {
        let account = OlmAccount::unpickle(pickle.pickle.0, pickle_mode)?;
        let identity_keys = account.parsed_identity_keys();

        Ok(Self {
            user_id: Arc::new(pickle.user_id),
            device_id: Arc::new(pickle.device_id),
            inner: Arc::new(Mutex::new(account)),
            identity_keys: Arc::new(identity_keys),
            shared: Arc::new(AtomicBool::new(pickle.shared)),
            uploaded_signed_key_count: Arc::new(AtomicI64::new(pickle.uploaded_signed_key_count)),
        })
    }
}

impl PartialEq for Account {
    fn eq(&self, other: &Self) -> bool {
        self.identity_keys().curve25519() == other.identity_keys().curve25519()
            && self.identity_keys().ed25519() == other.identity_keys().ed25519()
            && self.shared() == other.shared()
    }
}

/// A pickled version of an `Account`.
///
/// Holds all the information that needs to be stored in a database to restore
/// an account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PickledAccount {
    /// The user id of the account owner.
    pub user_id: UserId,
    /// The device id of the account owner.
    pub device_id: DeviceIdBox,
    /// The pickled version of the Olm account.
    pub pickle: AccountPickle,
    /// Was the account shared.
    pub shared: bool,
    /// The number of uploaded one-time keys we have on the server.
    pub uploaded_signed_key_count: i64,
}

/// The typed representation of a base64 encoded string of the Olm account
/// pickle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountPickle(String);

impl From<String> for AccountPickle {
    fn from(pickle_string: String) -> Self {
        AccountPickle(pickle_string)
    }
}

impl AccountPickle {
    /// Get the string representation of the pickle.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}
