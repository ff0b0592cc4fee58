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
    collections::{BTreeMap, HashSet},
    sync::Arc,
};

use olm_rs::session::{OlmMessage, PreKeyMessage};
use ruma::{
    identifiers::EventEncryptionAlgorithm, DeviceId, DeviceIdBox, DeviceKeyId, RoomId, UserId,
};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::{
    error::{
        EventError, MegolmResult, OlmError, OlmResult, SessionCreationError, SignatureError,
    },
    identities::{manager::DeviceDirectory, DeviceKeysIntake, LocalTrust, ReadOnlyDevice},
    olm::{
        Account, GroupSessionKey, IdentityKeys, InboundCreationResult, OneTimeKeys,
        OutboundGroupSession, Session, Utility,
    },
    requests::ToDeviceRequest,
    session_manager::GroupSessionManager,
    store::{CryptoStore, MemoryStore, Result as StoreResult, UserDevices},
    types::{
        DecryptedEvent, DeviceKeys, EncryptedEvent, OlmPayload, OlmV1Curve25519AesSha2Content,
        RoomKeyContent, SignedOneTimeKey, ToDeviceEvent,
    },
};

/// State machine implementation of the per-device encryption engine.
///
/// The machine owns the long lived account and mediates every cryptographic
/// operation a client needs: pairwise channel setup, group session creation
/// and sharing, message encryption and decryption, replay defence and signed
/// JSON attestation.
#[derive(Clone, Debug)]
pub struct OlmMachine {
    /// The unique user id that owns this account.
    user_id: Arc<UserId>,
    /// The unique device id of the device that holds this account.
    device_id: Arc<DeviceIdBox>,
    /// Our underlying Olm Account holding our identity keys.
    account: Account,
    /// Store for the encryption keys.
    /// Persists all the encryption keys so a client can resume the session
    /// without the need to create new keys.
    store: Arc<dyn CryptoStore>,
    /// Manager for the inbound and outbound group sessions.
    group_session_manager: GroupSessionManager,
    /// Directory of the devices we know about.
    device_directory: DeviceDirectory,
}

impl OlmMachine {
    /// Create a new machine with an in-memory store.
    ///
    /// All the keys are lost once the machine is dropped, a persistent store
    /// should be used in production.
    pub fn new(user_id: &UserId, device_id: &DeviceId) -> Self {
        let store: Arc<dyn CryptoStore> = Arc::new(MemoryStore::new());
        let account = Account::new(user_id, device_id);

        Self::with_account(account, store)
    }

    fn with_account(account: Account, store: Arc<dyn CryptoStore>) -> Self {
        let user_id = account.user_id.clone();
        let device_id = account.device_id.clone();

        let group_session_manager = GroupSessionManager::new(account.clone(), store.clone());
        let device_directory =
            DeviceDirectory::new(user_id.clone(), device_id.clone(), store.clone());

        OlmMachine {
            user_id,
            device_id,
            account,
            store,
            group_session_manager,
            device_directory,
        }
    }

    /// Create a new machine backed by the given store.
    ///
    /// If the store already holds an account it is restored, otherwise a
    /// fresh one is created and persisted right away. The identity keys are
    /// therefore stable across restarts.
    pub async fn with_store(
        user_id: &UserId,
        device_id: &DeviceId,
        store: Arc<dyn CryptoStore>,
    ) -> StoreResult<Self> {
        let account = match store.load_account().await? {
            Some(account) => {
                debug!("Restored account");
                account
            }
            None => {
                debug!("Creating a new account");
                let account = Account::new(user_id, device_id);
                store.save_account(account.clone()).await?;
                account
            }
        };

        Ok(Self::with_account(account, store))
    }

    /// Create a new machine backed by a sled store in the given directory.
    #[cfg(feature = "sled_cryptostore")]
    pub async fn with_sled_store(
        user_id: &UserId,
        device_id: &DeviceId,
        path: impl AsRef<std::path::Path>,
        passphrase: Option<&str>,
    ) -> StoreResult<Self> {
        let store = crate::store::SledStore::open_with_passphrase(path, passphrase)?;
        Self::with_store(user_id, device_id, Arc::new(store)).await
    }

    /// The unique user id that owns this machine.
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// The unique device id that identifies this machine.
    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    /// Get the public parts of our identity keys.
    pub fn identity_keys(&self) -> &IdentityKeys {
        self.account.identity_keys()
    }

    /// Get our signed device keys, ready to be advertised.
    pub async fn device_keys(&self) -> DeviceKeys {
        self.account.device_keys().await
    }

    /// Sign the given message using our fingerprint key.
    ///
    /// Returns the signature as a base64 encoded string.
    pub async fn sign(&self, message: &str) -> String {
        self.account.sign(message).await
    }

    /// Sign the canonical form of the given JSON object.
    pub async fn sign_json(&self, json: &Value) -> Result<String, SignatureError> {
        self.account.sign_json(json).await
    }

    /// Verify a signed JSON object that embeds its signatures.
    ///
    /// The object must have a signatures key associated with an object of
    /// the form `user_id: {key_id: signature}`.
    pub fn verify_json(
        &self,
        user_id: &UserId,
        key_id: &DeviceKeyId,
        signing_key: &str,
        json: &mut Value,
    ) -> Result<(), SignatureError> {
        Utility::new().verify_json(user_id, key_id, signing_key, json)
    }

    /// Verify a detached signature over the canonical form of the given JSON
    /// object.
    pub fn verify_json_signature(
        &self,
        signing_key: &str,
        json: &Value,
        signature: &str,
    ) -> Result<(), SignatureError> {
        Utility::new().verify_json_signature(signing_key, json, signature)
    }

    /// Get the base64 encoded SHA-256 hash of the UTF-8 bytes of the given
    /// message.
    pub fn sha256(&self, message: &str) -> String {
        Utility::new().sha256(message)
    }

    /// Get the one-time keys that were generated but not yet published.
    pub async fn one_time_keys(&self) -> OneTimeKeys {
        self.account.one_time_keys().await
    }

    /// Generate the given number of one-time keys and persist the account.
    pub async fn generate_one_time_keys(&self, count: usize) -> StoreResult<()> {
        self.account.generate_one_time_keys_helper(count).await;
        self.store.save_account(self.account.clone()).await
    }

    /// Mark all our currently unpublished one-time keys as published.
    pub async fn mark_keys_as_published(&self) -> StoreResult<()> {
        self.account.mark_keys_as_published().await;
        self.store.save_account(self.account.clone()).await
    }

    /// The maximum number of one-time keys our account can hold.
    pub async fn max_one_time_keys(&self) -> usize {
        self.account.max_one_time_keys().await
    }

    /// Should device and one-time keys be advertised to the server.
    pub async fn should_upload_keys(&self) -> bool {
        self.account.should_upload_keys().await
    }

    /// Get the key payloads that need to be advertised.
    ///
    /// Returns the signed device keys if they weren't published before and a
    /// batch of freshly generated, signed one-time keys. The empty tuple
    /// means nothing needs to be uploaded right now.
    pub async fn keys_for_upload(
        &self,
    ) -> StoreResult<(Option<DeviceKeys>, Option<BTreeMap<String, SignedOneTimeKey>>)> {
        if !self.should_upload_keys().await {
            return Ok((None, None));
        }

        let device_keys = if !self.account.shared() {
            Some(self.account.device_keys().await)
        } else {
            None
        };

        let one_time_keys = self.account.signed_one_time_keys().await.ok();

        if one_time_keys.is_some() {
            // Key generation mutated the account.
            self.store.save_account(self.account.clone()).await?;
        }

        Ok((device_keys, one_time_keys))
    }

    /// Receive the successful response of a key advertisement.
    ///
    /// Marks the account as shared and all the advertised one-time keys as
    /// published.
    ///
    /// # Arguments
    ///
    /// * `one_time_key_count` - The count of signed one-time keys the server
    /// now holds for us.
    pub async fn receive_keys_upload_response(&self, one_time_key_count: u64) -> StoreResult<()> {
        if !self.account.shared() {
            debug!("Marking account as shared");
        }
        self.account.mark_as_shared();

        debug!(
            "Updated uploaded one-time key count {} -> {}, marking keys as published",
            self.account.uploaded_key_count(),
            one_time_key_count,
        );
        self.account.update_uploaded_key_count(one_time_key_count);
        self.account.mark_keys_as_published().await;

        self.store.save_account(self.account.clone()).await
    }

    /// Create a new pairwise session by consuming a one-time key the other
    /// device published.
    ///
    /// Returns the id of the new session.
    ///
    /// # Arguments
    ///
    /// * `their_identity_key` - The curve25519 identity key of the other
    /// device.
    ///
    /// * `their_one_time_key` - A curve25519 one-time key the other device
    /// published.
    pub async fn create_outbound_session(
        &self,
        their_identity_key: &str,
        their_one_time_key: &str,
    ) -> OlmResult<String> {
        let session = self
            .account
            .create_outbound_session_helper(their_identity_key, their_one_time_key)
            .await?;

        let session_id = session.session_id().to_owned();
        info!(
            "Created a new outbound Olm session with the device owning the key {}",
            their_identity_key
        );

        self.store.save_session(session).await?;

        Ok(session_id)
    }

    /// Create a new pairwise session with the given device, verifying the
    /// signature of the claimed one-time key first.
    pub async fn create_session_for_device(
        &self,
        device: &ReadOnlyDevice,
        one_time_key: &SignedOneTimeKey,
    ) -> Result<String, SessionCreationError> {
        device.verify_one_time_key(one_time_key).map_err(|e| {
            warn!(
                "Failed to verify the one-time key signatures for {} {}",
                device.user_id(),
                device.device_id()
            );
            e
        })?;

        let curve_key = device
            .get_key(ruma::DeviceKeyAlgorithm::Curve25519)
            .ok_or(SessionCreationError::DeviceMissingCurveKey)?;

        let session = self
            .account
            .create_outbound_session_helper(curve_key, &one_time_key.key)
            .await?;

        let session_id = session.session_id().to_owned();
        info!(
            "Created a new outbound Olm session for {} {}",
            device.user_id(),
            device.device_id()
        );

        self.store.save_session(session).await?;

        Ok(session_id)
    }

    /// Create a new pairwise session from a received pre-key message.
    ///
    /// The consumed one-time keys are removed and the account is persisted
    /// before the new session touches the store. A crash in between loses
    /// the session but never republishes a used one-time key.
    ///
    /// # Arguments
    ///
    /// * `their_identity_key` - The curve25519 identity key of the device
    /// that sent us the pre-key message.
    ///
    /// * `message` - The pre-key message itself.
    pub async fn create_inbound_session(
        &self,
        their_identity_key: &str,
        message: PreKeyMessage,
    ) -> OlmResult<InboundCreationResult> {
        let mut session = self
            .account
            .create_inbound_session(their_identity_key, message.clone())
            .await?;

        self.store.save_account(self.account.clone()).await?;

        let plaintext = session.decrypt(OlmMessage::PreKey(message)).await?;

        self.store.save_session(session.clone()).await?;

        Ok(InboundCreationResult { session, plaintext })
    }

    /// Get the ids of all the pairwise sessions we share with the device
    /// owning the given identity key, in lexicographic order.
    pub async fn session_ids(&self, their_identity_key: &str) -> StoreResult<Vec<String>> {
        let mut ids = Vec::new();

        if let Some(sessions) = self.store.get_sessions(their_identity_key).await? {
            for session in &*sessions.lock().await {
                ids.push(session.session_id().to_owned());
            }
        }

        ids.sort();

        Ok(ids)
    }

    /// Pick the session that should be used to encrypt for the given device.
    ///
    /// Both sides need to settle on the same session without coordinating,
    /// so the lexicographically smallest session id wins.
    pub async fn preferred_session(&self, their_identity_key: &str) -> StoreResult<Option<String>> {
        Ok(self
            .session_ids(their_identity_key)
            .await?
            .into_iter()
            .next())
    }

    async fn get_session(
        &self,
        their_identity_key: &str,
        session_id: &str,
    ) -> StoreResult<Option<Session>> {
        if let Some(sessions) = self.store.get_sessions(their_identity_key).await? {
            let sessions = sessions.lock().await;
            Ok(sessions
                .iter()
                .find(|s| s.session_id() == session_id)
                .cloned())
        } else {
            Ok(None)
        }
    }

    /// Check if the given pre-key message was encrypted for the given
    /// session.
    pub async fn matches_inbound_session(
        &self,
        their_identity_key: &str,
        session_id: &str,
        message: PreKeyMessage,
    ) -> OlmResult<bool> {
        if let Some(session) = self.get_session(their_identity_key, session_id).await? {
            Ok(session.matches(their_identity_key, message).await?)
        } else {
            Ok(false)
        }
    }

    /// Encrypt the given plaintext with a specific pairwise session.
    ///
    /// Returns `None` when no session with the given id exists. On success
    /// the ratcheted session is persisted.
    pub async fn encrypt_session(
        &self,
        their_identity_key: &str,
        session_id: &str,
        plaintext: &str,
    ) -> OlmResult<Option<OlmMessage>> {
        if let Some(mut session) = self.get_session(their_identity_key, session_id).await? {
            let message = session.encrypt_helper(plaintext).await;
            self.store.save_session(session).await?;
            Ok(Some(message))
        } else {
            Ok(None)
        }
    }

    /// Decrypt the given message with a specific pairwise session.
    ///
    /// Returns `None` when no session with the given id exists. On success
    /// the ratcheted session is persisted.
    pub async fn decrypt_session(
        &self,
        their_identity_key: &str,
        session_id: &str,
        message: OlmMessage,
    ) -> OlmResult<Option<String>> {
        if let Some(mut session) = self.get_session(their_identity_key, session_id).await? {
            let plaintext = session.decrypt(message).await?;
            self.store.save_session(session).await?;
            Ok(Some(plaintext))
        } else {
            Ok(None)
        }
    }

    /// Encrypt an event for the given device over the preferred pairwise
    /// session.
    pub async fn encrypt_for_device(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        event_type: &str,
        content: Value,
    ) -> OlmResult<OlmV1Curve25519AesSha2Content> {
        let device = self
            .store
            .get_device(user_id, device_id)
            .await?
            .ok_or(OlmError::MissingSession)?;

        if !device
            .algorithms()
            .contains(&EventEncryptionAlgorithm::OlmV1Curve25519AesSha2)
        {
            warn!(
                "The device {} of user {} doesn't support any of our encryption algorithms",
                device_id, user_id
            );
            return Err(EventError::UnsupportedAlgorithm.into());
        }

        let their_identity_key = device
            .get_key(ruma::DeviceKeyAlgorithm::Curve25519)
            .ok_or(EventError::MissingSenderKey)?
            .to_owned();

        let session_id = self
            .preferred_session(&their_identity_key)
            .await?
            .ok_or(OlmError::MissingSession)?;

        let mut session = self
            .get_session(&their_identity_key, &session_id)
            .await?
            .ok_or(OlmError::MissingSession)?;

        let content = session.encrypt(&device, event_type, content).await?;
        self.store.save_session(session).await?;

        Ok(content)
    }

    async fn try_decrypt_olm_message(
        &self,
        sender_key: &str,
        message: &OlmMessage,
    ) -> OlmResult<Option<String>> {
        let sessions = if let Some(s) = self.store.get_sessions(sender_key).await? {
            s.lock().await.clone()
        } else {
            return Ok(None);
        };

        for mut session in sessions {
            let mut matches = false;

            if let OlmMessage::PreKey(m) = &message {
                matches = session.matches(sender_key, m.clone()).await?;

                if !matches {
                    continue;
                }
            }

            match session.decrypt(message.clone()).await {
                Ok(plaintext) => {
                    self.store.save_session(session).await?;
                    return Ok(Some(plaintext));
                }
                Err(_) => {
                    if matches {
                        return Err(OlmError::SessionWedged(sender_key.to_owned()));
                    }
                }
            }
        }

        Ok(None)
    }

    async fn decrypt_olm_message(
        &self,
        sender_key: &str,
        message: OlmMessage,
    ) -> OlmResult<String> {
        if let Some(plaintext) = self.try_decrypt_olm_message(sender_key, &message).await? {
            return Ok(plaintext);
        }

        match message {
            // A normal message that no known session could decrypt, the
            // session is wedged and needs to be recreated by the other side.
            OlmMessage::Message(_) => Err(OlmError::SessionWedged(sender_key.to_owned())),
            OlmMessage::PreKey(message) => {
                let result = self.create_inbound_session(sender_key, message).await?;
                Ok(result.plaintext)
            }
        }
    }

    async fn decrypt_olm_content(
        &self,
        content: &OlmV1Curve25519AesSha2Content,
    ) -> OlmResult<OlmPayload> {
        let own_key = self.identity_keys().curve25519();
        let ciphertext = content
            .ciphertext
            .get(own_key)
            .ok_or(EventError::MissingCiphertext)?;

        let message = OlmMessage::from_type_and_ciphertext(
            ciphertext.message_type.into(),
            ciphertext.body.clone(),
        )
        .map_err(|_| EventError::UnsupportedOlmType)?;

        let plaintext = self
            .decrypt_olm_message(&content.sender_key, message)
            .await?;

        debug!("Successfully decrypted an Olm message");

        Ok(serde_json::from_str(&plaintext)?)
    }

    /// Decrypt a pairwise encrypted to-device event.
    ///
    /// Returns the decrypted payload without acting on it.
    pub async fn decrypt_to_device_event(&self, event: &ToDeviceEvent) -> OlmResult<OlmPayload> {
        let content: OlmV1Curve25519AesSha2Content =
            serde_json::from_value(event.content.clone())?;

        if content.algorithm != EventEncryptionAlgorithm::OlmV1Curve25519AesSha2 {
            warn!("Error, unsupported encryption algorithm");
            return Err(EventError::UnsupportedAlgorithm.into());
        }

        self.decrypt_olm_content(&content).await
    }

    /// Receive a to-device event from the transport.
    ///
    /// Encrypted events are decrypted, a transported `m.room_key` installs
    /// the announced inbound group session. The decrypted payload is handed
    /// back to the caller.
    pub async fn receive_to_device_event(&self, event: &ToDeviceEvent) -> OlmResult<OlmPayload> {
        info!("Decrypting a to-device event");

        let content: OlmV1Curve25519AesSha2Content =
            serde_json::from_value(event.content.clone())?;

        if content.algorithm != EventEncryptionAlgorithm::OlmV1Curve25519AesSha2 {
            warn!("Error, unsupported encryption algorithm");
            return Err(EventError::UnsupportedAlgorithm.into());
        }

        let payload = self.decrypt_olm_content(&content).await?;

        self.handle_decrypted_to_device_event(&content.sender_key, &payload)
            .await?;

        Ok(payload)
    }

    async fn handle_decrypted_to_device_event(
        &self,
        sender_key: &str,
        payload: &OlmPayload,
    ) -> OlmResult<()> {
        match payload.event_type.as_str() {
            "m.room_key" => {
                let content: RoomKeyContent = serde_json::from_value(payload.content.clone())?;
                self.group_session_manager
                    .receive_room_key(sender_key, payload.keys.clone(), content)
                    .await?;
                Ok(())
            }
            _ => {
                debug!(
                    "Received a decrypted to-device event of the unhandled type {}",
                    payload.event_type
                );
                Ok(())
            }
        }
    }

    /// Create a new outbound group session for the given room.
    ///
    /// The session lives in memory only, it is never persisted. Restarting
    /// the process discards it, which forces a rotation and a re-share of
    /// the fresh session key.
    pub async fn create_outbound_group_session(&self, room_id: &RoomId) -> MegolmResult<String> {
        self.group_session_manager
            .create_outbound_group_session(room_id, Default::default())
            .await
    }

    /// Get the active outbound group session of the given room, if any.
    pub fn outbound_group_session(&self, room_id: &RoomId) -> Option<OutboundGroupSession> {
        self.group_session_manager.get_outbound_group_session(room_id)
    }

    /// Discard the outbound group session of the given room.
    ///
    /// The next `share_group_session()` call creates and shares a fresh one.
    pub fn invalidate_group_session(&self, room_id: &RoomId) -> bool {
        self.group_session_manager.invalidate_group_session(room_id)
    }

    /// Encrypt the current room key of the given room for every device of
    /// the given users.
    ///
    /// Blocked devices never receive the key.
    pub async fn share_group_session<'a, I>(
        &self,
        room_id: &RoomId,
        users: I,
    ) -> OlmResult<Vec<ToDeviceRequest>>
    where
        I: IntoIterator<Item = &'a UserId>,
    {
        self.group_session_manager
            .share_group_session(room_id, users)
            .await
    }

    /// Encrypt a room event with the room's outbound group session.
    pub async fn encrypt_room_event(
        &self,
        room_id: &RoomId,
        event_type: &str,
        content: Value,
    ) -> MegolmResult<crate::types::MegolmV1AesSha2Content> {
        self.group_session_manager
            .encrypt(room_id, event_type, content)
            .await
    }

    /// Decrypt a group encrypted room event.
    ///
    /// # Arguments
    ///
    /// * `event` - The encrypted room event.
    ///
    /// * `timeline` - The timeline the event is decrypted for. Each message
    /// index decrypts at most once per timeline, `None` skips the replay
    /// check.
    pub async fn decrypt_room_event(
        &self,
        event: &EncryptedEvent,
        timeline: Option<&str>,
    ) -> MegolmResult<DecryptedEvent> {
        self.group_session_manager
            .decrypt_group_event(event, timeline)
            .await
    }

    /// Install an inbound group session that was announced to us.
    ///
    /// A session that is already known for the given sender key and session
    /// id is never replaced, see `GroupSessionManager` for the reasoning.
    pub async fn add_inbound_group_session(
        &self,
        session_id: &str,
        session_key: GroupSessionKey,
        room_id: &RoomId,
        sender_key: &str,
        keys_claimed: BTreeMap<ruma::DeviceKeyAlgorithm, String>,
    ) -> StoreResult<bool> {
        self.group_session_manager
            .add_inbound_group_session(session_id, session_key, room_id, sender_key, keys_claimed)
            .await
    }

    /// Permanently remove an inbound group session from the store.
    pub async fn remove_inbound_group_session(
        &self,
        sender_key: &str,
        session_id: &str,
    ) -> StoreResult<()> {
        self.group_session_manager
            .remove_inbound_group_session(sender_key, session_id)
            .await
    }

    /// Drop the replay bookkeeping of the given timeline.
    ///
    /// Re-decrypting the timeline's events is legitimate afterwards, used
    /// when a timeline view gets discarded and rebuilt.
    pub fn reset_replay_detection(&self, timeline: &str) {
        self.group_session_manager.reset_replay_detection(timeline)
    }

    /// Receive a batch of device key claims for the given user.
    ///
    /// Invalid claims are dropped and reported in the returned intake.
    pub async fn receive_device_keys(
        &self,
        user_id: &UserId,
        device_keys: &[DeviceKeys],
    ) -> StoreResult<DeviceKeysIntake> {
        self.device_directory
            .receive_device_keys(user_id, device_keys)
            .await
    }

    /// Get a device we know about.
    pub async fn get_device(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> StoreResult<Option<ReadOnlyDevice>> {
        self.device_directory.get_device(user_id, device_id).await
    }

    /// Get the device of the given user that owns the given curve25519
    /// identity key, if we know about one.
    pub async fn get_device_by_identity_key(
        &self,
        user_id: &UserId,
        sender_key: &str,
    ) -> StoreResult<Option<ReadOnlyDevice>> {
        self.device_directory
            .get_device_by_identity_key(user_id, sender_key)
            .await
    }

    /// Get all the devices we know for the given user.
    pub async fn get_user_devices(&self, user_id: &UserId) -> StoreResult<UserDevices> {
        self.device_directory.get_user_devices(user_id).await
    }

    /// Set the local trust state of a device.
    pub async fn set_device_trust(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        trust_state: LocalTrust,
    ) -> StoreResult<Option<ReadOnlyDevice>> {
        self.device_directory
            .set_device_trust(user_id, device_id, trust_state)
            .await
    }

    /// Update the set of tracked users.
    ///
    /// Newly tracked users are marked as needing a device list refresh.
    pub async fn update_tracked_users<'a, I>(&self, users: I)
    where
        I: IntoIterator<Item = &'a UserId>,
    {
        for user in users {
            if self.store.is_user_tracked(user) {
                continue;
            }

            if let Err(e) = self.store.update_tracked_user(user, true).await {
                warn!("Error storing users for tracking {}", e);
            }
        }
    }

    /// Should the device lists of some users be refreshed.
    pub fn should_query_keys(&self) -> bool {
        !self.store.users_for_key_query().is_empty()
    }

    /// Get the set of users whose device lists need a refresh.
    pub fn users_for_key_query(&self) -> HashSet<UserId> {
        self.store.users_for_key_query()
    }

    /// Wait until every store write issued so far is durable.
    pub async fn flush_store(&self) -> StoreResult<()> {
        self.store.flush().await
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use matches::assert_matches;
    use olm_rs::session::OlmMessage;
    use ruma::{room_id, user_id, DeviceId, DeviceIdBox, DeviceKeyAlgorithm, DeviceKeyId, UserId};
    use serde_json::json;

    use super::OlmMachine;
    use crate::{
        error::{EventError, MegolmError},
        identities::LocalTrust,
        store::{CryptoStore, MemoryStore},
        types::{EncryptedEvent, EncryptedEventContent, ToDeviceEvent},
    };

    fn alice_id() -> UserId {
        user_id!("@alice:example.org")
    }

    fn alice_device_id() -> Box<DeviceId> {
        "ALICEDEVICE".into()
    }

    fn bob_id() -> UserId {
        user_id!("@bob:example.org")
    }

    fn bob_device_id() -> Box<DeviceId> {
        "BOBDEVICE".into()
    }

    fn alice_machine() -> OlmMachine {
        OlmMachine::new(&alice_id(), &alice_device_id())
    }

    fn bob_machine() -> OlmMachine {
        OlmMachine::new(&bob_id(), &bob_device_id())
    }

    /// Create an Alice and Bob machine that know each other's devices and
    /// share an established Olm session.
    async fn get_machine_pair_with_session() -> (OlmMachine, OlmMachine) {
        let alice = alice_machine();
        let bob = bob_machine();

        alice
            .receive_device_keys(&bob_id(), &[bob.device_keys().await])
            .await
            .unwrap();
        bob.receive_device_keys(&alice_id(), &[alice.device_keys().await])
            .await
            .unwrap();

        let bob_device = alice
            .get_device(&bob_id(), &bob_device_id())
            .await
            .unwrap()
            .unwrap();

        let one_time_keys = bob.account.signed_one_time_keys().await.unwrap();
        let one_time_key = one_time_keys.values().next().unwrap();

        alice
            .create_session_for_device(&bob_device, one_time_key)
            .await
            .unwrap();

        bob.mark_keys_as_published().await.unwrap();

        (alice, bob)
    }

    /// Let Alice create a group session for the room and deliver the room
    /// key to Bob through a to-device message.
    async fn share_room_key(alice: &OlmMachine, bob: &OlmMachine, room_id: &ruma::RoomId) {
        let requests = alice
            .share_group_session(room_id, [bob_id()].iter())
            .await
            .unwrap();

        assert_eq!(requests.len(), 1);

        let content = requests[0]
            .messages
            .get(&bob_id())
            .unwrap()
            .get(&DeviceIdBox::from("BOBDEVICE"))
            .unwrap()
            .clone();

        let event = ToDeviceEvent {
            sender: alice_id(),
            event_type: "m.room.encrypted".to_owned(),
            content,
        };

        let payload = bob.receive_to_device_event(&event).await.unwrap();
        assert_eq!(payload.event_type, "m.room_key");
    }

    #[tokio::test]
    async fn create_olm_machine() {
        let machine = alice_machine();
        assert!(machine.should_upload_keys().await);
    }

    #[tokio::test]
    async fn receive_keys_upload_response() {
        let machine = alice_machine();
        let max_keys = machine.max_one_time_keys().await as u64;

        assert!(machine.should_upload_keys().await);

        machine.receive_keys_upload_response(10).await.unwrap();
        assert!(machine.should_upload_keys().await);

        machine
            .receive_keys_upload_response(max_keys / 2)
            .await
            .unwrap();
        assert!(!machine.should_upload_keys().await);
    }

    #[tokio::test]
    async fn one_time_key_handling() {
        let machine = alice_machine();

        machine.generate_one_time_keys(5).await.unwrap();
        assert_eq!(machine.one_time_keys().await.curve25519().len(), 5);

        machine.mark_keys_as_published().await.unwrap();
        assert!(machine.one_time_keys().await.curve25519().is_empty());
    }

    #[tokio::test]
    async fn device_key_signing() {
        let machine = alice_machine();

        let (device_keys, one_time_keys) = machine.keys_for_upload().await.unwrap();
        let ed25519_key = machine.identity_keys().ed25519().to_owned();

        let mut device_keys = serde_json::to_value(device_keys.unwrap()).unwrap();
        machine
            .verify_json(
                machine.user_id(),
                &DeviceKeyId::from_parts(DeviceKeyAlgorithm::Ed25519, machine.device_id()),
                &ed25519_key,
                &mut device_keys,
            )
            .unwrap();

        let mut one_time_key =
            serde_json::to_value(one_time_keys.unwrap().values().next().unwrap()).unwrap();
        machine
            .verify_json(
                machine.user_id(),
                &DeviceKeyId::from_parts(DeviceKeyAlgorithm::Ed25519, machine.device_id()),
                &ed25519_key,
                &mut one_time_key,
            )
            .unwrap();
    }

    #[tokio::test]
    async fn invalid_signature() {
        let machine = alice_machine();

        let (device_keys, _) = machine.keys_for_upload().await.unwrap();
        let mut device_keys = serde_json::to_value(device_keys.unwrap()).unwrap();

        let ret = machine.verify_json(
            machine.user_id(),
            &DeviceKeyId::from_parts(DeviceKeyAlgorithm::Ed25519, machine.device_id()),
            "fake_key",
            &mut device_keys,
        );
        assert!(ret.is_err());
    }

    #[tokio::test]
    async fn pairwise_session_creation_and_round_trip() {
        let alice = alice_machine();
        let bob = bob_machine();

        bob.generate_one_time_keys(1).await.unwrap();
        let one_time_keys = bob.one_time_keys().await;
        let (_, one_time_key) = one_time_keys.curve25519().iter().next().unwrap();

        let bob_curve = bob.identity_keys().curve25519().to_owned();
        let alice_curve = alice.identity_keys().curve25519().to_owned();

        let session_id = alice
            .create_outbound_session(&bob_curve, one_time_key)
            .await
            .unwrap();

        assert_eq!(
            alice.preferred_session(&bob_curve).await.unwrap(),
            Some(session_id.clone())
        );

        let message = alice
            .encrypt_session(&bob_curve, &session_id, "It's a secret to everybody")
            .await
            .unwrap()
            .unwrap();

        let prekey_message = match message.clone() {
            OlmMessage::PreKey(m) => m,
            OlmMessage::Message(_) => panic!("Incorrect message type"),
        };

        let result = bob
            .create_inbound_session(&alice_curve, prekey_message.clone())
            .await
            .unwrap();

        assert_eq!(result.plaintext, "It's a secret to everybody");
        assert_eq!(result.session.session_id(), session_id);

        // The consumed one-time key is gone from the pool.
        assert!(bob.one_time_keys().await.curve25519().is_empty());

        assert!(bob
            .matches_inbound_session(&alice_curve, &session_id, prekey_message)
            .await
            .unwrap());

        // And the channel works in both directions now.
        let reply = bob
            .encrypt_session(&alice_curve, &session_id, "Hello Alice")
            .await
            .unwrap()
            .unwrap();

        let plaintext = alice
            .decrypt_session(&bob_curve, &session_id, reply)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(plaintext, "Hello Alice");
    }

    #[tokio::test]
    async fn group_encryption_round_trip() {
        let (alice, bob) = get_machine_pair_with_session().await;
        let room_id = room_id!("!test:example.org");

        share_room_key(&alice, &bob, &room_id).await;

        let content = alice
            .encrypt_room_event(
                &room_id,
                "m.room.message",
                json!({"msgtype": "m.text", "body": "Hello I'm Alice!"}),
            )
            .await
            .unwrap();

        let event = EncryptedEvent {
            sender: alice_id(),
            room_id: room_id.clone(),
            content: EncryptedEventContent::MegolmV1AesSha2(content),
            event_id: Some("$event1".to_owned()),
        };

        let decrypted = bob
            .decrypt_room_event(&event, Some("timeline"))
            .await
            .unwrap();

        assert_eq!(decrypted.event["content"]["body"], "Hello I'm Alice!");
        assert_eq!(decrypted.event["type"], "m.room.message");
        assert_eq!(decrypted.message_index, 0);
        assert_eq!(
            decrypted.keys_proved.get(&DeviceKeyAlgorithm::Curve25519),
            Some(&alice.identity_keys().curve25519().to_owned())
        );
        assert_eq!(
            decrypted.keys_claimed.get(&DeviceKeyAlgorithm::Ed25519),
            Some(&alice.identity_keys().ed25519().to_owned())
        );

        // Feeding the identical ciphertext into the same timeline is replay.
        assert_matches!(
            bob.decrypt_room_event(&event, Some("timeline")).await,
            Err(MegolmError::DuplicateMessageIndex(0))
        );

        // Outside of any timeline the decryption is legitimate.
        assert!(bob.decrypt_room_event(&event, None).await.is_ok());

        // As it is after the timeline was rebuilt.
        bob.reset_replay_detection("timeline");
        assert!(bob
            .decrypt_room_event(&event, Some("timeline"))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn room_binding_is_enforced() {
        let (alice, bob) = get_machine_pair_with_session().await;
        let room_id = room_id!("!test:example.org");

        share_room_key(&alice, &bob, &room_id).await;

        let content = alice
            .encrypt_room_event(&room_id, "m.room.message", json!({"body": "secret"}))
            .await
            .unwrap();

        let rerouted = EncryptedEvent {
            sender: alice_id(),
            room_id: room_id!("!other:example.org"),
            content: EncryptedEventContent::MegolmV1AesSha2(content.clone()),
            event_id: None,
        };

        assert_matches!(
            bob.decrypt_room_event(&rerouted, None).await,
            Err(MegolmError::EventError(EventError::MismatchedRoom(_, _)))
        );

        // The event still decrypts in the room the session was bound to.
        let event = EncryptedEvent {
            sender: alice_id(),
            room_id: room_id.clone(),
            content: EncryptedEventContent::MegolmV1AesSha2(content),
            event_id: None,
        };
        assert!(bob.decrypt_room_event(&event, None).await.is_ok());
    }

    #[tokio::test]
    async fn unknown_sessions_are_reported() {
        let (alice, bob) = get_machine_pair_with_session().await;
        let room_id = room_id!("!test:example.org");

        share_room_key(&alice, &bob, &room_id).await;

        let content = alice
            .encrypt_room_event(&room_id, "m.room.message", json!({"body": "secret"}))
            .await
            .unwrap();

        let event = EncryptedEvent {
            sender: alice_id(),
            room_id: room_id.clone(),
            content: EncryptedEventContent::MegolmV1AesSha2(content),
            event_id: None,
        };

        // A freshly logged-in device never saw the room key.
        let new_device: DeviceIdBox = "NEWDEVICE".into();
        let new_bob = OlmMachine::new(&bob_id(), &new_device);
        assert_matches!(
            new_bob.decrypt_room_event(&event, None).await,
            Err(MegolmError::MissingSession)
        );

        // The device that received the key still decrypts fine.
        assert!(bob.decrypt_room_event(&event, None).await.is_ok());
    }

    #[tokio::test]
    async fn known_sessions_are_never_replaced() {
        let (alice, bob) = get_machine_pair_with_session().await;
        let room_id = room_id!("!test:example.org");

        share_room_key(&alice, &bob, &room_id).await;

        let content = alice
            .encrypt_room_event(&room_id, "m.room.message", json!({"body": "M1"}))
            .await
            .unwrap();

        let outbound = alice.outbound_group_session(&room_id).unwrap();
        assert_eq!(outbound.message_index().await, 1);

        // A replayed room key exported at the advanced ratchet index must
        // not overwrite the session Bob already has.
        let mut keys_claimed = std::collections::BTreeMap::new();
        keys_claimed.insert(
            DeviceKeyAlgorithm::Ed25519,
            alice.identity_keys().ed25519().to_owned(),
        );

        let added = bob
            .add_inbound_group_session(
                outbound.session_id(),
                outbound.session_key().await,
                &room_id,
                alice.identity_keys().curve25519(),
                keys_claimed,
            )
            .await
            .unwrap();
        assert!(!added);

        // M1 still decrypts with the original ratchet state.
        let event = EncryptedEvent {
            sender: alice_id(),
            room_id: room_id.clone(),
            content: EncryptedEventContent::MegolmV1AesSha2(content),
            event_id: None,
        };
        let decrypted = bob.decrypt_room_event(&event, None).await.unwrap();
        assert_eq!(decrypted.event["content"]["body"], "M1");
    }

    #[tokio::test]
    async fn blocked_devices_are_skipped_when_sharing() {
        let (alice, bob) = get_machine_pair_with_session().await;
        let room_id = room_id!("!test:example.org");

        share_room_key(&alice, &bob, &room_id).await;

        alice
            .set_device_trust(&bob_id(), &bob_device_id(), LocalTrust::Blocked)
            .await
            .unwrap();
        alice.invalidate_group_session(&room_id);

        let requests = alice
            .share_group_session(&room_id, [bob_id()].iter())
            .await
            .unwrap();
        let message_count: usize = requests.iter().map(|r| r.message_count()).sum();
        assert_eq!(message_count, 0);

        // Bob can't read messages that were encrypted with the rotated
        // session.
        let content = alice
            .encrypt_room_event(&room_id, "m.room.message", json!({"body": "M2"}))
            .await
            .unwrap();
        let event = EncryptedEvent {
            sender: alice_id(),
            room_id: room_id.clone(),
            content: EncryptedEventContent::MegolmV1AesSha2(content),
            event_id: None,
        };
        assert_matches!(
            bob.decrypt_room_event(&event, None).await,
            Err(MegolmError::MissingSession)
        );

        // Unblocking and rotating makes Bob readable again.
        alice
            .set_device_trust(&bob_id(), &bob_device_id(), LocalTrust::Verified)
            .await
            .unwrap();
        alice.invalidate_group_session(&room_id);

        share_room_key(&alice, &bob, &room_id).await;

        let content = alice
            .encrypt_room_event(&room_id, "m.room.message", json!({"body": "M3"}))
            .await
            .unwrap();
        let event = EncryptedEvent {
            sender: alice_id(),
            room_id,
            content: EncryptedEventContent::MegolmV1AesSha2(content),
            event_id: None,
        };
        let decrypted = bob.decrypt_room_event(&event, None).await.unwrap();
        assert_eq!(decrypted.event["content"]["body"], "M3");
    }

    #[tokio::test]
    async fn back_pagination_decrypts_in_reverse_order() {
        let (alice, bob) = get_machine_pair_with_session().await;
        let room_id = room_id!("!test:example.org");

        share_room_key(&alice, &bob, &room_id).await;

        let mut events = Vec::new();

        for i in 0..5 {
            let body = format!("message {}", i);
            let content = alice
                .encrypt_room_event(&room_id, "m.room.message", json!({ "body": body }))
                .await
                .unwrap();

            events.push(EncryptedEvent {
                sender: alice_id(),
                room_id: room_id.clone(),
                content: EncryptedEventContent::MegolmV1AesSha2(content),
                event_id: Some(format!("$event{}", i)),
            });
        }

        // Paginating backwards hands us the events in reverse chronological
        // order, each of them still decrypts to its original plaintext.
        for (i, event) in events.iter().enumerate().rev() {
            let decrypted = bob
                .decrypt_room_event(event, Some("pagination"))
                .await
                .unwrap();

            assert_eq!(
                decrypted.event["content"]["body"],
                format!("message {}", i)
            );
            assert_eq!(decrypted.message_index, i as u32);
        }
    }

    #[tokio::test]
    async fn own_messages_are_readable() {
        let (alice, bob) = get_machine_pair_with_session().await;
        let room_id = room_id!("!test:example.org");

        share_room_key(&alice, &bob, &room_id).await;

        let content = alice
            .encrypt_room_event(&room_id, "m.room.message", json!({"body": "to myself"}))
            .await
            .unwrap();

        let event = EncryptedEvent {
            sender: alice_id(),
            room_id,
            content: EncryptedEventContent::MegolmV1AesSha2(content),
            event_id: None,
        };

        let decrypted = alice.decrypt_room_event(&event, None).await.unwrap();
        assert_eq!(decrypted.event["content"]["body"], "to myself");
    }

    #[tokio::test]
    async fn tracked_users() {
        let machine = alice_machine();

        machine.update_tracked_users([bob_id()].iter()).await;
        assert!(machine.should_query_keys());
        assert!(machine.users_for_key_query().contains(&bob_id()));
    }

    #[tokio::test]
    async fn machine_with_explicit_store() {
        let store: Arc<dyn CryptoStore> = Arc::new(MemoryStore::new());

        let machine = OlmMachine::with_store(&alice_id(), &alice_device_id(), store.clone())
            .await
            .unwrap();
        let curve25519 = machine.identity_keys().curve25519().to_owned();
        let ed25519 = machine.identity_keys().ed25519().to_owned();
        drop(machine);

        // The account was persisted, a new machine over the same store picks
        // up the identical identity keys.
        let machine = OlmMachine::with_store(&alice_id(), &alice_device_id(), store)
            .await
            .unwrap();
        assert_eq!(machine.identity_keys().curve25519(), curve25519);
        assert_eq!(machine.identity_keys().ed25519(), ed25519);
    }

    #[cfg(feature = "sled_cryptostore")]
    #[tokio::test]
    async fn machine_survives_a_restart() {
        let dir = tempfile::tempdir().unwrap();

        let machine =
            OlmMachine::with_sled_store(&alice_id(), &alice_device_id(), dir.path(), None)
                .await
                .unwrap();
        let curve25519 = machine.identity_keys().curve25519().to_owned();
        let ed25519 = machine.identity_keys().ed25519().to_owned();

        machine.generate_one_time_keys(5).await.unwrap();
        machine.flush_store().await.unwrap();
        drop(machine);

        let machine =
            OlmMachine::with_sled_store(&alice_id(), &alice_device_id(), dir.path(), None)
                .await
                .unwrap();

        assert_eq!(machine.identity_keys().curve25519(), curve25519);
        assert_eq!(machine.identity_keys().ed25519(), ed25519);
        assert_eq!(machine.one_time_keys().await.curve25519().len(), 5);
    }
}
