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

use std::{collections::BTreeMap, sync::Arc};

use dashmap::{DashMap, DashSet};
use ruma::{
    identifiers::EventEncryptionAlgorithm, DeviceKeyAlgorithm, RoomId, UserId,
};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::{
    error::{EventError, MegolmError, MegolmResult, OlmError, OlmResult},
    identities::ReadOnlyDevice,
    olm::{
        Account, EncryptionSettings, GroupSessionKey, InboundGroupSession, OutboundGroupSession,
        Session,
    },
    requests::ToDeviceRequest,
    store::{CryptoStore, Result as StoreResult},
    types::{DecryptedEvent, EncryptedEvent, EncryptedEventContent, RoomKeyContent},
};

/// Manager keeping track of our outbound group sessions and the inbound
/// counterparts other devices sent to us.
#[derive(Debug, Clone)]
pub(crate) struct GroupSessionManager {
    account: Account,
    store: Arc<dyn CryptoStore>,
    /// The currently active outbound group sessions. These never touch the
    /// store, a process restart discards them and forces a rotation plus
    /// re-share.
    outbound_group_sessions: Arc<DashMap<RoomId, OutboundGroupSession>>,
    /// Message indices we have seen, per timeline. A triple of sender key,
    /// session id and ratchet index may decrypt at most once within one
    /// timeline.
    decrypted_message_indices: Arc<DashMap<String, DashSet<String>>>,
}

impl GroupSessionManager {
    const MAX_TO_DEVICE_MESSAGES: usize = 20;

    pub fn new(account: Account, store: Arc<dyn CryptoStore>) -> Self {
        Self {
            account,
            store,
            outbound_group_sessions: Arc::new(DashMap::new()),
            decrypted_message_indices: Arc::new(DashMap::new()),
        }
    }

    /// Create a new outbound group session for the given room.
    ///
    /// The matching inbound session is created and persisted as well, so our
    /// own messages stay readable.
    pub async fn create_outbound_group_session(
        &self,
        room_id: &RoomId,
        settings: EncryptionSettings,
    ) -> MegolmResult<String> {
        let session = self.account.create_outbound_group_session(room_id, settings);

        let inbound_session = self
            .account
            .create_inbound_mirror(room_id, session.session_key().await)?;
        self.store.save_inbound_group_session(inbound_session).await?;

        let session_id = session.session_id().to_owned();

        debug!(
            "Created new outbound group session {} for room {}",
            session_id, room_id
        );

        self.outbound_group_sessions
            .insert(room_id.to_owned(), session);

        Ok(session_id)
    }

    /// Get the cached outbound group session of the given room, if any.
    pub fn get_outbound_group_session(&self, room_id: &RoomId) -> Option<OutboundGroupSession> {
        self.outbound_group_sessions
            .get(room_id)
            .map(|s| s.clone())
    }

    /// Discard the outbound group session of the given room.
    ///
    /// The next message in the room will create a fresh session, which in
    /// turn forces a re-share of the new session key.
    pub fn invalidate_group_session(&self, room_id: &RoomId) -> bool {
        if let Some(session) = self.outbound_group_sessions.get(room_id) {
            session.invalidate_session();
        }

        self.outbound_group_sessions.remove(room_id).is_some()
    }

    /// Encrypt a room message with the room's current outbound group
    /// session.
    pub async fn encrypt(
        &self,
        room_id: &RoomId,
        event_type: &str,
        content: Value,
    ) -> MegolmResult<crate::types::MegolmV1AesSha2Content> {
        let session = self
            .get_outbound_group_session(room_id)
            .ok_or(MegolmError::MissingSession)?;

        Ok(session.encrypt(event_type, content).await)
    }

    /// Install an inbound group session another device shared with us.
    ///
    /// Returns true if the session was added, false if it was rejected.
    ///
    /// A session that is already known for the given sender key and session
    /// id is never replaced. Accepting a replacement would let the sender
    /// reset the ratchet index and replay old ciphertexts.
    pub async fn add_inbound_group_session(
        &self,
        session_id: &str,
        session_key: GroupSessionKey,
        room_id: &RoomId,
        sender_key: &str,
        keys_claimed: BTreeMap<DeviceKeyAlgorithm, String>,
    ) -> StoreResult<bool> {
        if self
            .store
            .get_inbound_group_session(sender_key, session_id)
            .await?
            .is_some()
        {
            debug!(
                "Ignoring a room key for a known inbound group session {} from {}",
                session_id, sender_key
            );
            return Ok(false);
        }

        let session =
            match InboundGroupSession::from_room_key(sender_key, keys_claimed, room_id, session_key)
            {
                Ok(s) => s,
                Err(e) => {
                    warn!(
                        "Failed to create an inbound group session from a room key: {}",
                        e
                    );
                    return Ok(false);
                }
            };

        if session.session_id() != session_id {
            warn!(
                "The key of the received room key doesn't match its claimed session id {}",
                session_id
            );
            return Ok(false);
        }

        info!(
            "Added an inbound group session {} for room {}",
            session_id, room_id
        );

        self.store.save_inbound_group_session(session).await?;

        Ok(true)
    }

    /// Handle a decrypted `m.room_key` payload.
    pub async fn receive_room_key(
        &self,
        sender_key: &str,
        keys_claimed: BTreeMap<DeviceKeyAlgorithm, String>,
        content: RoomKeyContent,
    ) -> StoreResult<bool> {
        match content.algorithm {
            EventEncryptionAlgorithm::MegolmV1AesSha2 => {
                self.add_inbound_group_session(
                    &content.session_id,
                    GroupSessionKey(content.session_key),
                    &content.room_id,
                    sender_key,
                    keys_claimed,
                )
                .await
            }
            _ => {
                warn!(
                    "Received a room key with the unsupported algorithm {}",
                    content.algorithm
                );
                Ok(false)
            }
        }
    }

    /// Permanently drop the inbound group session from the store.
    pub async fn remove_inbound_group_session(
        &self,
        sender_key: &str,
        session_id: &str,
    ) -> StoreResult<()> {
        self.store
            .remove_inbound_group_session(sender_key, session_id)
            .await
    }

    /// Decrypt a group encrypted event.
    ///
    /// # Arguments
    ///
    /// * `event` - The encrypted room event.
    ///
    /// * `content` - The Megolm content of the event.
    ///
    /// * `timeline` - The timeline the event belongs to. Replay protection is
    /// tracked per timeline, passing `None` skips the replay check, which is
    /// what callers decrypting outside of any timeline want.
    pub async fn decrypt_group_event(
        &self,
        event: &EncryptedEvent,
        timeline: Option<&str>,
    ) -> MegolmResult<DecryptedEvent> {
        let content = match &event.content {
            EncryptedEventContent::MegolmV1AesSha2(c) => c,
            _ => return Err(EventError::UnsupportedAlgorithm.into()),
        };

        let session = self
            .store
            .get_inbound_group_session(&content.sender_key, &content.session_id)
            .await?
            .ok_or(MegolmError::MissingSession)?;

        // The session is bound to the room its room key event announced. A
        // server rerouting the ciphertext into another room must not get a
        // plaintext back.
        if session.room_id() != &event.room_id {
            return Err(
                EventError::MismatchedRoom(session.room_id().clone(), event.room_id.clone())
                    .into(),
            );
        }

        let (plaintext, message_index) =
            session.decrypt_helper(content.ciphertext.clone()).await?;

        if let Some(timeline) = timeline {
            let index_key = format!(
                "{}|{}|{}",
                content.sender_key, content.session_id, message_index
            );

            let newly_seen = self
                .decrypted_message_indices
                .entry(timeline.to_owned())
                .or_insert_with(DashSet::new)
                .insert(index_key);

            if !newly_seen {
                return Err(MegolmError::DuplicateMessageIndex(message_index));
            }
        }

        self.store.save_inbound_group_session(session.clone()).await?;

        let mut decrypted_value: Value = serde_json::from_str(&plaintext)?;
        let decrypted_object = decrypted_value
            .as_object_mut()
            .ok_or(EventError::NotAnObject)?;

        decrypted_object.insert("sender".to_owned(), event.sender.to_string().into());

        if let Some(event_id) = &event.event_id {
            decrypted_object.insert("event_id".to_owned(), event_id.clone().into());
        }

        let mut keys_proved = BTreeMap::new();
        keys_proved.insert(
            DeviceKeyAlgorithm::Curve25519,
            content.sender_key.to_owned(),
        );

        Ok(DecryptedEvent {
            event: decrypted_value,
            message_index,
            keys_claimed: (*session.keys_claimed).clone(),
            keys_proved,
        })
    }

    /// Drop the replay bookkeeping of the given timeline.
    ///
    /// Used when a timeline gets discarded and rebuilt, re-decrypting its
    /// events is legitimate then.
    pub fn reset_replay_detection(&self, timeline: &str) {
        self.decrypted_message_indices.remove(timeline);
    }

    /// Encrypt the current room key of the given room to every device of the
    /// given users.
    ///
    /// Devices that are blocked, lack a curve25519 key or don't share an Olm
    /// session with us are skipped. Creates a fresh outbound group session
    /// if the room doesn't have one yet.
    pub async fn share_group_session<'a, I>(
        &self,
        room_id: &RoomId,
        users: I,
    ) -> OlmResult<Vec<ToDeviceRequest>>
    where
        I: IntoIterator<Item = &'a UserId>,
    {
        let session = match self.get_outbound_group_session(room_id) {
            Some(s) => s,
            None => {
                self.create_outbound_group_session(room_id, EncryptionSettings::default())
                    .await
                    .map_err(|e| match e {
                        MegolmError::Store(e) => OlmError::Store(e),
                        MegolmError::OlmGroupSession(e) => OlmError::OlmGroupSession(e),
                        _ => OlmError::MissingSession,
                    })?;
                self.get_outbound_group_session(room_id)
                    .expect("A freshly created outbound group session is cached")
            }
        };

        let key_content = session.as_json().await;

        let mut recipient_devices: Vec<(Session, ReadOnlyDevice)> = Vec::new();

        for user_id in users {
            for device in self.store.get_user_devices(user_id).await?.devices() {
                if device.is_blocked() {
                    debug!(
                        "Not sharing the room key of {} with the blocked device {} of user {}",
                        room_id,
                        device.device_id(),
                        user_id
                    );
                    continue;
                }

                if !device
                    .algorithms()
                    .contains(&EventEncryptionAlgorithm::OlmV1Curve25519AesSha2)
                {
                    debug!(
                        "The device {} of user {} doesn't support any of our \
                        encryption algorithms",
                        device.device_id(),
                        user_id
                    );
                    continue;
                }

                let sender_key = if let Some(k) = device.get_key(DeviceKeyAlgorithm::Curve25519) {
                    k
                } else {
                    warn!(
                        "The device {} of user {} doesn't have a curve25519 key",
                        device.device_id(),
                        user_id
                    );
                    continue;
                };

                let sessions = self.store.get_sessions(sender_key).await?;

                let session = if let Some(s) = sessions {
                    let sessions = s.lock().await;
                    let mut sorted: Vec<&Session> = sessions.iter().collect();
                    sorted.sort_by(|a, b| a.session_id().cmp(b.session_id()));
                    sorted.first().map(|s| (*s).clone())
                } else {
                    None
                };

                if let Some(session) = session {
                    recipient_devices.push((session, device.clone()));
                } else {
                    warn!(
                        "Trying to encrypt a room key for user {} on device {}, \
                        but no Olm session is found",
                        user_id,
                        device.device_id()
                    );
                }
            }
        }

        let mut requests = Vec::new();

        for chunk in recipient_devices.chunks_mut(Self::MAX_TO_DEVICE_MESSAGES) {
            let mut request = ToDeviceRequest::new("m.room.encrypted");

            for (session, device) in chunk {
                let encrypted_content = session
                    .encrypt(device, "m.room_key", key_content.clone())
                    .await?;
                self.store.save_session(session.clone()).await?;

                request
                    .messages
                    .entry(device.user_id().to_owned())
                    .or_insert_with(BTreeMap::new)
                    .insert(
                        device.device_id().into(),
                        serde_json::to_value(encrypted_content)?,
                    );
            }

            requests.push(request);
        }

        session.mark_as_shared();

        Ok(requests)
    }
}
