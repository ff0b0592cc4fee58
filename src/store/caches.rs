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

use std::{collections::HashMap, sync::Arc};

use dashmap::{DashMap, ReadOnlyView};
use ruma::{DeviceId, DeviceIdBox, UserId};
use tokio::sync::Mutex;

use crate::identities::ReadOnlyDevice;
use crate::olm::{InboundGroupSession, Session};

/// In-memory store for Olm Sessions.
#[derive(Debug, Default, Clone)]
pub struct SessionStore {
    entries: Arc<DashMap<String, Arc<Mutex<Vec<Session>>>>>,
}

impl SessionStore {
    /// Create a new empty Session store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a session to the store.
    pub async fn add(&self, session: Session) {
        let sessions = self
            .entries
            .entry(session.sender_key().to_owned())
            .or_insert_with(|| Arc::new(Mutex::new(Vec::new())))
            .clone();

        let mut sessions = sessions.lock().await;

        if let Some(pos) = sessions
            .iter()
            .position(|s| s.session_id() == session.session_id())
        {
            sessions[pos] = session;
        } else {
            sessions.push(session);
        }
    }

    /// Get all the sessions that belong to the given sender key.
    pub fn get(&self, sender_key: &str) -> Option<Arc<Mutex<Vec<Session>>>> {
        self.entries.get(sender_key).map(|s| s.clone())
    }

    /// Add a list of sessions belonging to the sender key.
    pub fn set_for_sender(&self, sender_key: &str, sessions: Vec<Session>) {
        self.entries
            .insert(sender_key.to_owned(), Arc::new(Mutex::new(sessions)));
    }
}

/// In-memory store that holds inbound group sessions.
#[derive(Debug, Default, Clone)]
pub struct GroupSessionStore {
    entries: Arc<DashMap<String, HashMap<String, InboundGroupSession>>>,
}

impl GroupSessionStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an inbound group session to the store.
    ///
    /// Returns true if the session was added, false if the session was
    /// already in the store.
    pub fn add(&self, session: InboundGroupSession) -> bool {
        self.entries
            .entry(session.sender_key().to_owned())
            .or_insert_with(HashMap::new)
            .insert(session.session_id().to_owned(), session)
            .is_none()
    }

    /// Get an inbound group session from our store.
    ///
    /// # Arguments
    ///
    /// * `sender_key` - The curve25519 key of the sender that sent us the
    /// session.
    ///
    /// * `session_id` - The unique id of the session.
    pub fn get(&self, sender_key: &str, session_id: &str) -> Option<InboundGroupSession> {
        self.entries
            .get(sender_key)
            .and_then(|m| m.get(session_id).cloned())
    }

    /// Remove an inbound group session from the store.
    pub fn remove(&self, sender_key: &str, session_id: &str) -> Option<InboundGroupSession> {
        self.entries
            .get_mut(sender_key)
            .and_then(|mut m| m.remove(session_id))
    }
}

/// In-memory store holding the devices of users.
#[derive(Debug, Default, Clone)]
pub struct DeviceStore {
    entries: Arc<DashMap<UserId, DashMap<DeviceIdBox, ReadOnlyDevice>>>,
}

/// A read-only view over all devices of a user.
pub struct UserDevices {
    pub(crate) entries: ReadOnlyView<DeviceIdBox, ReadOnlyDevice>,
}

impl std::fmt::Debug for UserDevices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.entries.keys()).finish()
    }
}

impl UserDevices {
    /// Get the specific device with the given device id.
    pub fn get(&self, device_id: &DeviceId) -> Option<ReadOnlyDevice> {
        self.entries.get(device_id).cloned()
    }

    /// Iterator over all the device ids of the user.
    pub fn keys(&self) -> impl Iterator<Item = &DeviceIdBox> {
        self.entries.keys()
    }

    /// Iterator over all the devices of the user.
    pub fn devices(&self) -> impl Iterator<Item = &ReadOnlyDevice> {
        self.entries.values()
    }

    /// Is the view empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl DeviceStore {
    /// Create a new empty device store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a device to the store.
    ///
    /// Returns true if the device was already in the store, false otherwise.
    pub fn add(&self, device: ReadOnlyDevice) -> bool {
        let user_id = device.user_id();

        self.entries
            .entry(user_id.to_owned())
            .or_insert_with(DashMap::new)
            .insert(device.device_id().into(), device)
            .is_some()
    }

    /// Get the device with the given device_id and belonging to the given
    /// user.
    pub fn get(&self, user_id: &UserId, device_id: &DeviceId) -> Option<ReadOnlyDevice> {
        self.entries
            .get(user_id)
            .and_then(|m| m.get(device_id).map(|d| d.value().clone()))
    }

    /// Remove the device with the given device_id and belonging to the given
    /// user.
    pub fn remove(&self, user_id: &UserId, device_id: &DeviceId) -> Option<ReadOnlyDevice> {
        self.entries
            .get(user_id)
            .and_then(|m| m.remove(device_id))
            .map(|(_, d)| d)
    }

    /// Get a read-only view over all devices of the given user.
    pub fn user_devices(&self, user_id: &UserId) -> UserDevices {
        UserDevices {
            entries: self
                .entries
                .entry(user_id.to_owned())
                .or_insert_with(DashMap::new)
                .clone()
                .into_read_only(),
        }
    }
}

#[cfg(test)]
mod test {
    use crate::identities::device::test::get_device;
    use crate::olm::test::get_account_and_session;

    use super::{DeviceStore, GroupSessionStore, SessionStore};
    use crate::olm::InboundGroupSession;
    use ruma::room_id;

    #[tokio::test]
    async fn test_session_store() {
        let (_, session) = get_account_and_session().await;

        let store = SessionStore::new();
        store.add(session.clone()).await;

        let sessions = store.get(session.sender_key()).unwrap();
        let sessions = sessions.lock().await;

        let loaded_session = &sessions[0];
        assert_eq!(&session, loaded_session);
    }

    #[tokio::test]
    async fn test_group_session_store() {
        let (account, _) = get_account_and_session().await;
        let room_id = room_id!("!test:localhost");

        let outbound = account.create_outbound_group_session(&room_id, Default::default());
        let inbound = InboundGroupSession::new(
            "test_key",
            "test_key",
            &room_id,
            outbound.session_key().await,
        )
        .unwrap();

        let store = GroupSessionStore::new();
        assert!(store.add(inbound.clone()));
        assert!(!store.add(inbound.clone()));

        let loaded_session = store.get("test_key", outbound.session_id()).unwrap();
        assert_eq!(inbound, loaded_session);

        store.remove("test_key", outbound.session_id());
        assert!(store.get("test_key", outbound.session_id()).is_none());
    }

    #[test]
    fn test_device_store() {
        let device = get_device();
        let store = DeviceStore::new();

        assert!(!store.add(device.clone()));
        assert!(store.add(device.clone()));

        let loaded_device = store.get(device.user_id(), device.device_id()).unwrap();
        assert_eq!(device, loaded_device);

        let user_devices = store.user_devices(device.user_id());
        assert_eq!(&**user_devices.keys().next().unwrap(), device.device_id());
        assert_eq!(user_devices.devices().next().unwrap(), &device);

        store.remove(device.user_id(), device.device_id());
        assert!(store.get(device.user_id(), device.device_id()).is_none());
    }
}
