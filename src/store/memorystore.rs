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

use std::{collections::HashSet, sync::Arc};

use async_trait::async_trait;
use dashmap::DashSet;
use ruma::{DeviceId, UserId};
use tokio::sync::Mutex;

use super::{
    caches::{DeviceStore, GroupSessionStore, SessionStore},
    CryptoStore, Result, UserDevices,
};
use crate::identities::ReadOnlyDevice;
use crate::olm::{Account, InboundGroupSession, Session};

/// An in-memory only store that will forget all the E2EE keys once it's
/// dropped.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    account: Arc<Mutex<Option<Account>>>,
    sessions: SessionStore,
    inbound_group_sessions: GroupSessionStore,
    devices: DeviceStore,
    tracked_users: Arc<DashSet<UserId>>,
    users_for_key_query: Arc<DashSet<UserId>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        MemoryStore {
            account: Arc::new(Mutex::new(None)),
            sessions: SessionStore::new(),
            inbound_group_sessions: GroupSessionStore::new(),
            devices: DeviceStore::new(),
            tracked_users: Arc::new(DashSet::new()),
            users_for_key_query: Arc::new(DashSet::new()),
        }
    }
}

impl MemoryStore {
    /// Create a new empty `MemoryStore`.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CryptoStore for MemoryStore {
    async fn load_account(&self) -> Result<Option<Account>> {
        Ok(self.account.lock().await.clone())
    }

    async fn save_account(&self, account: Account) -> Result<()> {
        *self.account.lock().await = Some(account);
        Ok(())
    }

    async fn save_session(&self, session: Session) -> Result<()> {
        self.sessions.add(session).await;
        Ok(())
    }

    async fn get_sessions(&self, sender_key: &str) -> Result<Option<Arc<Mutex<Vec<Session>>>>> {
        Ok(self.sessions.get(sender_key))
    }

    async fn save_inbound_group_session(&self, session: InboundGroupSession) -> Result<()> {
        self.inbound_group_sessions.add(session);
        Ok(())
    }

    async fn get_inbound_group_session(
        &self,
        sender_key: &str,
        session_id: &str,
    ) -> Result<Option<InboundGroupSession>> {
        Ok(self.inbound_group_sessions.get(sender_key, session_id))
    }

    async fn remove_inbound_group_session(
        &self,
        sender_key: &str,
        session_id: &str,
    ) -> Result<()> {
        self.inbound_group_sessions.remove(sender_key, session_id);
        Ok(())
    }

    async fn save_device(&self, device: ReadOnlyDevice) -> Result<()> {
        let _ = self.devices.add(device);
        Ok(())
    }

    async fn delete_device(&self, device: ReadOnlyDevice) -> Result<()> {
        let _ = self.devices.remove(device.user_id(), device.device_id());
        Ok(())
    }

    async fn get_device(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> Result<Option<ReadOnlyDevice>> {
        Ok(self.devices.get(user_id, device_id))
    }

    async fn get_user_devices(&self, user_id: &UserId) -> Result<UserDevices> {
        Ok(self.devices.user_devices(user_id))
    }

    async fn update_tracked_user(&self, user: &UserId, dirty: bool) -> Result<bool> {
        if dirty {
            self.users_for_key_query.insert(user.clone());
        } else {
            self.users_for_key_query.remove(user);
        }

        Ok(self.tracked_users.insert(user.clone()))
    }

    fn is_user_tracked(&self, user_id: &UserId) -> bool {
        self.tracked_users.contains(user_id)
    }

    fn users_for_key_query(&self) -> HashSet<UserId> {
        self.users_for_key_query.iter().map(|u| u.clone()).collect()
    }

    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use ruma::room_id;

    use super::MemoryStore;
    use crate::identities::device::test::get_device;
    use crate::olm::test::get_account_and_session;
    use crate::olm::InboundGroupSession;
    use crate::store::CryptoStore;

    #[tokio::test]
    async fn test_session_store() {
        let (account, session) = get_account_and_session().await;
        let store = MemoryStore::new();

        assert!(store.load_account().await.unwrap().is_none());
        store.save_account(account).await.unwrap();

        store.save_session(session.clone()).await.unwrap();

        let sessions = store
            .get_sessions(session.sender_key())
            .await
            .unwrap()
            .unwrap();
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

        let store = MemoryStore::new();
        store
            .save_inbound_group_session(inbound.clone())
            .await
            .unwrap();

        let loaded_session = store
            .get_inbound_group_session("test_key", outbound.session_id())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(inbound, loaded_session);

        store
            .remove_inbound_group_session("test_key", outbound.session_id())
            .await
            .unwrap();
        assert!(store
            .get_inbound_group_session("test_key", outbound.session_id())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_device_store() {
        let device = get_device();
        let store = MemoryStore::new();

        store.save_device(device.clone()).await.unwrap();

        let loaded_device = store
            .get_device(device.user_id(), device.device_id())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(device, loaded_device);

        let user_devices = store.get_user_devices(device.user_id()).await.unwrap();
        assert_eq!(&**user_devices.keys().next().unwrap(), device.device_id());
        assert_eq!(user_devices.devices().next().unwrap(), &device);

        store.delete_device(device.clone()).await.unwrap();
        assert!(store
            .get_device(device.user_id(), device.device_id())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_tracked_users() {
        let store = MemoryStore::new();
        let device = get_device();

        assert!(store
            .update_tracked_user(device.user_id(), false)
            .await
            .unwrap());
        assert!(!store
            .update_tracked_user(device.user_id(), false)
            .await
            .unwrap());

        assert!(store.is_user_tracked(device.user_id()));
        assert!(!store.users_for_key_query().contains(device.user_id()));

        store
            .update_tracked_user(device.user_id(), true)
            .await
            .unwrap();
        assert!(store.users_for_key_query().contains(device.user_id()));
    }
}
