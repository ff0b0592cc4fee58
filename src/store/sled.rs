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

use std::{collections::HashSet, convert::TryFrom, path::Path, sync::Arc};

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use olm_rs::PicklingMode;
pub use sled::Error;
use sled::{Config, Db, Tree};
use tokio::sync::Mutex;
use zeroize::Zeroizing;

use ruma::{DeviceId, UserId};

use super::{
    caches::SessionStore, CryptoStore, CryptoStoreError, Result, UserDevices,
};
use crate::identities::ReadOnlyDevice;
use crate::olm::{
    Account, InboundGroupSession, PickledAccount, PickledInboundGroupSession, PickledSession,
    Session,
};

trait EncodeKey {
    const SEPARATOR: u8 = 0xff;
    fn encode(&self) -> Vec<u8>;
}

impl EncodeKey for &UserId {
    fn encode(&self) -> Vec<u8> {
        self.as_str().encode()
    }
}

impl EncodeKey for &str {
    fn encode(&self) -> Vec<u8> {
        [self.as_bytes(), &[Self::SEPARATOR]].concat()
    }
}

impl EncodeKey for (&str, &str) {
    fn encode(&self) -> Vec<u8> {
        [
            self.0.as_bytes(),
            &[Self::SEPARATOR],
            self.1.as_bytes(),
            &[Self::SEPARATOR],
        ]
        .concat()
    }
}

/// A store that persists all the E2EE keys in a sled database on disk.
#[derive(Debug, Clone)]
pub struct SledStore {
    inner: Db,
    pickle_key: Arc<Option<Zeroizing<Vec<u8>>>>,

    session_cache: SessionStore,
    tracked_users_cache: Arc<DashSet<UserId>>,
    users_for_key_query_cache: Arc<DashSet<UserId>>,

    account: Tree,
    sessions: Tree,
    inbound_group_sessions: Tree,
    devices: Tree,
    tracked_users: Tree,
}

impl SledStore {
    /// Open the sled based cryptostore at the given path using the given
    /// passphrase to encrypt private data.
    pub fn open_with_passphrase(path: impl AsRef<Path>, passphrase: Option<&str>) -> Result<Self> {
        let path = path.as_ref().join("commune-crypto");
        let db = Config::new().temporary(false).path(path).open()?;

        SledStore::open_helper(db, passphrase)
    }

    /// Create a sled based cryptostore using the given sled database.
    /// The given passphrase will be used to encrypt private data.
    pub fn open_with_database(db: Db, passphrase: Option<&str>) -> Result<Self> {
        SledStore::open_helper(db, passphrase)
    }

    fn open_helper(db: Db, passphrase: Option<&str>) -> Result<Self> {
        let account = db.open_tree("account")?;
        let sessions = db.open_tree("sessions")?;
        let inbound_group_sessions = db.open_tree("inbound_group_sessions")?;
        let devices = db.open_tree("devices")?;
        let tracked_users = db.open_tree("tracked_users")?;

        let pickle_key = passphrase.map(|p| Zeroizing::new(p.as_bytes().to_vec()));

        Ok(Self {
            inner: db,
            pickle_key: Arc::new(pickle_key),
            session_cache: SessionStore::new(),
            tracked_users_cache: Arc::new(DashSet::new()),
            users_for_key_query_cache: Arc::new(DashSet::new()),
            account,
            sessions,
            inbound_group_sessions,
            devices,
            tracked_users,
        })
    }

    fn get_pickle_mode(&self) -> PicklingMode {
        match &*self.pickle_key {
            Some(key) => PicklingMode::Encrypted {
                key: key.to_vec(),
            },
            None => PicklingMode::Unencrypted,
        }
    }

    async fn load_tracked_users(&self) -> Result<()> {
        for value in self.tracked_users.iter() {
            let (user, dirty) = value?;
            let user = UserId::try_from(String::from_utf8_lossy(&user).to_string())?;
            let dirty = dirty.get(0).map(|d| *d == 1).unwrap_or(true);

            self.tracked_users_cache.insert(user.clone());

            if dirty {
                self.users_for_key_query_cache.insert(user);
            }
        }

        Ok(())
    }

    async fn flush_helper(&self) -> Result<()> {
        self.inner.flush_async().await?;
        Ok(())
    }
}

#[async_trait]
impl CryptoStore for SledStore {
    async fn load_account(&self) -> Result<Option<Account>> {
        if let Some(pickle) = self.account.get("account".encode())? {
            let pickle: PickledAccount = serde_json::from_slice(&pickle)?;

            self.load_tracked_users().await?;

            Ok(Some(Account::from_pickle(pickle, self.get_pickle_mode())?))
        } else {
            Ok(None)
        }
    }

    async fn save_account(&self, account: Account) -> Result<()> {
        let pickle = account.pickle(self.get_pickle_mode()).await;
        self.account
            .insert("account".encode(), serde_json::to_vec(&pickle)?)?;

        self.flush_helper().await
    }

    async fn save_session(&self, session: Session) -> Result<()> {
        let pickle = session.pickle(self.get_pickle_mode()).await;
        let key = (session.sender_key(), session.session_id()).encode();

        self.sessions.insert(key, serde_json::to_vec(&pickle)?)?;
        self.session_cache.add(session).await;

        self.flush_helper().await
    }

    async fn get_sessions(&self, sender_key: &str) -> Result<Option<Arc<Mutex<Vec<Session>>>>> {
        if self.session_cache.get(sender_key).is_none() {
            let account = self
                .load_account()
                .await?
                .ok_or(CryptoStoreError::AccountUnset)?;

            let sessions: Result<Vec<Session>> = self
                .sessions
                .scan_prefix(sender_key.encode())
                .map(|s| serde_json::from_slice(&s?.1).map_err(CryptoStoreError::Serialization))
                .map(|p: Result<PickledSession>| {
                    Session::from_pickle(
                        account.user_id.clone(),
                        account.device_id.clone(),
                        account.identity_keys.clone(),
                        p?,
                        self.get_pickle_mode(),
                    )
                    .map_err(CryptoStoreError::OlmSession)
                })
                .collect();

            let sessions = sessions?;

            if sessions.is_empty() {
                return Ok(None);
            }

            self.session_cache.set_for_sender(sender_key, sessions);
        }

        Ok(self.session_cache.get(sender_key))
    }

    async fn save_inbound_group_session(&self, session: InboundGroupSession) -> Result<()> {
        let key = (session.sender_key(), session.session_id()).encode();
        let pickle = session.pickle(self.get_pickle_mode()).await;

        self.inbound_group_sessions
            .insert(key, serde_json::to_vec(&pickle)?)?;

        self.flush_helper().await
    }

    async fn get_inbound_group_session(
        &self,
        sender_key: &str,
        session_id: &str,
    ) -> Result<Option<InboundGroupSession>> {
        let key = (sender_key, session_id).encode();
        let pickle = self
            .inbound_group_sessions
            .get(&key)?
            .map(|p| serde_json::from_slice(&p));

        if let Some(pickle) = pickle {
            let pickle: PickledInboundGroupSession = pickle?;
            Ok(Some(InboundGroupSession::from_pickle(
                pickle,
                self.get_pickle_mode(),
            )?))
        } else {
            Ok(None)
        }
    }

    async fn remove_inbound_group_session(
        &self,
        sender_key: &str,
        session_id: &str,
    ) -> Result<()> {
        let key = (sender_key, session_id).encode();
        self.inbound_group_sessions.remove(key)?;

        self.flush_helper().await
    }

    async fn save_device(&self, device: ReadOnlyDevice) -> Result<()> {
        let key = (device.user_id().as_str(), device.device_id().as_str()).encode();
        self.devices.insert(key, serde_json::to_vec(&device)?)?;

        self.flush_helper().await
    }

    async fn delete_device(&self, device: ReadOnlyDevice) -> Result<()> {
        let key = (device.user_id().as_str(), device.device_id().as_str()).encode();
        self.devices.remove(key)?;

        self.flush_helper().await
    }

    async fn get_device(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> Result<Option<ReadOnlyDevice>> {
        let key = (user_id.as_str(), device_id.as_str()).encode();

        if let Some(d) = self.devices.get(key)? {
            Ok(Some(serde_json::from_slice(&d)?))
        } else {
            Ok(None)
        }
    }

    async fn get_user_devices(&self, user_id: &UserId) -> Result<UserDevices> {
        let entries = DashMap::new();

        for device in self.devices.scan_prefix(user_id.encode()) {
            let device: ReadOnlyDevice = serde_json::from_slice(&device?.1)?;
            entries.insert(device.device_id().into(), device);
        }

        Ok(UserDevices {
            entries: entries.into_read_only(),
        })
    }

    async fn update_tracked_user(&self, user: &UserId, dirty: bool) -> Result<bool> {
        let already_added = self.tracked_users_cache.insert(user.clone());

        if dirty {
            self.users_for_key_query_cache.insert(user.clone());
        } else {
            self.users_for_key_query_cache.remove(user);
        }

        self.tracked_users.insert(user.as_str(), &[dirty as u8])?;

        Ok(already_added)
    }

    fn is_user_tracked(&self, user_id: &UserId) -> bool {
        self.tracked_users_cache.contains(user_id)
    }

    fn users_for_key_query(&self) -> HashSet<UserId> {
        self.users_for_key_query_cache
            .iter()
            .map(|u| u.clone())
            .collect()
    }

    async fn flush(&self) -> Result<()> {
        self.flush_helper().await
    }
}
