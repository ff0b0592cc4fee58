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

//! Storage abstraction for the engine.
//!
//! The engine owns the account and the outbound group sessions, everything
//! else lives in a `CryptoStore` and is borrowed for single operations.

use core::fmt::Debug;
use std::collections::HashSet;
use std::io::Error as IoError;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Error as SerdeError;
use thiserror::Error;
use tokio::sync::Mutex;

use olm_rs::errors::{OlmAccountError, OlmGroupSessionError, OlmSessionError};
use ruma::{identifiers::Error as IdentifierError, DeviceId, UserId};

use crate::identities::ReadOnlyDevice;
use crate::olm::{Account, InboundGroupSession, Session};

pub(crate) mod caches;
pub mod memorystore;
#[cfg(feature = "sled_cryptostore")]
pub mod sled;

pub use caches::UserDevices;
pub use memorystore::MemoryStore;
#[cfg(feature = "sled_cryptostore")]
pub use self::sled::SledStore;

#[derive(Error, Debug)]
pub enum CryptoStoreError {
    #[error("can't read or write from the store")]
    Io(#[from] IoError),
    #[error("can't finish Olm Account operation {0}")]
    OlmAccount(#[from] OlmAccountError),
    #[error("can't finish Olm Session operation {0}")]
    OlmSession(#[from] OlmSessionError),
    #[error("can't finish Olm GroupSession operation {0}")]
    OlmGroupSession(#[from] OlmGroupSessionError),
    #[error("error serializing data for the database")]
    Serialization(#[from] SerdeError),
    #[error("an invalid identifier was stored in the database")]
    Identifier(#[from] IdentifierError),
    #[error("can't save/load sessions or group sessions in the store before a account is stored")]
    AccountUnset,
    #[cfg(feature = "sled_cryptostore")]
    #[error("database error")]
    Database(#[from] ::sled::Error),
}

pub type Result<T> = std::result::Result<T, CryptoStoreError>;

/// Trait abstracting over the durable storage of the engine.
///
/// The store serialises writes to the same key, readers observe the last
/// committed value. Implementations are allowed to write asynchronously, the
/// `flush()` method is the drain point that makes every previous write
/// durable.
#[async_trait]
pub trait CryptoStore: Debug + Send + Sync {
    /// Load the account that was previously stored, if any.
    async fn load_account(&self) -> Result<Option<Account>>;

    /// Save the account, overwriting a previously stored one.
    ///
    /// This is called after every account mutation, the last write wins.
    async fn save_account(&self, account: Account) -> Result<()>;

    /// Save the given pairwise session, upserting by the peer identity key
    /// and session id.
    async fn save_session(&self, session: Session) -> Result<()>;

    /// Get all the pairwise sessions we share with the device owning the
    /// given curve25519 key.
    async fn get_sessions(&self, sender_key: &str) -> Result<Option<Arc<Mutex<Vec<Session>>>>>;

    /// Save the given inbound group session.
    async fn save_inbound_group_session(&self, session: InboundGroupSession) -> Result<()>;

    /// Get the inbound group session that was sent to us by the device with
    /// the given curve25519 key.
    async fn get_inbound_group_session(
        &self,
        sender_key: &str,
        session_id: &str,
    ) -> Result<Option<InboundGroupSession>>;

    /// Permanently remove an inbound group session from the store.
    async fn remove_inbound_group_session(
        &self,
        sender_key: &str,
        session_id: &str,
    ) -> Result<()>;

    /// Save the given device record.
    async fn save_device(&self, device: ReadOnlyDevice) -> Result<()>;

    /// Delete the given device record.
    async fn delete_device(&self, device: ReadOnlyDevice) -> Result<()>;

    /// Get the device record of the given device belonging to the given
    /// user.
    async fn get_device(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> Result<Option<ReadOnlyDevice>>;

    /// Get all the device records of the given user.
    async fn get_user_devices(&self, user_id: &UserId) -> Result<UserDevices>;

    /// Add a user to the set of users whose devices we keep track of.
    ///
    /// Returns true if the user was not yet tracked. The dirty flag marks
    /// users whose device list needs a refresh.
    async fn update_tracked_user(&self, user: &UserId, dirty: bool) -> Result<bool>;

    /// Is the given user already tracked.
    fn is_user_tracked(&self, user_id: &UserId) -> bool;

    /// The set of tracked users whose device lists are out of date.
    fn users_for_key_query(&self) -> HashSet<UserId>;

    /// Wait until every previously issued write has hit the backing storage.
    async fn flush(&self) -> Result<()>;
}
