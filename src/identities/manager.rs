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

use std::{convert::TryFrom, sync::Arc};

use ruma::{DeviceId, DeviceIdBox, DeviceKeyAlgorithm, UserId};
use tracing::{info, warn};

use super::{LocalTrust, ReadOnlyDevice};
use crate::{
    error::DeviceError,
    store::{CryptoStore, Result as StoreResult, UserDevices},
    types::DeviceKeys,
};

/// The result of taking a batch of device key claims into the directory.
#[derive(Debug, Default)]
pub struct DeviceKeysIntake {
    /// Devices that were seen for the first time.
    pub new: Vec<ReadOnlyDevice>,
    /// Devices we already knew about, possibly with refreshed metadata.
    pub changed: Vec<ReadOnlyDevice>,
    /// Claims that were dropped, together with the reason.
    pub rejected: Vec<DeviceError>,
}

/// The per-user directory of devices we know about.
///
/// Every record that enters the directory carries a valid self-signature,
/// claims that fail validation never make it into the store.
#[derive(Debug, Clone)]
pub(crate) struct DeviceDirectory {
    user_id: Arc<UserId>,
    device_id: Arc<DeviceIdBox>,
    store: Arc<dyn CryptoStore>,
}

impl DeviceDirectory {
    pub fn new(user_id: Arc<UserId>, device_id: Arc<DeviceIdBox>, store: Arc<dyn CryptoStore>) -> Self {
        Self {
            user_id,
            device_id,
            store,
        }
    }

    /// Receive a batch of device key claims for the given user.
    ///
    /// Each claim is validated on its own, a bad record never poisons the
    /// rest of the batch. The account lock is not needed here, so bulk
    /// downloads don't stall concurrent encryption work.
    pub async fn receive_device_keys(
        &self,
        user_id: &UserId,
        device_keys: &[DeviceKeys],
    ) -> StoreResult<DeviceKeysIntake> {
        let mut intake = DeviceKeysIntake::default();

        for keys in device_keys {
            // We don't need our own device in the device store.
            if &keys.user_id == &*self.user_id && keys.device_id == *self.device_id {
                continue;
            }

            if user_id != &keys.user_id {
                warn!(
                    "Mismatch in the device keys payload of device {} from user {}",
                    keys.device_id, keys.user_id
                );
                intake.rejected.push(DeviceError::MismatchedPayload);
                continue;
            }

            let device = self.store.get_device(user_id, &keys.device_id).await?;

            if let Some(mut device) = device {
                match device.update_device(keys) {
                    Ok(()) => {
                        self.store.save_device(device.clone()).await?;
                        intake.changed.push(device);
                    }
                    Err(e) => {
                        warn!(
                            "Failed to update the device keys of {} {}: {}",
                            user_id, keys.device_id, e
                        );
                        intake.rejected.push(e);
                    }
                }
            } else {
                match ReadOnlyDevice::try_from(keys) {
                    Ok(device) => {
                        info!("Found new device {:?}", device);
                        self.store.save_device(device.clone()).await?;
                        intake.new.push(device);
                    }
                    Err(e) => {
                        warn!(
                            "Failed to verify the device key signatures for {} {}",
                            user_id, keys.device_id
                        );
                        intake.rejected.push(DeviceError::InvalidSignature(e));
                    }
                }
            }
        }

        self.store.update_tracked_user(user_id, false).await?;

        Ok(intake)
    }

    /// Get a device the directory knows about.
    pub async fn get_device(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> StoreResult<Option<ReadOnlyDevice>> {
        self.store.get_device(user_id, device_id).await
    }

    /// Get the device that owns the given curve25519 identity key, if any.
    pub async fn get_device_by_identity_key(
        &self,
        user_id: &UserId,
        sender_key: &str,
    ) -> StoreResult<Option<ReadOnlyDevice>> {
        let devices = self.store.get_user_devices(user_id).await?;

        Ok(devices
            .devices()
            .find(|d| {
                d.get_key(DeviceKeyAlgorithm::Curve25519)
                    .map_or(false, |k| k == sender_key)
            })
            .cloned())
    }

    /// Get all the devices the directory knows for the given user.
    pub async fn get_user_devices(&self, user_id: &UserId) -> StoreResult<UserDevices> {
        self.store.get_user_devices(user_id).await
    }

    /// Set the local trust state of a device.
    ///
    /// This is local policy: it gates whether new room keys are shared with
    /// the device, nothing else.
    pub async fn set_device_trust(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        trust_state: LocalTrust,
    ) -> StoreResult<Option<ReadOnlyDevice>> {
        let device = self.store.get_device(user_id, device_id).await?;

        if let Some(device) = device {
            device.set_trust_state(trust_state);
            self.store.save_device(device.clone()).await?;
            Ok(Some(device))
        } else {
            Ok(None)
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use matches::assert_matches;
    use ruma::{user_id, DeviceId, DeviceIdBox, DeviceKeyAlgorithm, UserId};

    use super::DeviceDirectory;
    use crate::{
        error::DeviceError,
        identities::LocalTrust,
        olm::Account,
        store::{CryptoStore, MemoryStore},
    };

    fn own_user_id() -> UserId {
        user_id!("@me:example.org")
    }

    fn bob_id() -> UserId {
        user_id!("@bob:example.org")
    }

    fn bob_device_id() -> Box<DeviceId> {
        "BOBDEVICE".into()
    }

    fn directory() -> DeviceDirectory {
        let device_id: DeviceIdBox = "OWNDEVICE".into();
        let store: Arc<dyn CryptoStore> = Arc::new(MemoryStore::new());

        DeviceDirectory::new(Arc::new(own_user_id()), Arc::new(device_id), store)
    }

    #[tokio::test]
    async fn device_intake() {
        let directory = directory();
        let bob = Account::new(&bob_id(), &bob_device_id());
        let device_keys = bob.device_keys().await;

        let intake = directory
            .receive_device_keys(&bob_id(), &[device_keys.clone()])
            .await
            .unwrap();

        assert_eq!(intake.new.len(), 1);
        assert!(intake.rejected.is_empty());

        let device = directory
            .get_device(&bob_id(), &device_keys.device_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(device.local_trust_state(), LocalTrust::Unknown);

        // A refresh of the same record is accepted but nothing new shows up.
        let intake = directory
            .receive_device_keys(&bob_id(), &[device_keys])
            .await
            .unwrap();
        assert!(intake.new.is_empty());
        assert_eq!(intake.changed.len(), 1);
    }

    #[tokio::test]
    async fn unsigned_devices_are_dropped() {
        let directory = directory();
        let bob = Account::new(&bob_id(), &bob_device_id());
        let mut device_keys = bob.device_keys().await;
        device_keys.signatures.clear();

        let intake = directory
            .receive_device_keys(&bob_id(), &[device_keys.clone()])
            .await
            .unwrap();

        assert!(intake.new.is_empty());
        assert_matches!(
            intake.rejected.first(),
            Some(DeviceError::InvalidSignature(_))
        );
        assert!(directory
            .get_device(&bob_id(), &device_keys.device_id)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn changed_identity_keys_are_rejected() {
        let directory = directory();

        let bob = Account::new(&bob_id(), &bob_device_id());
        let device_keys = bob.device_keys().await;
        directory
            .receive_device_keys(&bob_id(), &[device_keys.clone()])
            .await
            .unwrap();

        // A different account advertising the same device id.
        let impostor = Account::new(&bob_id(), &bob_device_id());
        let impostor_keys = impostor.device_keys().await;

        let intake = directory
            .receive_device_keys(&bob_id(), &[impostor_keys])
            .await
            .unwrap();

        assert_matches!(
            intake.rejected.first(),
            Some(DeviceError::IdentityChanged(_, _))
        );

        // The original record is still there, untouched.
        let device = directory
            .get_device(&bob_id(), &device_keys.device_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            device.get_key(DeviceKeyAlgorithm::Curve25519),
            Some(&bob.identity_keys().curve25519().to_owned())
        );
    }

    #[tokio::test]
    async fn trust_state_changes() {
        let directory = directory();
        let bob = Account::new(&bob_id(), &bob_device_id());
        let device_keys = bob.device_keys().await;

        directory
            .receive_device_keys(&bob_id(), &[device_keys.clone()])
            .await
            .unwrap();

        let device = directory
            .set_device_trust(&bob_id(), &device_keys.device_id, LocalTrust::Blocked)
            .await
            .unwrap()
            .unwrap();
        assert!(device.is_blocked());

        let device = directory
            .get_device(&bob_id(), &device_keys.device_id)
            .await
            .unwrap()
            .unwrap();
        assert!(device.is_blocked());
    }
}
