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

use std::fmt;

use olm_rs::utility::OlmUtility;
use ruma::{DeviceKeyId, UserId};
use serde_json::Value;

use crate::error::SignatureError;

/// Convert a JSON object into the canonical form that signatures and hashes
/// are computed over.
///
/// Object keys get sorted by their code points, insignificant whitespace is
/// dropped and the `signatures` and `unsigned` fields are removed. This is
/// the normative interop surface, any deviation here breaks signature checks
/// against other clients.
pub(crate) fn canonical_json(json: &Value) -> Result<String, SignatureError> {
    let mut json = json.clone();
    let json_object = json.as_object_mut().ok_or(SignatureError::NotAnObject)?;
    json_object.remove("signatures");
    json_object.remove("unsigned");

    Ok(cjson::to_string(&json)?)
}

/// Stateless helper wrapping the signature verification and hashing
/// primitives.
pub(crate) struct Utility {
    inner: OlmUtility,
}

impl fmt::Debug for Utility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Utility").finish()
    }
}

impl Default for Utility {
    fn default() -> Self {
        Self::new()
    }
}

impl Utility {
    pub fn new() -> Self {
        Self {
            inner: OlmUtility::new(),
        }
    }

    /// Get the base64 encoded SHA-256 hash of the UTF-8 bytes of the given
    /// message.
    pub fn sha256(&self, message: &str) -> String {
        self.inner.sha256_utf8_msg(message)
    }

    /// Verify a signed JSON object.
    ///
    /// The object must have a signatures key associated with an object of the
    /// form `user_id: {key_id: signature}`.
    ///
    /// # Arguments
    ///
    /// * `user_id` - The user who signed the JSON object.
    ///
    /// * `key_id` - The id of the key that signed the JSON object.
    ///
    /// * `signing_key` - The public ed25519 key which was used to sign the
    /// JSON object.
    ///
    /// * `json` - The JSON object that should be verified.
    pub(crate) fn verify_json(
        &self,
        user_id: &UserId,
        key_id: &DeviceKeyId,
        signing_key: &str,
        json: &mut Value,
    ) -> Result<(), SignatureError> {
        let json_object = json.as_object_mut().ok_or(SignatureError::NotAnObject)?;
        let unsigned = json_object.remove("unsigned");
        let signatures = json_object.remove("signatures");

        let canonical_json = cjson::to_string(json_object)?;

        if let Some(u) = unsigned {
            json_object.insert("unsigned".to_string(), u);
        }

        let signatures = signatures.ok_or(SignatureError::NoSignatureFound)?;
        let signature = signatures
            .as_object()
            .and_then(|s| s.get(user_id.as_str()))
            .and_then(|u| u.get(key_id.to_string()))
            .and_then(|s| s.as_str())
            .ok_or(SignatureError::NoSignatureFound)?;

        let ret = if self
            .inner
            .ed25519_verify(signing_key, &canonical_json, signature)
            .is_ok()
        {
            Ok(())
        } else {
            Err(SignatureError::VerificationError)
        };

        json.as_object_mut()
            .expect("The JSON value is still an object")
            .insert("signatures".to_string(), signatures);

        ret
    }

    /// Verify a detached signature over the canonical form of the given JSON
    /// object.
    ///
    /// # Arguments
    ///
    /// * `signing_key` - The public ed25519 key that allegedly produced the
    /// signature.
    ///
    /// * `json` - The JSON object the signature covers.
    ///
    /// * `signature` - The base64 encoded signature to check.
    pub(crate) fn verify_json_signature(
        &self,
        signing_key: &str,
        json: &Value,
        signature: &str,
    ) -> Result<(), SignatureError> {
        let canonical_json = canonical_json(json)?;

        if self
            .inner
            .ed25519_verify(signing_key, &canonical_json, signature)
            .is_ok()
        {
            Ok(())
        } else {
            Err(SignatureError::VerificationError)
        }
    }
}

#[cfg(test)]
mod test {
    use ruma::{user_id, DeviceId, UserId};
    use serde_json::json;

    use super::Utility;
    use crate::olm::Account;

    fn alice_id() -> UserId {
        user_id!("@alice:example.org")
    }

    fn alice_device_id() -> Box<DeviceId> {
        "ALICEDEVICE".into()
    }

    #[tokio::test]
    async fn signature_verification() {
        let account = Account::new(&alice_id(), &alice_device_id());
        let utility = Utility::new();

        let payload = json!({
            "fruits": ["apple", "banana"],
            "nested": { "b": 1, "a": 2 },
        });

        let signature = account.sign_json(&payload).await.unwrap();

        utility
            .verify_json_signature(account.identity_keys().ed25519(), &payload, &signature)
            .unwrap();

        // The canonical form is independent of the key order of the object
        // that gets signed.
        let reordered = json!({
            "nested": { "a": 2, "b": 1 },
            "fruits": ["apple", "banana"],
        });

        utility
            .verify_json_signature(account.identity_keys().ed25519(), &reordered, &signature)
            .unwrap();

        let tampered = json!({
            "fruits": ["apple", "cherry"],
            "nested": { "b": 1, "a": 2 },
        });

        assert!(utility
            .verify_json_signature(account.identity_keys().ed25519(), &tampered, &signature)
            .is_err());
    }

    #[test]
    fn sha256_hashing() {
        let utility = Utility::new();
        let hash = utility.sha256("Hello world");

        assert!(!hash.is_empty());
        assert_eq!(hash, utility.sha256("Hello world"));
        assert_ne!(hash, utility.sha256("Hello worlds"));
    }
}
