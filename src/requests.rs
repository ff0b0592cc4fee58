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

use std::collections::BTreeMap;

use ruma::{DeviceIdBox, UserId};
use serde_json::Value;
use uuid::Uuid;

/// A request to send a batch of events directly to a set of devices.
///
/// The engine never talks to the homeserver itself, requests like this one
/// are handed to the transport layer which is responsible for sending them
/// out.
#[derive(Clone, Debug)]
pub struct ToDeviceRequest {
    /// The type of the events that are sent out, `m.room.encrypted` for
    /// encrypted payloads.
    pub event_type: String,
    /// A unique transaction id so the transport can retry the request
    /// without duplicating events.
    pub txn_id: Uuid,
    /// The event contents, grouped per user and device.
    pub messages: BTreeMap<UserId, BTreeMap<DeviceIdBox, Value>>,
}

impl ToDeviceRequest {
    pub(crate) fn new(event_type: &str) -> Self {
        Self {
            event_type: event_type.to_owned(),
            txn_id: Uuid::new_v4(),
            messages: BTreeMap::new(),
        }
    }

    /// The number of unique messages this request contains.
    pub fn message_count(&self) -> usize {
        self.messages.values().map(|m| m.len()).sum()
    }
}
