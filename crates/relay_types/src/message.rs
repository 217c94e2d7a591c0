// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::fmt;

use serde::{Deserialize, Serialize};

/// Announcement that a blob of content exists somewhere in the relay network.
///
/// `key` identifies the blob across the whole system, `topic` groups related announcements
/// and `timestamp` orders them inside a topic (oldest first for replay and for eviction).
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub key: String,
    pub name: String,
    pub content_type: String,
    pub length: u64,
    pub topic: String,
    pub alias: String,
    pub timestamp: i64,
}

impl Message {
    /// Serializes to the JSON object used inside `message` frames.
    pub fn to_json(&self) -> String {
        // A struct of strings and integers always serializes.
        serde_json::to_string(self).unwrap()
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({:?}, {} bytes, topic {:?}, t={})",
            self.key, self.name, self.length, self.topic, self.timestamp
        )
    }
}

/// Claim that the peer `peer_id` holds the blob announced by `message`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PeerMessage {
    pub peer_id: String,
    pub message: Message,
}

impl PeerMessage {
    pub fn new(peer_id: impl Into<String>, message: Message) -> Self {
        Self {
            peer_id: peer_id.into(),
            message,
        }
    }
}

impl fmt::Display for PeerMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} claims {}", self.peer_id, self.message)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub fn message(key: &str, topic: &str, timestamp: i64) -> Message {
        Message {
            key: key.into(),
            name: format!("{key}.bin"),
            content_type: "application/octet-stream".into(),
            length: 3,
            topic: topic.into(),
            alias: "alice".into(),
            timestamp,
        }
    }

    #[test]
    fn uses_camel_case_field_names() {
        let json: serde_json::Value =
            serde_json::from_str(&message("k1", "pics", 7).to_json()).unwrap();
        assert_eq!(json["contentType"], "application/octet-stream");
        assert_eq!(json["length"], 3);
        assert_eq!(json["timestamp"], 7);
        assert!(json.get("content_type").is_none());
    }

    #[test]
    fn rejects_messages_with_missing_fields() {
        let err = serde_json::from_str::<Message>(r#"{"key":"k","name":"n"}"#).unwrap_err();
        assert!(err.to_string().contains("missing field"));
    }
}
