// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Signaling frames exchanged with peers over their persistent connection

use serde::{Deserialize, Serialize};

use crate::message::Message;
use crate::request_id::RequestId;

/// A JSON text frame, discriminated by its `action` field.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum Frame {
    /// Peer → relay: register this connection for `(peer_id, topic)`.
    Subscribe {
        #[serde(rename = "peerId")]
        peer_id: String,
        topic: String,
    },
    /// Either direction: announcement of a blob.
    Message { message: Message },
    /// Relay → peer: upload the blob `key` to `sendBlob?requestId=...`.
    RequestBlob {
        key: String,
        #[serde(rename = "requestId")]
        request_id: String,
    },
}

#[derive(thiserror::Error, Debug)]
pub enum FrameError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
}

impl Frame {
    pub fn parse(text: &str) -> Result<Self, FrameError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn request_blob(key: &str, request_id: &RequestId) -> Self {
        Self::RequestBlob {
            key: key.to_owned(),
            request_id: request_id.to_string(),
        }
    }

    pub fn to_json(&self) -> String {
        // Every variant is plain strings and integers, so this can't fail.
        serde_json::to_string(self).unwrap()
    }

    /// Name of the `action`, for logging.
    pub fn action(&self) -> &'static str {
        match self {
            Frame::Subscribe { .. } => "subscribe",
            Frame::Message { .. } => "message",
            Frame::RequestBlob { .. } => "requestBlob",
        }
    }
}

impl From<Message> for Frame {
    fn from(message: Message) -> Self {
        Frame::Message { message }
    }
}
