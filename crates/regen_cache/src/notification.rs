// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The result notification exchanged after each regeneration attempt.

use serde::{Deserialize, Serialize};

/// Outcome of a regeneration attempt for one key.
///
/// The same message releases local awaiters and, serialized as JSON, travels
/// over the fan-out bus so peer nodes can release theirs and drop their local
/// copies. The wire field names are part of the cross-node contract and must
/// not change:
///
/// ```json
/// {"Success": true, "Key": "orders:42", "Sender": "host-orders-6f9a…"}
/// ```
///
/// `sender` carries a per-process identity so a node can tell its own echo
/// from a peer's notification.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultNotification {
    /// Whether the regeneration produced (or confirmed) a stored value.
    #[serde(rename = "Success")]
    pub success: bool,

    /// The cache key the notification is about.
    #[serde(rename = "Key")]
    pub key: String,

    /// The generation callback's error message, on failure.
    #[serde(rename = "Exception", default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Identity of the originating process.
    #[serde(rename = "Sender")]
    pub sender: String,
}

impl ResultNotification {
    /// A success notification from `sender` about `key`.
    #[must_use]
    pub fn success(key: &str, sender: &str) -> Self {
        Self {
            success: true,
            key: key.to_owned(),
            error: None,
            sender: sender.to_owned(),
        }
    }

    /// A failure notification carrying the generation error message.
    #[must_use]
    pub fn failure(key: &str, sender: &str, message: impl Into<String>) -> Self {
        Self {
            success: false,
            key: key.to_owned(),
            error: Some(message.into()),
            sender: sender.to_owned(),
        }
    }
}
