//! Wire type for the `chat/1.0` protocol: newline-delimited JSON.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatEnvelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    pub text: String,
    pub ts: i64,
    /// True for a broadcast delivery; false for a direct message.
    #[serde(default)]
    pub broadcast: bool,
}
