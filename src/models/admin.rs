//! Admin endpoint bodies.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize)]
pub struct AdminRequest {
    #[serde(default)]
    pub password: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddKeyRequest {
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteKeyRequest {
    #[serde(default)]
    pub password: Option<String>,
    /// Number or numeric string; validated by the handler.
    #[serde(default)]
    pub key_index: Option<serde_json::Value>,
}

impl DeleteKeyRequest {
    pub fn parsed_index(&self) -> Option<i64> {
        match self.key_index.as_ref()? {
            serde_json::Value::Number(n) => n.as_i64(),
            serde_json::Value::String(s) => s.trim().parse::<i64>().ok(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedactedKey {
    pub id: usize,
    pub key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeysResponse {
    pub keys: Vec<RedactedKey>,
    pub total: usize,
    pub current_index: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyChangeResponse {
    pub message: String,
    pub total: usize,
}
