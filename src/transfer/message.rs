use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Control and data frames exchanged over the direct data channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum DataMessage {
  /// Raw AES-256-GCM key, base64. Sent once by the host before any file.
  SessionKey { key: String },
  #[serde(rename_all = "camelCase")]
  FileMeta {
    #[serde(deserialize_with = "opaque_id")]
    file_id: String,
    name: String,
    size: u64,
    #[serde(default)]
    mime_type: String,
    total_chunks: u32,
    #[serde(default)]
    encrypted: bool,
  },
  #[serde(rename_all = "camelCase")]
  FileChunk {
    #[serde(deserialize_with = "opaque_id")]
    file_id: String,
    index: u32,
    total_chunks: u32,
    data: String,
  },
  #[serde(rename_all = "camelCase")]
  FileAck {
    #[serde(deserialize_with = "opaque_id")]
    file_id: String,
  },
  #[serde(rename_all = "camelCase")]
  FileCancel {
    #[serde(deserialize_with = "opaque_id")]
    file_id: String,
  },
}

impl DataMessage {
  pub fn encode(&self) -> serde_json::Result<String> {
    serde_json::to_string(self)
  }

  pub fn decode(text: &str) -> serde_json::Result<Self> {
    serde_json::from_str(text)
  }
}

// Browser senders use a numeric id.
fn opaque_id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
  match Value::deserialize(deserializer)? {
    Value::String(id) => Ok(id),
    Value::Number(id) => Ok(id.to_string()),
    other => Err(D::Error::custom(format!("invalid file id: {other}"))),
  }
}
