//! Signaling wire messages.
//!
//! Every frame is one UTF-8 JSON object tagged by `type`. Negotiation payloads
//! (`offer`, `answer`, `candidate`) are carried as opaque JSON and never inspected
//! by the server.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProtocolError;

const CLIENT_TYPES: &[&str] = &["join", "offer", "answer", "ice-candidate"];

/// Client to server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
  #[serde(rename_all = "camelCase")]
  Join {
    #[serde(default)]
    room_id: String,
    #[serde(default)]
    is_host: bool,
  },
  #[serde(rename_all = "camelCase")]
  Offer { room_id: String, offer: Value },
  #[serde(rename_all = "camelCase")]
  Answer { room_id: String, answer: Value },
  #[serde(rename_all = "camelCase")]
  IceCandidate { room_id: String, candidate: Value },
}

impl ClientMessage {
  pub fn kind(&self) -> &'static str {
    match self {
      ClientMessage::Join { .. } => "join",
      ClientMessage::Offer { .. } => "offer",
      ClientMessage::Answer { .. } => "answer",
      ClientMessage::IceCandidate { .. } => "ice-candidate",
    }
  }
}

/// Server to client, plus the relayed negotiation frames a peer receives from its counterpart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
  #[serde(rename_all = "camelCase")]
  PeerReady { room_id: String },
  #[serde(rename_all = "camelCase")]
  Joined { room_id: String },
  #[serde(rename_all = "camelCase")]
  RoomNotFound { room_id: String },
  #[serde(rename_all = "camelCase")]
  RoomFull { room_id: String },
  #[serde(rename_all = "camelCase")]
  PeerDisconnected { room_id: String },
  #[serde(rename_all = "camelCase")]
  RoomExpired { room_id: String },
  Error { message: String },
  #[serde(rename_all = "camelCase")]
  Offer { room_id: String, offer: Value },
  #[serde(rename_all = "camelCase")]
  Answer { room_id: String, answer: Value },
  #[serde(rename_all = "camelCase")]
  IceCandidate { room_id: String, candidate: Value },
}

impl ServerMessage {
  pub fn error(message: impl Into<String>) -> Self {
    ServerMessage::Error { message: message.into() }
  }
}

/// Classifies a raw frame so the reply can say *why* it was rejected.
pub fn parse_client_message(text: &str) -> Result<ClientMessage, ProtocolError> {
  let value: Value = serde_json::from_str(text).map_err(|_| ProtocolError::Malformed)?;
  let kind = value
    .get("type")
    .and_then(Value::as_str)
    .ok_or(ProtocolError::Malformed)?
    .to_string();
  if !CLIENT_TYPES.contains(&kind.as_str()) {
    return Err(ProtocolError::UnknownType(kind));
  }
  serde_json::from_value(value).map_err(|_| ProtocolError::InvalidFields(kind))
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn join_uses_camel_case_fields() {
    let msg = parse_client_message(r#"{"type":"join","roomId":"r1","isHost":true}"#).unwrap();
    assert_eq!(
      msg,
      ClientMessage::Join {
        room_id: "r1".into(),
        is_host: true
      }
    );
  }

  #[test]
  fn join_without_room_id_still_parses() {
    // Empty ids are rejected by the registry with a dedicated message.
    let msg = parse_client_message(r#"{"type":"join"}"#).unwrap();
    assert_eq!(
      msg,
      ClientMessage::Join {
        room_id: String::new(),
        is_host: false
      }
    );
  }

  #[test]
  fn negotiation_payloads_stay_opaque() {
    let text = r#"{"type":"ice-candidate","roomId":"r1","candidate":{"candidate":"candidate:1 1 udp 1 10.0.0.1 5000 typ host","sdpMid":"0","weird":[1,2]}}"#;
    match parse_client_message(text).unwrap() {
      ClientMessage::IceCandidate { candidate, .. } => assert_eq!(candidate["weird"], json!([1, 2])),
      other => panic!("unexpected {other:?}"),
    }
  }

  #[test]
  fn rejects_are_classified() {
    assert_eq!(parse_client_message("not json"), Err(ProtocolError::Malformed));
    assert_eq!(parse_client_message("[1,2]"), Err(ProtocolError::Malformed));
    assert_eq!(
      parse_client_message(r#"{"type":"hello"}"#),
      Err(ProtocolError::UnknownType("hello".into()))
    );
    assert_eq!(
      parse_client_message(r#"{"type":"offer","roomId":"r1"}"#),
      Err(ProtocolError::InvalidFields("offer".into()))
    );
  }

  #[test]
  fn server_notifications_serialize_with_room_id() {
    let text = serde_json::to_string(&ServerMessage::PeerDisconnected { room_id: "r1".into() }).unwrap();
    assert_eq!(text, r#"{"type":"peer-disconnected","roomId":"r1"}"#);
    let text = serde_json::to_string(&ServerMessage::error("Room already has a host")).unwrap();
    assert_eq!(text, r#"{"type":"error","message":"Room already has a host"}"#);
  }

  #[test]
  fn relayed_frames_decode_as_server_messages() {
    let relayed = r#"{"type":"answer","roomId":"r1","answer":{"type":"answer","sdp":"v=0"}}"#;
    let msg: ServerMessage = serde_json::from_str(relayed).unwrap();
    assert!(matches!(msg, ServerMessage::Answer { ref room_id, .. } if room_id == "r1"));
  }
}
