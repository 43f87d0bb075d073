use thiserror::Error;

/// Outcome of a rejected `join`. The `Display` text is what the joining connection is told.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoomError {
  #[error("Room ID is required")]
  MissingRoomId,
  #[error("Room already has a host")]
  AlreadyHasHost,
  #[error("Room not found")]
  RoomNotFound,
  #[error("Room is full")]
  RoomFull,
  #[error("Already joined a room")]
  AlreadyJoined,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RelayError {
  #[error("Not connected to any room")]
  NotInRoom,
  #[error("Peer not connected")]
  PeerNotConnected,
}

/// Receiver/sender side failures. These stay local to the peer that hit them.
#[derive(Debug, Error)]
pub enum TransferError {
  #[error("unknown file id {0}")]
  UnknownFile(String),
  #[error("chunk index {index} out of range for {total} chunks")]
  ChunkOutOfRange { index: u32, total: u32 },
  #[error("invalid chunk encoding: {0}")]
  Decode(#[from] base64::DecodeError),
  #[error("chunk {index} failed to decrypt")]
  Decrypt { index: u32 },
  #[error("encrypted transfer but no session key installed")]
  MissingKey,
  #[error("transfer incomplete: {received}/{total} chunks")]
  Incomplete { received: usize, total: u32 },
  #[error("reassembled {actual} bytes, expected {expected}")]
  SizeMismatch { expected: u64, actual: u64 },
  #[error("data channel closed")]
  ChannelClosed,
  #[error("data channel send failed: {0}")]
  Channel(String),
  #[error(transparent)]
  Io(#[from] std::io::Error),
  #[error(transparent)]
  Encode(#[from] serde_json::Error),
  #[error("transfer cancelled by sender")]
  Cancelled,
  #[error("no chunk received for {0:?}")]
  TimedOut(std::time::Duration),
  #[error("invalid session key length")]
  InvalidKey,
  #[error("crypto failure: {0}")]
  Crypto(String),
}

/// Rejection of an inbound signaling frame. Reported to the sender only.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
  #[error("Invalid message format")]
  Malformed,
  #[error("Unknown message type: {0}")]
  UnknownType(String),
  #[error("Invalid {0} message")]
  InvalidFields(String),
}
