//! Receiver-side reassembly.
//!
//! Chunks may arrive in any order and may repeat. Each distinct index is stored
//! once; the transfer completes when the number of distinct indices reaches the
//! announced `totalChunks`, at which point chunks are concatenated in index order.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::Bytes;
use tracing::{debug, info, warn};

use super::crypto::SessionCipher;
use super::message::DataMessage;
use crate::error::TransferError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkOutcome {
  Stored,
  Duplicate,
}

#[derive(Debug)]
pub struct IncomingFile {
  pub file_id: String,
  pub name: String,
  pub size: u64,
  pub mime_type: String,
  pub total_chunks: u32,
  pub encrypted: bool,
  chunks: BTreeMap<u32, Bytes>,
  received_size: u64,
  last_activity: Instant,
}

impl IncomingFile {
  pub fn new(
    file_id: String,
    name: String,
    size: u64,
    mime_type: String,
    total_chunks: u32,
    encrypted: bool,
    now: Instant,
  ) -> Self {
    Self {
      file_id,
      name,
      size,
      mime_type,
      total_chunks,
      encrypted,
      chunks: BTreeMap::new(),
      received_size: 0,
      last_activity: now,
    }
  }

  /// Stores a base64 chunk. A repeated index is ignored and not counted again.
  pub fn accept_chunk(&mut self, index: u32, data: &str, now: Instant) -> Result<ChunkOutcome, TransferError> {
    if index >= self.total_chunks {
      return Err(TransferError::ChunkOutOfRange {
        index,
        total: self.total_chunks,
      });
    }
    self.last_activity = now;
    if self.chunks.contains_key(&index) {
      return Ok(ChunkOutcome::Duplicate);
    }
    let payload = Bytes::from(STANDARD.decode(data)?);
    self.received_size += payload.len() as u64;
    self.chunks.insert(index, payload);
    Ok(ChunkOutcome::Stored)
  }

  pub fn received_size(&self) -> u64 {
    self.received_size
  }

  pub fn received_chunks(&self) -> usize {
    self.chunks.len()
  }

  pub fn is_complete(&self) -> bool {
    self.chunks.len() == self.total_chunks as usize
  }

  pub fn idle_for(&self, now: Instant) -> Duration {
    now.saturating_duration_since(self.last_activity)
  }

  /// Drains chunks by ascending index into one buffer, decrypting each frame when the sender encrypted.
  /// Each stored chunk is released as soon as it has been appended.
  pub fn reassemble(&mut self, cipher: Option<&SessionCipher>) -> Result<Vec<u8>, TransferError> {
    if !self.is_complete() {
      return Err(TransferError::Incomplete {
        received: self.chunks.len(),
        total: self.total_chunks,
      });
    }
    let cipher = match (self.encrypted, cipher) {
      (false, _) => None,
      (true, Some(cipher)) => Some(cipher),
      (true, None) => return Err(TransferError::MissingKey),
    };
    // `size` comes from the peer; only bytes actually held are trusted for allocation.
    let held: usize = self.chunks.values().map(Bytes::len).sum();
    let mut data = Vec::with_capacity(held);
    for (index, payload) in std::mem::take(&mut self.chunks) {
      match cipher {
        Some(cipher) => {
          let plain = cipher
            .decrypt_frame(&payload)
            .map_err(|_| TransferError::Decrypt { index })?;
          data.extend_from_slice(&plain);
        }
        None => data.extend_from_slice(&payload),
      }
    }
    if data.len() as u64 != self.size {
      return Err(TransferError::SizeMismatch {
        expected: self.size,
        actual: data.len() as u64,
      });
    }
    Ok(data)
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedFile {
  pub file_id: String,
  pub name: String,
  pub mime_type: String,
  pub data: Vec<u8>,
}

#[derive(Debug)]
pub enum ReceiveEvent {
  KeyInstalled,
  /// A `file-meta` was accepted; the caller answers with `file-ack`.
  Started {
    file_id: String,
    name: String,
    size: u64,
    total_chunks: u32,
  },
  Progress {
    file_id: String,
    received_size: u64,
    size: u64,
  },
  Duplicate {
    file_id: String,
    index: u32,
  },
  Completed(CompletedFile),
  Failed {
    file_id: String,
    name: String,
    error: TransferError,
  },
  Acknowledged {
    file_id: String,
  },
  Ignored,
}

/// All in-flight inbound transfers for one data channel, keyed by `fileId`.
#[derive(Debug, Default)]
pub struct TransferReceiver {
  transfers: HashMap<String, IncomingFile>,
  cipher: Option<SessionCipher>,
}

impl TransferReceiver {
  pub fn new(cipher: Option<SessionCipher>) -> Self {
    Self {
      transfers: HashMap::new(),
      cipher,
    }
  }

  pub fn cipher(&self) -> Option<&SessionCipher> {
    self.cipher.as_ref()
  }

  pub fn pending(&self) -> usize {
    self.transfers.len()
  }

  pub fn progress(&self, file_id: &str) -> Option<(u64, u64)> {
    self.transfers.get(file_id).map(|t| (t.received_size, t.size))
  }

  /// Only errors for frames that cannot be tied to a tracked transfer.
  pub fn handle(&mut self, msg: DataMessage, now: Instant) -> Result<ReceiveEvent, TransferError> {
    match msg {
      DataMessage::SessionKey { key } => {
        self.cipher = Some(SessionCipher::from_encoded(&key)?);
        info!("session key installed");
        Ok(ReceiveEvent::KeyInstalled)
      }
      DataMessage::FileMeta {
        file_id,
        name,
        size,
        mime_type,
        total_chunks,
        encrypted,
      } => {
        if self.transfers.contains_key(&file_id) {
          debug!(file_id = %file_id, "duplicate file-meta ignored");
          return Ok(ReceiveEvent::Ignored);
        }
        if encrypted && self.cipher.is_none() {
          warn!(file = %name, "encrypted file announced without a session key");
          return Ok(ReceiveEvent::Failed {
            file_id,
            name,
            error: TransferError::MissingKey,
          });
        }
        info!(file = %name, size, total_chunks, encrypted, "receiving");
        let transfer = IncomingFile::new(file_id.clone(), name.clone(), size, mime_type, total_chunks, encrypted, now);
        if transfer.is_complete() {
          // Zero-length file: nothing further will arrive.
          return Ok(self.finish(transfer));
        }
        self.transfers.insert(file_id.clone(), transfer);
        Ok(ReceiveEvent::Started {
          file_id,
          name,
          size,
          total_chunks,
        })
      }
      DataMessage::FileChunk {
        file_id, index, data, ..
      } => {
        let transfer = self
          .transfers
          .get_mut(&file_id)
          .ok_or_else(|| TransferError::UnknownFile(file_id.clone()))?;
        match transfer.accept_chunk(index, &data, now) {
          Ok(ChunkOutcome::Duplicate) => Ok(ReceiveEvent::Duplicate { file_id, index }),
          Ok(ChunkOutcome::Stored) if transfer.is_complete() => {
            let transfer = self.transfers.remove(&file_id).ok_or(TransferError::UnknownFile(file_id))?;
            Ok(self.finish(transfer))
          }
          Ok(ChunkOutcome::Stored) => Ok(ReceiveEvent::Progress {
            file_id,
            received_size: transfer.received_size,
            size: transfer.size,
          }),
          Err(error) => Ok(self.fail(&file_id, error)),
        }
      }
      DataMessage::FileAck { file_id } => Ok(ReceiveEvent::Acknowledged { file_id }),
      DataMessage::FileCancel { file_id } => {
        if self.transfers.contains_key(&file_id) {
          Ok(self.fail(&file_id, TransferError::Cancelled))
        } else {
          Ok(ReceiveEvent::Ignored)
        }
      }
    }
  }

  fn finish(&self, mut transfer: IncomingFile) -> ReceiveEvent {
    match transfer.reassemble(self.cipher.as_ref()) {
      Ok(data) => {
        info!(file = %transfer.name, bytes = data.len(), "file reassembled");
        ReceiveEvent::Completed(CompletedFile {
          file_id: transfer.file_id,
          name: transfer.name,
          mime_type: transfer.mime_type,
          data,
        })
      }
      Err(error) => {
        warn!(file = %transfer.name, %error, "reassembly failed");
        ReceiveEvent::Failed {
          file_id: transfer.file_id,
          name: transfer.name,
          error,
        }
      }
    }
  }

  fn fail(&mut self, file_id: &str, error: TransferError) -> ReceiveEvent {
    let name = self
      .transfers
      .remove(file_id)
      .map(|t| t.name)
      .unwrap_or_default();
    warn!(file = %name, %error, "transfer failed");
    ReceiveEvent::Failed {
      file_id: file_id.to_string(),
      name,
      error,
    }
  }

  /// Abandons transfers that have not seen a chunk within `idle`.
  pub fn expire_idle(&mut self, now: Instant, idle: Duration) -> Vec<ReceiveEvent> {
    let stale: Vec<String> = self
      .transfers
      .values()
      .filter(|t| t.idle_for(now) > idle)
      .map(|t| t.file_id.clone())
      .collect();
    stale
      .into_iter()
      .map(|file_id| self.fail(&file_id, TransferError::TimedOut(idle)))
      .collect()
  }

  /// The channel is gone; nothing in flight can complete.
  pub fn abandon_all(&mut self) -> Vec<ReceiveEvent> {
    let ids: Vec<String> = self.transfers.keys().cloned().collect();
    ids
      .into_iter()
      .map(|file_id| self.fail(&file_id, TransferError::ChannelClosed))
      .collect()
  }
}

/// Writes a completed file into `dir` under a sanitised name.
pub async fn save_completed(dir: &Path, file: &CompletedFile) -> Result<PathBuf, TransferError> {
  let path = dir.join(sanitize_file_name(&file.name));
  tokio::fs::write(&path, &file.data).await?;
  Ok(path)
}

pub fn sanitize_file_name(name: &str) -> String {
  let candidate = Path::new(name).file_name().and_then(|n| n.to_str()).unwrap_or("file");
  let trimmed = candidate.trim();
  if trimmed.is_empty() || trimmed == "." || trimmed == ".." {
    "file".to_string()
  } else {
    trimmed.to_string()
  }
}
