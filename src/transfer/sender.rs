use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::sleep;
use tracing::{debug, info};
use uuid::Uuid;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;

use super::crypto::SessionCipher;
use super::message::DataMessage;
use crate::error::TransferError;

const BACKPRESSURE_POLL: Duration = Duration::from_millis(10);
const DRAIN_POLLS: usize = 500;

/// The outbound half of a data channel, as the sender sees it.
pub trait ChunkSink {
  fn send_text(&self, text: String) -> impl Future<Output = Result<(), TransferError>> + Send;
  fn buffered_amount(&self) -> impl Future<Output = usize> + Send;
  fn is_open(&self) -> bool;
}

impl ChunkSink for RTCDataChannel {
  fn send_text(&self, text: String) -> impl Future<Output = Result<(), TransferError>> + Send {
    async move {
      RTCDataChannel::send_text(self, text)
        .await
        .map(|_| ())
        .map_err(|err| TransferError::Channel(err.to_string()))
    }
  }

  fn buffered_amount(&self) -> impl Future<Output = usize> + Send {
    RTCDataChannel::buffered_amount(self)
  }

  fn is_open(&self) -> bool {
    self.ready_state() == RTCDataChannelState::Open
  }
}

#[derive(Debug, Clone, Copy)]
pub struct SendOptions {
  pub chunk_size: usize,
  /// Fixed pause after every chunk.
  pub chunk_delay: Duration,
  /// Sending pauses while the channel buffers more than this many bytes.
  pub high_water_mark: usize,
}

/// Sender-side bookkeeping for one file.
#[derive(Debug, Clone)]
pub struct OutgoingFile {
  pub path: PathBuf,
  pub file_id: String,
  pub name: String,
  pub size: u64,
  pub mime_type: String,
  pub total_chunks: u32,
  pub sent_size: u64,
}

impl OutgoingFile {
  pub fn new(path: PathBuf, name: String, size: u64, mime_type: String, chunk_size: usize) -> Self {
    Self {
      path,
      file_id: Uuid::new_v4().to_string(),
      name,
      size,
      mime_type,
      total_chunks: total_chunks(size, chunk_size),
      sent_size: 0,
    }
  }

  pub async fn from_path(path: &Path, chunk_size: usize) -> Result<Self, TransferError> {
    let metadata = tokio::fs::metadata(path).await?;
    let name = path
      .file_name()
      .and_then(|n| n.to_str())
      .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidInput, "invalid file name"))?
      .to_string();
    let mime = mime_guess::from_path(path).first_or_octet_stream().essence_str().to_string();
    Ok(Self::new(path.to_path_buf(), name, metadata.len(), mime, chunk_size))
  }

  pub fn meta(&self, encrypted: bool) -> DataMessage {
    DataMessage::FileMeta {
      file_id: self.file_id.clone(),
      name: self.name.clone(),
      size: self.size,
      mime_type: self.mime_type.clone(),
      total_chunks: self.total_chunks,
      encrypted,
    }
  }

  pub fn is_done(&self) -> bool {
    self.sent_size >= self.size
  }
}

pub fn total_chunks(size: u64, chunk_size: usize) -> u32 {
  size.div_ceil(chunk_size as u64) as u32
}

/// Streams `reader` as `file-meta` followed by indexed `file-chunk` frames.
///
/// Completion means every chunk was handed to the channel; the receiver is
/// not asked to confirm. Setting `cancel` stops before the next chunk and
/// tells the receiver with `file-cancel`.
pub async fn send_file<S, R>(
  sink: &S,
  reader: &mut R,
  file: &mut OutgoingFile,
  cipher: Option<&SessionCipher>,
  options: &SendOptions,
  cancel: &AtomicBool,
) -> Result<(), TransferError>
where
  S: ChunkSink,
  R: AsyncRead + Unpin,
{
  sink.send_text(file.meta(cipher.is_some()).encode()?).await?;
  info!(file = %file.name, size = file.size, chunks = file.total_chunks, "sending");

  let mut buffer = vec![0u8; options.chunk_size];
  for index in 0..file.total_chunks {
    if cancel.load(Ordering::SeqCst) {
      let _ = sink
        .send_text(
          DataMessage::FileCancel {
            file_id: file.file_id.clone(),
          }
          .encode()?,
        )
        .await;
      return Err(TransferError::Cancelled);
    }
    wait_for_capacity(sink, options.high_water_mark).await?;

    let read = read_chunk(reader, &mut buffer).await?;
    if read == 0 {
      return Err(TransferError::Io(std::io::Error::new(
        std::io::ErrorKind::UnexpectedEof,
        format!("{} ended at chunk {index} of {}", file.name, file.total_chunks),
      )));
    }
    let payload = match cipher {
      Some(cipher) => cipher.encrypt_frame(&buffer[..read])?,
      None => buffer[..read].to_vec(),
    };
    let chunk = DataMessage::FileChunk {
      file_id: file.file_id.clone(),
      index,
      total_chunks: file.total_chunks,
      data: STANDARD.encode(&payload),
    };
    sink.send_text(chunk.encode()?).await?;
    file.sent_size += read as u64;
    debug!(file = %file.name, index, sent = file.sent_size, "chunk sent");

    if !options.chunk_delay.is_zero() {
      sleep(options.chunk_delay).await;
    }
  }
  Ok(())
}

/// Fills `buffer` unless the reader hits EOF first.
async fn read_chunk<R: AsyncRead + Unpin>(reader: &mut R, buffer: &mut [u8]) -> Result<usize, TransferError> {
  let mut filled = 0;
  while filled < buffer.len() {
    let read = reader.read(&mut buffer[filled..]).await?;
    if read == 0 {
      break;
    }
    filled += read;
  }
  Ok(filled)
}

async fn wait_for_capacity<S: ChunkSink>(sink: &S, high_water_mark: usize) -> Result<(), TransferError> {
  loop {
    if !sink.is_open() {
      return Err(TransferError::ChannelClosed);
    }
    if sink.buffered_amount().await <= high_water_mark {
      return Ok(());
    }
    sleep(BACKPRESSURE_POLL).await;
  }
}

/// Bounded wait for the channel to flush what it already accepted.
pub async fn wait_for_drain<S: ChunkSink>(sink: &S) {
  for _ in 0..DRAIN_POLLS {
    if !sink.is_open() {
      break;
    }
    if sink.buffered_amount().await == 0 {
      break;
    }
    sleep(BACKPRESSURE_POLL).await;
  }
}

#[cfg(test)]
pub(crate) mod tests {
  use super::*;
  use std::sync::atomic::AtomicUsize;
  use std::sync::Mutex;

  /// In-memory channel that records frames and reports a scripted buffered amount.
  #[derive(Default)]
  pub(crate) struct MemorySink {
    pub frames: Mutex<Vec<String>>,
    pub buffered: AtomicUsize,
    pub closed: AtomicBool,
  }

  impl MemorySink {
    pub fn messages(&self) -> Vec<DataMessage> {
      self
        .frames
        .lock()
        .unwrap()
        .iter()
        .map(|text| DataMessage::decode(text).unwrap())
        .collect()
    }
  }

  impl ChunkSink for MemorySink {
    fn send_text(&self, text: String) -> impl Future<Output = Result<(), TransferError>> + Send {
      let result = if self.closed.load(Ordering::SeqCst) {
        Err(TransferError::ChannelClosed)
      } else {
        self.frames.lock().unwrap().push(text);
        Ok(())
      };
      async move { result }
    }

    fn buffered_amount(&self) -> impl Future<Output = usize> + Send {
      let amount = self.buffered.load(Ordering::SeqCst);
      async move { amount }
    }

    fn is_open(&self) -> bool {
      !self.closed.load(Ordering::SeqCst)
    }
  }

  pub(crate) fn options() -> SendOptions {
    SendOptions {
      chunk_size: crate::config::CHUNK_SIZE,
      chunk_delay: Duration::ZERO,
      high_water_mark: 1024,
    }
  }

  fn outgoing(size: u64) -> OutgoingFile {
    OutgoingFile::new(
      PathBuf::from("report.bin"),
      "report.bin".into(),
      size,
      "application/octet-stream".into(),
      crate::config::CHUNK_SIZE,
    )
  }

  #[test]
  fn chunk_count_rounds_up() {
    assert_eq!(total_chunks(0, 16384), 0);
    assert_eq!(total_chunks(1, 16384), 1);
    assert_eq!(total_chunks(16384, 16384), 1);
    assert_eq!(total_chunks(40000, 16384), 3);
  }

  #[tokio::test]
  async fn emits_meta_then_fixed_size_chunks() {
    let data: Vec<u8> = (0..40000u32).map(|i| (i % 251) as u8).collect();
    let sink = MemorySink::default();
    let mut file = outgoing(data.len() as u64);
    let cancel = AtomicBool::new(false);

    send_file(&sink, &mut data.as_slice(), &mut file, None, &options(), &cancel)
      .await
      .unwrap();

    let messages = sink.messages();
    assert_eq!(messages.len(), 4);
    assert!(matches!(
      &messages[0],
      DataMessage::FileMeta { total_chunks: 3, size: 40000, encrypted: false, .. }
    ));
    let sizes: Vec<usize> = messages[1..]
      .iter()
      .map(|msg| match msg {
        DataMessage::FileChunk { data, .. } => STANDARD.decode(data).unwrap().len(),
        other => panic!("unexpected {other:?}"),
      })
      .collect();
    assert_eq!(sizes, vec![16384, 16384, 7232]);
    assert_eq!(file.sent_size, 40000);
    assert!(file.is_done());
  }

  #[tokio::test]
  async fn cancellation_notifies_the_receiver() {
    let data = vec![7u8; 50000];
    let sink = MemorySink::default();
    let mut file = outgoing(data.len() as u64);
    let cancel = AtomicBool::new(true);

    let result = send_file(&sink, &mut data.as_slice(), &mut file, None, &options(), &cancel).await;
    assert!(matches!(result, Err(TransferError::Cancelled)));
    let messages = sink.messages();
    assert_eq!(messages.len(), 2);
    assert_eq!(
      messages[1],
      DataMessage::FileCancel {
        file_id: file.file_id.clone()
      }
    );
  }

  #[tokio::test(start_paused = true)]
  async fn waits_while_channel_is_over_the_high_water_mark() {
    let data = vec![1u8; 100];
    let sink = std::sync::Arc::new(MemorySink::default());
    sink.buffered.store(4096, Ordering::SeqCst);
    let mut file = outgoing(data.len() as u64);

    let drain = {
      let sink = sink.clone();
      tokio::spawn(async move {
        sleep(Duration::from_millis(250)).await;
        assert_eq!(sink.frames.lock().unwrap().len(), 1, "only meta before the buffer drains");
        sink.buffered.store(0, Ordering::SeqCst);
      })
    };

    let cancel = AtomicBool::new(false);
    send_file(sink.as_ref(), &mut data.as_slice(), &mut file, None, &options(), &cancel)
      .await
      .unwrap();
    drain.await.unwrap();
    assert_eq!(sink.frames.lock().unwrap().len(), 2);
  }

  #[tokio::test]
  async fn closed_channel_aborts_the_send() {
    let data = vec![1u8; 100];
    let sink = MemorySink::default();
    let mut file = outgoing(data.len() as u64);
    sink.closed.store(true, Ordering::SeqCst);
    let cancel = AtomicBool::new(false);
    let result = send_file(&sink, &mut data.as_slice(), &mut file, None, &options(), &cancel).await;
    assert!(matches!(result, Err(TransferError::ChannelClosed)));
  }

  #[tokio::test]
  async fn short_source_is_an_error() {
    let data = vec![1u8; 10];
    let sink = MemorySink::default();
    let mut file = outgoing(20000);
    let cancel = AtomicBool::new(false);
    let result = send_file(&sink, &mut data.as_slice(), &mut file, None, &options(), &cancel).await;
    assert!(matches!(result, Err(TransferError::Io(_))));
  }
}
