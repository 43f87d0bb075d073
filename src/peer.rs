//! Async driver that binds the negotiation state machine and the transfer
//! protocol to a real signaling socket and peer connection.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, timeout, MissedTickBehavior};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use crate::config::{ClientConfig, SIGNALING_PATH};
use crate::endpoint::build_ws_url;
use crate::error::TransferError;
use crate::negotiation::{NegotiationState, Negotiator, PeerAction, PeerEvent, PeerRole, TransportState};
use crate::protocol::{ClientMessage, ServerMessage};
use crate::transfer::{
  save_completed, send_file, wait_for_drain, ChunkSink, DataMessage, OutgoingFile, ReceiveEvent, SendOptions,
  SessionCipher, TransferReceiver,
};

pub const DATA_CHANNEL_LABEL: &str = "fileTransfer";

const IDLE_CHECK: Duration = Duration::from_secs(1);
const SIGNALING_FLUSH: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub enum Job {
  /// Host the room and push `files` once the channel opens.
  Send { files: Vec<PathBuf>, stay_open: bool },
  /// Join as guest and write incoming files to `output_dir`.
  Receive { output_dir: PathBuf },
}

#[derive(Debug, Default)]
pub struct SessionReport {
  pub room_id: String,
  pub sent: Vec<String>,
  pub received: Vec<PathBuf>,
  /// `(file name, reason)` for every transfer that did not complete.
  pub failed: Vec<(String, String)>,
}

enum DriverEvent {
  Peer(PeerEvent),
  Channel(Arc<RTCDataChannel>),
  Data(String),
  SendFinished(Result<Vec<String>, TransferError>),
}

/// Runs one session to completion: negotiate, transfer, tear down.
pub async fn run(config: &ClientConfig, room_id: &str, job: Job) -> Result<SessionReport> {
  let role = match job {
    Job::Send { .. } => PeerRole::Host,
    Job::Receive { .. } => PeerRole::Guest,
  };
  let cipher = if role == PeerRole::Host && config.encrypt {
    Some(SessionCipher::generate()?)
  } else {
    None
  };
  let (events_tx, mut events_rx) = mpsc::unbounded_channel();
  let mut session = Session {
    config,
    job,
    negotiator: Negotiator::new(role),
    events: events_tx,
    queue: VecDeque::new(),
    signal_tx: None,
    signal_writer: None,
    signal_reader: None,
    pc: None,
    channel: None,
    receiver: TransferReceiver::default(),
    cipher,
    cancel: Arc::new(AtomicBool::new(false)),
    sending: false,
    report: SessionReport {
      room_id: room_id.to_string(),
      ..Default::default()
    },
  };

  session.push(PeerEvent::Start {
    room_id: room_id.to_string(),
  });
  session.drain().await;

  let deadline = sleep(config.negotiation_timeout);
  tokio::pin!(deadline);
  let mut idle = interval(IDLE_CHECK);
  idle.set_missed_tick_behavior(MissedTickBehavior::Delay);
  let ctrl_c = tokio::signal::ctrl_c();
  tokio::pin!(ctrl_c);
  let mut interrupted = false;

  while !session.negotiator.state().is_terminal() {
    tokio::select! {
      event = events_rx.recv() => match event {
        Some(event) => session.on_driver_event(event).await,
        None => break,
      },
      _ = &mut deadline, if session.negotiator.state() != NegotiationState::Connected => {
        session.push(PeerEvent::TimedOut);
      }
      _ = idle.tick() => session.expire_idle(),
      _ = &mut ctrl_c, if !interrupted => {
        interrupted = true;
        session.interrupt();
      }
    }
    session.drain().await;
  }
  session.finish()
}

struct Session<'a> {
  config: &'a ClientConfig,
  job: Job,
  negotiator: Negotiator,
  events: mpsc::UnboundedSender<DriverEvent>,
  queue: VecDeque<PeerEvent>,
  signal_tx: Option<mpsc::UnboundedSender<ClientMessage>>,
  signal_writer: Option<JoinHandle<()>>,
  signal_reader: Option<JoinHandle<()>>,
  pc: Option<Arc<RTCPeerConnection>>,
  channel: Option<Arc<RTCDataChannel>>,
  receiver: TransferReceiver,
  cipher: Option<SessionCipher>,
  cancel: Arc<AtomicBool>,
  sending: bool,
  report: SessionReport,
}

impl Session<'_> {
  fn push(&mut self, event: PeerEvent) {
    self.queue.push_back(event);
  }

  async fn drain(&mut self) {
    while let Some(event) = self.queue.pop_front() {
      for action in self.negotiator.handle(event) {
        self.execute(action).await;
      }
    }
  }

  async fn execute(&mut self, action: PeerAction) {
    let result = match action {
      PeerAction::ConnectSignaling => self.connect_signaling().await,
      PeerAction::Send(msg) => {
        self.signal(msg);
        Ok(())
      }
      PeerAction::CreateOffer => self.create_offer().await,
      PeerAction::AcceptOffer(offer) => self.accept_offer(offer).await,
      PeerAction::ApplyAnswer(answer) => self.apply_answer(answer).await,
      PeerAction::AddCandidate(candidate) => {
        self.add_candidate(candidate).await;
        Ok(())
      }
      PeerAction::ChannelReady => self.start_job(),
      PeerAction::Teardown => {
        self.teardown().await;
        Ok(())
      }
    };
    if let Err(err) = result {
      self.push(PeerEvent::Error(format!("{err:#}")));
    }
  }

  async fn on_driver_event(&mut self, event: DriverEvent) {
    match event {
      DriverEvent::Peer(event) => self.push(event),
      DriverEvent::Channel(dc) => self.channel = Some(dc),
      DriverEvent::Data(text) => self.on_data(&text).await,
      DriverEvent::SendFinished(result) => {
        self.sending = false;
        match result {
          Ok(sent) => {
            info!(files = sent.len(), "all files sent");
            self.report.sent = sent;
            if !matches!(self.job, Job::Send { stay_open: true, .. }) {
              self.push(PeerEvent::Close);
            }
          }
          Err(err) => self.push(PeerEvent::Error(err.to_string())),
        }
      }
    }
  }

  async fn connect_signaling(&mut self) -> Result<()> {
    let url = build_ws_url(&self.config.endpoint, SIGNALING_PATH)?;
    info!(url = %url, "connecting to signaling server");
    let (ws_stream, _) = connect_async(url.as_str())
      .await
      .context("connect signaling websocket")?;
    let (mut ws_write, mut ws_read) = ws_stream.split();
    let (signal_tx, mut signal_rx) = mpsc::unbounded_channel::<ClientMessage>();

    let writer = tokio::spawn(async move {
      while let Some(msg) = signal_rx.recv().await {
        let text = match serde_json::to_string(&msg) {
          Ok(text) => text,
          Err(err) => {
            warn!(%err, "failed to encode signaling message");
            continue;
          }
        };
        if ws_write.send(Message::Text(text)).await.is_err() {
          break;
        }
      }
      let _ = ws_write.close().await;
    });

    let events = self.events.clone();
    let reader = tokio::spawn(async move {
      while let Some(frame) = ws_read.next().await {
        match frame {
          Ok(Message::Text(text)) => match serde_json::from_str::<ServerMessage>(&text) {
            Ok(msg) => {
              debug!(?msg, "signal");
              let _ = events.send(DriverEvent::Peer(PeerEvent::Signal(msg)));
            }
            Err(err) => debug!(%err, "unrecognised signaling frame"),
          },
          Ok(Message::Close(_)) => break,
          Ok(_) => {}
          Err(err) => {
            debug!(%err, "signaling read error");
            break;
          }
        }
      }
      let _ = events.send(DriverEvent::Peer(PeerEvent::SignalingClosed));
    });

    self.signal_tx = Some(signal_tx);
    self.signal_writer = Some(writer);
    self.signal_reader = Some(reader);
    self.push(PeerEvent::SignalingOpened);
    Ok(())
  }

  fn signal(&self, msg: ClientMessage) {
    match &self.signal_tx {
      Some(tx) => {
        let _ = tx.send(msg);
      }
      None => debug!(kind = msg.kind(), "signaling closed, message dropped"),
    }
  }

  async fn peer_connection(&mut self) -> Result<Arc<RTCPeerConnection>> {
    if let Some(pc) = &self.pc {
      return Ok(pc.clone());
    }
    let pc = create_peer_connection(&self.config.ice_servers).await?;

    let events = self.events.clone();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
      let events = events.clone();
      Box::pin(async move {
        let Some(candidate) = candidate else {
          return;
        };
        match candidate.to_json().map(serde_json::to_value) {
          Ok(Ok(value)) => {
            let _ = events.send(DriverEvent::Peer(PeerEvent::LocalCandidate(value)));
          }
          Ok(Err(err)) => warn!(%err, "failed to encode local candidate"),
          Err(err) => warn!(%err, "failed to read local candidate"),
        }
      })
    }));

    let events = self.events.clone();
    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
      info!(%state, "peer connection state");
      let _ = events.send(DriverEvent::Peer(PeerEvent::Transport(transport_state(state))));
      Box::pin(async {})
    }));

    if self.negotiator.role() == PeerRole::Guest {
      let events = self.events.clone();
      pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
        wire_channel(dc, events.clone());
        Box::pin(async {})
      }));
    }

    self.pc = Some(pc.clone());
    Ok(pc)
  }

  async fn create_offer(&mut self) -> Result<()> {
    let pc = self.peer_connection().await?;
    let dc = pc
      .create_data_channel(
        DATA_CHANNEL_LABEL,
        Some(RTCDataChannelInit {
          ordered: Some(true),
          ..Default::default()
        }),
      )
      .await?;
    wire_channel(dc, self.events.clone());

    let offer = pc.create_offer(None).await?;
    pc.set_local_description(offer).await?;
    let local = pc
      .local_description()
      .await
      .ok_or_else(|| anyhow!("local description missing after offer"))?;
    self.push(PeerEvent::LocalDescription(serde_json::to_value(local)?));
    Ok(())
  }

  async fn accept_offer(&mut self, offer: Value) -> Result<()> {
    let pc = self.peer_connection().await?;
    let offer: RTCSessionDescription = serde_json::from_value(offer).context("invalid offer")?;
    pc.set_remote_description(offer).await?;
    let answer = pc.create_answer(None).await?;
    pc.set_local_description(answer).await?;
    let local = pc
      .local_description()
      .await
      .ok_or_else(|| anyhow!("local description missing after answer"))?;
    self.push(PeerEvent::LocalDescription(serde_json::to_value(local)?));
    Ok(())
  }

  async fn apply_answer(&mut self, answer: Value) -> Result<()> {
    let pc = self.pc.clone().ok_or_else(|| anyhow!("answer arrived without a peer connection"))?;
    let answer: RTCSessionDescription = serde_json::from_value(answer).context("invalid answer")?;
    pc.set_remote_description(answer).await?;
    Ok(())
  }

  /// A bad candidate only costs one path.
  async fn add_candidate(&mut self, candidate: Value) {
    let Some(pc) = self.pc.clone() else {
      return;
    };
    let candidate: RTCIceCandidateInit = match serde_json::from_value(candidate) {
      Ok(candidate) => candidate,
      Err(err) => {
        warn!(%err, "invalid remote candidate");
        return;
      }
    };
    if let Err(err) = pc.add_ice_candidate(candidate).await {
      warn!(%err, "failed to add remote candidate");
    }
  }

  fn start_job(&mut self) -> Result<()> {
    info!(room = %self.report.room_id, "direct channel ready");
    let Job::Send { files, .. } = &self.job else {
      return Ok(());
    };
    let dc = self.channel.clone().ok_or_else(|| anyhow!("data channel missing"))?;
    let files = files.clone();
    let cipher = self.cipher.clone();
    let options = SendOptions {
      chunk_size: self.config.chunk_size,
      chunk_delay: self.config.chunk_delay,
      high_water_mark: self.config.high_water_mark,
    };
    let cancel = self.cancel.clone();
    let events = self.events.clone();
    self.sending = true;
    tokio::spawn(async move {
      let result = send_all(dc.as_ref(), &files, cipher.as_ref(), &options, &cancel).await;
      let _ = events.send(DriverEvent::SendFinished(result));
    });
    Ok(())
  }

  async fn on_data(&mut self, text: &str) {
    let msg = match DataMessage::decode(text) {
      Ok(msg) => msg,
      Err(err) => {
        warn!(%err, "unreadable data-channel frame");
        return;
      }
    };
    match self.receiver.handle(msg, Instant::now()) {
      Ok(event) => self.on_receive_event(event).await,
      Err(err) => warn!(%err, "data-channel frame dropped"),
    }
  }

  async fn on_receive_event(&mut self, event: ReceiveEvent) {
    match event {
      ReceiveEvent::Started {
        file_id,
        name,
        size,
        total_chunks,
      } => {
        info!(file = %name, size, total_chunks, "incoming file");
        self.reply(DataMessage::FileAck { file_id }).await;
      }
      ReceiveEvent::Progress {
        file_id,
        received_size,
        size,
      } => debug!(file_id = %file_id, percent = percent(received_size, size), "progress"),
      ReceiveEvent::Duplicate { file_id, index } => debug!(file_id = %file_id, index, "duplicate chunk ignored"),
      ReceiveEvent::Completed(file) => {
        let Job::Receive { output_dir } = &self.job else {
          warn!(file = %file.name, "unexpected inbound file discarded");
          return;
        };
        match save_completed(output_dir, &file).await {
          Ok(path) => {
            info!(path = %path.display(), bytes = file.data.len(), "file saved");
            self.report.received.push(path);
          }
          Err(err) => self.record_failure(&file.name, &err),
        }
      }
      ReceiveEvent::Failed { name, error, .. } => self.record_failure(&name, &error),
      ReceiveEvent::Acknowledged { file_id } => debug!(file_id = %file_id, "receiver accepted file"),
      ReceiveEvent::KeyInstalled | ReceiveEvent::Ignored => {}
    }
  }

  async fn reply(&self, msg: DataMessage) {
    let Some(dc) = &self.channel else {
      return;
    };
    let result = match msg.encode() {
      Ok(text) => ChunkSink::send_text(dc.as_ref(), text).await,
      Err(err) => Err(err.into()),
    };
    if let Err(err) = result {
      warn!(%err, "failed to reply on data channel");
    }
  }

  fn record_failure(&mut self, name: &str, error: &TransferError) {
    warn!(file = %name, %error, "transfer failed");
    self.report.failed.push((name.to_string(), error.to_string()));
  }

  fn expire_idle(&mut self) {
    for event in self.receiver.expire_idle(Instant::now(), self.config.idle_timeout) {
      if let ReceiveEvent::Failed { name, error, .. } = event {
        self.record_failure(&name, &error);
      }
    }
  }

  fn interrupt(&mut self) {
    info!("interrupted");
    self.cancel.store(true, Ordering::SeqCst);
    // An in-flight send winds down on its own and tells the receiver.
    if !self.sending {
      self.push(PeerEvent::Close);
    }
  }

  async fn teardown(&mut self) {
    for event in self.receiver.abandon_all() {
      if let ReceiveEvent::Failed { name, error, .. } = event {
        self.record_failure(&name, &error);
      }
    }
    self.cancel.store(true, Ordering::SeqCst);
    if let Some(dc) = self.channel.take() {
      let _ = dc.close().await;
    }
    if let Some(pc) = self.pc.take() {
      let _ = pc.close().await;
    }
    self.signal_tx = None;
    if let Some(reader) = self.signal_reader.take() {
      reader.abort();
    }
    if let Some(writer) = self.signal_writer.take() {
      let _ = timeout(SIGNALING_FLUSH, writer).await;
    }
    debug!("session torn down");
  }

  fn finish(self) -> Result<SessionReport> {
    if self.negotiator.state() == NegotiationState::Failed {
      let reason = self.negotiator.failure().unwrap_or("negotiation failed");
      return Err(anyhow!(reason.to_string()));
    }
    if let Job::Send { files, .. } = &self.job {
      if self.report.sent.len() < files.len() {
        return Err(anyhow!("Connection closed before every file was sent"));
      }
    }
    Ok(self.report)
  }
}

async fn send_all(
  dc: &RTCDataChannel,
  files: &[PathBuf],
  cipher: Option<&SessionCipher>,
  options: &SendOptions,
  cancel: &AtomicBool,
) -> Result<Vec<String>, TransferError> {
  if let Some(cipher) = cipher {
    let key = DataMessage::SessionKey {
      key: cipher.encoded_key(),
    };
    ChunkSink::send_text(dc, key.encode()?).await?;
  }
  let mut sent = Vec::with_capacity(files.len());
  for path in files {
    let mut file = OutgoingFile::from_path(path, options.chunk_size).await?;
    let mut reader = tokio::fs::File::open(path).await?;
    send_file(dc, &mut reader, &mut file, cipher, options, cancel).await?;
    info!(file = %file.name, bytes = file.sent_size, "file sent");
    sent.push(file.name);
  }
  wait_for_drain(dc).await;
  Ok(sent)
}

/// Forwards channel lifecycle and text frames to the driver loop.
fn wire_channel(dc: Arc<RTCDataChannel>, events: mpsc::UnboundedSender<DriverEvent>) {
  debug!(label = dc.label(), "data channel wired");
  let _ = events.send(DriverEvent::Channel(dc.clone()));

  let tx = events.clone();
  dc.on_open(Box::new(move || {
    let _ = tx.send(DriverEvent::Peer(PeerEvent::DataChannelOpen));
    Box::pin(async {})
  }));

  let tx = events.clone();
  dc.on_close(Box::new(move || {
    let _ = tx.send(DriverEvent::Peer(PeerEvent::DataChannelClosed));
    Box::pin(async {})
  }));

  dc.on_message(Box::new(move |msg: DataChannelMessage| {
    if !msg.is_string {
      debug!(bytes = msg.data.len(), "binary frame ignored");
    } else {
      match String::from_utf8(msg.data.to_vec()) {
        Ok(text) => {
          let _ = events.send(DriverEvent::Data(text));
        }
        Err(err) => warn!(%err, "non-utf8 text frame"),
      }
    }
    Box::pin(async {})
  }));
}

async fn create_peer_connection(ice_servers: &[String]) -> Result<Arc<RTCPeerConnection>> {
  let mut media_engine = MediaEngine::default();
  media_engine.register_default_codecs()?;

  let mut registry = Registry::new();
  registry = register_default_interceptors(registry, &mut media_engine)?;

  let api = APIBuilder::new()
    .with_media_engine(media_engine)
    .with_interceptor_registry(registry)
    .build();

  // No servers means host candidates only.
  let ice_servers = if ice_servers.is_empty() {
    Vec::new()
  } else {
    vec![RTCIceServer {
      urls: ice_servers.to_vec(),
      ..Default::default()
    }]
  };
  let config = RTCConfiguration {
    ice_servers,
    ..Default::default()
  };

  let pc = api.new_peer_connection(config).await?;
  Ok(Arc::new(pc))
}

fn transport_state(state: RTCPeerConnectionState) -> TransportState {
  match state {
    RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => TransportState::New,
    RTCPeerConnectionState::Connecting => TransportState::Connecting,
    RTCPeerConnectionState::Connected => TransportState::Connected,
    RTCPeerConnectionState::Disconnected => TransportState::Disconnected,
    RTCPeerConnectionState::Failed => TransportState::Failed,
    RTCPeerConnectionState::Closed => TransportState::Closed,
  }
}

/// Encrypted chunks count their nonce and tag, so the raw ratio can pass 100.
fn percent(received: u64, size: u64) -> u64 {
  if size == 0 {
    return 100;
  }
  (received.saturating_mul(100) / size).min(100)
}
