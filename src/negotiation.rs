//! Client-side connection negotiation as an explicit state machine.
//!
//! The machine owns no I/O. Every external occurrence (a signaling frame, a
//! locally produced description or candidate, a transport state change) is fed
//! to [`Negotiator::handle`], which advances the state and returns the actions
//! the driver must perform, in order.

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::protocol::{ClientMessage, ServerMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerRole {
  Host,
  Guest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
  Idle,
  ConnectingToSignaling,
  AwaitingGuest,
  OfferCreated,
  AwaitingAnswer,
  AwaitingOffer,
  AnswerCreated,
  IceExchange,
  Connected,
  Disconnected,
  Failed,
}

impl NegotiationState {
  pub fn is_terminal(self) -> bool {
    matches!(self, NegotiationState::Disconnected | NegotiationState::Failed)
  }

  fn is_negotiating(self) -> bool {
    !self.is_terminal() && !matches!(self, NegotiationState::Idle | NegotiationState::Connected)
  }
}

/// Direct-connection state as reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
  New,
  Connecting,
  Connected,
  Disconnected,
  Failed,
  Closed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
  Start { room_id: String },
  SignalingOpened,
  SignalingClosed,
  Signal(ServerMessage),
  /// The offer (host) or answer (guest) the transport just produced.
  LocalDescription(Value),
  LocalCandidate(Value),
  Transport(TransportState),
  DataChannelOpen,
  DataChannelClosed,
  TimedOut,
  Close,
  Error(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum PeerAction {
  ConnectSignaling,
  Send(ClientMessage),
  CreateOffer,
  /// Apply the remote offer, then produce an answer.
  AcceptOffer(Value),
  ApplyAnswer(Value),
  AddCandidate(Value),
  /// Transport connected and data channel open; transfers may start.
  ChannelReady,
  /// Close the data channel, the peer connection and the signaling socket.
  Teardown,
}

#[derive(Debug)]
pub struct Negotiator {
  role: PeerRole,
  state: NegotiationState,
  room_id: Option<String>,
  pending_candidates: Vec<Value>,
  remote_description_set: bool,
  channel_open: bool,
  channel_ready: bool,
  failure: Option<String>,
}

impl Negotiator {
  pub fn new(role: PeerRole) -> Self {
    Self {
      role,
      state: NegotiationState::Idle,
      room_id: None,
      pending_candidates: Vec::new(),
      remote_description_set: false,
      channel_open: false,
      channel_ready: false,
      failure: None,
    }
  }

  pub fn role(&self) -> PeerRole {
    self.role
  }

  pub fn state(&self) -> NegotiationState {
    self.state
  }

  pub fn room_id(&self) -> Option<&str> {
    self.room_id.as_deref()
  }

  pub fn failure(&self) -> Option<&str> {
    self.failure.as_deref()
  }

  pub fn pending_candidates(&self) -> usize {
    self.pending_candidates.len()
  }

  pub fn handle(&mut self, event: PeerEvent) -> Vec<PeerAction> {
    use NegotiationState as S;

    if self.state.is_terminal() {
      debug!(state = ?self.state, ?event, "event after teardown ignored");
      return Vec::new();
    }

    match (self.state, event) {
      (S::Idle, PeerEvent::Start { room_id }) => {
        self.room_id = Some(room_id);
        self.transition(S::ConnectingToSignaling);
        vec![PeerAction::ConnectSignaling]
      }
      (S::ConnectingToSignaling, PeerEvent::SignalingOpened) => {
        let room_id = self.room_id.clone().unwrap_or_default();
        let is_host = self.role == PeerRole::Host;
        self.transition(if is_host { S::AwaitingGuest } else { S::AwaitingOffer });
        vec![PeerAction::Send(ClientMessage::Join { room_id, is_host })]
      }

      (S::AwaitingGuest, PeerEvent::Signal(ServerMessage::PeerReady { room_id })) => {
        info!(room = %room_id, "guest present, creating offer");
        self.transition(S::OfferCreated);
        vec![PeerAction::CreateOffer]
      }
      (S::OfferCreated, PeerEvent::LocalDescription(offer)) => {
        self.transition(S::AwaitingAnswer);
        vec![PeerAction::Send(ClientMessage::Offer {
          room_id: self.room(),
          offer,
        })]
      }
      (S::AwaitingAnswer, PeerEvent::Signal(ServerMessage::Answer { answer, .. })) => {
        self.transition(S::IceExchange);
        let mut actions = vec![PeerAction::ApplyAnswer(answer)];
        actions.extend(self.flush_candidates());
        actions
      }

      (S::AwaitingOffer, PeerEvent::Signal(ServerMessage::Joined { room_id })) => {
        info!(room = %room_id, "joined, waiting for offer");
        Vec::new()
      }
      (S::AwaitingOffer, PeerEvent::Signal(ServerMessage::Offer { offer, .. })) => {
        self.transition(S::AnswerCreated);
        let mut actions = vec![PeerAction::AcceptOffer(offer)];
        actions.extend(self.flush_candidates());
        actions
      }
      (S::AnswerCreated, PeerEvent::LocalDescription(answer)) => {
        self.transition(S::IceExchange);
        vec![PeerAction::Send(ClientMessage::Answer {
          room_id: self.room(),
          answer,
        })]
      }

      (state, PeerEvent::Signal(ServerMessage::IceCandidate { candidate, .. }))
        if state.is_negotiating() || state == S::Connected =>
      {
        if self.remote_description_set {
          vec![PeerAction::AddCandidate(candidate)]
        } else {
          self.pending_candidates.push(candidate);
          debug!(pending = self.pending_candidates.len(), "remote candidate buffered");
          Vec::new()
        }
      }
      (state, PeerEvent::LocalCandidate(candidate)) if state.is_negotiating() || state == S::Connected => {
        vec![PeerAction::Send(ClientMessage::IceCandidate {
          room_id: self.room(),
          candidate,
        })]
      }

      (S::AwaitingAnswer | S::AnswerCreated | S::IceExchange, PeerEvent::Transport(TransportState::Connected)) => {
        self.transition(S::Connected);
        self.ready_if_open()
      }
      (state, PeerEvent::DataChannelOpen) if !matches!(state, S::Idle) => {
        self.channel_open = true;
        self.ready_if_open()
      }
      (_, PeerEvent::Transport(TransportState::Failed)) => self.fail("peer connection failed"),
      (_, PeerEvent::Transport(TransportState::Disconnected | TransportState::Closed)) => self.disconnect(),
      (S::Connected, PeerEvent::DataChannelClosed) => self.disconnect(),

      (state, PeerEvent::Signal(msg)) if state.is_negotiating() => self.signal_failure(msg),
      (state, PeerEvent::SignalingClosed) if state.is_negotiating() => self.fail("signaling connection closed"),
      (state, PeerEvent::TimedOut) if state != S::Connected => self.fail("negotiation timed out"),
      (_, PeerEvent::Close) => self.disconnect(),
      (_, PeerEvent::Error(message)) => self.fail(&message),

      (state, event) => {
        debug!(?state, ?event, "ignored");
        Vec::new()
      }
    }
  }

  /// Signaling outcomes that end an unfinished negotiation.
  fn signal_failure(&mut self, msg: ServerMessage) -> Vec<PeerAction> {
    match msg {
      ServerMessage::RoomNotFound { room_id } => self.fail(&format!("Room not found: {room_id}")),
      ServerMessage::RoomFull { room_id } => self.fail(&format!("Room is full: {room_id}")),
      ServerMessage::RoomExpired { room_id } => self.fail(&format!("Room expired: {room_id}")),
      ServerMessage::Error { message } => self.fail(&message),
      ServerMessage::PeerDisconnected { room_id } => {
        info!(room = %room_id, "peer left before the connection was established");
        self.disconnect()
      }
      other => {
        debug!(state = ?self.state, msg = ?other, "out-of-order signaling message ignored");
        Vec::new()
      }
    }
  }

  fn flush_candidates(&mut self) -> Vec<PeerAction> {
    self.remote_description_set = true;
    self.pending_candidates.drain(..).map(PeerAction::AddCandidate).collect()
  }

  fn ready_if_open(&mut self) -> Vec<PeerAction> {
    if self.state == NegotiationState::Connected && self.channel_open && !self.channel_ready {
      self.channel_ready = true;
      vec![PeerAction::ChannelReady]
    } else {
      Vec::new()
    }
  }

  fn fail(&mut self, reason: &str) -> Vec<PeerAction> {
    warn!(state = ?self.state, reason, "negotiation failed");
    self.failure = Some(reason.to_string());
    self.teardown(NegotiationState::Failed)
  }

  fn disconnect(&mut self) -> Vec<PeerAction> {
    self.teardown(NegotiationState::Disconnected)
  }

  fn teardown(&mut self, next: NegotiationState) -> Vec<PeerAction> {
    self.transition(next);
    self.room_id = None;
    self.pending_candidates.clear();
    self.remote_description_set = false;
    self.channel_open = false;
    self.channel_ready = false;
    vec![PeerAction::Teardown]
  }

  fn transition(&mut self, next: NegotiationState) {
    debug!(from = ?self.state, to = ?next, "negotiation");
    self.state = next;
  }

  fn room(&self) -> String {
    self.room_id.clone().unwrap_or_default()
  }
}
