//! In-memory rendezvous state for the signaling server.
//!
//! A room holds at most one host and one guest. Connections are referenced, not
//! owned: a slot may briefly hold a connection whose transport already went
//! away, so every decision re-checks liveness before trusting an occupant.
//! A room with no live occupant is removed in the same critical section that
//! emptied it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::error::{RelayError, RoomError};
use crate::protocol::ServerMessage;

pub type ConnectionId = u64;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// What the registry asks a connection's writer task to do.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
  Message(ServerMessage),
  /// A peer's frame, forwarded byte for byte.
  Relay(String),
  Close,
}

#[derive(Debug, Clone)]
pub struct Connection {
  id: ConnectionId,
  tx: mpsc::UnboundedSender<Outbound>,
}

impl Connection {
  pub fn new(tx: mpsc::UnboundedSender<Outbound>) -> Self {
    Self {
      id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
      tx,
    }
  }

  pub fn id(&self) -> ConnectionId {
    self.id
  }

  /// Live while its writer task still holds the receiving half.
  pub fn is_live(&self) -> bool {
    !self.tx.is_closed()
  }

  pub fn send(&self, msg: ServerMessage) {
    let _ = self.tx.send(Outbound::Message(msg));
  }

  fn relay(&self, text: &str) {
    let _ = self.tx.send(Outbound::Relay(text.to_string()));
  }

  fn close(&self) {
    let _ = self.tx.send(Outbound::Close);
  }

  fn same(&self, other: &Connection) -> bool {
    self.id == other.id
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
  Host,
  Guest,
}

impl Role {
  fn as_str(self) -> &'static str {
    match self {
      Role::Host => "host",
      Role::Guest => "guest",
    }
  }
}

pub trait Clock: Send + Sync {
  /// Wall-clock milliseconds since the Unix epoch.
  fn now_millis(&self) -> i64;
}

pub struct SystemClock;

impl Clock for SystemClock {
  fn now_millis(&self) -> i64 {
    chrono::Utc::now().timestamp_millis()
  }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
  now: AtomicI64,
}

impl ManualClock {
  pub fn new(start_millis: i64) -> Self {
    Self {
      now: AtomicI64::new(start_millis),
    }
  }

  pub fn advance(&self, by: Duration) {
    self.now.fetch_add(by.as_millis() as i64, Ordering::SeqCst);
  }
}

impl Clock for ManualClock {
  fn now_millis(&self) -> i64 {
    self.now.load(Ordering::SeqCst)
  }
}

#[derive(Debug)]
struct Room {
  host: Option<Connection>,
  guest: Option<Connection>,
  created_at: i64,
}

impl Room {
  fn new(created_at: i64) -> Self {
    Self {
      host: None,
      guest: None,
      created_at,
    }
  }

  fn slot(&mut self, role: Role) -> &mut Option<Connection> {
    match role {
      Role::Host => &mut self.host,
      Role::Guest => &mut self.guest,
    }
  }

  fn live(&self, role: Role) -> Option<&Connection> {
    let slot = match role {
      Role::Host => &self.host,
      Role::Guest => &self.guest,
    };
    slot.as_ref().filter(|conn| conn.is_live())
  }

  fn has_live_occupant(&self) -> bool {
    self.live(Role::Host).is_some() || self.live(Role::Guest).is_some()
  }

  fn is_expired(&self, now: i64, ttl: Duration) -> bool {
    now - self.created_at >= ttl.as_millis() as i64
  }
}

#[derive(Debug, Clone)]
struct Binding {
  room_id: String,
  role: Role,
}

#[derive(Debug, Default)]
struct Inner {
  rooms: HashMap<String, Room>,
  bindings: HashMap<ConnectionId, Binding>,
}

impl Inner {
  fn evict_expired(&mut self, now: i64, ttl: Duration) -> Vec<String> {
    let expired: Vec<String> = self
      .rooms
      .iter()
      .filter(|(_, room)| room.is_expired(now, ttl))
      .map(|(id, _)| id.clone())
      .collect();

    for room_id in &expired {
      let Some(room) = self.rooms.remove(room_id) else {
        continue;
      };
      for conn in [room.host, room.guest].into_iter().flatten() {
        self.bindings.remove(&conn.id);
        if conn.is_live() {
          conn.send(ServerMessage::RoomExpired {
            room_id: room_id.clone(),
          });
          conn.close();
        }
      }
      info!(room = %room_id, "room expired");
    }
    expired
  }

  /// Vacates a slot whose occupant is no longer live, dropping its binding.
  fn vacate_dead(&mut self, room_id: &str, role: Role) {
    let Some(room) = self.rooms.get_mut(room_id) else {
      return;
    };
    let slot = room.slot(role);
    if slot.as_ref().is_some_and(|conn| !conn.is_live()) {
      if let Some(conn) = slot.take() {
        self.bindings.remove(&conn.id);
      }
    }
  }

  fn remove_if_vacant(&mut self, room_id: &str) {
    let vacant = self
      .rooms
      .get(room_id)
      .map(|room| !room.has_live_occupant())
      .unwrap_or(false);
    if vacant {
      if let Some(room) = self.rooms.remove(room_id) {
        for conn in [room.host, room.guest].into_iter().flatten() {
          self.bindings.remove(&conn.id);
        }
      }
      info!(room = %room_id, "room removed");
    }
  }

  fn check_binding(&self, conn: &Connection, room_id: &str, role: Role) -> Result<bool, RoomError> {
    match self.bindings.get(&conn.id) {
      None => Ok(false),
      Some(binding) if binding.room_id == room_id && binding.role == role => Ok(true),
      Some(_) => Err(RoomError::AlreadyJoined),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomStatus {
  pub exists: bool,
  pub has_host: bool,
  pub has_client: bool,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub created_at: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryStats {
  pub total_rooms: usize,
  pub total_connections: usize,
  pub active_rooms: usize,
}

pub struct RoomRegistry {
  inner: Mutex<Inner>,
  clock: Arc<dyn Clock>,
  ttl: Duration,
}

impl RoomRegistry {
  pub fn new(ttl: Duration) -> Self {
    Self::with_clock(ttl, Arc::new(SystemClock))
  }

  pub fn with_clock(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
    Self {
      inner: Mutex::new(Inner::default()),
      clock,
      ttl,
    }
  }

  pub fn ttl(&self) -> Duration {
    self.ttl
  }

  /// Locks and drops any room already past its TTL, so no caller ever observes one.
  fn lock(&self) -> MutexGuard<'_, Inner> {
    let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
    inner.evict_expired(self.clock.now_millis(), self.ttl);
    inner
  }

  pub fn join(&self, room_id: &str, is_host: bool, conn: &Connection) -> Result<(), RoomError> {
    if room_id.trim().is_empty() {
      return Err(RoomError::MissingRoomId);
    }
    if is_host {
      self.join_as_host(room_id, conn)
    } else {
      self.join_as_guest(room_id, conn)
    }
  }

  pub fn join_as_host(&self, room_id: &str, conn: &Connection) -> Result<(), RoomError> {
    let now = self.clock.now_millis();
    let mut inner = self.lock();
    let rejoin = inner.check_binding(conn, room_id, Role::Host)?;

    if let Some(room) = inner.rooms.get(room_id) {
      if room.live(Role::Host).is_some_and(|host| !host.same(conn)) {
        return Err(RoomError::AlreadyHasHost);
      }
    }
    inner.vacate_dead(room_id, Role::Host);

    let room = inner.rooms.entry(room_id.to_string()).or_insert_with(|| {
      info!(room = %room_id, "room created");
      Room::new(now)
    });
    room.host = Some(conn.clone());
    if let Some(guest) = room.live(Role::Guest).filter(|guest| !guest.same(conn)) {
      guest.send(ServerMessage::PeerReady {
        room_id: room_id.to_string(),
      });
      conn.send(ServerMessage::PeerReady {
        room_id: room_id.to_string(),
      });
    }
    inner.bindings.insert(
      conn.id,
      Binding {
        room_id: room_id.to_string(),
        role: Role::Host,
      },
    );
    if !rejoin {
      info!(room = %room_id, conn = conn.id, "host joined");
    }
    Ok(())
  }

  pub fn join_as_guest(&self, room_id: &str, conn: &Connection) -> Result<(), RoomError> {
    let mut inner = self.lock();
    let rejoin = inner.check_binding(conn, room_id, Role::Guest)?;

    let Some(room) = inner.rooms.get(room_id) else {
      return Err(RoomError::RoomNotFound);
    };
    if room.live(Role::Guest).is_some_and(|guest| !guest.same(conn)) {
      return Err(RoomError::RoomFull);
    }
    inner.vacate_dead(room_id, Role::Guest);

    let Some(room) = inner.rooms.get_mut(room_id) else {
      return Err(RoomError::RoomNotFound);
    };
    room.guest = Some(conn.clone());
    if let Some(host) = room.live(Role::Host) {
      host.send(ServerMessage::PeerReady {
        room_id: room_id.to_string(),
      });
    }
    conn.send(ServerMessage::Joined {
      room_id: room_id.to_string(),
    });
    inner.bindings.insert(
      conn.id,
      Binding {
        room_id: room_id.to_string(),
        role: Role::Guest,
      },
    );
    if !rejoin {
      info!(room = %room_id, conn = conn.id, "guest joined");
    }
    Ok(())
  }

  /// Forwards `text` unchanged to the other occupant of the sender's room.
  pub fn relay(&self, from: &Connection, text: &str) -> Result<(), RelayError> {
    let inner = self.lock();
    let binding = inner.bindings.get(&from.id).ok_or(RelayError::NotInRoom)?;
    let room = inner.rooms.get(&binding.room_id).ok_or(RelayError::NotInRoom)?;
    let target_role = match binding.role {
      Role::Host => Role::Guest,
      Role::Guest => Role::Host,
    };
    let target = room
      .live(target_role)
      .filter(|target| !target.same(from))
      .ok_or(RelayError::PeerNotConnected)?;
    target.relay(text);
    debug!(room = %binding.room_id, to = target_role.as_str(), "relayed");
    Ok(())
  }

  pub fn leave(&self, conn: &Connection) {
    let mut inner = self.lock();
    let Some(binding) = inner.bindings.remove(&conn.id) else {
      return;
    };
    let room_id = binding.room_id;
    let Some(room) = inner.rooms.get_mut(&room_id) else {
      return;
    };
    let slot = room.slot(binding.role);
    if slot.as_ref().is_some_and(|occupant| occupant.same(conn)) {
      *slot = None;
    }
    let other = match binding.role {
      Role::Host => Role::Guest,
      Role::Guest => Role::Host,
    };
    if let Some(peer) = room.live(other) {
      peer.send(ServerMessage::PeerDisconnected {
        room_id: room_id.clone(),
      });
    }
    info!(room = %room_id, conn = conn.id, role = binding.role.as_str(), "left room");
    inner.remove_if_vacant(&room_id);
  }

  /// Removes every room older than `ttl` at `now`, telling live occupants first.
  pub fn sweep_expired(&self, now: i64, ttl: Duration) -> Vec<String> {
    let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
    inner.evict_expired(now, ttl)
  }

  /// Sweep with this registry's own clock and TTL.
  pub fn sweep(&self) -> Vec<String> {
    self.sweep_expired(self.clock.now_millis(), self.ttl)
  }

  pub fn room_status(&self, room_id: &str) -> RoomStatus {
    let inner = self.lock();
    match inner.rooms.get(room_id) {
      None => RoomStatus {
        exists: false,
        has_host: false,
        has_client: false,
        created_at: None,
      },
      Some(room) => RoomStatus {
        exists: true,
        has_host: room.live(Role::Host).is_some(),
        has_client: room.live(Role::Guest).is_some(),
        created_at: Some(room.created_at),
      },
    }
  }

  pub fn stats(&self) -> RegistryStats {
    let inner = self.lock();
    RegistryStats {
      total_rooms: inner.rooms.len(),
      total_connections: inner.bindings.len(),
      active_rooms: inner.rooms.values().filter(|room| room.has_live_occupant()).count(),
    }
  }
}
