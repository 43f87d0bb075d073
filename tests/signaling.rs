use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use roomdrop::config::{ROOM_TTL, SIGNALING_PATH};
use roomdrop::registry::{RegistryStats, RoomRegistry, RoomStatus};
use roomdrop::server::router;
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

const WAIT: Duration = Duration::from_secs(5);

fn init_test_tracing() {
  let _ = tracing_subscriber::fmt()
    .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "debug".into()))
    .with_test_writer()
    .try_init();
}

async fn start_server() -> (SocketAddr, Arc<RoomRegistry>) {
  init_test_tracing();
  let registry = Arc::new(RoomRegistry::new(ROOM_TTL));
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  let app = router(registry.clone(), SIGNALING_PATH);
  tokio::spawn(async move {
    axum::serve(listener, app).await.unwrap();
  });
  (addr, registry)
}

async fn connect(addr: SocketAddr) -> Ws {
  let (ws, _) = connect_async(format!("ws://{addr}{SIGNALING_PATH}")).await.unwrap();
  ws
}

async fn send(ws: &mut Ws, value: Value) {
  ws.send(Message::Text(value.to_string())).await.unwrap();
}

async fn send_raw(ws: &mut Ws, text: &str) {
  ws.send(Message::Text(text.to_string())).await.unwrap();
}

async fn recv_text(ws: &mut Ws) -> String {
  loop {
    let frame = timeout(WAIT, ws.next())
      .await
      .expect("timed out waiting for a frame")
      .expect("socket closed")
      .unwrap();
    match frame {
      Message::Text(text) => return text,
      Message::Ping(_) | Message::Pong(_) => continue,
      other => panic!("unexpected frame {other:?}"),
    }
  }
}

async fn recv(ws: &mut Ws) -> Value {
  serde_json::from_str(&recv_text(ws).await).unwrap()
}

async fn join(ws: &mut Ws, room_id: &str, is_host: bool) {
  send(ws, json!({"type": "join", "roomId": room_id, "isHost": is_host})).await;
}

async fn stats(addr: SocketAddr) -> RegistryStats {
  reqwest::get(format!("http://{addr}/api/p2p/stats"))
    .await
    .unwrap()
    .json()
    .await
    .unwrap()
}

async fn room(addr: SocketAddr, room_id: &str) -> RoomStatus {
  reqwest::get(format!("http://{addr}/api/p2p/rooms/{room_id}"))
    .await
    .unwrap()
    .json()
    .await
    .unwrap()
}

/// Polls until the server has caught up with what the sockets did.
async fn eventually<F, Fut>(mut check: F)
where
  F: FnMut() -> Fut,
  Fut: std::future::Future<Output = bool>,
{
  for _ in 0..100 {
    if check().await {
      return;
    }
    tokio::time::sleep(Duration::from_millis(20)).await;
  }
  panic!("condition not reached");
}

#[tokio::test]
async fn guest_without_host_gets_room_not_found() {
  let (addr, _) = start_server().await;
  let mut guest = connect(addr).await;
  join(&mut guest, "xyz000", false).await;
  assert_eq!(recv(&mut guest).await, json!({"type": "room-not-found", "roomId": "xyz000"}));
  assert!(!room(addr, "xyz000").await.exists);
}

#[tokio::test]
async fn second_live_host_is_refused() {
  let (addr, _) = start_server().await;
  let mut a = connect(addr).await;
  join(&mut a, "r1", true).await;
  let mut b = connect(addr).await;
  join(&mut b, "r1", true).await;
  assert_eq!(
    recv(&mut b).await,
    json!({"type": "error", "message": "Room already has a host"})
  );
}

#[tokio::test]
async fn negotiation_frames_are_relayed_verbatim() {
  let (addr, _) = start_server().await;
  let mut host = connect(addr).await;
  join(&mut host, "r1", true).await;
  let mut guest = connect(addr).await;
  join(&mut guest, "r1", false).await;

  assert_eq!(recv(&mut guest).await, json!({"type": "joined", "roomId": "r1"}));
  assert_eq!(recv(&mut host).await, json!({"type": "peer-ready", "roomId": "r1"}));

  let offer = r#"{"type":"offer","roomId":"r1","offer":{"type":"offer","sdp":"v=0\r\n"},"extra":[1, 2]}"#;
  send_raw(&mut host, offer).await;
  assert_eq!(recv_text(&mut guest).await, offer);

  let candidate = r#"{"type":"ice-candidate","roomId":"r1","candidate":{"candidate":"candidate:1 1 udp 1 10.0.0.1 9 typ host","sdpMid":"0"}}"#;
  send_raw(&mut guest, candidate).await;
  assert_eq!(recv_text(&mut host).await, candidate);
}

#[tokio::test]
async fn host_disconnect_notifies_guest_and_room_goes_away() {
  let (addr, _) = start_server().await;
  let mut a = connect(addr).await;
  join(&mut a, "r1", true).await;
  let mut b = connect(addr).await;
  join(&mut b, "r1", false).await;
  recv(&mut b).await;
  recv(&mut a).await;

  a.close(None).await.unwrap();
  assert_eq!(
    recv(&mut b).await,
    json!({"type": "peer-disconnected", "roomId": "r1"})
  );

  // The guest tears down on peer-disconnected; the room then has no occupant left.
  b.close(None).await.unwrap();
  eventually(move || async move { !room(addr, "r1").await.exists }).await;
}

#[tokio::test]
async fn stats_reflect_live_rooms() {
  let (addr, _) = start_server().await;
  let mut h1 = connect(addr).await;
  join(&mut h1, "r1", true).await;
  let mut g1 = connect(addr).await;
  join(&mut g1, "r1", false).await;
  recv(&mut g1).await;
  let mut h2 = connect(addr).await;
  join(&mut h2, "r2", true).await;

  eventually(move || async move { stats(addr).await.total_rooms == 2 }).await;
  assert_eq!(
    stats(addr).await,
    RegistryStats {
      total_rooms: 2,
      total_connections: 3,
      active_rooms: 2
    }
  );
  let status = room(addr, "r1").await;
  assert!(status.exists && status.has_host && status.has_client);
  assert!(status.created_at.is_some());
}

#[tokio::test]
async fn malformed_frames_leave_rooms_alone() {
  let (addr, registry) = start_server().await;
  let mut ws = connect(addr).await;
  send_raw(&mut ws, "not json").await;
  assert_eq!(
    recv(&mut ws).await,
    json!({"type": "error", "message": "Invalid message format"})
  );
  send(&mut ws, json!({"type": "teleport"})).await;
  assert_eq!(
    recv(&mut ws).await,
    json!({"type": "error", "message": "Unknown message type: teleport"})
  );
  send(&mut ws, json!({"type": "answer", "roomId": "r1", "answer": {}})).await;
  assert_eq!(
    recv(&mut ws).await,
    json!({"type": "error", "message": "Not connected to any room"})
  );
  assert_eq!(registry.stats().total_rooms, 0);

  // The connection is still usable afterwards.
  join(&mut ws, "r9", true).await;
  eventually(move || {
    let registry = registry.clone();
    async move { registry.room_status("r9").has_host }
  })
  .await;
}
