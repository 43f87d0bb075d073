use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::{ServerConfig, QUERY_PREFIX};
use crate::error::RoomError;
use crate::protocol::{parse_client_message, ClientMessage, ServerMessage};
use crate::registry::{Connection, Outbound, RegistryStats, RoomRegistry, RoomStatus};
use crate::sweeper;

/// Signaling socket plus the read-only query routes, all over one registry.
pub fn router(registry: Arc<RoomRegistry>, signaling_path: &str) -> Router {
  let queries = Router::new()
    .route("/rooms/:room_id", get(room_status))
    .route("/stats", get(stats));

  Router::new()
    .route(signaling_path, get(ws_handler))
    .nest(QUERY_PREFIX, queries)
    .with_state(registry)
}

pub async fn serve(config: ServerConfig) -> Result<()> {
  let listener = TcpListener::bind(config.bind)
    .await
    .with_context(|| format!("bind {}", config.bind))?;
  let registry = Arc::new(RoomRegistry::new(config.room_ttl));
  let sweeper = sweeper::spawn(registry.clone(), config.sweep_interval);

  info!(
    addr = %listener.local_addr()?,
    path = %config.signaling_path,
    ttl_secs = config.room_ttl.as_secs(),
    "signaling server listening"
  );
  let result = axum::serve(listener, router(registry, &config.signaling_path))
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("signaling server");
  sweeper.abort();
  info!("signaling server stopped");
  result
}

async fn shutdown_signal() {
  if tokio::signal::ctrl_c().await.is_err() {
    std::future::pending::<()>().await;
  }
}

async fn room_status(Path(room_id): Path<String>, State(registry): State<Arc<RoomRegistry>>) -> Json<RoomStatus> {
  Json(registry.room_status(&room_id))
}

async fn stats(State(registry): State<Arc<RoomRegistry>>) -> Json<RegistryStats> {
  Json(registry.stats())
}

async fn ws_handler(ws: WebSocketUpgrade, State(registry): State<Arc<RoomRegistry>>) -> impl IntoResponse {
  ws.on_upgrade(move |socket| handle_socket(socket, registry))
}

async fn handle_socket(socket: WebSocket, registry: Arc<RoomRegistry>) {
  let (mut ws_tx, mut ws_rx) = socket.split();
  let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();
  let conn = Connection::new(tx);
  debug!(conn = conn.id(), "signaling connection opened");

  let mut writer = tokio::spawn(async move {
    while let Some(out) = rx.recv().await {
      let text = match out {
        Outbound::Message(msg) => match serde_json::to_string(&msg) {
          Ok(text) => text,
          Err(err) => {
            warn!(%err, "failed to encode server message");
            continue;
          }
        },
        Outbound::Relay(text) => text,
        Outbound::Close => {
          let _ = ws_tx.send(Message::Close(None)).await;
          break;
        }
      };
      if ws_tx.send(Message::Text(text)).await.is_err() {
        break;
      }
    }
  });

  let reader = async {
    while let Some(frame) = ws_rx.next().await {
      let frame = match frame {
        Ok(frame) => frame,
        Err(err) => {
          debug!(conn = conn.id(), %err, "signaling read error");
          break;
        }
      };
      match frame {
        Message::Text(text) => dispatch(&registry, &conn, &text),
        Message::Binary(_) => conn.send(ServerMessage::error("Invalid message format")),
        Message::Close(_) => break,
        Message::Ping(_) | Message::Pong(_) => {}
      }
    }
  };

  tokio::select! {
    _ = reader => {}
    _ = &mut writer => {}
  }
  registry.leave(&conn);
  writer.abort();
  debug!(conn = conn.id(), "signaling connection closed");
}

/// A panic while handling a frame is reported to that connection only.
fn dispatch(registry: &RoomRegistry, conn: &Connection, text: &str) {
  if catch_unwind(AssertUnwindSafe(|| handle_frame(registry, conn, text))).is_err() {
    error!(conn = conn.id(), "panic while handling signaling frame");
    conn.send(ServerMessage::error("Internal error"));
  }
}

pub fn handle_frame(registry: &RoomRegistry, conn: &Connection, text: &str) {
  let msg = match parse_client_message(text) {
    Ok(msg) => msg,
    Err(err) => {
      warn!(conn = conn.id(), %err, "rejected signaling frame");
      conn.send(ServerMessage::error(err.to_string()));
      return;
    }
  };

  match msg {
    ClientMessage::Join { room_id, is_host } => match registry.join(&room_id, is_host, conn) {
      Ok(()) => {}
      Err(RoomError::RoomNotFound) => conn.send(ServerMessage::RoomNotFound { room_id }),
      Err(RoomError::RoomFull) => conn.send(ServerMessage::RoomFull { room_id }),
      Err(err) => {
        info!(conn = conn.id(), room = %room_id, %err, "join rejected");
        conn.send(ServerMessage::error(err.to_string()));
      }
    },
    ClientMessage::Offer { .. } | ClientMessage::Answer { .. } | ClientMessage::IceCandidate { .. } => {
      let kind = msg.kind();
      if let Err(err) = registry.relay(conn, text) {
        debug!(conn = conn.id(), kind, %err, "relay failed");
        conn.send(ServerMessage::error(err.to_string()));
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::ROOM_TTL;

  fn peer() -> (Connection, mpsc::UnboundedReceiver<Outbound>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Connection::new(tx), rx)
  }

  #[test]
  fn malformed_frames_only_answer_the_sender() {
    let registry = RoomRegistry::new(ROOM_TTL);
    let (conn, mut rx) = peer();
    handle_frame(&registry, &conn, "{nope");
    handle_frame(&registry, &conn, r#"{"type":"dance"}"#);
    assert_eq!(
      rx.try_recv().unwrap(),
      Outbound::Message(ServerMessage::error("Invalid message format"))
    );
    assert_eq!(
      rx.try_recv().unwrap(),
      Outbound::Message(ServerMessage::error("Unknown message type: dance"))
    );
    assert_eq!(registry.stats().total_rooms, 0);
  }

  #[test]
  fn room_errors_use_dedicated_message_types() {
    let registry = RoomRegistry::new(ROOM_TTL);
    let (guest, mut rx) = peer();
    handle_frame(&registry, &guest, r#"{"type":"join","roomId":"xyz000","isHost":false}"#);
    assert_eq!(
      rx.try_recv().unwrap(),
      Outbound::Message(ServerMessage::RoomNotFound { room_id: "xyz000".into() })
    );

    let (host, _host_rx) = peer();
    handle_frame(&registry, &host, r#"{"type":"join","roomId":"r1","isHost":true}"#);
    let (second, mut second_rx) = peer();
    handle_frame(&registry, &second, r#"{"type":"join","roomId":"r1","isHost":true}"#);
    assert_eq!(
      second_rx.try_recv().unwrap(),
      Outbound::Message(ServerMessage::error("Room already has a host"))
    );
  }

  #[test]
  fn relay_without_a_room_is_reported() {
    let registry = RoomRegistry::new(ROOM_TTL);
    let (conn, mut rx) = peer();
    handle_frame(&registry, &conn, r#"{"type":"offer","roomId":"r1","offer":{"sdp":"x"}}"#);
    assert_eq!(
      rx.try_recv().unwrap(),
      Outbound::Message(ServerMessage::error("Not connected to any room"))
    );
  }
}
