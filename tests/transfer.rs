use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use roomdrop::config::{ClientConfig, ROOM_TTL, SIGNALING_PATH};
use roomdrop::peer::{self, Job};
use roomdrop::registry::RoomRegistry;
use roomdrop::server::router;
use tokio::net::TcpListener;
use tokio::time::timeout;

const SESSION: Duration = Duration::from_secs(60);

fn init_test_tracing() {
  let _ = tracing_subscriber::fmt()
    .with_env_filter(
      tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "roomdrop=debug,webrtc_ice::agent=error".into()),
    )
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

fn scratch_dir() -> PathBuf {
  let dir = std::env::temp_dir().join(format!("roomdrop-{}", uuid::Uuid::new_v4()));
  std::fs::create_dir_all(dir.join("out")).unwrap();
  dir
}

fn client(addr: SocketAddr, encrypt: bool) -> ClientConfig {
  let mut config = ClientConfig::new(Some(&format!("http://{addr}"))).unwrap();
  config.ice_servers = Vec::new();
  config.chunk_delay = Duration::ZERO;
  config.negotiation_timeout = Duration::from_secs(30);
  config.encrypt = encrypt;
  config
}

async fn wait_until<F>(mut check: F)
where
  F: FnMut() -> bool,
{
  for _ in 0..250 {
    if check() {
      return;
    }
    tokio::time::sleep(Duration::from_millis(20)).await;
  }
  panic!("condition not reached");
}

/// Hosts `source` in `room_id`, joins as guest once the host is in, and
/// returns the bytes the guest wrote to disk.
async fn transfer_once(encrypt: bool, room_id: &str, source: &Path, dir: &Path) -> Vec<u8> {
  let (addr, registry) = start_server().await;
  let config = client(addr, encrypt);

  let send = peer::run(
    &config,
    room_id,
    Job::Send {
      files: vec![source.to_path_buf()],
      stay_open: false,
    },
  );
  let receive = async {
    let registry = registry.clone();
    wait_until(move || registry.room_status(room_id).has_host).await;
    peer::run(
      &config,
      room_id,
      Job::Receive {
        output_dir: dir.join("out"),
      },
    )
    .await
  };
  let (sent, received) = timeout(SESSION, async { tokio::join!(send, receive) })
    .await
    .expect("session did not finish");

  let sent = sent.unwrap();
  assert_eq!(sent.sent, vec!["payload.bin".to_string()]);
  assert!(sent.failed.is_empty(), "{:?}", sent.failed);

  let received = received.unwrap();
  assert!(received.failed.is_empty(), "{:?}", received.failed);
  assert_eq!(received.received, vec![dir.join("out").join("payload.bin")]);

  // Both sides dropped their signaling sockets on teardown.
  wait_until(move || registry.stats().total_rooms == 0).await;

  std::fs::read(&received.received[0]).unwrap()
}

fn write_source(dir: &Path) -> (PathBuf, Vec<u8>) {
  let data: Vec<u8> = (0..40000u32).map(|i| (i.wrapping_mul(2654435761) >> 13) as u8).collect();
  let path = dir.join("payload.bin");
  std::fs::write(&path, &data).unwrap();
  (path, data)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn encrypted_file_arrives_byte_identical() {
  let dir = scratch_dir();
  let (source, data) = write_source(&dir);
  let written = transfer_once(true, "enc001", &source, &dir).await;
  assert_eq!(written.len(), 40000);
  assert_eq!(written, data);
  let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn plaintext_file_arrives_byte_identical() {
  let dir = scratch_dir();
  let (source, data) = write_source(&dir);
  let written = transfer_once(false, "plain1", &source, &dir).await;
  assert_eq!(written, data);
  let _ = std::fs::remove_dir_all(&dir);
}
