use std::env;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{anyhow, Result};
use url::Url;

pub const CHUNK_SIZE: usize = 16 * 1024;
pub const DEFAULT_CHUNK_DELAY: Duration = Duration::from_millis(10);
pub const DEFAULT_HIGH_WATER_MARK: usize = 1024 * 1024;

pub const ROOM_TTL: Duration = Duration::from_secs(30 * 60);
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

pub const DEFAULT_BIND: &str = "0.0.0.0:8080";
pub const DEFAULT_ENDPOINT: &str = "http://127.0.0.1:8080";
pub const SIGNALING_PATH: &str = "/api/p2p/signaling";
pub const QUERY_PREFIX: &str = "/api/p2p";

pub const DEFAULT_STUN_SERVERS: &[&str] = &["stun:stun.l.google.com:19302", "stun:stun1.l.google.com:19302"];
pub const DEFAULT_NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(120);
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct ServerConfig {
  pub bind: SocketAddr,
  pub signaling_path: String,
  pub room_ttl: Duration,
  pub sweep_interval: Duration,
}

impl Default for ServerConfig {
  fn default() -> Self {
    Self {
      bind: SocketAddr::from(([0, 0, 0, 0], 8080)),
      signaling_path: SIGNALING_PATH.to_string(),
      room_ttl: ROOM_TTL,
      sweep_interval: SWEEP_INTERVAL,
    }
  }
}

/// Settings shared by the `send` and `receive` peers.
#[derive(Debug, Clone)]
pub struct ClientConfig {
  pub endpoint: Url,
  pub ice_servers: Vec<String>,
  pub chunk_size: usize,
  pub chunk_delay: Duration,
  pub high_water_mark: usize,
  pub negotiation_timeout: Duration,
  pub idle_timeout: Duration,
  pub encrypt: bool,
}

impl ClientConfig {
  pub fn new(endpoint: Option<&str>) -> Result<Self> {
    Ok(Self {
      endpoint: resolve_endpoint(endpoint)?,
      ice_servers: DEFAULT_STUN_SERVERS.iter().map(|s| s.to_string()).collect(),
      chunk_size: CHUNK_SIZE,
      chunk_delay: DEFAULT_CHUNK_DELAY,
      high_water_mark: DEFAULT_HIGH_WATER_MARK,
      negotiation_timeout: DEFAULT_NEGOTIATION_TIMEOUT,
      idle_timeout: DEFAULT_IDLE_TIMEOUT,
      encrypt: true,
    })
  }
}

/// Flag, then `ROOMDROP_ENDPOINT`, then the local default. Always normalised to an http(s) base.
pub fn resolve_endpoint(endpoint: Option<&str>) -> Result<Url> {
  let endpoint = endpoint
    .map(|value| value.to_string())
    .or_else(|| env::var("ROOMDROP_ENDPOINT").ok())
    .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string());

  let mut url = Url::parse(&endpoint)?;
  let scheme = match url.scheme() {
    "https" | "http" => url.scheme().to_string(),
    "wss" => "https".to_string(),
    "ws" => "http".to_string(),
    other => return Err(anyhow!("Unsupported endpoint scheme: {other}")),
  };
  url.set_scheme(&scheme).map_err(|_| anyhow!("Invalid endpoint scheme"))?;
  url.set_path("");
  url.set_query(None);
  url.set_fragment(None);
  Ok(url)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn websocket_endpoints_are_normalised_to_http() {
    let url = resolve_endpoint(Some("wss://drop.example.com/some/path?x=1#frag")).unwrap();
    assert_eq!(url.as_str(), "https://drop.example.com/");

    let url = resolve_endpoint(Some("ws://127.0.0.1:9000")).unwrap();
    assert_eq!(url.as_str(), "http://127.0.0.1:9000/");
  }

  #[test]
  fn unsupported_scheme_is_rejected() {
    assert!(resolve_endpoint(Some("ftp://example.com")).is_err());
  }

  #[test]
  fn server_defaults_match_protocol_constants() {
    let config = ServerConfig::default();
    assert_eq!(config.bind.to_string(), DEFAULT_BIND);
    assert_eq!(config.room_ttl, Duration::from_secs(1800));
    assert_eq!(config.sweep_interval, Duration::from_secs(300));
  }
}
