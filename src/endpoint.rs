use anyhow::{anyhow, Context, Result};
use url::Url;
use uuid::Uuid;

use crate::config::QUERY_PREFIX;
use crate::registry::{RegistryStats, RoomStatus};

/// Signaling URL for an http(s) endpoint base.
pub fn build_ws_url(endpoint: &Url, path: &str) -> Result<Url> {
  let mut url = endpoint.clone();
  let scheme = match url.scheme() {
    "https" => "wss",
    "http" => "ws",
    "wss" => "wss",
    "ws" => "ws",
    other => return Err(anyhow!("Unsupported endpoint scheme: {other}")),
  };
  url.set_scheme(scheme).map_err(|_| anyhow!("Invalid endpoint scheme"))?;
  url.set_path(path);
  url.set_query(None);
  url.set_fragment(None);
  Ok(url)
}

fn query_url(endpoint: &Url, path: &str) -> Url {
  let mut url = endpoint.clone();
  url.set_path(&format!("{QUERY_PREFIX}{path}"));
  url.set_query(None);
  url.set_fragment(None);
  url
}

/// Short random id for a fresh room.
pub fn generate_room_id() -> String {
  Uuid::new_v4().simple().to_string()[..12].to_string()
}

pub async fn fetch_room_status(endpoint: &Url, room_id: &str) -> Result<RoomStatus> {
  let mut url = query_url(endpoint, "/rooms");
  url
    .path_segments_mut()
    .map_err(|_| anyhow!("Invalid endpoint URL"))?
    .push(room_id);
  let response = reqwest::get(url).await.context("room status request")?;
  let response = response.error_for_status().context("room status response")?;
  response.json().await.context("parse room status")
}

pub async fn fetch_stats(endpoint: &Url) -> Result<RegistryStats> {
  let response = reqwest::get(query_url(endpoint, "/stats"))
    .await
    .context("stats request")?;
  let response = response.error_for_status().context("stats response")?;
  response.json().await.context("parse stats")
}
