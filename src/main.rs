use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use roomdrop::config::{ClientConfig, ServerConfig, DEFAULT_BIND, SIGNALING_PATH};
use roomdrop::endpoint::{fetch_room_status, fetch_stats, generate_room_id};
use roomdrop::peer::{self, Job, SessionReport};
use roomdrop::server;

#[derive(Parser, Debug)]
#[command(name = "roomdrop")]
#[command(about = "Room-based P2P file transfer over WebRTC")]
struct Cli {
  /// -v for debug, -vv for trace. RUST_LOG takes precedence.
  #[arg(short, long, action = clap::ArgAction::Count, global = true)]
  verbose: u8,
  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Run the signaling server
  Serve {
    #[arg(long, env = "ROOMDROP_BIND", default_value = DEFAULT_BIND, value_name = "ADDR")]
    bind: SocketAddr,
    #[arg(long, default_value = SIGNALING_PATH, value_name = "PATH", help = "WebSocket signaling path")]
    path: String,
    #[arg(long, env = "ROOMDROP_ROOM_TTL_SECS", default_value_t = 30 * 60, value_name = "SECS")]
    room_ttl_secs: u64,
    #[arg(long, env = "ROOMDROP_SWEEP_INTERVAL_SECS", default_value_t = 5 * 60, value_name = "SECS")]
    sweep_interval_secs: u64,
  },
  /// Host a room and send files to whoever joins it
  Send {
    #[arg(value_name = "FILE", required = true, help = "Files to send")]
    files: Vec<PathBuf>,
    #[arg(long, value_name = "ROOM_ID", help = "Use this room id instead of a random one")]
    room_id: Option<String>,
    #[command(flatten)]
    client: ClientArgs,
    #[arg(long, help = "Disable chunk encryption (default: enabled)")]
    no_encrypt: bool,
    #[arg(long, value_name = "MS", help = "Pause between chunks")]
    chunk_delay_ms: Option<u64>,
    #[arg(long, help = "Keep the connection open after a successful send")]
    stay_open: bool,
  },
  /// Join a room and receive its files
  Receive {
    #[arg(value_name = "ROOM_ID")]
    room_id: String,
    #[arg(long, default_value = ".", value_name = "DIR", help = "Output directory")]
    output_dir: PathBuf,
    #[command(flatten)]
    client: ClientArgs,
  },
  /// Show a room's occupancy
  Room {
    #[arg(value_name = "ROOM_ID")]
    room_id: String,
    #[arg(long, value_name = "URL", help = "Override signaling endpoint")]
    endpoint: Option<String>,
  },
  /// Show registry totals
  Stats {
    #[arg(long, value_name = "URL", help = "Override signaling endpoint")]
    endpoint: Option<String>,
  },
}

#[derive(clap::Args, Debug)]
struct ClientArgs {
  #[arg(long, value_name = "URL", help = "Override signaling endpoint")]
  endpoint: Option<String>,
  #[arg(long, value_name = "SECS", help = "Give up if no direct connection within this time")]
  timeout_secs: Option<u64>,
  #[arg(long, value_name = "SECS", help = "Abandon a transfer that stalls for this long")]
  idle_timeout_secs: Option<u64>,
}

impl ClientArgs {
  fn config(&self) -> Result<ClientConfig> {
    let mut config = ClientConfig::new(self.endpoint.as_deref())?;
    if let Some(secs) = self.timeout_secs {
      config.negotiation_timeout = Duration::from_secs(secs);
    }
    if let Some(secs) = self.idle_timeout_secs {
      config.idle_timeout = Duration::from_secs(secs);
    }
    Ok(config)
  }
}

#[tokio::main]
async fn main() -> Result<()> {
  let cli = Cli::parse();
  init_tracing(cli.verbose);

  match cli.command {
    Command::Serve {
      bind,
      path,
      room_ttl_secs,
      sweep_interval_secs,
    } => {
      if !path.starts_with('/') {
        bail!("Signaling path must start with '/'");
      }
      server::serve(ServerConfig {
        bind,
        signaling_path: path,
        room_ttl: Duration::from_secs(room_ttl_secs),
        sweep_interval: Duration::from_secs(sweep_interval_secs.max(1)),
      })
      .await
    }
    Command::Send {
      files,
      room_id,
      client,
      no_encrypt,
      chunk_delay_ms,
      stay_open,
    } => {
      let mut config = client.config()?;
      config.encrypt = !no_encrypt;
      if let Some(ms) = chunk_delay_ms {
        config.chunk_delay = Duration::from_millis(ms);
      }
      run_send(&config, files, room_id, stay_open).await
    }
    Command::Receive {
      room_id,
      output_dir,
      client,
    } => run_receive(&client.config()?, &room_id, output_dir).await,
    Command::Room { room_id, endpoint } => {
      let config = ClientConfig::new(endpoint.as_deref())?;
      let status = fetch_room_status(&config.endpoint, &room_id).await?;
      println!("{}", serde_json::to_string_pretty(&status)?);
      Ok(())
    }
    Command::Stats { endpoint } => {
      let config = ClientConfig::new(endpoint.as_deref())?;
      let stats = fetch_stats(&config.endpoint).await?;
      println!("{}", serde_json::to_string_pretty(&stats)?);
      Ok(())
    }
  }
}

fn init_tracing(verbose: u8) {
  // webrtc_ice reports late STUN responses as warnings; they are harmless.
  let default = match verbose {
    0 => "warn,roomdrop=info,webrtc_ice::agent=error",
    1 => "info,roomdrop=debug,webrtc_ice::agent=error",
    _ => "debug,roomdrop=trace",
  };
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
  tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

async fn run_send(config: &ClientConfig, files: Vec<PathBuf>, room_id: Option<String>, stay_open: bool) -> Result<()> {
  for file in &files {
    if !file.is_file() {
      bail!("Not a file: {}", file.display());
    }
  }
  let room_id = room_id.unwrap_or_else(generate_room_id);
  println!("Room: {room_id}");
  println!("On the other machine run: roomdrop receive {room_id}");
  info!(endpoint = %config.endpoint, encrypt = config.encrypt, "waiting for a guest");

  let report = peer::run(config, &room_id, Job::Send { files, stay_open }).await?;
  summarize(&report)
}

async fn run_receive(config: &ClientConfig, room_id: &str, output_dir: PathBuf) -> Result<()> {
  let status = fetch_room_status(&config.endpoint, room_id).await?;
  if !status.exists || !status.has_host {
    return Err(anyhow!("Room not found: {room_id}"));
  }
  tokio::fs::create_dir_all(&output_dir).await?;

  let report = peer::run(config, room_id, Job::Receive { output_dir }).await?;
  if report.received.is_empty() && report.failed.is_empty() {
    bail!("Connection closed before any file arrived");
  }
  summarize(&report)
}

fn summarize(report: &SessionReport) -> Result<()> {
  for name in &report.sent {
    println!("sent      {name}");
  }
  for path in &report.received {
    println!("received  {}", path.display());
  }
  for (name, reason) in &report.failed {
    println!("failed    {name}: {reason}");
  }
  if report.failed.is_empty() {
    Ok(())
  } else {
    Err(anyhow!("{} transfer(s) failed", report.failed.len()))
  }
}
