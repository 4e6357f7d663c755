use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};

use meshvoice::{
    CaptureSwitch, LocalIdentity, Session, SessionConfig, SessionNotification, WebRtcPeerFactory,
    WebSocketTransport,
};

#[derive(Parser, Debug)]
#[command(name = "meshvoice")]
#[command(about = "Join a full-mesh voice room")]
struct Cli {
    /// Signaling server WebSocket URL
    #[arg(long, env = "MESHVOICE_URL")]
    url: String,

    /// Room to join
    #[arg(long, env = "MESHVOICE_ROOM")]
    room: String,

    /// Local user id (random when omitted)
    #[arg(long, env = "MESHVOICE_USER_ID")]
    user_id: Option<String>,

    #[arg(long, env = "MESHVOICE_USERNAME")]
    username: Option<String>,

    /// STUN/TURN server URL; repeat for several
    #[arg(long = "stun")]
    stun: Vec<String>,

    #[arg(long)]
    max_retries: Option<u32>,

    #[arg(long)]
    backoff_base_ms: Option<u64>,

    #[arg(long)]
    backoff_cap_ms: Option<u64>,

    #[arg(long)]
    roster_sync_secs: Option<u64>,

    /// Join receive-only, without opening the microphone
    #[arg(long)]
    no_capture: bool,
}

impl Cli {
    fn session_config(&self) -> SessionConfig {
        let mut identity = match &self.user_id {
            Some(user_id) => LocalIdentity::new(user_id.clone(), self.room.clone()),
            None => LocalIdentity::random(self.room.clone()),
        };
        if let Some(username) = &self.username {
            identity = identity.with_username(username.clone());
        }

        let mut config = SessionConfig::new(identity).apply_env();
        if !self.stun.is_empty() {
            config.ice_servers = self.stun.clone();
        }
        if let Some(retries) = self.max_retries {
            config.backoff.max_retries = retries;
        }
        if let Some(ms) = self.backoff_base_ms {
            config.backoff.base = Duration::from_millis(ms);
        }
        if let Some(ms) = self.backoff_cap_ms {
            config.backoff.cap = Duration::from_millis(ms);
        }
        if let Some(secs) = self.roster_sync_secs {
            config.roster_sync_interval = Duration::from_secs(secs.max(1));
        }
        config
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let config = cli.session_config();
    info!(
        user = %config.identity.user_id,
        room = %config.identity.room_id,
        stun = ?config.ice_servers,
        "starting meshvoice"
    );

    let factory = WebRtcPeerFactory::new(&config.ice_servers)
        .context("failed to initialise WebRTC")?;
    let transport = WebSocketTransport::new(cli.url.clone());
    let window = config.activity.window;
    let (mut session, handle, mut notifications) =
        Session::new(config, transport, Arc::new(factory));
    let capture_switch = CaptureSwitch::new();
    session.add_local_media(Arc::new(capture_switch.clone()));

    #[cfg(feature = "capture")]
    let _capture = if cli.no_capture {
        handle.media_unavailable("capture disabled")?;
        None
    } else {
        match meshvoice::audio::AudioCapture::start(handle.clone(), window, capture_switch) {
            Ok(capture) => {
                handle.media_ready()?;
                Some(capture)
            }
            Err(e) => {
                handle.media_unavailable(e.to_string())?;
                None
            }
        }
    };
    #[cfg(not(feature = "capture"))]
    {
        let _ = (window, capture_switch);
        let reason = if cli.no_capture {
            "capture disabled"
        } else {
            "built without capture support"
        };
        handle.media_unavailable(reason)?;
    }

    let session_task = tokio::spawn(session.run());
    let mut fatal = false;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted, leaving room");
                let _ = handle.leave();
                break;
            }
            notification = notifications.recv() => match notification {
                Some(SessionNotification::Fatal { message }) => {
                    error!("{}", message);
                    fatal = true;
                    let _ = handle.leave();
                    break;
                }
                Some(SessionNotification::Left) | None => break,
                Some(SessionNotification::ParticipantJoined { id, display_name }) => {
                    info!(peer = %id, "{} joined", display_name)
                }
                Some(SessionNotification::ParticipantLeft { id }) => info!(peer = %id, "participant left"),
                Some(SessionNotification::MediaUnavailable { reason }) => {
                    warn!("microphone unavailable ({}); others can still be heard", reason)
                }
                Some(other) => info!(?other, "session event"),
            }
        }
    }

    let outcome = session_task.await.context("session task panicked")?;
    if let Err(e) = outcome {
        error!("session ended: {}", e);
        fatal = true;
    }
    if fatal {
        std::process::exit(1);
    }
    Ok(())
}
