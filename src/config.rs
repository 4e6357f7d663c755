use std::env;
use std::time::Duration;

use crate::activity::ActivityConfig;
use crate::connection::BackoffPolicy;

pub const DEFAULT_ICE_SERVERS: &[&str] = &[
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalIdentity {
    pub user_id: String,
    pub room_id: String,
    pub username: Option<String>,
}

impl LocalIdentity {
    pub fn new(user_id: impl Into<String>, room_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            room_id: room_id.into(),
            username: None,
        }
    }

    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    /// Identity with a random `user-<n>` id.
    pub fn random(room_id: impl Into<String>) -> Self {
        Self::new(format!("user-{}", rand::random::<u32>()), room_id)
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub identity: LocalIdentity,
    pub ice_servers: Vec<String>,
    pub backoff: BackoffPolicy,
    pub roster_sync_interval: Duration,
    pub activity: ActivityConfig,
}

impl SessionConfig {
    pub fn new(identity: LocalIdentity) -> Self {
        Self {
            identity,
            ice_servers: DEFAULT_ICE_SERVERS.iter().map(|s| s.to_string()).collect(),
            backoff: BackoffPolicy::default(),
            roster_sync_interval: Duration::from_secs(10),
            activity: ActivityConfig::default(),
        }
    }

    /// Overrides tuning knobs from `MESHVOICE_*` environment variables.
    pub fn apply_env(mut self) -> Self {
        if let Some(ms) = env_parse::<u64>("MESHVOICE_BACKOFF_BASE_MS") {
            self.backoff.base = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse::<u64>("MESHVOICE_BACKOFF_CAP_MS") {
            self.backoff.cap = Duration::from_millis(ms);
        }
        if let Some(retries) = env_parse::<u32>("MESHVOICE_MAX_RETRIES") {
            self.backoff.max_retries = retries;
        }
        if let Some(secs) = env_parse::<u64>("MESHVOICE_ROSTER_SYNC_SECS") {
            self.roster_sync_interval = Duration::from_secs(secs.max(1));
        }
        if let Some(threshold) = env_parse::<f32>("MESHVOICE_SPEAKING_THRESHOLD") {
            self.activity.threshold = threshold;
        }
        if let Ok(servers) = env::var("MESHVOICE_ICE_SERVERS") {
            let servers: Vec<String> = servers
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
            if !servers.is_empty() {
                self.ice_servers = servers;
            }
        }
        self
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|value| value.trim().parse().ok())
}
