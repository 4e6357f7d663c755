use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "Disconnected"),
            ConnectionState::Connecting => write!(f, "Connecting"),
            ConnectionState::Connected => write!(f, "Connected"),
            ConnectionState::Reconnecting => write!(f, "Reconnecting"),
            ConnectionState::Failed => write!(f, "Failed"),
            ConnectionState::Closed => write!(f, "Closed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub retry_count: u32,
    pub last_error: Option<String>,
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            retry_count: 0,
            last_error: None,
        }
    }
}

/// Publishes signaling-channel health to any number of watchers.
#[derive(Clone)]
pub struct ConnectionMonitor {
    status: Arc<watch::Sender<ConnectionStatus>>,
    receiver: watch::Receiver<ConnectionStatus>,
}

impl ConnectionMonitor {
    pub fn new() -> Self {
        let (status, receiver) = watch::channel(ConnectionStatus::default());
        Self {
            status: Arc::new(status),
            receiver,
        }
    }

    pub fn update_state(&self, state: ConnectionState) {
        self.status.send_modify(|status| {
            status.state = state;
        });
    }

    pub fn update_retry_count(&self, retry_count: u32) {
        self.status.send_modify(|status| {
            status.retry_count = retry_count;
        });
    }

    pub fn set_error(&self, error: String) {
        self.status.send_modify(|status| {
            status.last_error = Some(error);
        });
    }

    pub fn current(&self) -> ConnectionStatus {
        self.receiver.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionStatus> {
        self.receiver.clone()
    }
}

impl Default for ConnectionMonitor {
    fn default() -> Self {
        Self::new()
    }
}

/// `delay = min(base * 2^attempt, cap)`, for at most `max_retries` attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub max_retries: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(1000),
            cap: Duration::from_millis(10_000),
            max_retries: 5,
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .unwrap_or(self.cap)
            .min(self.cap)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    /// Try again after `delay`; `attempt` counts from 1.
    Retry { attempt: u32, delay: Duration },
    /// Retries just ran out. Reported once.
    GiveUp { attempts: u32 },
    /// Retries ran out earlier and the failure was already reported.
    AlreadyExhausted,
}

#[derive(Debug, Clone)]
pub struct ConnectionHealth {
    policy: BackoffPolicy,
    retry_count: u32,
    exhausted: bool,
}

impl ConnectionHealth {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            retry_count: 0,
            exhausted: false,
        }
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn max_retries(&self) -> u32 {
        self.policy.max_retries
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// Delay the next reconnect would wait.
    pub fn current_delay(&self) -> Duration {
        self.policy.delay_for(self.retry_count)
    }

    pub fn record_open(&mut self) {
        self.retry_count = 0;
        self.exhausted = false;
    }

    pub fn record_abnormal_close(&mut self) -> ReconnectDecision {
        if self.exhausted {
            return ReconnectDecision::AlreadyExhausted;
        }
        if self.retry_count >= self.policy.max_retries {
            self.exhausted = true;
            return ReconnectDecision::GiveUp {
                attempts: self.retry_count,
            };
        }
        let delay = self.policy.delay_for(self.retry_count);
        self.retry_count += 1;
        ReconnectDecision::Retry {
            attempt: self.retry_count,
            delay,
        }
    }

    /// Manual rejoin starts the retry budget over.
    pub fn reset(&mut self) {
        self.retry_count = 0;
        self.exhausted = false;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerEvent {
    Reconnect,
    RosterSync,
}

/// Owns the reconnect and roster-sync timers so teardown can cancel both.
pub struct ReconnectController {
    health: ConnectionHealth,
    roster_interval: Duration,
    timers: mpsc::UnboundedSender<TimerEvent>,
    reconnect_task: Option<JoinHandle<()>>,
    roster_task: Option<JoinHandle<()>>,
}

impl ReconnectController {
    pub fn new(
        policy: BackoffPolicy,
        roster_interval: Duration,
        timers: mpsc::UnboundedSender<TimerEvent>,
    ) -> Self {
        Self {
            health: ConnectionHealth::new(policy),
            roster_interval,
            timers,
            reconnect_task: None,
            roster_task: None,
        }
    }

    pub fn health(&self) -> &ConnectionHealth {
        &self.health
    }

    pub fn on_open(&mut self) {
        self.health.record_open();
        self.cancel_reconnect();
    }

    /// Records the failure and schedules the next attempt if the budget allows.
    pub fn on_abnormal_close(&mut self) -> ReconnectDecision {
        let decision = self.health.record_abnormal_close();
        if let ReconnectDecision::Retry { attempt, delay } = decision {
            info!(
                attempt,
                max = self.health.max_retries(),
                delay_ms = delay.as_millis() as u64,
                "scheduling signaling reconnect"
            );
            self.schedule_reconnect(delay);
        }
        decision
    }

    pub fn schedule_reconnect(&mut self, delay: Duration) {
        self.cancel_reconnect();
        let timers = self.timers.clone();
        self.reconnect_task = Some(tokio::spawn(async move {
            sleep(delay).await;
            let _ = timers.send(TimerEvent::Reconnect);
        }));
    }

    /// Marks the pending reconnect as consumed once its event was delivered.
    pub fn reconnect_fired(&mut self) {
        self.reconnect_task = None;
    }

    pub fn reconnect_pending(&self) -> bool {
        self.reconnect_task
            .as_ref()
            .map_or(false, |task| !task.is_finished())
    }

    pub fn cancel_reconnect(&mut self) {
        if let Some(task) = self.reconnect_task.take() {
            task.abort();
        }
    }

    pub fn start_roster_sync(&mut self) {
        if self.roster_sync_running() {
            return;
        }
        let timers = self.timers.clone();
        let period = self.roster_interval;
        debug!(period_ms = period.as_millis() as u64, "starting roster sync");
        self.roster_task = Some(tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if timers.send(TimerEvent::RosterSync).is_err() {
                    break;
                }
            }
        }));
    }

    pub fn roster_sync_running(&self) -> bool {
        self.roster_task
            .as_ref()
            .map_or(false, |task| !task.is_finished())
    }

    pub fn stop_roster_sync(&mut self) {
        if let Some(task) = self.roster_task.take() {
            task.abort();
        }
    }

    pub fn reset_for_rejoin(&mut self) {
        self.health.reset();
        self.cancel_reconnect();
    }

    pub fn cancel_all(&mut self) {
        self.cancel_reconnect();
        self.stop_roster_sync();
    }
}

impl Drop for ReconnectController {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
