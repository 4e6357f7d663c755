mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use meshvoice::connection::ConnectionState;
use meshvoice::error::SessionError;
use meshvoice::media::CaptureSwitch;
use meshvoice::session::{Command, MediaState, SessionNotification};
use meshvoice::signaling::SignalingMessage;
use meshvoice::transport::{SignalingTransport, TransportEvent};

fn abnormal() -> TransportEvent {
    TransportEvent::Closed {
        code: 1006,
        reason: "connection reset".into(),
    }
}

fn reconnect_delays(notifications: &[SessionNotification]) -> Vec<u64> {
    notifications
        .iter()
        .filter_map(|n| match n {
            SessionNotification::Reconnecting { delay, .. } => Some(delay.as_millis() as u64),
            _ => None,
        })
        .collect()
}

fn fatal_count(notifications: &[SessionNotification]) -> usize {
    notifications
        .iter()
        .filter(|n| matches!(n, SessionNotification::Fatal { .. }))
        .count()
}

#[tokio::test(start_paused = true)]
async fn abnormal_close_evicts_peers_and_schedules_reconnect() {
    let mut a = TestSession::joined("a").await;
    a.deliver(&user_joined("b")).await;
    a.deliver(&user_joined("c")).await;
    a.drain_notifications();

    a.session.transport_mut().drop_connection();
    a.session.handle_transport_event(abnormal()).await;

    assert!(a.session.room().remote_ids().is_empty());
    assert!(a.session.peers().is_empty());
    assert!(a.session.reconnect_pending());
    assert!(!a.session.roster_sync_running());
    assert_eq!(a.session.monitor().current().state, ConnectionState::Reconnecting);
    assert_eq!(a.session.monitor().current().retry_count, 1);

    let notifications = a.drain_notifications();
    assert_eq!(
        notifications
            .iter()
            .filter(|n| matches!(n, SessionNotification::ParticipantLeft { .. }))
            .count(),
        2
    );
    assert_eq!(reconnect_delays(&notifications), vec![1000]);
}

#[tokio::test(start_paused = true)]
async fn successful_reconnect_rejoins_and_resets_retries() {
    let mut a = TestSession::joined("a").await;
    a.session.transport_mut().drop_connection();
    a.session.transport_mut().fail_connects = 1;
    let started = tokio::time::Instant::now();

    a.session.handle_transport_event(abnormal()).await;
    assert!(a.session.step().await);
    assert_eq!(started.elapsed(), Duration::from_millis(1000));
    assert_eq!(a.session.health().retry_count(), 2);

    assert!(a.session.step().await);
    assert_eq!(started.elapsed(), Duration::from_millis(3000));
    assert_eq!(a.session.health().retry_count(), 0);
    assert_eq!(a.session.transport().connects, 2);
    assert!(a.session.roster_sync_running());
    assert_eq!(
        a.take_sent(),
        vec![SignalingMessage::Join {
            user_id: "a".into(),
            room_id: "r1".into(),
            username: Some("a".into()),
        }]
    );
    assert_eq!(reconnect_delays(&a.drain_notifications()), vec![1000, 2000]);
    assert_eq!(a.session.monitor().current().state, ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn backoff_doubles_and_gives_up_exactly_once() {
    let mut config = test_config("a");
    config.backoff.max_retries = 5;
    let mut a = TestSession::with_config(config);
    a.session.start().await;
    a.session.transport_mut().drop_connection();
    a.session.transport_mut().fail_connects = u32::MAX;
    let started = tokio::time::Instant::now();

    a.session.handle_transport_event(abnormal()).await;
    for _ in 0..5 {
        assert!(a.session.step().await);
    }

    assert_eq!(started.elapsed(), Duration::from_millis(1000 + 2000 + 4000 + 8000 + 10_000));
    let notifications = a.drain_notifications();
    assert_eq!(reconnect_delays(&notifications), vec![1000, 2000, 4000, 8000, 10_000]);
    assert_eq!(fatal_count(&notifications), 1);
    assert!(!a.session.reconnect_pending());
    assert!(a.session.health().is_exhausted());
    assert_eq!(a.session.monitor().current().state, ConnectionState::Failed);

    // Nothing else is ever scheduled, and later closes do not report again.
    assert!(tokio::time::timeout(Duration::from_secs(120), a.session.step())
        .await
        .is_err());
    a.session.handle_transport_event(abnormal()).await;
    assert!(a.drain_notifications().is_empty());
    assert!(!a.session.reconnect_pending());
}

#[tokio::test(start_paused = true)]
async fn connect_failure_at_start_enters_backoff() {
    let mut a = TestSession::new("a");
    a.session.transport_mut().fail_connects = 1;
    a.session.start().await;

    assert!(a.session.reconnect_pending());
    assert_eq!(reconnect_delays(&a.drain_notifications()), vec![1000]);

    assert!(a.session.step().await);
    assert!(a.session.transport().is_open());
    assert_eq!(a.session.transport().sent_kinds(), vec!["join"]);
}

#[tokio::test(start_paused = true)]
async fn normal_close_does_not_reconnect() {
    let mut a = TestSession::joined("a").await;
    a.deliver(&user_joined("b")).await;
    a.drain_notifications();

    a.session.transport_mut().drop_connection();
    a.session
        .handle_transport_event(TransportEvent::Closed {
            code: 1001,
            reason: "going away".into(),
        })
        .await;

    assert!(!a.session.reconnect_pending());
    assert!(!a.session.roster_sync_running());
    assert_eq!(a.session.peers().ids(), vec!["b"]);
    assert_eq!(a.session.health().retry_count(), 0);
    assert_eq!(
        a.drain_notifications(),
        vec![SessionNotification::TransportClosed {
            code: 1001,
            reason: "going away".into()
        }]
    );
    assert_eq!(a.session.monitor().current().state, ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn manual_rejoin_resets_exhausted_retries() {
    let mut config = test_config("a");
    config.backoff.max_retries = 1;
    let mut a = TestSession::with_config(config);
    a.session.start().await;
    a.take_sent();
    a.session.transport_mut().drop_connection();
    a.session.transport_mut().fail_connects = 1;

    a.session.handle_transport_event(abnormal()).await;
    assert!(a.session.step().await);
    assert!(a.session.health().is_exhausted());
    assert_eq!(fatal_count(&a.drain_notifications()), 1);

    a.session.handle_command(Command::Rejoin).await;

    assert!(!a.session.health().is_exhausted());
    assert_eq!(a.session.health().retry_count(), 0);
    assert_eq!(a.session.transport().sent_kinds(), vec!["join"]);
    assert!(a.session.roster_sync_running());
}

#[tokio::test(start_paused = true)]
async fn leave_cancels_timers_and_closes_everything() {
    let mut a = TestSession::joined("a").await;
    let capture = CaptureSwitch::new();
    a.session.add_local_media(Arc::new(capture.clone()));
    a.deliver(&user_joined("b")).await;
    let peer = a.factory.peer("b").unwrap();
    a.drain_notifications();

    a.handle.leave().unwrap();
    assert!(!a.session.step().await);

    assert!(a.session.is_closed());
    assert!(a.session.peers().is_empty());
    assert!(a.session.room().remote_ids().is_empty());
    assert_eq!(a.session.keys().remote_count(), 0);
    assert!(peer.is_closed());
    assert!(capture.is_stopped());
    assert_eq!(a.session.media_state(), MediaState::Stopped);
    assert!(a.session.transport().closed);
    assert!(!a.session.roster_sync_running());
    assert!(!a.session.reconnect_pending());
    assert_eq!(a.session.monitor().current().state, ConnectionState::Closed);
    assert_eq!(a.drain_notifications(), vec![SessionNotification::Left]);

    // Late events after teardown are ignored.
    a.session.handle_transport_event(abnormal()).await;
    a.deliver(&user_joined("c")).await;
    assert!(!a.session.reconnect_pending());
    assert!(a.session.peers().is_empty());
}

#[tokio::test(start_paused = true)]
async fn run_reports_exhaustion_when_left_after_giving_up() {
    let mut config = test_config("a");
    config.backoff.max_retries = 0;
    let a = TestSession::with_config(config);
    let TestSession {
        mut session,
        handle,
        mut notifications,
        ..
    } = a;
    session.transport_mut().fail_connects = 1;

    let task = tokio::spawn(session.run());
    loop {
        match notifications.recv().await {
            Some(SessionNotification::Fatal { .. }) => break,
            Some(_) => {}
            None => panic!("session ended before giving up"),
        }
    }
    handle.leave().unwrap();

    let outcome = task.await.unwrap();
    assert!(matches!(
        outcome,
        Err(SessionError::ReconnectExhausted { attempts: 0 })
    ));
}
