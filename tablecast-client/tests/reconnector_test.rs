//! Reconnector integration tests, driven by a paused clock

mod common;

use common::{settle, MockTransport};
use std::sync::Arc;
use std::time::Duration;
use tablecast_client::{Error, FixedDelay, NoReconnect, Reconnector, ReconnectorState};
use tokio::time::sleep;

#[tokio::test(start_paused = true)]
async fn test_backoff_schedule_and_give_up() {
    let transport = MockTransport::new();
    transport.set_fail_always(true);
    let manager = transport.manager();

    let reconnector = manager.reconnector();
    sleep(Duration::from_secs(120)).await;

    let opens = transport.open_times();
    assert_eq!(opens.len(), 6, "one initial attempt plus five retries");

    let gaps: Vec<Duration> = opens.windows(2).map(|w| w[1] - w[0]).collect();
    let expected = [1000, 2000, 4000, 8000, 16000];
    for (gap, want) in gaps.iter().zip(expected) {
        let diff = gap.as_millis().abs_diff(want);
        assert!(diff <= 10, "expected ~{want}ms between attempts, got {gap:?}");
    }

    assert_eq!(reconnector.state(), ReconnectorState::Failed);
    assert_eq!(reconnector.attempt_count(), 5);
    assert_eq!(reconnector.error(), Some(Error::Handshake("refused".into())));
    assert!(!reconnector.is_connected());
    assert_eq!(manager.reference_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_recovers_on_third_attempt_with_queued_subscriptions() {
    let transport = MockTransport::new();
    transport.set_open_delay(Duration::from_millis(100));
    transport.fail_next(2);
    let manager = transport.manager();

    let reconnector = manager.reconnector();
    let mut observed = vec![reconnector.is_connected()];

    // Requested while the first attempt is still in flight
    sleep(Duration::from_millis(50)).await;
    assert!(reconnector.subscribe("/topic/a", |_| async {}).is_none());
    assert!(reconnector.subscribe("/topic/b", |_| async {}).is_none());

    // First failure at 0.1s, second retry fails at 1.2s
    sleep(Duration::from_millis(450)).await;
    observed.push(reconnector.is_connected());
    assert_eq!(reconnector.state(), ReconnectorState::Failed);

    sleep(Duration::from_millis(1500)).await;
    observed.push(reconnector.is_connected());
    assert_eq!(reconnector.attempt_count(), 1);

    // Third attempt starts at 3.2s and succeeds at 3.3s
    sleep(Duration::from_millis(1400)).await;
    observed.push(reconnector.is_connected());

    assert_eq!(observed, vec![false, false, false, true]);
    assert_eq!(reconnector.attempt_count(), 0);
    assert_eq!(reconnector.error(), None);
    assert_eq!(reconnector.state(), ReconnectorState::Connected);
    assert_eq!(transport.open_count(), 3);
    assert_eq!(transport.subscribed(), vec!["/topic/a", "/topic/b"]);
    assert_eq!(manager.active_topics(), vec!["/topic/a", "/topic/b"]);
}

#[tokio::test(start_paused = true)]
async fn test_watch_reports_each_change_once() {
    let transport = MockTransport::new();
    transport.fail_next(1);
    let manager = transport.manager();

    let reconnector = Reconnector::mount(&manager, Arc::new(FixedDelay::new(Duration::from_secs(1))));
    let mut watch = reconnector.watch();
    assert!(!*watch.borrow());

    watch.changed().await.unwrap();
    assert!(*watch.borrow_and_update());
    assert_eq!(transport.open_count(), 2);

    reconnector.unmount();
    watch.changed().await.unwrap();
    assert!(!*watch.borrow());
}

#[tokio::test(start_paused = true)]
async fn test_manual_connect_resumes_after_giving_up() {
    let transport = MockTransport::new();
    transport.fail_next(1);
    let manager = transport.manager();

    let reconnector = Reconnector::mount(&manager, Arc::new(NoReconnect));
    sleep(Duration::from_millis(10)).await;
    assert_eq!(reconnector.state(), ReconnectorState::Failed);
    assert!(reconnector.error().is_some());

    reconnector.connect().await;

    assert!(reconnector.is_connected());
    assert_eq!(reconnector.state(), ReconnectorState::Connected);
    assert_eq!(reconnector.error(), None);
    assert_eq!(transport.open_count(), 2);
    assert_eq!(manager.reference_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_manual_connect_during_attempt_keeps_retry_budget() {
    let transport = MockTransport::new();
    transport.set_open_delay(Duration::from_millis(100));
    transport.fail_next(2);
    let manager = transport.manager();

    // First attempt fails at 0.1s, the first retry opens at 1.1s
    let reconnector = manager.reconnector();
    sleep(Duration::from_millis(1150)).await;
    assert_eq!(transport.open_count(), 2);
    assert_eq!(reconnector.state(), ReconnectorState::Connecting);
    assert_eq!(reconnector.attempt_count(), 1);

    reconnector.connect().await;
    assert_eq!(transport.open_count(), 2);
    assert_eq!(reconnector.attempt_count(), 1);

    // The retry fails at 1.2s; the next delay is still the second step (2s)
    sleep(Duration::from_millis(100)).await;
    assert_eq!(reconnector.state(), ReconnectorState::Failed);
    assert_eq!(reconnector.attempt_count(), 1);

    sleep(Duration::from_millis(1800)).await;
    assert_eq!(transport.open_count(), 2);

    sleep(Duration::from_millis(300)).await;
    assert_eq!(transport.open_count(), 3);
    assert!(reconnector.is_connected());
    assert_eq!(reconnector.attempt_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_manual_connect_while_connected_is_noop() {
    let transport = MockTransport::new();
    let manager = transport.manager();

    let reconnector = manager.reconnector();
    sleep(Duration::from_millis(10)).await;
    assert!(reconnector.is_connected());

    reconnector.connect().await;
    reconnector.connect().await;

    assert_eq!(reconnector.state(), ReconnectorState::Connected);
    assert_eq!(transport.open_count(), 1);
    assert_eq!(manager.reference_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_lost_session_is_retried_after_first_delay() {
    let transport = MockTransport::new();
    let manager = transport.manager();

    let reconnector = manager.reconnector();
    sleep(Duration::from_millis(10)).await;
    assert!(reconnector.is_connected());

    transport.session().unwrap().drop_connection();
    settle().await;
    assert!(!reconnector.is_connected());
    assert_eq!(reconnector.error(), Some(Error::ConnectionClosed));

    sleep(Duration::from_millis(900)).await;
    assert_eq!(transport.open_count(), 1);

    sleep(Duration::from_millis(200)).await;
    assert_eq!(transport.open_count(), 2);
    assert!(reconnector.is_connected());
    assert!(manager.is_connected());
    assert_eq!(reconnector.attempt_count(), 0);
    assert_eq!(manager.reference_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_follows_connection_made_by_another_consumer() {
    let transport = MockTransport::new();
    transport.fail_next(1);
    let manager = transport.manager();

    let reconnector = Reconnector::mount(&manager, Arc::new(NoReconnect));
    sleep(Duration::from_millis(10)).await;
    assert!(!reconnector.is_connected());

    manager.connect().await.unwrap();
    assert!(reconnector.is_connected());
    assert_eq!(reconnector.state(), ReconnectorState::Connected);
    assert_eq!(manager.reference_count(), 2);

    manager.disconnect();
    assert!(manager.is_connected());
    assert!(reconnector.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_unmount_cancels_pending_retry() {
    let transport = MockTransport::new();
    transport.set_fail_always(true);
    let manager = transport.manager();

    let reconnector = manager.reconnector();
    sleep(Duration::from_millis(10)).await;
    assert_eq!(transport.open_count(), 1);

    reconnector.unmount();
    assert_eq!(manager.reference_count(), 0);

    sleep(Duration::from_secs(60)).await;
    assert_eq!(transport.open_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_then_connect_retakes_reference() {
    let transport = MockTransport::new();
    let manager = transport.manager();

    let reconnector = manager.reconnector();
    sleep(Duration::from_millis(10)).await;
    assert!(manager.is_connected());

    reconnector.disconnect();
    assert_eq!(manager.reference_count(), 0);
    assert!(!manager.is_connected());
    assert_eq!(reconnector.state(), ReconnectorState::Idle);

    // No automatic retry after an explicit disconnect
    sleep(Duration::from_secs(5)).await;
    assert_eq!(transport.open_count(), 1);

    reconnector.connect().await;
    assert_eq!(manager.reference_count(), 1);
    assert!(reconnector.is_connected());
    assert_eq!(transport.open_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_reconnectors_share_one_connection() {
    let transport = MockTransport::new();
    let manager = transport.manager();

    let first = manager.reconnector();
    let second = manager.reconnector();
    sleep(Duration::from_millis(10)).await;

    assert!(first.is_connected());
    assert!(second.is_connected());
    assert_eq!(transport.open_count(), 1);
    assert_eq!(manager.reference_count(), 2);

    drop(first);
    assert!(manager.is_connected());
    assert!(second.is_connected());

    drop(second);
    assert!(!manager.is_connected());
    assert_eq!(transport.close_count(), 1);
}
