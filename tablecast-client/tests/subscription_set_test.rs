//! Subscription set integration tests

mod common;

use common::{settle, MockTransport};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tablecast_client::{TopicHandler, ORDERS_TOPIC, TABLES_TOPIC};
use tokio::time::sleep;

fn noop(topic: &str) -> TopicHandler {
    TopicHandler::new(topic, |_| async {})
}

#[tokio::test(start_paused = true)]
async fn test_unmount_unsubscribes_everything() {
    let transport = MockTransport::new();
    let manager = transport.manager();
    // Another consumer keeps the connection open throughout
    manager.connect().await.unwrap();

    let set = manager.subscription_set(vec![noop(TABLES_TOPIC), noop(ORDERS_TOPIC)]);
    settle().await;
    assert_eq!(set.tracked_topics(), vec![TABLES_TOPIC, ORDERS_TOPIC]);
    assert_eq!(manager.reference_count(), 2);

    set.unmount();

    assert_eq!(transport.unsubscribed(), vec![TABLES_TOPIC, ORDERS_TOPIC]);
    assert!(set.tracked_topics().is_empty());
    assert!(manager.active_topics().is_empty());
    assert_eq!(manager.reference_count(), 1);
    assert!(manager.is_connected());

    set.unmount();
    assert_eq!(manager.reference_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_subscribes_once_connected() {
    let transport = MockTransport::new();
    transport.set_open_delay(Duration::from_millis(100));
    let manager = transport.manager();

    let set = manager.subscription_set(vec![noop(TABLES_TOPIC)]);
    sleep(Duration::from_millis(50)).await;
    assert!(!set.is_connected());
    assert!(set.tracked_topics().is_empty());
    assert!(transport.subscribed().is_empty());

    sleep(Duration::from_millis(100)).await;
    assert!(set.is_connected());
    assert_eq!(set.tracked_topics(), vec![TABLES_TOPIC]);
    assert_eq!(transport.subscribed(), vec![TABLES_TOPIC]);
}

#[tokio::test(start_paused = true)]
async fn test_handlers_receive_messages() {
    let transport = MockTransport::new();
    let manager = transport.manager();

    let hits = Arc::new(AtomicUsize::new(0));
    let h = hits.clone();
    let _set = manager.subscription_set(vec![TopicHandler::new(ORDERS_TOPIC, move |_| {
        let h = h.clone();
        async move {
            h.fetch_add(1, Ordering::SeqCst);
        }
    })]);
    settle().await;

    let session = transport.session().unwrap();
    assert_eq!(session.deliver(ORDERS_TOPIC, r#"{"action":"created"}"#).await, 1);
    assert_eq!(session.deliver(TABLES_TOPIC, "{}").await, 0);
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_resubscribes_after_reconnect() {
    let transport = MockTransport::new();
    let manager = transport.manager();

    let set = manager.subscription_set(vec![noop(TABLES_TOPIC)]);
    sleep(Duration::from_millis(10)).await;
    assert_eq!(transport.subscribed(), vec![TABLES_TOPIC]);

    transport.session().unwrap().drop_connection();
    settle().await;
    assert!(!set.is_connected());
    assert!(set.tracked_topics().is_empty());
    assert_eq!(manager.pending_count(), 0);

    sleep(Duration::from_millis(1100)).await;
    assert!(set.is_connected());
    assert_eq!(transport.open_count(), 2);
    assert_eq!(transport.subscribed(), vec![TABLES_TOPIC, TABLES_TOPIC]);
    assert_eq!(set.tracked_topics(), vec![TABLES_TOPIC]);
    assert_eq!(manager.active_topics(), vec![TABLES_TOPIC]);
    assert_eq!(transport.session().unwrap().live_subscriptions(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_add_and_remove_topics() {
    let transport = MockTransport::new();
    let manager = transport.manager();

    let set = manager.subscription_set(vec![noop(TABLES_TOPIC)]);
    settle().await;

    assert!(set.add_subscription(noop(ORDERS_TOPIC)));
    assert!(!set.add_subscription(noop(ORDERS_TOPIC)));
    assert_eq!(set.tracked_topics(), vec![TABLES_TOPIC, ORDERS_TOPIC]);
    assert_eq!(transport.subscribed(), vec![TABLES_TOPIC, ORDERS_TOPIC]);

    set.remove_subscription(ORDERS_TOPIC);
    assert_eq!(transport.unsubscribed(), vec![ORDERS_TOPIC]);
    assert_eq!(set.tracked_topics(), vec![TABLES_TOPIC]);

    set.remove_subscription("/topic/unknown");
    assert_eq!(transport.unsubscribed(), vec![ORDERS_TOPIC]);
}

#[tokio::test(start_paused = true)]
async fn test_clear_all_and_replace_topics() {
    let transport = MockTransport::new();
    let manager = transport.manager();

    let set = manager.subscription_set(vec![noop(TABLES_TOPIC), noop(ORDERS_TOPIC)]);
    settle().await;

    set.clear_all();
    assert!(set.tracked_topics().is_empty());
    assert!(manager.active_topics().is_empty());
    assert!(set.is_connected());

    set.replace_topics(vec![noop("/topic/kitchen")]);
    assert_eq!(set.tracked_topics(), vec!["/topic/kitchen"]);
    assert_eq!(manager.active_topics(), vec!["/topic/kitchen"]);
}

#[tokio::test(start_paused = true)]
async fn test_drop_releases_connection() {
    let transport = MockTransport::new();
    let manager = transport.manager();

    {
        let _set = manager.subscription_set(vec![noop(TABLES_TOPIC)]);
        settle().await;
        assert!(manager.is_connected());
        assert_eq!(manager.reference_count(), 1);
    }

    assert_eq!(manager.reference_count(), 0);
    assert!(!manager.is_connected());
    assert_eq!(transport.unsubscribed(), vec![TABLES_TOPIC]);
    assert_eq!(transport.close_count(), 1);
}
