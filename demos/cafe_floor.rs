//! Café floor demo
//!
//! Starts a local broker, mounts two consumers on one shared connection and
//! publishes a few table and order updates. Halfway through, the broker drops
//! every client and the consumers resubscribe on their own.
//!
//! Run with: cargo run --example cafe_floor

use std::sync::Arc;
use std::time::Duration;
use tablecast::client::{FixedDelay, OrderAction};
use tablecast::{
    Broker, ClientBuilder, OrderEvent, TableStatusEvent, TopicHandler, ORDERS_TOPIC, TABLES_TOPIC,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tablecast_client=debug".into()),
        )
        .init();

    let broker = Broker::builder().bind_str("127.0.0.1:0")?.build().await?;
    let addr = broker.local_addr()?;
    let handle = broker.handle();
    tokio::spawn(async move {
        if let Err(e) = broker.run().await {
            tracing::error!(error = %e, "Broker stopped");
        }
    });

    let manager = ClientBuilder::new()
        .url(format!("ws://{}/ws", addr))
        .reconnect_policy(Arc::new(FixedDelay::new(Duration::from_millis(250))))
        .build()?;

    // The floor plan view
    let floor = manager.subscription_set(vec![TopicHandler::new(TABLES_TOPIC, |msg| async move {
        match msg.json::<TableStatusEvent>() {
            Ok(event) => println!("[floor] table {} is {}", event.table_id, event.status),
            Err(e) => println!("[floor] unreadable update: {}", e),
        }
    })]);

    // The kitchen view
    let kitchen = manager.subscription_set(vec![TopicHandler::new(ORDERS_TOPIC, |msg| async move {
        if let Ok(event) = msg.json::<OrderEvent>() {
            println!(
                "[kitchen] order {} {}",
                event.order_id.as_deref().unwrap_or("?"),
                event.action
            );
        }
    })]);

    while handle.subscriber_count(ORDERS_TOPIC).await == 0 {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    println!("{} consumers on {} connection(s)", manager.reference_count(), handle.connection_count().await);

    handle
        .broadcast_table_update(&TableStatusEvent::update("t-1", "OCCUPIED"))
        .await?;
    handle
        .broadcast_order_update(&OrderEvent::new(OrderAction::Created, "o-100"))
        .await?;
    tokio::time::sleep(Duration::from_millis(200)).await;

    println!("Broker drops every client...");
    handle.disconnect_all().await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    while handle.subscriber_count(TABLES_TOPIC).await == 0 {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    println!("Consumers are back");

    handle
        .broadcast_table_update(&TableStatusEvent::update("t-1", "AVAILABLE"))
        .await?;
    tokio::time::sleep(Duration::from_millis(200)).await;

    kitchen.unmount();
    floor.unmount();
    tokio::time::sleep(Duration::from_millis(100)).await;
    println!("Open connections after unmount: {}", handle.connection_count().await);

    Ok(())
}
