use anyhow::Result;
use chrono::{DateTime, Utc};
use rabbitbus::{BusConfig, Inbound, MessageBus};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Serialize, Deserialize)]
struct OrderMessage {
    order_id: Uuid,
    customer_id: String,
    items: Vec<String>,
    total: f64,
    timestamp: DateTime<Utc>,
}

async fn run_publisher() -> Result<()> {
    let bus = MessageBus::from_config(BusConfig::from_env()?);
    let channel = bus.channel().await?;

    let order = OrderMessage {
        order_id: Uuid::new_v4(),
        customer_id: "customer-123".to_string(),
        items: vec!["product-1".to_string(), "product-2".to_string()],
        total: 59.99,
        timestamp: Utc::now(),
    };
    channel.publish("orders.created", &order).await?;
    println!("Published order {}", order.order_id);
    Ok(())
}

async fn run_subscriber() -> Result<()> {
    let bus = MessageBus::from_config(BusConfig::from_env()?);
    let channel = bus.channel().await?;

    channel
        .subscribe("orders.*", "", |inbound: Inbound<OrderMessage>| async move {
            println!(
                "[{}] order {} for {} (${:.2})",
                inbound.routing_key, inbound.payload.order_id, inbound.payload.customer_id, inbound.payload.total
            );
            if let Err(e) = inbound.ack().await {
                eprintln!("ack failed: {}", e);
            }
        })
        .await?;

    println!("Subscribed to orders.*. Press Ctrl+C to exit.");
    tokio::signal::ctrl_c().await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let args: Vec<String> = std::env::args().collect();
    match args.get(1).map(|s| s.as_str()) {
        Some("publisher") => run_publisher().await,
        Some("subscriber") => run_subscriber().await,
        _ => {
            println!("Usage: cargo run --example pubsub_demo [publisher|subscriber]");
            Ok(())
        }
    }
}
