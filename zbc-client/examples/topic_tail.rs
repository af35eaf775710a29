//! Prints every event of a topic from the beginning.
//!
//! Run with: `cargo run --example topic_tail -- 127.0.0.1:51015 default-topic`

use futures::StreamExt;
use tracing_subscriber::EnvFilter;
use zbc_client::ZbcClient;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let mut args = std::env::args().skip(1);
    let address = args.next().unwrap_or_else(|| "127.0.0.1:51015".to_string());
    let topic = args.next().unwrap_or_else(|| "default-topic".to_string());

    let client = ZbcClient::connect_to(address).await?;
    let (events, handle) = client.open_topic_subscription(&topic, "topic-tail", 0).await?;

    let mut events = events.take_until(Box::pin(tokio::signal::ctrl_c()));
    while let Some(event) = events.next().await {
        println!(
            "[{}:{}] {:?} key={} ({} bytes)",
            event.partition_id(),
            event.position(),
            event.event_type(),
            event.key(),
            event.payload().len()
        );
    }

    if let Err(errors) = client.close_subscription(handle).await {
        eprintln!("{} partition(s) failed to close", errors.len());
    }
    client.shutdown().await;
    Ok(())
}
