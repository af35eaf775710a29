//! Task worker that completes every `payment` task it is handed.
//!
//! Run with: `cargo run --example task_worker -- 127.0.0.1:51015 default-topic`
//!
//! Set `RUST_LOG=zbc_client=debug` to see routing and flow control.

use std::time::Duration;

use tracing_subscriber::EnvFilter;
use zbc_client::{ClientConfig, ZbcClient};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let mut args = std::env::args().skip(1);
    let address = args.next().unwrap_or_else(|| "127.0.0.1:51015".to_string());
    let topic = args.next().unwrap_or_else(|| "default-topic".to_string());

    let config = ClientConfig::builder()
        .bootstrap_address(address)
        .subscription(|s| s.task_lock_duration(Duration::from_secs(30)))
        .build()?;
    let client = ZbcClient::connect(config).await?;
    println!("Connected: {}", client.current_topology());

    let (mut tasks, handle) = client
        .open_task_subscription(&topic, "example-worker", "payment", 32)
        .await?;
    println!(
        "Subscribed to 'payment' tasks on {} partition(s); press Ctrl-C to stop",
        handle.partitions().len()
    );

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = tasks.recv() => {
                let Some(event) = event else {
                    println!("Task stream ended");
                    break;
                };
                match client.complete_task(&event).await {
                    Ok(task) => println!(
                        "  partition {} key {} -> {}",
                        event.partition_id(),
                        event.key(),
                        task.state
                    ),
                    Err(err) => eprintln!("  failed to complete task {}: {}", event.key(), err),
                }
            }
        }
    }

    if let Err(errors) = client.close_subscription(handle).await {
        for err in errors {
            eprintln!("close failed: {err}");
        }
    }
    client.shutdown().await;
    Ok(())
}
