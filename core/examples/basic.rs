//! Basic credential pool usage example
//!
//! Run with `RUST_LOG=pool_machines=debug cargo run --example basic` to see the
//! pool's own logging.

use pool_machines::{
    ChannelSink, CredentialBroker, CredentialConfig, PoolBuilder, PoolConfig, PoolError,
};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

const CONFIG: &str = r#"
error_threshold = 5
cooldown_secs = 300.0

[health]
recovery_interval_secs = 1.0
base_backoff_secs = 2.0

[[credentials]]
id = "primary"
capacity = 2
priority = 80
label = "Primary key pair"

[[credentials]]
id = "backup"
capacity = 1
"#;

#[tokio::main]
async fn main() -> Result<(), PoolError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    println!("=== Credential Pool Basic Example ===\n");

    let (sink, mut events) = ChannelSink::new(64);
    let config = PoolConfig::from_toml_str(CONFIG)?;
    let allocator = PoolBuilder::from_config(config)
        .event_sink(Arc::new(sink))
        .build()?;

    let broker = CredentialBroker::from_allocator(allocator);
    broker.start()?;

    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            println!("  event {} {:?}", event.kind(), event.payload());
        }
    });

    println!("--- Filling the pool ---");
    let mut held = Vec::new();
    loop {
        match broker.allocate(None) {
            Ok(credential) => {
                println!(
                    "✓ {} ({}/{})",
                    credential.id, credential.current_load, credential.capacity
                );
                held.push(credential);
            }
            Err(e) => {
                println!("✗ {}", e);
                break;
            }
        }
    }
    for credential in held.drain(..) {
        broker.release(&credential.id);
    }

    println!("\n--- Primary starts failing ---");
    for _ in 0..3 {
        broker.report_error("primary", "429 Too Many Requests");
    }
    let credential = broker.allocate(None)?;
    println!("✓ Allocated {} while primary is quarantined", credential.id);
    broker.release(&credential.id);

    println!("\n--- Waiting for the recovery scan ---");
    tokio::time::sleep(std::time::Duration::from_millis(3500)).await;
    if let Some(report) = broker.get_credential_health("primary") {
        println!(
            "primary: {} (attempts: {})",
            report.status, report.recovery_attempts
        );
    }

    for _ in 0..5 {
        broker.report_success("primary", Some(90.0));
    }

    println!("\n--- Adding a credential at runtime ---");
    broker.add_credential(CredentialConfig::new("overflow").capacity(10).priority(10))?;

    println!("\n--- Pool summary ---");
    for row in broker.list_all() {
        println!(
            "{:<10} {:<9} health={:<10} load={}/{} errors={}",
            row.credential.id,
            row.credential.status,
            row.health,
            row.credential.current_load,
            row.credential.capacity,
            row.credential.error_count
        );
    }

    let stats = broker.get_stats();
    println!(
        "\nallocations={} exhausted={} capacity={}",
        stats.allocation_count, stats.exhausted_count, stats.total_capacity
    );

    broker.shutdown().await;
    drop(broker);
    let _ = printer.await;

    Ok(())
}
