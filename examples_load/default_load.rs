use std::sync::Arc;
use std::time::Instant;
use tracing::error;

use tracing_log_publisher::init::init_tracing;
use tracing_log_publisher::memory::MemoryConnector;
use tracing_log_publisher::{Publisher, PublisherConfig};

#[tokio::main]
async fn main() {
    let connector = MemoryConnector::new();
    let publisher = Publisher::new(Arc::new(connector.clone()));
    publisher
        .initialize(PublisherConfig {
            endpoint_url: "memory://".to_string(),
            ..PublisherConfig::default()
        })
        .await;
    init_tracing(publisher.clone()).expect("set global subscriber");

    let n: u64 = 100_000;
    let start = Instant::now();

    for i in 0..n {
        error!(iteration = i, "default load test error");
    }

    let elapsed = start.elapsed();
    println!("default config: pushed {} events in {:?} (~{:.0} ev/s)",
        n,
        elapsed,
        n as f64 / elapsed.as_secs_f64()
    );

    publisher.shutdown().await;
    println!(
        "published {} dropped {} (endpoint holds {})",
        publisher.total_published(),
        publisher.total_dropped(),
        connector.published().len()
    );
}
