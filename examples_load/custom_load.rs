use std::sync::Arc;
use std::time::Instant;
use tracing::error;

use tracing_log_publisher::config::ExecutionPreference;
use tracing_log_publisher::init::{init_tracing_with_config, LayerConfig};
use tracing_log_publisher::memory::MemoryConnector;
use tracing_log_publisher::{Publisher, PublisherConfig};

#[tokio::main]
async fn main() {
    let connector = MemoryConnector::new();
    let publisher = Publisher::new(Arc::new(connector.clone()));
    publisher
        .initialize(PublisherConfig {
            endpoint_url: "memory://".to_string(),
            buffer_size: 1_000,
            flush_interval_ms: 200,
            execution: ExecutionPreference::Inline,
            ..PublisherConfig::default()
        })
        .await;

    let layer_config = LayerConfig {
        enable_stdout: false,
    };
    init_tracing_with_config(publisher.clone(), layer_config).expect("set global subscriber");

    let n: u64 = 100_000;
    let start = Instant::now();

    for i in 0..n {
        error!(iteration = i, "custom load test error");
    }

    let elapsed = start.elapsed();
    println!("custom config: pushed {} events in {:?} (~{:.0} ev/s)",
        n,
        elapsed,
        n as f64 / elapsed.as_secs_f64()
    );

    publisher.shutdown().await;
    println!(
        "published {} dropped {}",
        publisher.total_published(),
        publisher.total_dropped()
    );
}
