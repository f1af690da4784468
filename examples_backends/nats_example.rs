use tracing::{error, info};
use tracing_log_publisher::{init::init_tracing, Publisher, PublisherConfig};

#[tokio::main]
async fn main() {
    // Reads LOG_PUBLISHER_URL, LOG_PUBLISHER_TOPIC, LOG_PUBLISHER_TOKEN, ...
    // e.g. LOG_PUBLISHER_URL=nats://127.0.0.1:4222 LOG_PUBLISHER_TOPIC=logs.demo
    let config = PublisherConfig::from_env();

    let publisher = Publisher::from_url(&config.endpoint_url).expect("invalid LOG_PUBLISHER_URL");
    publisher.initialize(config).await;
    init_tracing(publisher.clone()).expect("set global subscriber");

    info!(component = "checkout", "nats backend example started");
    error!(component = "checkout", order_id = 1234, "simulated error sent via NATS");

    publisher.shutdown().await;
    println!(
        "connected={} published={} dropped={}",
        publisher.is_connected(),
        publisher.total_published(),
        publisher.total_dropped()
    );
}
