pub mod record;
pub mod normalize;
pub mod buffer;
pub mod config;
pub mod env;
pub mod error;
pub mod state;
pub mod transport;
pub mod backoff;
pub mod strategy;
pub mod publisher;
pub mod layer;
pub mod init;

pub mod backend;
pub mod memory;
pub mod nats;

#[cfg(feature = "http")]
pub mod http;

pub use config::PublisherConfig;
pub use publisher::Publisher;
pub use record::LogRecord;
