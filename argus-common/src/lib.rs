pub mod config;
pub mod kafka;
pub mod kafka_messages;
pub mod metrics;
pub mod schema;
