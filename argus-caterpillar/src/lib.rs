//! Consume heartbeat records from Kafka, keep the ones that conform to a registered schema
//! and store them in PostgreSQL.
pub mod config;
pub mod conform;
pub mod error;
pub mod pipeline;
pub mod sink;
