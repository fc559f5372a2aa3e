//! Generate synthetic heartbeat records and publish them to Kafka.
pub mod config;
pub mod error;
pub mod faker;
pub mod generator;
