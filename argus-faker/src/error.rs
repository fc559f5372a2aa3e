use argus_common::config::ConfigurationError;
use argus_common::kafka::KafkaConnectionError;
use argus_common::schema::RegistryError;
use thiserror::Error;

/// Errors that stop the faker from starting or generating records.
#[derive(Error, Debug)]
pub enum FakerError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error("transport error: {0}")]
    Transport(#[from] KafkaConnectionError),
    #[error("generated record does not conform: {0}")]
    Encode(#[from] RegistryError),
    #[error("failed to serialize generated record: {0}")]
    Serialization(#[from] serde_json::Error),
}
