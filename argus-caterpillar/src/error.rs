use argus_common::config::ConfigurationError;
use argus_common::kafka::KafkaConnectionError;
use argus_common::metrics::BuildError;
use thiserror::Error;

use crate::sink::PersistenceError;

/// Errors that stop the caterpillar from starting or running.
#[derive(Error, Debug)]
pub enum CaterpillarError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error("transport error: {0}")]
    Transport(#[from] KafkaConnectionError),
    #[error("persistence error: {0}")]
    Persistence(#[from] PersistenceError),
    #[error("failed to install metrics recorder: {0}")]
    Metrics(#[from] BuildError),
    #[error("only {persisted} of {conformed} conformed record(s) were persisted")]
    IncompleteBatch { persisted: usize, conformed: usize },
}
