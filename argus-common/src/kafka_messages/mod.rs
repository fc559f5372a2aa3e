use rdkafka::message::{BorrowedMessage, Message, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The broker payload: a schema-tagged value and the id of the producer that sent it.
///
/// `schema_key` names the registry schema `payload` must conform to, so one topic can carry
/// several record types.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Envelope {
    #[serde(rename = "id")]
    pub producer_id: String,
    #[serde(rename = "deserializer")]
    pub schema_key: String,
    #[serde(rename = "data")]
    pub payload: Value,
}

/// Message key used when publishing, so every record from one producer lands on one partition.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ProducerKey {
    pub key: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TimestampType {
    NotAvailable,
    CreateTime,
    LogAppendTime,
}

/// One polled message, detached from the consumer that received it.
#[derive(Debug, Clone, PartialEq)]
pub struct RawMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    /// Milliseconds since the epoch, when the broker reported one.
    pub timestamp: Option<i64>,
    pub timestamp_type: TimestampType,
    pub payload: Option<Vec<u8>>,
}

impl From<&BorrowedMessage<'_>> for RawMessage {
    fn from(message: &BorrowedMessage<'_>) -> Self {
        let (timestamp, timestamp_type) = match message.timestamp() {
            Timestamp::NotAvailable => (None, TimestampType::NotAvailable),
            Timestamp::CreateTime(ms) => (Some(ms), TimestampType::CreateTime),
            Timestamp::LogAppendTime(ms) => (Some(ms), TimestampType::LogAppendTime),
        };

        RawMessage {
            topic: message.topic().to_owned(),
            partition: message.partition(),
            offset: message.offset(),
            timestamp,
            timestamp_type,
            payload: message.payload().map(|payload| payload.to_vec()),
        }
    }
}
