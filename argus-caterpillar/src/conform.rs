use argus_common::kafka_messages::{Envelope, RawMessage, TimestampType};
use argus_common::schema::{RegistryError, SchemaRegistry};
use metrics::counter;
use serde::Serialize;
use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::{debug, warn};

use crate::sink::PRODUCER_ID_MAX_CHARS;

/// Pipeline metadata attached to every conformed record.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct RecordMeta {
    pub timestamp: Option<i64>,
    pub timestamp_type: TimestampType,
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub producer_id: String,
    pub schema_key: String,
}

/// A message whose payload passed validation against the schema named by its envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct ConformedRecord {
    pub meta: RecordMeta,
    /// The envelope as received, kept for audit.
    pub raw: Envelope,
    /// The decoded, validated payload.
    pub conformed: Value,
}

impl ConformedRecord {
    /// The JSON document stored for this record: the received envelope and its metadata.
    pub fn info(&self) -> Value {
        json!({
            "data": self.raw,
            "meta": self.meta,
        })
    }
}

/// Why a message was skipped.
#[derive(Error, Debug)]
pub enum Rejection {
    #[error("message has no payload")]
    EmptyPayload,
    #[error("payload is not valid JSON: {0}")]
    MalformedJson(#[source] serde_json::Error),
    #[error("envelope is not a JSON object")]
    NotAnObject,
    #[error("deserializer not defined")]
    MissingSchemaKey,
    #[error("deserializer {0} not found")]
    UnknownSchema(String),
    #[error("{0} data value not found")]
    MissingPayload(String),
    #[error("{0} producer id not found")]
    MissingProducerId(String),
    #[error("producer id has {0} characters, more than the {} allowed", PRODUCER_ID_MAX_CHARS)]
    ProducerIdTooLong(usize),
    #[error(transparent)]
    Invalid(RegistryError),
}

impl Rejection {
    /// Short label used for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            Rejection::EmptyPayload => "empty_payload",
            Rejection::MalformedJson(_) => "malformed_json",
            Rejection::NotAnObject => "not_an_object",
            Rejection::MissingSchemaKey => "missing_schema_key",
            Rejection::UnknownSchema(_) => "unknown_schema",
            Rejection::MissingPayload(_) => "missing_payload",
            Rejection::MissingProducerId(_) => "missing_producer_id",
            Rejection::ProducerIdTooLong(_) => "producer_id_too_long",
            Rejection::Invalid(_) => "invalid_payload",
        }
    }
}

/// A skipped message, with whatever the envelope told about its origin before it was rejected.
#[derive(Error, Debug)]
#[error("{reason}")]
pub struct Rejected {
    pub producer_id: Option<String>,
    pub schema_key: Option<String>,
    #[source]
    pub reason: Rejection,
}

impl From<Rejection> for Rejected {
    fn from(reason: Rejection) -> Self {
        Rejected {
            producer_id: None,
            schema_key: None,
            reason,
        }
    }
}

/// Resolves each message to its schema and keeps only the ones that decode.
pub struct ConformanceStage {
    registry: SchemaRegistry,
}

impl ConformanceStage {
    pub fn new(registry: SchemaRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    /// Conform every message of a batch independently. Rejected messages are logged and
    /// skipped; the others are returned in their original order.
    pub fn conform(&self, batch: &[RawMessage]) -> Vec<ConformedRecord> {
        batch
            .iter()
            .filter_map(|message| match self.conform_one(message) {
                Ok(record) => {
                    counter!("argus_records_conformed_total").increment(1);
                    debug!(
                        offset = record.meta.offset,
                        timestamp = record.meta.timestamp,
                        producer_id = %record.meta.producer_id,
                        "{} decoded",
                        record.meta.schema_key
                    );
                    Some(record)
                }
                Err(rejected) => {
                    counter!("argus_records_rejected_total", "reason" => rejected.reason.label())
                        .increment(1);
                    warn!(
                        topic = %message.topic,
                        partition = message.partition,
                        offset = message.offset,
                        producer_id = rejected.producer_id.as_deref(),
                        schema_key = rejected.schema_key.as_deref(),
                        "unable to decode message: {}",
                        rejected
                    );
                    None
                }
            })
            .collect()
    }

    pub fn conform_one(&self, message: &RawMessage) -> Result<ConformedRecord, Rejected> {
        let bytes = message.payload.as_deref().ok_or(Rejection::EmptyPayload)?;
        let value: Value = serde_json::from_slice(bytes).map_err(Rejection::MalformedJson)?;
        let Value::Object(envelope) = value else {
            return Err(Rejection::NotAnObject.into());
        };

        let origin = |field: &str| envelope.get(field).and_then(Value::as_str).map(str::to_owned);
        let producer_id = origin("id");
        let schema_key = origin("deserializer");

        self.conform_envelope(message, envelope)
            .map_err(|reason| Rejected {
                producer_id,
                schema_key,
                reason,
            })
    }

    fn conform_envelope(
        &self,
        message: &RawMessage,
        mut envelope: Map<String, Value>,
    ) -> Result<ConformedRecord, Rejection> {
        let schema_key = match envelope.remove("deserializer") {
            Some(Value::String(key)) => key,
            _ => return Err(Rejection::MissingSchemaKey),
        };
        if !self.registry.has(&schema_key) {
            return Err(Rejection::UnknownSchema(schema_key));
        }
        let Some(payload) = envelope.remove("data") else {
            return Err(Rejection::MissingPayload(schema_key));
        };
        let producer_id = match envelope.remove("id") {
            Some(Value::String(id)) => id,
            _ => return Err(Rejection::MissingProducerId(schema_key)),
        };
        let length = producer_id.chars().count();
        if length > PRODUCER_ID_MAX_CHARS {
            return Err(Rejection::ProducerIdTooLong(length));
        }

        let conformed = self
            .registry
            .decode(&schema_key, &payload)
            .map_err(Rejection::Invalid)?;

        Ok(ConformedRecord {
            meta: RecordMeta {
                timestamp: message.timestamp,
                timestamp_type: message.timestamp_type,
                topic: message.topic.clone(),
                partition: message.partition,
                offset: message.offset,
                producer_id: producer_id.clone(),
                schema_key: schema_key.clone(),
            },
            raw: Envelope {
                producer_id,
                schema_key,
                payload,
            },
            conformed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_json_diff::assert_json_include;
    use argus_common::schema::CPU_TIME_FIELDS;

    fn message(offset: i64, payload: Option<&[u8]>) -> RawMessage {
        RawMessage {
            topic: "heartbeats".to_owned(),
            partition: 0,
            offset,
            timestamp: Some(1709288100000 + offset),
            timestamp_type: TimestampType::CreateTime,
            payload: payload.map(<[u8]>::to_vec),
        }
    }

    fn envelope_message(offset: i64, envelope: Value) -> RawMessage {
        message(offset, Some(envelope.to_string().as_bytes()))
    }

    fn heartbeat_envelope(load: Value) -> Value {
        let times: serde_json::Map<String, Value> = CPU_TIME_FIELDS
            .iter()
            .map(|field| (field.to_string(), json!("10.00")))
            .collect();

        json!({
            "id": "faker-1",
            "deserializer": "heartbeat",
            "data": {
                "timestamp": "2024-03-01T10:15:00Z",
                "cpus": {"load": load, "times": times},
            }
        })
    }

    fn stage() -> ConformanceStage {
        ConformanceStage::new(SchemaRegistry::heartbeat())
    }

    #[test]
    fn test_conform_valid_heartbeat() {
        let record = stage()
            .conform_one(&envelope_message(
                7,
                heartbeat_envelope(json!(["12.5", "87.0"])),
            ))
            .unwrap();

        assert_eq!(record.conformed["cpus"]["load"], json!([12.5, 87.0]));
        assert_eq!(
            record.meta,
            RecordMeta {
                timestamp: Some(1709288100007),
                timestamp_type: TimestampType::CreateTime,
                topic: "heartbeats".to_owned(),
                partition: 0,
                offset: 7,
                producer_id: "faker-1".to_owned(),
                schema_key: "heartbeat".to_owned(),
            }
        );
        assert_eq!(record.raw.payload["cpus"]["load"], json!(["12.5", "87.0"]));
    }

    #[test]
    fn test_info_combines_envelope_and_meta() {
        let record = stage()
            .conform_one(&envelope_message(
                3,
                heartbeat_envelope(json!(["1.0"])),
            ))
            .unwrap();

        assert_json_include!(
            actual: record.info(),
            expected: json!({
                "data": {"id": "faker-1", "deserializer": "heartbeat"},
                "meta": {"offset": 3, "producer_id": "faker-1", "timestamp_type": "create_time"},
            })
        );
    }

    #[test]
    fn test_failure_isolation() {
        let batch = vec![
            envelope_message(0, heartbeat_envelope(json!(["12.5"]))),
            envelope_message(
                1,
                json!({"id": "faker-1", "data": {"timestamp": "2024-03-01T10:15:00Z"}}),
            ),
            envelope_message(
                2,
                json!({"id": "faker-1", "deserializer": "not_a_real_schema", "data": {}}),
            ),
            envelope_message(3, heartbeat_envelope(json!(["150.0"]))),
            message(4, Some(b"{not json")),
            message(5, None),
            envelope_message(6, heartbeat_envelope(json!(["87.0", "0.5"]))),
        ];

        let records = stage().conform(&batch);

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].meta.offset, 0);
        assert_eq!(records[1].meta.offset, 6);
        assert_eq!(records[1].conformed["cpus"]["load"], json!([87.0, 0.5]));
    }

    #[test]
    fn test_unknown_schema_key() {
        let batch = vec![envelope_message(
            0,
            json!({"id": "faker-1", "deserializer": "not_a_real_schema", "data": [1, 2]}),
        )];

        assert!(stage().conform(&batch).is_empty());
        assert!(matches!(
            stage().conform_one(&batch[0]),
            Err(Rejected { reason: Rejection::UnknownSchema(key), .. }) if key == "not_a_real_schema"
        ));
    }

    #[test]
    fn test_rejection_keeps_known_origin() {
        let stage = stage();

        let rejected = stage
            .conform_one(&envelope_message(
                4,
                json!({"id": "faker-9", "deserializer": "cpu_load", "data": ["150.0"]}),
            ))
            .unwrap_err();
        assert_eq!(rejected.producer_id.as_deref(), Some("faker-9"));
        assert_eq!(rejected.schema_key.as_deref(), Some("cpu_load"));
        assert!(matches!(rejected.reason, Rejection::Invalid(_)));

        let rejected = stage
            .conform_one(&envelope_message(
                5,
                json!({"id": "faker-9", "deserializer": "not_a_real_schema", "data": []}),
            ))
            .unwrap_err();
        assert_eq!(rejected.producer_id.as_deref(), Some("faker-9"));
        assert_eq!(rejected.schema_key.as_deref(), Some("not_a_real_schema"));

        let rejected = stage.conform_one(&message(6, Some(b"{not json"))).unwrap_err();
        assert!(rejected.producer_id.is_none());
        assert!(rejected.schema_key.is_none());
        assert_eq!(rejected.to_string(), rejected.reason.to_string());
    }

    #[test]
    fn test_oversized_producer_id_is_rejected() {
        let producer_id = "x".repeat(PRODUCER_ID_MAX_CHARS + 1);
        let batch = vec![
            envelope_message(
                0,
                json!({"id": producer_id, "deserializer": "cpu_load", "data": ["1.0"]}),
            ),
            envelope_message(
                1,
                json!({"id": "x".repeat(PRODUCER_ID_MAX_CHARS), "deserializer": "cpu_load", "data": ["1.0"]}),
            ),
        ];

        let records = stage().conform(&batch);

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].meta.offset, 1);
        assert!(matches!(
            stage().conform_one(&batch[0]).unwrap_err().reason,
            Rejection::ProducerIdTooLong(201)
        ));
    }

    #[test]
    fn test_rejection_reasons() {
        let stage = stage();
        let reject = |message: RawMessage| stage.conform_one(&message).unwrap_err().reason.label();

        assert_eq!(reject(message(0, None)), "empty_payload");
        assert_eq!(reject(message(0, Some(b"]"))), "malformed_json");
        assert_eq!(reject(envelope_message(0, json!([1]))), "not_an_object");
        assert_eq!(
            reject(envelope_message(0, json!({"id": "a", "deserializer": 5, "data": []}))),
            "missing_schema_key"
        );
        assert_eq!(
            reject(envelope_message(0, json!({"id": "a", "deserializer": "cpu_load"}))),
            "missing_payload"
        );
        assert_eq!(
            reject(envelope_message(0, json!({"deserializer": "cpu_load", "data": []}))),
            "missing_producer_id"
        );
        assert_eq!(
            reject(envelope_message(
                0,
                json!({"id": "a", "deserializer": "cpu_load", "data": ["1.25"]})
            )),
            "invalid_payload"
        );
        assert_eq!(
            reject(envelope_message(
                0,
                json!({"id": "y".repeat(PRODUCER_ID_MAX_CHARS + 1), "deserializer": "cpu_load", "data": []})
            )),
            "producer_id_too_long"
        );
    }

    #[test]
    fn test_other_schema_keys_share_the_stream() {
        let batch = vec![
            envelope_message(
                0,
                json!({"id": "faker-1", "deserializer": "cpu_load", "data": ["42.0"]}),
            ),
            envelope_message(1, heartbeat_envelope(json!([]))),
        ];

        let records = stage().conform(&batch);

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].meta.schema_key, "cpu_load");
        assert_eq!(records[0].conformed, json!([42.0]));
        assert_eq!(records[1].meta.schema_key, "heartbeat");
    }
}
