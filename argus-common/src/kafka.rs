use std::fmt;
use std::future::Future;
use std::time::Duration;

use metrics::{counter, gauge};
use rdkafka::consumer::{CommitMode as KafkaCommitMode, Consumer, ConsumerContext, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use rdkafka::ClientConfig;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::{CommitMode, KafkaConfig};
use crate::kafka_messages::{Envelope, ProducerKey, RawMessage};

/// How long to wait for broker metadata when starting a role, before giving up on the broker.
const METADATA_TIMEOUT: Duration = Duration::from_secs(10);

/// How long `send` may wait for room in the producer queue.
const SEND_QUEUE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Consumer,
    Producer,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Consumer => write!(f, "consumer"),
            Role::Producer => write!(f, "producer"),
        }
    }
}

/// Transport errors of a [`KafkaConnection`].
#[derive(Error, Debug)]
pub enum KafkaConnectionError {
    #[error("the kafka {0} is not started")]
    NotStarted(Role),
    #[error("kafka error: {0}")]
    Kafka(#[from] KafkaError),
    #[error("failed to serialize message: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Where the consumer stands in its group membership.
///
/// The first poll after subscribing mostly completes the partition assignment and rarely
/// returns data, so the first `fetch` polls twice: `Unassigned -> Assigned -> Steady`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignmentState {
    Unassigned,
    Assigned,
    Steady,
}

impl AssignmentState {
    fn advance(self) -> Self {
        match self {
            AssignmentState::Unassigned => AssignmentState::Assigned,
            AssignmentState::Assigned | AssignmentState::Steady => AssignmentState::Steady,
        }
    }
}

pub struct KafkaContext {}

impl rdkafka::ClientContext for KafkaContext {
    fn stats(&self, stats: rdkafka::Statistics) {
        gauge!("argus_kafka_callback_queue_depth").set(stats.replyq as f64);
        gauge!("argus_kafka_producer_queue_depth").set(stats.msg_cnt as f64);
    }
}

impl ConsumerContext for KafkaContext {}

/// One broker connection, used as a group consumer, a producer, or both.
///
/// Neither role connects until `start_consumer`/`start_producer` is called. Transport failures
/// are logged and swallowed unless `raise_on_error` is set in the configuration, in which case
/// they are returned to the caller.
pub struct KafkaConnection {
    config: KafkaConfig,
    consumer: Option<StreamConsumer<KafkaContext>>,
    producer: Option<FutureProducer<KafkaContext>>,
    assignment: AssignmentState,
}

impl KafkaConnection {
    pub fn new(config: KafkaConfig) -> Self {
        Self {
            config,
            consumer: None,
            producer: None,
            assignment: AssignmentState::Unassigned,
        }
    }

    pub fn config(&self) -> &KafkaConfig {
        &self.config
    }

    pub fn commit_mode(&self) -> CommitMode {
        self.config.commit_mode
    }

    pub fn assignment_state(&self) -> AssignmentState {
        self.assignment
    }

    pub fn is_consumer_started(&self) -> bool {
        self.consumer.is_some()
    }

    pub fn is_producer_started(&self) -> bool {
        self.producer.is_some()
    }

    /// Join the consumer group and subscribe to the configured topic.
    pub fn start_consumer(&mut self) -> Result<(), KafkaConnectionError> {
        info!(
            "connecting consumer to Kafka brokers at {}...",
            self.config.bootstrap_servers()
        );

        match self.create_consumer() {
            Ok(consumer) => {
                self.consumer = Some(consumer);
                self.assignment = AssignmentState::Unassigned;
                info!(
                    topic = %self.config.topic,
                    group = %self.config.group_id,
                    "kafka consumer started"
                );
                Ok(())
            }
            Err(error) => {
                error!("failed to start kafka consumer: {}", error);
                self.fail(error.into())
            }
        }
    }

    pub fn start_producer(&mut self) -> Result<(), KafkaConnectionError> {
        info!(
            "connecting producer to Kafka brokers at {}...",
            self.config.bootstrap_servers()
        );

        match self.create_producer() {
            Ok(producer) => {
                self.producer = Some(producer);
                info!(topic = %self.config.topic, "kafka producer started");
                Ok(())
            }
            Err(error) => {
                error!("failed to start kafka producer: {}", error);
                self.fail(error.into())
            }
        }
    }

    /// Poll for messages. Never fails unless `raise_on_error` is set: transport problems
    /// are logged and an empty batch is returned.
    ///
    /// With [`CommitMode::OnFetch`] the consumed offsets are committed before returning.
    pub async fn fetch(&mut self) -> Result<Vec<RawMessage>, KafkaConnectionError> {
        match self.try_fetch().await {
            Ok(messages) => {
                counter!("argus_messages_fetched_total").increment(messages.len() as u64);
                Ok(messages)
            }
            Err(error) => {
                warn!("failed to fetch messages from kafka: {}", error);
                self.fail(error)
            }
        }
    }

    /// Commit the offsets of every message fetched so far.
    pub fn commit(&self) -> Result<(), KafkaConnectionError> {
        let result = match &self.consumer {
            Some(consumer) => commit_consumed(consumer).map_err(KafkaConnectionError::from),
            None => Err(KafkaConnectionError::NotStarted(Role::Consumer)),
        };

        match result {
            Ok(()) => Ok(()),
            Err(error) => {
                warn!("failed to commit kafka offsets: {}", error);
                self.fail(error)
            }
        }
    }

    /// Wrap `payload` in an [`Envelope`] tagged with `schema_key` and publish it, returning
    /// once the broker acknowledged the message. Publish failures are always returned, so
    /// the caller sees the outcome of every call.
    pub async fn send(&self, schema_key: &str, payload: Value) -> Result<(), KafkaConnectionError> {
        match self.try_send(schema_key, payload).await {
            Ok((partition, offset)) => {
                counter!("argus_messages_published_total").increment(1);
                debug!(schema_key, partition, offset, "published message");
                Ok(())
            }
            Err(error) => {
                counter!("argus_publish_errors_total").increment(1);
                error!(schema_key, "failed to publish message: {}", error);
                Err(error)
            }
        }
    }

    fn fail<T: Default>(&self, error: KafkaConnectionError) -> Result<T, KafkaConnectionError> {
        if self.config.raise_on_error {
            Err(error)
        } else {
            Ok(T::default())
        }
    }

    fn client_config(&self) -> ClientConfig {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", self.config.bootstrap_servers())
            .set("client.id", &self.config.client_id)
            .set("statistics.interval.ms", "10000");

        if self.config.tls {
            client_config
                .set("security.protocol", "ssl")
                .set("ssl.ca.location", self.config.ca_cert_file.to_string_lossy())
                .set(
                    "ssl.certificate.location",
                    self.config.access_cert_file.to_string_lossy(),
                )
                .set("ssl.key.location", self.config.key_file.to_string_lossy());
        };

        client_config
    }

    fn create_consumer(&self) -> Result<StreamConsumer<KafkaContext>, KafkaError> {
        let mut client_config = self.client_config();
        client_config
            .set("group.id", &self.config.group_id)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest");

        debug!("rdkafka consumer configuration: {:?}", client_config);
        let consumer: StreamConsumer<KafkaContext> =
            client_config.create_with_context(KafkaContext {})?;

        // Make sure we can reach brokers before subscribing
        drop(consumer.fetch_metadata(Some(&self.config.topic), Timeout::After(METADATA_TIMEOUT))?);
        consumer.subscribe(&[self.config.topic.as_str()])?;

        Ok(consumer)
    }

    fn create_producer(&self) -> Result<FutureProducer<KafkaContext>, KafkaError> {
        let mut client_config = self.client_config();
        client_config.set("linger.ms", "0");

        debug!("rdkafka producer configuration: {:?}", client_config);
        let producer: FutureProducer<KafkaContext> =
            client_config.create_with_context(KafkaContext {})?;

        drop(
            producer
                .client()
                .fetch_metadata(Some(&self.config.topic), Timeout::After(METADATA_TIMEOUT))?,
        );

        Ok(producer)
    }

    async fn try_fetch(&mut self) -> Result<Vec<RawMessage>, KafkaConnectionError> {
        let consumer = self
            .consumer
            .as_ref()
            .ok_or(KafkaConnectionError::NotStarted(Role::Consumer))?;
        let timeout = self.config.poll_timeout;

        let messages = poll_tracking_assignment(
            &mut self.assignment,
            self.config.max_poll_records,
            move |limit| poll(consumer, timeout, limit),
        )
        .await?;

        if self.config.commit_mode == CommitMode::OnFetch {
            commit_consumed(consumer)?;
        }

        Ok(messages)
    }

    async fn try_send(
        &self,
        schema_key: &str,
        payload: Value,
    ) -> Result<(i32, i64), KafkaConnectionError> {
        let producer = self
            .producer
            .as_ref()
            .ok_or(KafkaConnectionError::NotStarted(Role::Producer))?;

        let envelope = Envelope {
            producer_id: self.config.client_id.clone(),
            schema_key: schema_key.to_owned(),
            payload,
        };
        let payload = serde_json::to_string(&envelope)?;
        let key = serde_json::to_string(&ProducerKey {
            key: self.config.client_id.clone(),
        })?;

        let delivered = producer
            .send(
                FutureRecord::to(&self.config.topic)
                    .payload(&payload)
                    .key(&key),
                Timeout::After(SEND_QUEUE_TIMEOUT),
            )
            .await
            .map_err(|(error, _)| error)?;

        Ok(delivered)
    }
}

/// Poll once, or twice while the group assignment is still being completed.
///
/// Whatever the first poll returned is kept even if the second one fails: by then the consumer
/// position already moved past those messages, so dropping them would let the next commit
/// skip them.
async fn poll_tracking_assignment<P, F>(
    assignment: &mut AssignmentState,
    max_records: usize,
    mut poll_once: P,
) -> Result<Vec<RawMessage>, KafkaError>
where
    P: FnMut(usize) -> F,
    F: Future<Output = Result<Vec<RawMessage>, KafkaError>>,
{
    let mut messages = poll_once(max_records).await?;
    if *assignment != AssignmentState::Unassigned {
        return Ok(messages);
    }

    *assignment = assignment.advance();
    debug!("initial poll returned {} message(s), polling again", messages.len());

    let remaining = max_records.saturating_sub(messages.len());
    let second = poll_once(remaining).await;
    *assignment = assignment.advance();

    match second {
        Ok(more) => messages.extend(more),
        Err(error) if messages.is_empty() => return Err(error),
        Err(error) => warn!(
            "second poll after assignment failed, keeping {} message(s) from the first: {}",
            messages.len(),
            error
        ),
    }

    Ok(messages)
}

/// Wait up to `timeout` for a first message, then drain whatever is already available,
/// up to `max_records`.
async fn poll(
    consumer: &StreamConsumer<KafkaContext>,
    timeout: Duration,
    max_records: usize,
) -> Result<Vec<RawMessage>, KafkaError> {
    let mut messages = Vec::new();
    let mut wait = timeout;

    while messages.len() < max_records {
        match tokio::time::timeout(wait, consumer.recv()).await {
            Ok(Ok(message)) => messages.push(RawMessage::from(&message)),
            Ok(Err(error)) if messages.is_empty() => return Err(error),
            Ok(Err(error)) => {
                warn!("error while draining kafka messages, returning partial poll: {}", error);
                break;
            }
            Err(_elapsed) => break,
        }
        wait = Duration::ZERO;
    }

    Ok(messages)
}

fn commit_consumed(consumer: &StreamConsumer<KafkaContext>) -> Result<(), KafkaError> {
    match consumer.commit_consumer_state(KafkaCommitMode::Sync) {
        Ok(()) => Ok(()),
        // Nothing consumed since the last commit
        Err(KafkaError::ConsumerCommit(RDKafkaErrorCode::NoOffset)) => Ok(()),
        Err(error) => Err(error),
    }
}
