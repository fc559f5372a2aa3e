use std::ops::AddAssign;
use std::time::{Duration, Instant};

use argus_common::config::{CommitMode, KafkaConfig};
use argus_common::kafka::{KafkaConnection, KafkaConnectionError};
use argus_common::kafka_messages::RawMessage;
use argus_common::metrics::{serve, setup_metrics_router};
use argus_common::schema::SchemaRegistry;
use async_trait::async_trait;
use metrics::histogram;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::config::Config;
use crate::conform::{ConformanceStage, ConformedRecord};
use crate::error::CaterpillarError;
use crate::sink::PersistenceSink;

/// Where the pipeline gets its messages from.
#[async_trait]
pub trait MessageSource: Send {
    async fn fetch(&mut self) -> Result<Vec<RawMessage>, KafkaConnectionError>;
    fn commit(&mut self) -> Result<(), KafkaConnectionError>;
    fn commit_mode(&self) -> CommitMode;
}

/// Where conformed records end up. Returns how many of them were stored.
#[async_trait]
pub trait RecordSink: Send + Sync {
    async fn persist(&self, batch: &[ConformedRecord]) -> usize;
}

#[async_trait]
impl MessageSource for KafkaConnection {
    async fn fetch(&mut self) -> Result<Vec<RawMessage>, KafkaConnectionError> {
        KafkaConnection::fetch(self).await
    }

    fn commit(&mut self) -> Result<(), KafkaConnectionError> {
        KafkaConnection::commit(self)
    }

    fn commit_mode(&self) -> CommitMode {
        KafkaConnection::commit_mode(self)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    pub fetched: usize,
    pub conformed: usize,
    pub persisted: usize,
}

impl AddAssign for TickReport {
    fn add_assign(&mut self, other: Self) {
        self.fetched += other.fetched;
        self.conformed += other.conformed;
        self.persisted += other.persisted;
    }
}

/// Fetch, conform and persist, one batch per tick.
pub struct Pipeline<S, K> {
    source: S,
    stage: ConformanceStage,
    sink: K,
}

impl<S: MessageSource, K: RecordSink> Pipeline<S, K> {
    pub fn new(source: S, stage: ConformanceStage, sink: K) -> Self {
        Self {
            source,
            stage,
            sink,
        }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn sink(&self) -> &K {
        &self.sink
    }

    /// Run one fetch, conform, persist cycle.
    ///
    /// In [`CommitMode::AfterPersist`] offsets are only committed once every conformed record
    /// of the batch was stored. If the sink stored fewer, the tick fails without committing,
    /// so the batch is redelivered when the consumer group resumes.
    pub async fn tick(&mut self) -> Result<TickReport, CaterpillarError> {
        let started = Instant::now();

        let messages = self.source.fetch().await?;
        info!("finds {} result(s)", messages.len());

        let records = self.stage.conform(&messages);
        let persisted = if records.is_empty() {
            0
        } else {
            self.sink.persist(&records).await
        };

        histogram!("argus_tick_duration_seconds").record(started.elapsed().as_secs_f64());

        if !messages.is_empty() && self.source.commit_mode() == CommitMode::AfterPersist {
            if persisted < records.len() {
                error!(
                    persisted,
                    conformed = records.len(),
                    first_offset = messages[0].offset,
                    "batch was not fully persisted, leaving its offsets uncommitted"
                );
                return Err(CaterpillarError::IncompleteBatch {
                    persisted,
                    conformed: records.len(),
                });
            }
            self.source.commit()?;
        }

        Ok(TickReport {
            fetched: messages.len(),
            conformed: records.len(),
            persisted,
        })
    }

    /// Run `ticks` cycles, starting one every `interval`. A cycle that overruns the
    /// interval delays the next one instead of bunching them up.
    pub async fn run(&mut self, ticks: u32, interval: Duration) -> Result<TickReport, CaterpillarError> {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut total = TickReport::default();
        for tick in 1..=ticks {
            ticker.tick().await;
            let report = self.tick().await?;
            debug!(
                tick,
                fetched = report.fetched,
                conformed = report.conformed,
                persisted = report.persisted,
                "tick complete"
            );
            total += report;
        }

        Ok(total)
    }
}

/// Wire the caterpillar from its configuration and run it to completion.
pub async fn start(config: Config, kafka_config: KafkaConfig) -> Result<TickReport, CaterpillarError> {
    if let Some(bind) = config.metrics_bind.clone() {
        let router = setup_metrics_router()?;
        tokio::spawn(async move {
            if let Err(e) = serve(router, &bind).await {
                error!("failed to start metrics server, {}", e);
            }
        });
    }

    let mut connection = KafkaConnection::new(kafka_config);
    connection.start_consumer()?;

    let sink = PersistenceSink::new(
        config.table_name.clone(),
        &config.database_url,
        config.max_pg_connections,
    )
    .await?;
    sink.ensure_schema().await?;

    let stage = ConformanceStage::new(SchemaRegistry::heartbeat());
    let mut pipeline = Pipeline::new(connection, stage, sink);

    info!(
        ticks = config.ticks,
        interval_ms = config.tick_interval.0.as_millis() as u64,
        "caterpillar started"
    );
    let report = pipeline.run(config.ticks, config.tick_interval.0).await?;
    info!(
        fetched = report.fetched,
        conformed = report.conformed,
        persisted = report.persisted,
        "caterpillar finished"
    );

    Ok(report)
}
