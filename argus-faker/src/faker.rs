use argus_common::config::KafkaConfig;
use argus_common::kafka::KafkaConnection;
use argus_common::schema::SchemaRegistry;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

use crate::config::Config;
use crate::error::FakerError;
use crate::generator::HeartbeatGenerator;

/// Publishes generated records at a fixed pace.
pub struct Faker<R> {
    config: Config,
    connection: KafkaConnection,
    generator: HeartbeatGenerator<R>,
}

impl<R: Rng + Send> Faker<R> {
    pub fn new(config: Config, connection: KafkaConnection, generator: HeartbeatGenerator<R>) -> Self {
        Self {
            config,
            connection,
            generator,
        }
    }

    /// Publish `records` records, one per `record_interval`. A record that fails to publish
    /// is logged and skipped. Returns the number of records the broker acknowledged.
    pub async fn run(&mut self) -> Result<u32, FakerError> {
        self.connection.start_producer()?;

        let mut ticker = tokio::time::interval(self.config.record_interval.0);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut published = 0;
        for record in 1..=self.config.records {
            ticker.tick().await;
            info!(record, "generating a fake record to send to kafka");

            let payload = self.generator.generate(&self.config.schema_key)?;
            match self.connection.send(&self.config.schema_key, payload).await {
                Ok(()) => published += 1,
                Err(e) => error!(record, "record not published, continuing: {}", e),
            }
        }

        info!(
            published,
            records = self.config.records,
            cpu_count = self.generator.cpu_count(),
            "faker finished"
        );
        Ok(published)
    }
}

/// Wire the faker from its configuration and run it to completion.
pub async fn start(config: Config, kafka_config: KafkaConfig) -> Result<u32, FakerError> {
    let generator = HeartbeatGenerator::new(StdRng::from_entropy(), SchemaRegistry::heartbeat());
    info!(
        cpu_count = generator.cpu_count(),
        schema_key = %config.schema_key,
        "faker started"
    );

    let mut faker = Faker::new(config, KafkaConnection::new(kafka_config), generator);
    faker.run().await
}
