use argus_common::config::KafkaConfig;
use argus_common::schema::SchemaRegistry;
use argus_faker::generator::HeartbeatGenerator;
use clap::{Parser, Subcommand, ValueEnum};
use eyre::Result;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::info;

#[derive(Parser, Debug)]
#[command(version, about = "Heartbeat ingestion pipelines", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Commands {
    /// Run a pipeline to completion
    Run { module: Module },

    /// Validate a pipeline's configuration without connecting to anything
    Test { module: Module },
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Module {
    /// Consume heartbeats from Kafka and store them in PostgreSQL
    Caterpillar,
    /// Publish generated heartbeats to Kafka
    Faker,
}

impl Cli {
    pub async fn run(self) -> Result<()> {
        match self.command {
            Commands::Run { module } => run(module).await,
            Commands::Test { module } => dry_run(module),
        }
    }
}

async fn run(module: Module) -> Result<()> {
    let kafka_config = KafkaConfig::from_env()?;

    match module {
        Module::Caterpillar => {
            let config = argus_caterpillar::config::Config::from_env()?;
            argus_caterpillar::pipeline::start(config, kafka_config).await?;
        }
        Module::Faker => {
            let config = argus_faker::config::Config::from_env()?;
            argus_faker::faker::start(config, kafka_config).await?;
        }
    }

    Ok(())
}

fn dry_run(module: Module) -> Result<()> {
    let kafka_config = KafkaConfig::from_env()?;
    info!(
        brokers = %kafka_config.bootstrap_servers(),
        topic = %kafka_config.topic,
        "kafka configuration is valid"
    );

    match module {
        Module::Caterpillar => {
            let config = argus_caterpillar::config::Config::from_env()?;
            info!(
                table = %config.table_name,
                ticks = config.ticks,
                "caterpillar configuration is valid"
            );
        }
        Module::Faker => {
            let config = argus_faker::config::Config::from_env()?;
            let mut generator =
                HeartbeatGenerator::new(StdRng::from_entropy(), SchemaRegistry::heartbeat());

            let wire = generator.generate(&config.schema_key)?;
            let decoded = generator.registry().decode(&config.schema_key, &wire)?;
            info!(schema_key = %config.schema_key, "generated record round-trips");
            println!("{}", serde_json::to_string_pretty(&decoded)?);
        }
    }

    Ok(())
}
