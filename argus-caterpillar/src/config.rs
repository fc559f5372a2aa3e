use std::fmt;
use std::str::FromStr;

use argus_common::config::{ConfigurationError, EnvMsDuration};
use envconfig::Envconfig;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "POSTGRES_URL")]
    pub database_url: String,

    #[envconfig(from = "HEARTBEAT_TABLE", default = "heartbeat")]
    pub table_name: TableName,

    #[envconfig(default = "1")]
    pub max_pg_connections: u32,

    #[envconfig(default = "45")]
    pub ticks: u32,

    #[envconfig(from = "TICK_INTERVAL_MS", default = "1000")]
    pub tick_interval: EnvMsDuration,

    pub metrics_bind: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigurationError> {
        Self::init_from_env()?.validate()
    }

    /// Reject values that parse but cannot drive the pipeline.
    pub fn validate(self) -> Result<Self, ConfigurationError> {
        if self.tick_interval.0.is_zero() {
            return Err(ConfigurationError::InvalidValue(
                "TICK_INTERVAL_MS".to_owned(),
            ));
        }

        Ok(self)
    }
}

/// A table name that is safe to interpolate, quoted, into SQL statements.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableName(String);

impl TableName {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct InvalidTableNameError(pub String);

impl FromStr for TableName {
    type Err = InvalidTableNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let valid = !s.is_empty()
            && s.len() <= 48
            && s.starts_with(|c: char| c.is_ascii_lowercase() || c == '_')
            && s
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');

        if valid {
            Ok(TableName(s.to_owned()))
        } else {
            Err(InvalidTableNameError(s.to_owned()))
        }
    }
}
