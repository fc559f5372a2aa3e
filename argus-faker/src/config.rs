use argus_common::config::{ConfigurationError, EnvMsDuration};
use envconfig::Envconfig;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(default = "60")]
    pub records: u32,

    #[envconfig(from = "RECORD_INTERVAL_MS", default = "1000")]
    pub record_interval: EnvMsDuration,

    #[envconfig(default = "heartbeat")]
    pub schema_key: String,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigurationError> {
        Self::init_from_env()?.validate()
    }

    /// Reject values that parse but cannot drive the publishing loop.
    pub fn validate(self) -> Result<Self, ConfigurationError> {
        if self.record_interval.0.is_zero() {
            return Err(ConfigurationError::InvalidValue(
                "RECORD_INTERVAL_MS".to_owned(),
            ));
        }

        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::Duration;

    #[test]
    fn test_defaults() {
        let config = Config::init_from_hashmap(&HashMap::new())
            .unwrap()
            .validate()
            .unwrap();

        assert_eq!(config.records, 60);
        assert_eq!(config.record_interval.0, Duration::from_secs(1));
        assert_eq!(config.schema_key, "heartbeat");
    }

    #[test]
    fn test_overrides() {
        let env = HashMap::from([
            ("RECORDS".to_owned(), "3".to_owned()),
            ("RECORD_INTERVAL_MS".to_owned(), "250".to_owned()),
            ("SCHEMA_KEY".to_owned(), "cpu_load".to_owned()),
        ]);

        let config = Config::init_from_hashmap(&env).unwrap();

        assert_eq!(config.records, 3);
        assert_eq!(config.record_interval.0, Duration::from_millis(250));
        assert_eq!(config.schema_key, "cpu_load");
    }

    #[test]
    fn test_zero_interval_is_rejected() {
        let env = HashMap::from([("RECORD_INTERVAL_MS".to_owned(), "0".to_owned())]);

        let error = Config::init_from_hashmap(&env)
            .unwrap()
            .validate()
            .err()
            .expect("a zero interval should be rejected");

        assert!(matches!(error, ConfigurationError::InvalidValue(name) if name == "RECORD_INTERVAL_MS"));
    }

    #[test]
    fn test_invalid_interval() {
        let env = HashMap::from([("RECORD_INTERVAL_MS".to_owned(), "soon".to_owned())]);

        let error: ConfigurationError = Config::init_from_hashmap(&env)
            .err()
            .expect("interval should be rejected")
            .into();

        assert!(matches!(error, ConfigurationError::InvalidValue(name) if name == "RECORD_INTERVAL_MS"));
    }
}
