use std::path::PathBuf;
use std::str::FromStr;
use std::time;

use envconfig::Envconfig;
use thiserror::Error;

/// Errors raised while resolving configuration, before any connection is attempted.
#[derive(Error, Debug)]
pub enum ConfigurationError {
    #[error(
        "the following environment variables are missing: {}",
        .0.join(", ")
    )]
    MissingVariables(Vec<String>),
    #[error("credential files not found: {}", format_missing_files(.0))]
    CredentialFilesNotFound(Vec<(String, PathBuf)>),
    #[error("{0} has an invalid value")]
    InvalidValue(String),
}

fn format_missing_files(files: &[(String, PathBuf)]) -> String {
    files
        .iter()
        .map(|(variable, path)| format!("{}={}", variable, path.display()))
        .collect::<Vec<_>>()
        .join(", ")
}

impl From<envconfig::Error> for ConfigurationError {
    fn from(error: envconfig::Error) -> Self {
        match error {
            envconfig::Error::EnvVarMissing { name } => {
                ConfigurationError::MissingVariables(vec![name.to_owned()])
            }
            envconfig::Error::ParseError { name } => {
                ConfigurationError::InvalidValue(name.to_owned())
            }
        }
    }
}

/// When consumed offsets are committed back to the broker.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum CommitMode {
    /// `fetch` commits before returning, so records are processed after their offsets are committed.
    OnFetch,
    /// Offsets are committed by the caller once the fetched records are persisted.
    #[default]
    AfterPersist,
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParseCommitModeError(pub String);

impl FromStr for CommitMode {
    type Err = ParseCommitModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "on_fetch" => Ok(CommitMode::OnFetch),
            "after_persist" => Ok(CommitMode::AfterPersist),
            invalid => Err(ParseCommitModeError(invalid.to_owned())),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}

/// Raw broker settings as read from the environment.
///
/// Every value without a default is an `Option` so that all absent inputs can be reported
/// together by [`KafkaEnv::validate`], instead of failing on the first one.
#[derive(Envconfig, Clone, Debug)]
pub struct KafkaEnv {
    #[envconfig(from = "KAFKA_HOST")]
    pub host: Option<String>,

    #[envconfig(from = "KAFKA_PORT")]
    pub port: Option<u16>,

    #[envconfig(from = "KAFKA_KEY_FILE_PATH")]
    pub key_file: Option<PathBuf>,

    #[envconfig(from = "KAFKA_ACCESS_CERT_PATH")]
    pub access_cert_file: Option<PathBuf>,

    #[envconfig(from = "KAFKA_CA_CERT_PATH")]
    pub ca_cert_file: Option<PathBuf>,

    #[envconfig(from = "KAFKA_CLIENT_ID")]
    pub client_id: Option<String>,

    #[envconfig(from = "KAFKA_TOPIC", default = "default")]
    pub topic: String,

    #[envconfig(from = "KAFKA_GROUP_ID", default = "default")]
    pub group_id: String,

    #[envconfig(from = "KAFKA_POLL_TIMEOUT_MS", default = "1000")]
    pub poll_timeout: EnvMsDuration,

    #[envconfig(from = "KAFKA_MAX_POLL_RECORDS", default = "500")]
    pub max_poll_records: usize,

    #[envconfig(from = "KAFKA_TLS", default = "true")]
    pub tls: bool,

    #[envconfig(from = "KAFKA_RAISE_ON_ERROR", default = "false")]
    pub raise_on_error: bool,

    #[envconfig(from = "KAFKA_COMMIT_MODE", default = "after_persist")]
    pub commit_mode: CommitMode,
}

/// Validated broker settings. Holding one means every credential file existed at validation time.
#[derive(Clone, Debug)]
pub struct KafkaConfig {
    pub host: String,
    pub port: u16,
    pub key_file: PathBuf,
    pub access_cert_file: PathBuf,
    pub ca_cert_file: PathBuf,
    pub client_id: String,
    pub topic: String,
    pub group_id: String,
    pub poll_timeout: time::Duration,
    pub max_poll_records: usize,
    pub tls: bool,
    /// Re-raise transport errors to the caller instead of logging them.
    pub raise_on_error: bool,
    pub commit_mode: CommitMode,
}

impl KafkaConfig {
    /// Resolve and validate the broker configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigurationError> {
        KafkaEnv::init_from_env()?.validate()
    }

    pub fn bootstrap_servers(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl KafkaEnv {
    /// Check that every required value is present and that the credential files exist.
    /// Does not touch the network.
    pub fn validate(self) -> Result<KafkaConfig, ConfigurationError> {
        let host = self.host.filter(|host| !host.is_empty());
        let client_id = self.client_id.filter(|id| !id.is_empty());
        let key_file = self.key_file.filter(|path| !path.as_os_str().is_empty());
        let access_cert_file = self
            .access_cert_file
            .filter(|path| !path.as_os_str().is_empty());
        let ca_cert_file = self.ca_cert_file.filter(|path| !path.as_os_str().is_empty());

        let (host, port, key_file, access_cert_file, ca_cert_file, client_id) =
            match (host, self.port, key_file, access_cert_file, ca_cert_file, client_id) {
                (
                    Some(host),
                    Some(port),
                    Some(key_file),
                    Some(access_cert_file),
                    Some(ca_cert_file),
                    Some(client_id),
                ) => (host, port, key_file, access_cert_file, ca_cert_file, client_id),
                (host, port, key_file, access_cert_file, ca_cert_file, client_id) => {
                    let missing = [
                        ("KAFKA_HOST", host.is_none()),
                        ("KAFKA_PORT", port.is_none()),
                        ("KAFKA_KEY_FILE_PATH", key_file.is_none()),
                        ("KAFKA_ACCESS_CERT_PATH", access_cert_file.is_none()),
                        ("KAFKA_CA_CERT_PATH", ca_cert_file.is_none()),
                        ("KAFKA_CLIENT_ID", client_id.is_none()),
                    ]
                    .into_iter()
                    .filter(|(_, absent)| *absent)
                    .map(|(name, _)| name.to_owned())
                    .collect();

                    return Err(ConfigurationError::MissingVariables(missing));
                }
            };

        let missing_files: Vec<(String, PathBuf)> = [
            ("KAFKA_KEY_FILE_PATH", &key_file),
            ("KAFKA_ACCESS_CERT_PATH", &access_cert_file),
            ("KAFKA_CA_CERT_PATH", &ca_cert_file),
        ]
        .into_iter()
        .filter(|(_, path)| !path.is_file())
        .map(|(name, path)| (name.to_owned(), path.clone()))
        .collect();

        if !missing_files.is_empty() {
            return Err(ConfigurationError::CredentialFilesNotFound(missing_files));
        }

        Ok(KafkaConfig {
            host,
            port,
            key_file,
            access_cert_file,
            ca_cert_file,
            client_id,
            topic: self.topic,
            group_id: self.group_id,
            poll_timeout: self.poll_timeout.0,
            max_poll_records: self.max_poll_records,
            tls: self.tls,
            raise_on_error: self.raise_on_error,
            commit_mode: self.commit_mode,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::NamedTempFile;

    struct Credentials {
        key: NamedTempFile,
        access_cert: NamedTempFile,
        ca_cert: NamedTempFile,
    }

    impl Credentials {
        fn new() -> Self {
            Self {
                key: NamedTempFile::new().unwrap(),
                access_cert: NamedTempFile::new().unwrap(),
                ca_cert: NamedTempFile::new().unwrap(),
            }
        }
    }

    fn full_env(credentials: &Credentials) -> HashMap<String, String> {
        let path = |file: &NamedTempFile| file.path().to_string_lossy().into_owned();

        HashMap::from([
            ("KAFKA_HOST".to_owned(), "kafka.internal".to_owned()),
            ("KAFKA_PORT".to_owned(), "9093".to_owned()),
            ("KAFKA_KEY_FILE_PATH".to_owned(), path(&credentials.key)),
            (
                "KAFKA_ACCESS_CERT_PATH".to_owned(),
                path(&credentials.access_cert),
            ),
            ("KAFKA_CA_CERT_PATH".to_owned(), path(&credentials.ca_cert)),
            ("KAFKA_CLIENT_ID".to_owned(), "faker-1".to_owned()),
        ])
    }

    fn resolve(env: &HashMap<String, String>) -> Result<KafkaConfig, ConfigurationError> {
        KafkaEnv::init_from_hashmap(env)?.validate()
    }

    #[test]
    fn test_defaults_are_applied() {
        let credentials = Credentials::new();
        let config = resolve(&full_env(&credentials)).expect("configuration should be valid");

        assert_eq!(config.topic, "default");
        assert_eq!(config.group_id, "default");
        assert_eq!(config.poll_timeout, time::Duration::from_millis(1000));
        assert_eq!(config.max_poll_records, 500);
        assert!(config.tls);
        assert!(!config.raise_on_error);
        assert_eq!(config.commit_mode, CommitMode::AfterPersist);
        assert_eq!(config.bootstrap_servers(), "kafka.internal:9093");
    }

    #[test]
    fn test_one_missing_variable_is_named() {
        let credentials = Credentials::new();
        let mut env = full_env(&credentials);
        env.remove("KAFKA_CLIENT_ID");

        let error = resolve(&env).unwrap_err();

        match &error {
            ConfigurationError::MissingVariables(missing) => {
                assert_eq!(missing, &vec!["KAFKA_CLIENT_ID".to_owned()])
            }
            other => panic!("unexpected error: {}", other),
        }
        assert!(error.to_string().contains("KAFKA_CLIENT_ID"));
    }

    #[test]
    fn test_all_missing_variables_are_enumerated() {
        let error = resolve(&HashMap::new()).unwrap_err();

        assert_eq!(
            error.to_string(),
            "the following environment variables are missing: KAFKA_HOST, KAFKA_PORT, KAFKA_KEY_FILE_PATH, KAFKA_ACCESS_CERT_PATH, \
             KAFKA_CA_CERT_PATH, KAFKA_CLIENT_ID"
        );
    }

    #[test]
    fn test_empty_value_counts_as_missing() {
        let credentials = Credentials::new();
        let mut env = full_env(&credentials);
        env.insert("KAFKA_HOST".to_owned(), "".to_owned());

        match resolve(&env) {
            Err(ConfigurationError::MissingVariables(missing)) => {
                assert_eq!(missing, vec!["KAFKA_HOST".to_owned()])
            }
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_missing_credential_file_is_distinct() {
        let credentials = Credentials::new();
        let mut env = full_env(&credentials);
        env.insert(
            "KAFKA_CA_CERT_PATH".to_owned(),
            "/nonexistent/ca.pem".to_owned(),
        );

        match resolve(&env) {
            Err(ConfigurationError::CredentialFilesNotFound(files)) => {
                assert_eq!(
                    files,
                    vec![(
                        "KAFKA_CA_CERT_PATH".to_owned(),
                        PathBuf::from("/nonexistent/ca.pem")
                    )]
                );
            }
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_invalid_port_is_rejected() {
        let credentials = Credentials::new();
        let mut env = full_env(&credentials);
        env.insert("KAFKA_PORT".to_owned(), "not-a-port".to_owned());

        match resolve(&env) {
            Err(ConfigurationError::InvalidValue(variable)) => assert_eq!(variable, "KAFKA_PORT"),
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_overrides() {
        let credentials = Credentials::new();
        let mut env = full_env(&credentials);
        env.insert("KAFKA_TOPIC".to_owned(), "heartbeats".to_owned());
        env.insert("KAFKA_POLL_TIMEOUT_MS".to_owned(), "250".to_owned());
        env.insert("KAFKA_COMMIT_MODE".to_owned(), "on_fetch".to_owned());
        env.insert("KAFKA_RAISE_ON_ERROR".to_owned(), "true".to_owned());

        let config = resolve(&env).unwrap();

        assert_eq!(config.topic, "heartbeats");
        assert_eq!(config.poll_timeout, time::Duration::from_millis(250));
        assert_eq!(config.commit_mode, CommitMode::OnFetch);
        assert!(config.raise_on_error);
    }

    #[test]
    fn test_parse_commit_mode() {
        assert_eq!(
            CommitMode::from_str("AFTER_PERSIST"),
            Ok(CommitMode::AfterPersist)
        );
        assert_eq!(
            CommitMode::from_str("later"),
            Err(ParseCommitModeError("later".to_owned()))
        );
    }
}
