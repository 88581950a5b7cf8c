use std::env;
use std::fmt;
use std::fs;
use std::path::Path;

use serde::Deserialize;
use uuid::Uuid;

use crate::logging::LogLevel;

pub const DEFAULT_URI: &str = "tcp://localhost:7419";
pub const DEFAULT_PORT: u16 = 7419;
pub const URI_ENV_VAR: &str = "STOKER_URL";
pub const DEFAULT_CONCURRENCY: usize = 20;
pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 25;
pub const DEFAULT_QUEUE: &str = "default";

#[derive(Debug)]
pub enum ConfigError {
    Io {
        path: String,
        source: std::io::Error,
    },
    TomlParse {
        path: String,
        source: toml::de::Error,
    },
    InvalidUri {
        uri: String,
    },
    InvalidPort {
        uri: String,
    },
    InvalidConcurrency {
        provided: usize,
    },
    InvalidHeartbeatInterval {
        provided_secs: u64,
    },
    MissingWorkerId,
    InvalidLogLevel {
        provided: String,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io { path, source } => {
                write!(f, "failed to read config file '{path}': {source}")
            }
            Self::TomlParse { path, source } => {
                write!(f, "failed to parse TOML config '{path}': {source}")
            }
            Self::InvalidUri { uri } => {
                write!(f, "invalid broker URI '{uri}', expected 'tcp://host:port'")
            }
            Self::InvalidPort { uri } => write!(f, "invalid port in broker URI '{uri}'"),
            Self::InvalidConcurrency { provided } => {
                write!(f, "concurrency must be at least 1, got {provided}")
            }
            Self::InvalidHeartbeatInterval { provided_secs } => write!(
                f,
                "heartbeat interval must be at least 1 second, got {provided_secs}"
            ),
            Self::MissingWorkerId => write!(f, "worker id must be non-empty"),
            Self::InvalidLogLevel { provided } => write!(
                f,
                "invalid logging.level '{provided}'. Allowed values: error, warn, info, debug, trace"
            ),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Resolved broker endpoint. Resolution order: explicit URI, then the
/// `STOKER_URL` environment variable, then `tcp://localhost:7419`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BrokerUri {
    pub host: String,
    pub port: u16,
}

impl BrokerUri {
    pub fn parse(uri: &str) -> Result<Self, ConfigError> {
        let rest = uri.strip_prefix("tcp://").ok_or_else(|| ConfigError::InvalidUri {
            uri: uri.to_owned(),
        })?;

        if rest.is_empty() {
            return Err(ConfigError::InvalidUri {
                uri: uri.to_owned(),
            });
        }

        match rest.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() => {
                let port = port.parse::<u16>().map_err(|_| ConfigError::InvalidPort {
                    uri: uri.to_owned(),
                })?;
                Ok(Self {
                    host: host.to_owned(),
                    port,
                })
            }
            Some(_) => Err(ConfigError::InvalidUri {
                uri: uri.to_owned(),
            }),
            None => Ok(Self {
                host: rest.to_owned(),
                port: DEFAULT_PORT,
            }),
        }
    }

    pub fn resolve(explicit: Option<&str>) -> Result<Self, ConfigError> {
        match explicit {
            Some(uri) => Self::parse(uri),
            None => match env::var(URI_ENV_VAR) {
                Ok(uri) => Self::parse(&uri),
                Err(_) => Self::parse(DEFAULT_URI),
            },
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WorkerConfig {
    pub uri: Option<String>,
    pub worker_id: String,
    pub concurrency: usize,
    pub heartbeat_interval_secs: u64,
    pub queues: Vec<String>,
    pub password: Option<String>,
    pub labels: Vec<String>,
    pub logging: LoggingConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            uri: None,
            worker_id: Uuid::new_v4().to_string(),
            concurrency: DEFAULT_CONCURRENCY,
            heartbeat_interval_secs: DEFAULT_HEARTBEAT_INTERVAL_SECS,
            queues: Vec::new(),
            password: None,
            labels: Vec::new(),
            logging: LoggingConfig::default(),
        }
    }
}

impl WorkerConfig {
    pub fn load_from_toml(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path.as_ref()).map_err(|source| ConfigError::Io {
            path: path.as_ref().to_string_lossy().to_string(),
            source,
        })?;

        let config: Self = toml::from_str(&content).map_err(|source| ConfigError::TomlParse {
            path: path.as_ref().to_string_lossy().to_string(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_id.is_empty() {
            return Err(ConfigError::MissingWorkerId);
        }
        if self.concurrency < 1 {
            return Err(ConfigError::InvalidConcurrency {
                provided: self.concurrency,
            });
        }
        if self.heartbeat_interval_secs < 1 {
            return Err(ConfigError::InvalidHeartbeatInterval {
                provided_secs: self.heartbeat_interval_secs,
            });
        }
        if LogLevel::from_config_value(&self.logging.level).is_none() {
            return Err(ConfigError::InvalidLogLevel {
                provided: self.logging.level.clone(),
            });
        }
        Ok(())
    }

    /// Queue name list used for `FETCH`; an empty list falls back to the
    /// broker's default queue.
    pub fn effective_queues(&self) -> Vec<String> {
        if self.queues.is_empty() {
            vec![DEFAULT_QUEUE.to_owned()]
        } else {
            self.queues.clone()
        }
    }

    pub fn log_level(&self) -> LogLevel {
        LogLevel::from_config_value(&self.logging.level).unwrap_or(LogLevel::Info)
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;

    use super::{
        BrokerUri, ConfigError, WorkerConfig, DEFAULT_CONCURRENCY,
        DEFAULT_HEARTBEAT_INTERVAL_SECS, DEFAULT_PORT,
    };

    fn write_temp_config(content: &str, suffix: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "stoker-config-test-{suffix}-{}.toml",
            std::process::id()
        ));
        fs::write(&path, content).expect("failed to write temp config");
        path
    }

    #[test]
    fn defaults_match_protocol_expectations() {
        let config = WorkerConfig::default();
        assert_eq!(config.concurrency, DEFAULT_CONCURRENCY);
        assert_eq!(config.heartbeat_interval_secs, DEFAULT_HEARTBEAT_INTERVAL_SECS);
        assert!(!config.worker_id.is_empty());
        assert_eq!(config.effective_queues(), vec!["default".to_owned()]);
        config.validate().expect("defaults should validate");
    }

    #[test]
    fn explicit_queues_are_kept_in_order() {
        let config = WorkerConfig {
            queues: vec!["critical".to_owned(), "default".to_owned()],
            ..WorkerConfig::default()
        };
        assert_eq!(
            config.effective_queues(),
            vec!["critical".to_owned(), "default".to_owned()]
        );
    }

    #[test]
    fn rejects_zero_concurrency_and_zero_heartbeat() {
        let config = WorkerConfig {
            concurrency: 0,
            ..WorkerConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidConcurrency { provided: 0 })
        ));

        let config = WorkerConfig {
            heartbeat_interval_secs: 0,
            ..WorkerConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidHeartbeatInterval { provided_secs: 0 })
        ));
    }

    #[test]
    fn rejects_empty_worker_id_and_unknown_log_level() {
        let config = WorkerConfig {
            worker_id: String::new(),
            ..WorkerConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::MissingWorkerId)));

        let mut config = WorkerConfig::default();
        config.logging.level = "loud".to_owned();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidLogLevel { .. })
        ));
    }

    #[test]
    fn parses_tcp_uri_with_and_without_port() {
        let uri = BrokerUri::parse("tcp://broker.internal:7419").expect("uri should parse");
        assert_eq!(uri.host, "broker.internal");
        assert_eq!(uri.port, 7419);
        assert_eq!(uri.address(), "broker.internal:7419");

        let uri = BrokerUri::parse("tcp://localhost").expect("portless uri should parse");
        assert_eq!(uri.port, DEFAULT_PORT);
    }

    #[test]
    fn rejects_non_tcp_scheme_and_bad_port() {
        assert!(matches!(
            BrokerUri::parse("http://localhost:7419"),
            Err(ConfigError::InvalidUri { .. })
        ));
        assert!(matches!(
            BrokerUri::parse("tcp://localhost:notaport"),
            Err(ConfigError::InvalidPort { .. })
        ));
        assert!(matches!(
            BrokerUri::parse("tcp://"),
            Err(ConfigError::InvalidUri { .. })
        ));
    }

    #[test]
    fn explicit_uri_wins_over_fallbacks() {
        let uri = BrokerUri::resolve(Some("tcp://explicit:7420")).expect("uri should resolve");
        assert_eq!(uri.host, "explicit");
        assert_eq!(uri.port, 7420);
    }

    #[test]
    fn loads_config_from_toml() {
        let path = write_temp_config(
            r#"
worker_id = "wrk1"
concurrency = 8
heartbeat_interval_secs = 10
queues = ["critical"]
password = "hunter2"

[logging]
level = "debug"
"#,
            "load",
        );

        let config = WorkerConfig::load_from_toml(&path).expect("config should load");
        fs::remove_file(path).expect("temp config cleanup should succeed");

        assert_eq!(config.worker_id, "wrk1");
        assert_eq!(config.concurrency, 8);
        assert_eq!(config.heartbeat_interval_secs, 10);
        assert_eq!(config.queues, vec!["critical".to_owned()]);
        assert_eq!(config.password.as_deref(), Some("hunter2"));
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn toml_load_rejects_invalid_values() {
        let path = write_temp_config(
            r#"
worker_id = "wrk1"
concurrency = 0
"#,
            "invalid",
        );

        let err = WorkerConfig::load_from_toml(&path).expect_err("zero concurrency should fail");
        fs::remove_file(path).expect("temp config cleanup should succeed");
        assert!(matches!(err, ConfigError::InvalidConcurrency { provided: 0 }));
    }
}
