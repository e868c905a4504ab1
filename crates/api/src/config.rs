//! Server configuration, loadable from YAML.
//!
//! ```yaml
//! addr: 127.0.0.1:8080
//! read_timeout: 30s
//! write_timeout: 1m 30s
//! max_body_size: 1048576
//! strict_slash: true
//! error_handler:
//!   kind: problem-details
//!   type_prefix: https://errors.example.com/
//!   include_timestamp: true
//! openapi:
//!   title: Bookshop
//! ```

use crate::context::Limits;
use crate::cors::CorsConfig;
use crate::error::{ErrorMode, ProblemConfig};
use crate::openapi::OpenApiConfig;
use serde::{Deserialize, Deserializer};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

const DEFAULT_LIMIT: usize = 32 << 20;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] serde_yaml::Error),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TlsConfig {
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
}

/// How errors are rendered when no custom handler is installed.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ErrorHandlerConfig {
    #[default]
    Default,
    ProblemDetails(ProblemConfig),
}

impl ErrorHandlerConfig {
    pub(crate) fn mode(&self) -> ErrorMode {
        match self {
            ErrorHandlerConfig::Default => ErrorMode::Standard,
            ErrorHandlerConfig::ProblemDetails(config) => ErrorMode::ProblemDetails(config.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    pub addr: SocketAddr,
    /// Replaces the port of `addr` when set.
    pub port: Option<u16>,
    #[serde(deserialize_with = "deserialize_duration")]
    pub read_timeout: Option<Duration>,
    #[serde(deserialize_with = "deserialize_duration")]
    pub write_timeout: Option<Duration>,
    #[serde(deserialize_with = "deserialize_duration")]
    pub idle_timeout: Option<Duration>,
    pub max_body_size: usize,
    pub max_multipart_memory: usize,
    pub cors: Option<CorsConfig>,
    pub tls: Option<TlsConfig>,
    pub strict_slash: bool,
    pub openapi: OpenApiConfig,
    pub error_handler: ErrorHandlerConfig,
    /// A `tracing` filter level; when set the server installs a fmt subscriber.
    pub log_level: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            port: None,
            read_timeout: None,
            write_timeout: None,
            idle_timeout: None,
            max_body_size: DEFAULT_LIMIT,
            max_multipart_memory: DEFAULT_LIMIT,
            cors: None,
            tls: None,
            strict_slash: false,
            openapi: OpenApiConfig::default(),
            error_handler: ErrorHandlerConfig::default(),
            log_level: None,
        }
    }
}

impl Config {
    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text =
            std::fs::read_to_string(path).map_err(|source| ConfigError::Read { path: path.to_owned(), source })?;
        Self::from_yaml_str(&text)
    }

    /// The address to listen on, with `port` applied.
    pub fn socket_addr(&self) -> SocketAddr {
        let mut addr = self.addr;
        if let Some(port) = self.port {
            addr.set_port(port);
        }
        addr
    }

    pub fn limits(&self) -> Limits {
        Limits { max_body_size: self.max_body_size, max_multipart_memory: self.max_multipart_memory }
    }
}

/// Parses a config duration such as `30s`, `1m 30s` or `250ms`.
pub fn parse_duration(text: &str) -> Result<Duration, String> {
    humantime::parse_duration(text.trim())
        .map_err(|e| format!("invalid duration `{text}`: {e}, expected e.g. 30s or 1m 30s"))
}

fn deserialize_duration<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    let text: Option<String> = Option::deserialize(deserializer)?;
    text.map(|text| parse_duration(&text)).transpose().map_err(serde::de::Error::custom)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_defaults() {
        let config = Config::from_yaml_str("{}").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.socket_addr().port(), 8080);
        assert_eq!(config.limits().max_multipart_memory, 32 * 1024 * 1024);
    }

    #[test]
    fn test_full_yaml() {
        let config = Config::from_yaml_str(
            r#"
addr: 127.0.0.1:3000
port: 4000
read_timeout: 30s
write_timeout: 1m30s
max_body_size: 1024
strict_slash: true
cors:
  allowed_origins: [https://app.example.com]
tls:
  cert_file: cert.pem
  key_file: key.pem
error_handler:
  kind: problem-details
  type_prefix: https://errors.example.com/
  include_timestamp: true
  custom_fields:
    api_version: v1
openapi:
  title: Bookshop
  redoc_path: null
log_level: debug
"#,
        )
        .unwrap();

        assert_eq!(config.socket_addr(), "127.0.0.1:4000".parse().unwrap());
        assert_eq!(config.read_timeout, Some(Duration::from_secs(30)));
        assert_eq!(config.write_timeout, Some(Duration::from_secs(90)));
        assert_eq!(config.limits().max_body_size, 1024);
        assert!(config.strict_slash);
        assert_eq!(config.cors.unwrap().allowed_origins, ["https://app.example.com"]);
        assert_eq!(config.tls.unwrap().key_file, PathBuf::from("key.pem"));
        assert_eq!(config.openapi.title, "Bookshop");
        assert_eq!(config.openapi.redoc_path, None);
        assert_eq!(config.openapi.docs_path.as_deref(), Some("/docs"));

        let ErrorHandlerConfig::ProblemDetails(problem) = config.error_handler else {
            panic!("expected problem details");
        };
        assert_eq!(problem.type_prefix, "https://errors.example.com/");
        assert!(problem.include_timestamp);
        assert_eq!(problem.custom_fields["api_version"], json!("v1"));
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("250ms"), Ok(Duration::from_millis(250)));
        assert_eq!(parse_duration("1m30s"), Ok(Duration::from_secs(90)));
        assert_eq!(parse_duration("1h 15m"), Ok(Duration::from_secs(4500)));
        assert!(parse_duration("").is_err());
        assert!(parse_duration("1.5h").is_err());
    }

    #[test]
    fn test_invalid_duration() {
        let err = Config::from_yaml_str("idle_timeout: soon").unwrap_err();
        assert!(err.to_string().contains("invalid duration"));
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(Config::from_yaml_file("/nonexistent/micro-api.yaml"), Err(ConfigError::Read { .. })));
    }
}
