//! Configuration loading and typed access.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Top-level Finsight configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server: Option<ServerConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub streaming: Option<StreamingConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage: Option<StorageConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub market: Option<MarketConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// Allowed CORS origins. Empty/absent means permissive (dev default).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cors_origins: Option<Vec<String>>,
}

/// Stream tuning. These are deployment-calibrated knobs, not invariants:
/// the queue bound sizes burst capacity (default assumes ~10 concurrent
/// tools emitting ~10 events each), and chunking trades emission
/// granularity against per-frame network overhead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamingConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_queue_size: Option<usize>,

    /// Characters per `token_chunk` frame.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk_size: Option<usize>,

    /// Delay between token frames, in milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk_delay_ms: Option<u64>,

    /// Queue poll timeout for the multiplexer drain loop, in milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub poll_timeout_ms: Option<u64>,

    /// Maximum accepted user-message length, in characters.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_message_len: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
}

/// Substitute `${ENV_VAR}` patterns in a string with their environment variable values.
fn substitute_env_vars(input: &str) -> String {
    let re = regex::Regex::new(r"\$\{([^}]+)\}").unwrap();
    re.replace_all(input, |caps: &regex::Captures| {
        let var_name = &caps[1];
        std::env::var(var_name).unwrap_or_default()
    })
    .into_owned()
}

impl Config {
    /// Load config from a JSON5 file, substituting `${ENV_VAR}` references.
    pub fn load(path: &Path) -> crate::error::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path).map_err(crate::error::FinsightError::Io)?;
        let substituted = substitute_env_vars(&raw);

        let config: Config = json5::from_str(&substituted)
            .map_err(|e| crate::error::FinsightError::Config(e.to_string()))?;

        Ok(config)
    }

    pub fn bind_addr(&self) -> String {
        self.server
            .as_ref()
            .and_then(|s| s.bind.clone())
            .unwrap_or_else(|| "0.0.0.0".to_string())
    }

    pub fn port(&self) -> u16 {
        self.server.as_ref().and_then(|s| s.port).unwrap_or(8710)
    }

    pub fn max_queue_size(&self) -> usize {
        self.streaming
            .as_ref()
            .and_then(|s| s.max_queue_size)
            .unwrap_or(100)
    }

    pub fn chunk_size(&self) -> usize {
        self.streaming
            .as_ref()
            .and_then(|s| s.chunk_size)
            .unwrap_or(10)
            .max(1)
    }

    pub fn chunk_delay_ms(&self) -> u64 {
        self.streaming
            .as_ref()
            .and_then(|s| s.chunk_delay_ms)
            .unwrap_or(20)
    }

    pub fn poll_timeout_ms(&self) -> u64 {
        self.streaming
            .as_ref()
            .and_then(|s| s.poll_timeout_ms)
            .unwrap_or(100)
    }

    pub fn max_message_len(&self) -> usize {
        self.streaming
            .as_ref()
            .and_then(|s| s.max_message_len)
            .unwrap_or(4000)
    }

    pub fn data_dir(&self) -> PathBuf {
        self.storage
            .as_ref()
            .and_then(|s| s.data_dir.as_ref())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(".finsight"))
    }

    pub fn log_level(&self) -> String {
        self.logging
            .as_ref()
            .and_then(|l| l.level.clone())
            .unwrap_or_else(|| "info".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_without_file() {
        let config = Config::load(Path::new("/nonexistent/finsight.json")).unwrap();
        assert_eq!(config.max_queue_size(), 100);
        assert_eq!(config.chunk_size(), 10);
        assert_eq!(config.chunk_delay_ms(), 20);
        assert_eq!(config.poll_timeout_ms(), 100);
        assert_eq!(config.port(), 8710);
    }

    #[test]
    fn test_load_json5_with_comments() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                // stream tuning
                streaming: {{ max_queue_size: 50, chunk_size: 4 }},
                server: {{ port: 9000 }},
            }}"#
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.max_queue_size(), 50);
        assert_eq!(config.chunk_size(), 4);
        assert_eq!(config.port(), 9000);
    }

    #[test]
    fn test_env_var_substitution() {
        unsafe { std::env::set_var("FINSIGHT_TEST_DIR", "/tmp/fs-test") };
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ storage: {{ data_dir: "${{FINSIGHT_TEST_DIR}}" }} }}"#).unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.data_dir(), PathBuf::from("/tmp/fs-test"));
    }

    #[test]
    fn test_chunk_size_floor() {
        let config = Config {
            streaming: Some(StreamingConfig {
                max_queue_size: None,
                chunk_size: Some(0),
                chunk_delay_ms: None,
                poll_timeout_ms: None,
                max_message_len: None,
            }),
            ..Default::default()
        };
        assert_eq!(config.chunk_size(), 1);
    }
}
