use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{AppError, AppResult};

fn default_queue_size() -> usize {
    100
}

/// Server configuration.
///
/// `addr` and `header_bytes` are required; everything else has a default.
/// A config can be built in code with [`ServerConfig::new`] or loaded from a
/// file with [`ServerConfig::from_file`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// TCP address to listen on.
    pub addr: String,
    /// Size of request headers in bytes. Must be greater than zero.
    pub header_bytes: usize,
    /// Capacity of the per-session outgoing queue.
    #[serde(default = "default_queue_size")]
    pub out_queue_size: usize,
    /// Capacity of the per-session internal-message queue.
    #[serde(default = "default_queue_size")]
    pub ipc_queue_size: usize,
    /// Maximum duration of a single header or body read, in milliseconds.
    #[serde(default)]
    pub read_timeout_ms: Option<u64>,
    /// Maximum duration of a single outbound write, in milliseconds.
    #[serde(default)]
    pub write_timeout_ms: Option<u64>,
    /// Upper bound on handler-reported body lengths.
    #[serde(default)]
    pub max_body_size: Option<usize>,
}

impl ServerConfig {
    pub fn new(addr: impl Into<String>, header_bytes: usize) -> ServerConfig {
        ServerConfig {
            addr: addr.into(),
            header_bytes,
            out_queue_size: default_queue_size(),
            ipc_queue_size: default_queue_size(),
            read_timeout_ms: None,
            write_timeout_ms: None,
            max_body_size: None,
        }
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> AppResult<ServerConfig> {
        let path_str = path
            .as_ref()
            .to_str()
            .ok_or_else(|| {
                AppError::InvalidConfig(format!(
                    "config file path: {}",
                    path.as_ref().to_string_lossy()
                ))
            })?;
        let source = config::Config::builder()
            .add_source(config::File::with_name(path_str))
            .build()?;
        Ok(source.try_deserialize()?)
    }

    pub(crate) fn validate(&self) -> AppResult<()> {
        if self.addr.is_empty() {
            return Err(AppError::InvalidConfig("listen address is not set".into()));
        }
        if self.header_bytes == 0 {
            return Err(AppError::InvalidConfig(
                "header_bytes must be greater than zero".into(),
            ));
        }
        if self.out_queue_size == 0 || self.ipc_queue_size == 0 {
            return Err(AppError::InvalidConfig(
                "queue capacities must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        self.read_timeout_ms.map(Duration::from_millis)
    }

    pub fn write_timeout(&self) -> Option<Duration> {
        self.write_timeout_ms.map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn config_file_fills_defaults() -> AppResult<()> {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile()?;
        writeln!(file, "addr = \"127.0.0.1:9090\"")?;
        writeln!(file, "header_bytes = 4")?;
        writeln!(file, "read_timeout_ms = 250")?;

        let config = ServerConfig::from_file(file.path())?;
        assert_eq!(config.addr, "127.0.0.1:9090");
        assert_eq!(config.header_bytes, 4);
        assert_eq!(config.out_queue_size, 100);
        assert_eq!(config.ipc_queue_size, 100);
        assert_eq!(config.read_timeout(), Some(Duration::from_millis(250)));
        assert_eq!(config.write_timeout(), None);
        assert_eq!(config.max_body_size, None);
        Ok(())
    }

    #[test]
    fn validate_rejects_missing_required_fields() {
        assert!(ServerConfig::new("", 4).validate().is_err());
        assert!(ServerConfig::new("127.0.0.1:0", 0).validate().is_err());

        let mut config = ServerConfig::new("127.0.0.1:0", 4);
        config.out_queue_size = 0;
        assert!(config.validate().is_err());

        assert!(ServerConfig::new("127.0.0.1:0", 4).validate().is_ok());
    }
}
