// carbond-config - Daemon configuration
//
// A TOML file with one section per component, kebab-case keys, and
// defaults matching a conventional Graphite host layout. The config is
// validated as a whole before any of it is applied, so a bad reload never
// half-lands.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct Config {
    pub common: CommonConfig,
    pub whisper: WhisperConfig,
    pub cache: CacheConfig,
    pub udp: UdpConfig,
    pub tcp: TcpConfig,
    pub pickle: PickleConfig,
    pub carbonlink: CarbonlinkConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", default)]
pub struct CommonConfig {
    /// Run-as user for `--daemon`; empty keeps the invoking user.
    pub user: String,
    /// Log destination for `--daemon`; empty logs to stderr.
    pub logfile: String,
    pub log_level: String,
    pub log_format: LogFormat,
    /// `{host}` expands to the local hostname with dots flattened.
    pub graph_prefix: String,
    /// Runtime worker threads; 0 lets the runtime decide.
    pub max_cpu: usize,
}

impl Default for CommonConfig {
    fn default() -> Self {
        Self {
            user: String::new(),
            logfile: String::new(),
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
            graph_prefix: "carbon.agents.{host}.".to_string(),
            max_cpu: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", default)]
pub struct WhisperConfig {
    pub data_dir: PathBuf,
    pub schemas_file: PathBuf,
    /// Empty uses the built-in `(average, 0.5)` default for everything.
    pub aggregation_file: String,
    pub workers: usize,
    pub max_updates_per_second: u64,
    pub enabled: bool,
}

impl Default for WhisperConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/data/graphite/whisper/"),
            schemas_file: PathBuf::from("/data/graphite/schemas"),
            aggregation_file: String::new(),
            workers: 1,
            max_updates_per_second: 0,
            enabled: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", default)]
pub struct CacheConfig {
    pub max_size: usize,
    pub input_buffer: usize,
    pub output_buffer: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size: 1_000_000,
            input_buffer: 51200,
            output_buffer: 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", default)]
pub struct UdpConfig {
    pub listen: String,
    pub enabled: bool,
    pub log_incomplete: bool,
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:2003".to_string(),
            enabled: true,
            log_incomplete: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", default)]
pub struct TcpConfig {
    pub listen: String,
    pub enabled: bool,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:2003".to_string(),
            enabled: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", default)]
pub struct PickleConfig {
    pub listen: String,
    pub enabled: bool,
}

impl Default for PickleConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:2004".to_string(),
            enabled: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", default)]
pub struct CarbonlinkConfig {
    pub listen: String,
    pub enabled: bool,
    pub read_timeout_secs: u64,
    pub query_timeout_ms: u64,
}

impl Default for CarbonlinkConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:7002".to_string(),
            enabled: true,
            read_timeout_secs: 30,
            query_timeout_ms: 100,
        }
    }
}

impl CarbonlinkConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }
}

impl Config {
    /// Load from a file, or fall back to defaults with no path given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            None => Ok(Self::default()),
            Some(path) => {
                let content = std::fs::read_to_string(path)
                    .with_context(|| format!("can't read config file {}", path.display()))?;
                toml::from_str(&content)
                    .with_context(|| format!("can't parse config file {}", path.display()))
            }
        }
    }

    /// The `--config-print-default` output.
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).context("can't serialize config")
    }

    /// Check everything before anything is applied.
    pub fn validate(&self) -> Result<()> {
        match self.common.log_level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            other => bail!("unknown log-level {other:?}"),
        }

        if self.whisper.enabled {
            if self.whisper.data_dir.as_os_str().is_empty() {
                bail!("whisper.data-dir must be set when whisper is enabled");
            }
            if self.whisper.schemas_file.as_os_str().is_empty() {
                bail!("whisper.schemas-file must be set when whisper is enabled");
            }
            if self.whisper.workers == 0 {
                bail!("whisper.workers must be at least 1");
            }
        }

        if self.cache.input_buffer == 0 || self.cache.output_buffer == 0 {
            bail!("cache buffers must be non-zero");
        }

        for (name, listen, enabled) in [
            ("udp", &self.udp.listen, self.udp.enabled),
            ("tcp", &self.tcp.listen, self.tcp.enabled),
            ("pickle", &self.pickle.listen, self.pickle.enabled),
            ("carbonlink", &self.carbonlink.listen, self.carbonlink.enabled),
        ] {
            if enabled {
                listen
                    .parse::<SocketAddr>()
                    .with_context(|| format!("bad {name}.listen address {listen:?}"))?;
            }
        }

        Ok(())
    }

    pub fn udp_addr(&self) -> Result<SocketAddr> {
        Ok(self.udp.listen.parse()?)
    }

    pub fn tcp_addr(&self) -> Result<SocketAddr> {
        Ok(self.tcp.listen.parse()?)
    }

    pub fn pickle_addr(&self) -> Result<SocketAddr> {
        Ok(self.pickle.listen.parse()?)
    }

    pub fn carbonlink_addr(&self) -> Result<SocketAddr> {
        Ok(self.carbonlink.listen.parse()?)
    }
}
