use serde::Deserialize;
use std::convert::TryFrom;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{ReactorError, ReactorResult};
use crate::net::{ListenOptions, TriggerMode};

/// Configuration for the server.
///
/// Can be initialized from environment variables with the "SPARROW_" prefix
/// or from a `config` file in the working directory.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Listen address. Defaults to "0.0.0.0".
    #[serde(default = "default_host")]
    pub host: String,
    /// Listen port. Defaults to 1316.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Readiness trigger mode, 0-3. Defaults to 3 (all edge-triggered).
    #[serde(default)]
    pub trig_mode: TriggerMode,
    /// Idle connection timeout in milliseconds; 0 disables eviction.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Linger on close until pending data is sent.
    #[serde(default)]
    pub opt_linger: bool,
    #[serde(default = "default_backlog")]
    pub backlog: i32,
    /// Number of worker threads. Defaults to the CPU count.
    #[serde(default = "default_threads")]
    pub threads: usize,
    /// Connections beyond this count are turned away.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Directory static resources are served from.
    #[serde(default = "default_src_dir")]
    pub src_dir: PathBuf,
    /// Size of the credential connection pool.
    #[serde(default = "default_db_pool_size")]
    pub db_pool_size: usize,
    /// How long a worker waits for a pooled connection, in milliseconds.
    #[serde(default = "default_db_wait_ms")]
    pub db_wait_ms: u64,
    #[serde(default = "default_open_log")]
    pub open_log: bool,
    /// One of "trace", "debug", "info", "warn", "error", "off".
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// Capacity of the async log queue; 0 writes synchronously.
    #[serde(default = "default_log_queue_size")]
    pub log_queue_size: usize,
}

/// Implements conversion from the config crate's Config type to ServerConfig.
impl TryFrom<config::Config> for ServerConfig {
    type Error = config::ConfigError;

    fn try_from(config: config::Config) -> Result<Self, Self::Error> {
        config.try_deserialize()
    }
}

impl ServerConfig {
    /// Creates a new ServerConfig instance from environment variables and config file.
    ///
    /// This method will:
    /// 1. Load environment variables from a .env file if present
    /// 2. Load configuration from a "config" file (if it exists)
    /// 3. Override with environment variables prefixed with "SPARROW_"
    ///
    /// # Errors
    /// Returns a ConfigError if configuration loading or parsing fails.
    pub fn new() -> Result<Self, config::ConfigError> {
        dotenv::dotenv().ok();

        let builder = config::Config::builder()
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::with_prefix("SPARROW"));

        builder.build()?.try_into()
    }

    /// Resolves `host:port` into a socket address.
    pub fn addr(&self) -> ReactorResult<SocketAddr> {
        let target = format!("{}:{}", self.host, self.port);
        target
            .to_socket_addrs()
            .map_err(|e| ReactorError::Address(format!("{}: {}", target, e)))?
            .next()
            .ok_or(ReactorError::Address(target))
    }

    /// The idle timeout, or `None` when eviction is disabled.
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_ms > 0).then(|| Duration::from_millis(self.timeout_ms))
    }

    pub fn db_wait(&self) -> Duration {
        Duration::from_millis(self.db_wait_ms)
    }

    pub fn listen_options(&self) -> ListenOptions {
        ListenOptions {
            backlog: self.backlog,
            linger: self.opt_linger,
        }
    }

    /// The configured log level, falling back to `Info` when unparseable.
    pub fn log_level(&self) -> log::LevelFilter {
        log::LevelFilter::from_str(&self.log_level).unwrap_or(log::LevelFilter::Info)
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    1316
}

fn default_timeout_ms() -> u64 {
    60_000
}

fn default_backlog() -> i32 {
    128
}

/// Default worker count. Returns the CPU count.
fn default_threads() -> usize {
    num_cpus::get()
}

fn default_max_connections() -> usize {
    65_536
}

fn default_src_dir() -> PathBuf {
    PathBuf::from("./resources")
}

fn default_db_pool_size() -> usize {
    12
}

fn default_db_wait_ms() -> u64 {
    1_000
}

fn default_open_log() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("./log")
}

fn default_log_queue_size() -> usize {
    1024
}

/// Provides default values for all configuration options.
impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            trig_mode: TriggerMode::default(),
            timeout_ms: default_timeout_ms(),
            opt_linger: false,
            backlog: default_backlog(),
            threads: default_threads(),
            max_connections: default_max_connections(),
            src_dir: default_src_dir(),
            db_pool_size: default_db_pool_size(),
            db_wait_ms: default_db_wait_ms(),
            open_log: default_open_log(),
            log_level: default_log_level(),
            log_dir: default_log_dir(),
            log_queue_size: default_log_queue_size(),
        }
    }
}
