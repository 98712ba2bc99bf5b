//! Engine configuration.
//!
//! One [`Config`] value is passed to every proxy and daemon; there is no
//! process-wide mutable configuration. Defaults can be overridden from
//! `PYRO_*` environment variables with [`Config::from_env`].

use std::str::FromStr;
use std::time::Duration;

use crate::protocol::error::{PyroError, Result};
use crate::protocol::message::{WireOptions, DEFAULT_MAX_MESSAGE_SIZE};
use crate::serializer::JsonSerializer;

/// Which transport server a daemon runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ServerType {
    /// One pooled worker thread per connection
    #[default]
    Thread,
    /// A single thread multiplexing all connections
    Multiplex,
}

impl FromStr for ServerType {
    type Err = PyroError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "thread" => Ok(ServerType::Thread),
            "multiplex" => Ok(ServerType::Multiplex),
            other => Err(PyroError::Configuration(format!("invalid server type: {}", other))),
        }
    }
}

/// Engine configuration.
///
/// # Default Configuration
///
/// - `host`: `localhost`
/// - `comm_timeout`: none (block indefinitely)
/// - `max_message_size`: 100 MiB
/// - `compression`: off
/// - `serializer`: json (2)
/// - `max_retries`: 0
/// - `server_type`: thread
/// - `threadpool_size` / `threadpool_size_min`: 80 / 4
/// - `worker_idle_timeout`: 5 seconds
/// - `poll_timeout`: 2 seconds
/// - `iter_streaming`: on
/// - `iter_stream_lifetime`: unlimited
/// - `iter_stream_linger`: 30 seconds
/// - `detailed_traceback`: off
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use pyro_common::Config;
///
/// let config = Config::default()
///     .with_comm_timeout(Some(Duration::from_secs(5)))
///     .with_max_retries(2);
/// assert_eq!(config.max_retries, 2);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Host a daemon binds to when none is given
    pub host: String,
    /// Socket read/write timeout
    pub comm_timeout: Option<Duration>,
    /// Maximum payload plus annotations size
    pub max_message_size: usize,
    /// Compress large payloads
    pub compression: bool,
    /// Serializer id used by proxies
    pub serializer: u8,
    /// Re-attempts of a call after a dropped connection or timeout
    pub max_retries: u32,
    pub server_type: ServerType,
    /// Hard cap on thread-pool workers
    pub threadpool_size: usize,
    /// Idle worker floor of the thread pool
    pub threadpool_size_min: usize,
    /// How long a surplus idle worker waits before retiring
    pub worker_idle_timeout: Duration,
    /// Housekeeping interval of both servers
    pub poll_timeout: Duration,
    /// Return iterator results as item streams
    pub iter_streaming: bool,
    /// Absolute lifetime of an item stream, `None` for unlimited
    pub iter_stream_lifetime: Option<Duration>,
    /// How long an item stream survives its disconnected client; zero drops it at once
    pub iter_stream_linger: Duration,
    /// Add a native backtrace to remote exception tracebacks
    pub detailed_traceback: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            comm_timeout: None,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            compression: false,
            serializer: JsonSerializer::ID,
            max_retries: 0,
            server_type: ServerType::Thread,
            threadpool_size: 80,
            threadpool_size_min: 4,
            worker_idle_timeout: Duration::from_secs(5),
            poll_timeout: Duration::from_secs(2),
            iter_streaming: true,
            iter_stream_lifetime: None,
            iter_stream_linger: Duration::from_secs(30),
            detailed_traceback: false,
        }
    }
}

impl Config {
    /// Defaults overridden by `PYRO_*` environment variables.
    ///
    /// Durations are given in (fractional) seconds. For `PYRO_COMMTIMEOUT`
    /// and `PYRO_ITER_STREAM_LIFETIME` zero means unlimited.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` if a variable holds an unparsable value.
    pub fn from_env() -> Result<Self> {
        Self::from_vars(std::env::vars())
    }

    /// Same as [`from_env`](Self::from_env) over an explicit variable list.
    pub fn from_vars<I, K, V>(vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut config = Config::default();
        for (key, value) in vars {
            let Some(name) = key.as_ref().strip_prefix("PYRO_") else {
                continue;
            };
            let value = value.as_ref().trim();
            match name {
                "HOST" => config.host = value.to_string(),
                "COMMTIMEOUT" => config.comm_timeout = optional_seconds(name, value)?,
                "MAX_MESSAGE_SIZE" => config.max_message_size = parse(name, value)?,
                "COMPRESSION" => config.compression = boolean(name, value)?,
                "SERIALIZER" => {
                    config.serializer = match value.to_ascii_lowercase().as_str() {
                        "json" => JsonSerializer::ID,
                        other => parse(name, other)?,
                    }
                }
                "MAX_RETRIES" => config.max_retries = parse(name, value)?,
                "SERVERTYPE" => config.server_type = value.parse()?,
                "THREADPOOL_SIZE" => config.threadpool_size = parse(name, value)?,
                "THREADPOOL_SIZE_MIN" => config.threadpool_size_min = parse(name, value)?,
                "POLLTIMEOUT" => config.poll_timeout = seconds(name, value)?,
                "ITER_STREAMING" => config.iter_streaming = boolean(name, value)?,
                "ITER_STREAM_LIFETIME" => config.iter_stream_lifetime = optional_seconds(name, value)?,
                "ITER_STREAM_LINGER" => config.iter_stream_linger = seconds(name, value)?,
                "DETAILED_TRACEBACK" => config.detailed_traceback = boolean(name, value)?,
                _ => tracing::debug!(variable = key.as_ref(), "Ignoring unknown PYRO_ variable"),
            }
        }
        config.validate()?;
        Ok(config)
    }

    /// Checks cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        if self.threadpool_size == 0 {
            return Err(PyroError::Configuration("threadpool size must be at least 1".into()));
        }
        if self.threadpool_size_min > self.threadpool_size {
            return Err(PyroError::Configuration(format!(
                "threadpool minimum {} exceeds maximum {}",
                self.threadpool_size_min, self.threadpool_size
            )));
        }
        if self.poll_timeout.is_zero() {
            return Err(PyroError::Configuration("poll timeout must be positive".into()));
        }
        Ok(())
    }

    /// Codec options derived from this configuration.
    pub fn wire(&self) -> WireOptions {
        WireOptions {
            max_message_size: self.max_message_size,
            compression: self.compression,
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_comm_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.comm_timeout = timeout;
        self
    }

    pub fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    pub fn with_compression(mut self, compression: bool) -> Self {
        self.compression = compression;
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_server_type(mut self, server_type: ServerType) -> Self {
        self.server_type = server_type;
        self
    }

    pub fn with_threadpool(mut self, min: usize, max: usize) -> Self {
        self.threadpool_size_min = min;
        self.threadpool_size = max;
        self
    }

    pub fn with_worker_idle_timeout(mut self, timeout: Duration) -> Self {
        self.worker_idle_timeout = timeout;
        self
    }

    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    pub fn with_iter_streaming(mut self, enabled: bool) -> Self {
        self.iter_streaming = enabled;
        self
    }

    pub fn with_iter_stream_lifetime(mut self, lifetime: Option<Duration>) -> Self {
        self.iter_stream_lifetime = lifetime;
        self
    }

    pub fn with_iter_stream_linger(mut self, linger: Duration) -> Self {
        self.iter_stream_linger = linger;
        self
    }

    pub fn with_detailed_traceback(mut self, detailed: bool) -> Self {
        self.detailed_traceback = detailed;
        self
    }
}

fn parse<T: FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| PyroError::Configuration(format!("invalid value for PYRO_{}: {:?}", name, value)))
}

fn boolean(name: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(PyroError::Configuration(format!(
            "invalid boolean for PYRO_{}: {:?}",
            name, value
        ))),
    }
}

fn seconds(name: &str, value: &str) -> Result<Duration> {
    let secs: f64 = parse(name, value)?;
    Duration::try_from_secs_f64(secs).map_err(|_| {
        PyroError::Configuration(format!("invalid duration for PYRO_{}: {:?}", name, value))
    })
}

fn optional_seconds(name: &str, value: &str) -> Result<Option<Duration>> {
    let duration = seconds(name, value)?;
    Ok(if duration.is_zero() { None } else { Some(duration) })
}
