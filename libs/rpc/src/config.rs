//! Messenger Configuration
//!
//! Named, independently defaulted options for building a messenger. Values can
//! come from code, from a TOML file, or from `RPC_*` environment variables.

use crate::{Result, RpcError};
use config_crate::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

/// Runtime configuration for a messenger and its reactors
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MessengerConfig {
    /// Messenger identity, used in thread names and log fields
    pub name: String,
    /// Number of reactor threads
    pub num_reactors: usize,
    /// Idle server connections are closed after this long; 0 disables the scan
    pub connection_keepalive_ms: u64,
    /// Housekeeping tick of every reactor
    pub coarse_timer_granularity_ms: u64,
    /// Threads backing the shared scheduler
    pub io_thread_pool_size: usize,
    /// Parallel connections kept per remote endpoint
    pub num_connections_to_server: usize,
    /// Outbound connect timeout
    pub connect_timeout_ms: u64,
    /// Largest accepted frame, header included
    pub max_frame_size: usize,
    /// Initial read buffer capacity per connection
    pub read_buffer_size: usize,
    /// Bind outbound sockets to the first concrete listen address of the same family
    pub bind_outbound_to_listen_address: bool,
}

impl Default for MessengerConfig {
    fn default() -> Self {
        Self {
            name: "messenger".to_string(),
            num_reactors: crate::DEFAULT_NUM_REACTORS,
            connection_keepalive_ms: crate::DEFAULT_KEEPALIVE_MS,
            coarse_timer_granularity_ms: 100,
            io_thread_pool_size: 4,
            num_connections_to_server: crate::DEFAULT_CONNECTIONS_TO_SERVER,
            connect_timeout_ms: 15_000,
            max_frame_size: 16 * 1024 * 1024, // 16MB
            read_buffer_size: 64 * 1024,      // 64KB
            bind_outbound_to_listen_address: true,
        }
    }
}

impl MessengerConfig {
    /// Create defaults with the given messenger name
    pub fn with_name(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Load configuration from an optional TOML file with `RPC_*` overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();

        if let Some(path) = path {
            info!("Loading messenger config: {:?}", path);
            builder = builder.add_source(File::from(path).required(true));
        }

        // RPC_NUM_REACTORS=8 overrides num_reactors
        builder = builder.add_source(Environment::with_prefix("RPC").try_parsing(true));

        let config: Self = builder.build()?.try_deserialize()?;
        config.validate()?;
        debug!(?config, "Messenger configuration loaded");
        Ok(config)
    }

    /// Parse configuration from an inline TOML document
    pub fn from_toml_str(toml: &str) -> Result<Self> {
        let config: Self = Config::builder()
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the runtime cannot operate with
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(RpcError::invalid_argument(
                "Messenger name must not be empty",
                Some("name"),
            ));
        }
        if self.num_reactors == 0 {
            return Err(RpcError::invalid_argument(
                "At least one reactor is required",
                Some("num_reactors"),
            ));
        }
        if self.io_thread_pool_size == 0 {
            return Err(RpcError::invalid_argument(
                "IO thread pool needs at least one thread",
                Some("io_thread_pool_size"),
            ));
        }
        if self.num_connections_to_server == 0 {
            return Err(RpcError::invalid_argument(
                "num_connections_to_server must be positive",
                Some("num_connections_to_server"),
            ));
        }
        if self.coarse_timer_granularity_ms == 0 {
            return Err(RpcError::invalid_argument(
                "Coarse timer granularity must be positive",
                Some("coarse_timer_granularity_ms"),
            ));
        }
        if self.max_frame_size < crate::frame::MIN_FRAME_SIZE {
            return Err(RpcError::invalid_argument(
                format!(
                    "max_frame_size {} is below the minimum {}",
                    self.max_frame_size,
                    crate::frame::MIN_FRAME_SIZE
                ),
                Some("max_frame_size"),
            ));
        }
        Ok(())
    }

    pub fn connection_keepalive(&self) -> Duration {
        Duration::from_millis(self.connection_keepalive_ms)
    }

    pub fn coarse_timer_granularity(&self) -> Duration {
        Duration::from_millis(self.coarse_timer_granularity_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}
