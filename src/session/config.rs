//! Session configuration.

use std::time::Duration;

use crate::core::constants::{
    DEFAULT_MAX_OPTION_SIZE, DEFAULT_PEER_PORT, DEFAULT_RACE_TIMEOUT, DEFAULT_RECV_CHUNK_SIZE,
};
use crate::core::error::{TcplsError, TcplsResult};

/// Session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Port given to peer-advertised addresses.
    pub peer_port: u16,

    /// Budget used by `connect_all_default`.
    pub race_timeout: Duration,

    /// Largest accepted variable-length option.
    pub max_option_size: usize,

    /// Bind race sockets to the local primary address of their family.
    pub bind_local_primary: bool,

    /// Bytes read from a path per receive.
    pub recv_chunk_size: usize,

    /// Set TCP_NODELAY on path sockets.
    pub nodelay: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            peer_port: DEFAULT_PEER_PORT,
            race_timeout: DEFAULT_RACE_TIMEOUT,
            max_option_size: DEFAULT_MAX_OPTION_SIZE,
            bind_local_primary: false,
            recv_chunk_size: DEFAULT_RECV_CHUNK_SIZE,
            nodelay: true,
        }
    }
}

impl SessionConfig {
    /// Start a builder from the defaults.
    pub fn builder() -> SessionConfigBuilder {
        SessionConfigBuilder::new()
    }

    /// Reject zero sizes and timeouts.
    pub fn validate(&self) -> TcplsResult<()> {
        if self.race_timeout.is_zero() {
            return Err(TcplsError::Config("race_timeout must be non-zero".into()));
        }
        if self.max_option_size == 0 {
            return Err(TcplsError::Config("max_option_size must be non-zero".into()));
        }
        if self.recv_chunk_size == 0 {
            return Err(TcplsError::Config("recv_chunk_size must be non-zero".into()));
        }
        Ok(())
    }
}

/// Builder for [`SessionConfig`].
#[derive(Debug, Default)]
pub struct SessionConfigBuilder {
    config: SessionConfig,
}

impl SessionConfigBuilder {
    /// Create a builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the port of peer-advertised addresses.
    pub fn peer_port(mut self, port: u16) -> Self {
        self.config.peer_port = port;
        self
    }

    /// Set the default race budget.
    pub fn race_timeout(mut self, timeout: Duration) -> Self {
        self.config.race_timeout = timeout;
        self
    }

    /// Set the largest accepted variable-length option.
    pub fn max_option_size(mut self, size: usize) -> Self {
        self.config.max_option_size = size;
        self
    }

    /// Bind race sockets to the local primary address.
    pub fn bind_local_primary(mut self, enabled: bool) -> Self {
        self.config.bind_local_primary = enabled;
        self
    }

    /// Set the per-read chunk size.
    pub fn recv_chunk_size(mut self, size: usize) -> Self {
        self.config.recv_chunk_size = size;
        self
    }

    /// Enable or disable TCP_NODELAY.
    pub fn nodelay(mut self, enabled: bool) -> Self {
        self.config.nodelay = enabled;
        self
    }

    /// Validate and build the configuration.
    pub fn build(self) -> TcplsResult<SessionConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
