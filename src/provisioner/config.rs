//! HTTP server configuration

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use thiserror::Error;

/// 16 GiB; large enough for a full SD card image
const DEFAULT_MAX_UPLOAD_MIB: u64 = 16 * 1024;

/// Configuration for the provisioning API server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: SocketAddr,

    /// Answer cross-origin requests from any origin
    pub enable_cors: bool,

    /// Wrap the router in a request trace layer
    pub enable_request_logging: bool,

    /// Largest accepted template upload in MiB
    pub max_upload_mib: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::from(([0, 0, 0, 0], 8080)),
            enable_cors: true,
            enable_request_logging: true,
            max_upload_mib: DEFAULT_MAX_UPLOAD_MIB,
        }
    }
}

impl ServerConfig {
    /// Default settings listening on `addr`
    pub fn listening_on(addr: &str) -> Result<Self, ConfigError> {
        let bind_address = addr
            .parse()
            .map_err(|_| ConfigError::InvalidAddress(addr.to_string()))?;
        Ok(Self {
            bind_address,
            ..Self::default()
        })
    }

    /// Upload limit in bytes
    pub fn max_upload_bytes(&self) -> usize {
        usize::try_from(self.max_upload_mib.saturating_mul(1024 * 1024)).unwrap_or(usize::MAX)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_upload_mib == 0 {
            return Err(ConfigError::UploadLimit);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    #[error("invalid bind address: {0}")]
    InvalidAddress(String),

    #[error("max_upload_mib must be at least 1")]
    UploadLimit,
}
