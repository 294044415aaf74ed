use crate::config::ConfigError;
use crate::scanner::ScanError;
use crate::upstream::UpstreamError;
use thiserror::Error;
use toolguard_core::CodecError;

/// Errors that end a gateway run. Per-message faults never surface here;
/// they become JSON-RPC error responses instead.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Scanner(#[from] ScanError),

    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    #[error("client stream error: {0}")]
    Client(#[from] CodecError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type GatewayResult<T> = Result<T, GatewayError>;
