//! Central error taxonomy.
//!
//! Leaf layers (`ssh_driver`, `provider`) return their own narrow error
//! enums. The Convergence Engine and Lifecycle Controller classify those
//! into `FleetError` via `From` impls so every caller upstream of them
//! matches on one small set of kinds instead of reaching into driver- or
//! adapter-specific detail.

use thiserror::Error;

use crate::provider::ProviderError;
use crate::ssh_driver::DriverError;

#[derive(Debug, Error)]
pub enum FleetError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("verification failed: {0:?}")]
    VerificationMismatch(Vec<String>),

    #[error("provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("no capacity available")]
    NoCapacity,

    #[error("fatal configuration error: {0}")]
    FatalConfig(String),
}

impl From<DriverError> for FleetError {
    fn from(e: DriverError) -> Self {
        match e {
            DriverError::HostKeyMismatch { .. } => {
                FleetError::AuthenticationFailed(e.to_string())
            }
            DriverError::AuthFailed(_) => FleetError::AuthenticationFailed(e.to_string()),
            DriverError::Connect(_)
            | DriverError::Timeout
            | DriverError::Exec(_)
            | DriverError::Io(_) => FleetError::Transport(e.to_string()),
        }
    }
}

impl From<ProviderError> for FleetError {
    fn from(e: ProviderError) -> Self {
        match e {
            ProviderError::NotReady | ProviderError::Timeout | ProviderError::NoIpv4 => {
                FleetError::ProviderUnavailable(e.to_string())
            }
            ProviderError::Unauthorized => FleetError::AuthenticationFailed(e.to_string()),
            ProviderError::Http(_) | ProviderError::Decode(_) => {
                FleetError::ProviderUnavailable(e.to_string())
            }
        }
    }
}

/// Whether a `FleetError` should be retried by a background loop (pool
/// maintainer, sweeper) rather than surfaced immediately as a terminal
/// node error.
impl FleetError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FleetError::Transport(_) | FleetError::ProviderUnavailable(_)
        )
    }
}
