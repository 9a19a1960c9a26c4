use axum::http::StatusCode;
use thiserror::Error;

/// Error kinds surfaced to API clients. Anything not covered by a named
/// kind travels as `Internal` and maps to a 500.
#[derive(Debug, Error)]
pub enum DeployError {
    #[error("image unavailable: {0}")]
    ImageUnavailable(String),

    #[error("container never reported healthy: {0}")]
    Unhealthy(String),

    #[error("another operation is in progress for {0}")]
    ScopeBusy(String),

    #[error("no slot in deployed state to promote")]
    NoPromotableSlot,

    #[error("no grace slot to roll back to")]
    NothingToRollBack,

    #[error("grace slot failed its health gate: {0}")]
    GraceUnhealthy(String),

    #[error("proxy reload failed: {0}")]
    ProxyReloadFailed(String),

    #[error("no free port left in the {0} range")]
    PortsExhausted(String),

    #[error("registry corrupt: {0}")]
    RegistryCorrupt(String),

    #[error("invalid parameters: {0}")]
    InvalidParams(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl DeployError {
    /// Stable machine-readable code included in API error responses.
    pub fn kind(&self) -> &'static str {
        match self {
            DeployError::ImageUnavailable(_) => "image_unavailable",
            DeployError::Unhealthy(_) => "unhealthy",
            DeployError::ScopeBusy(_) => "scope_busy",
            DeployError::NoPromotableSlot => "no_promotable_slot",
            DeployError::NothingToRollBack => "nothing_to_roll_back",
            DeployError::GraceUnhealthy(_) => "grace_unhealthy",
            DeployError::ProxyReloadFailed(_) => "proxy_reload_failed",
            DeployError::PortsExhausted(_) => "ports_exhausted",
            DeployError::RegistryCorrupt(_) => "registry_corrupt",
            DeployError::InvalidParams(_) => "invalid_params",
            DeployError::Internal(_) => "internal_error",
        }
    }

    /// Client errors and failed preconditions are 4xx; proxy and registry
    /// failures are the server's problem.
    pub fn status(&self) -> StatusCode {
        match self {
            DeployError::InvalidParams(_) => StatusCode::BAD_REQUEST,
            DeployError::ImageUnavailable(_) | DeployError::Unhealthy(_) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            DeployError::ScopeBusy(_)
            | DeployError::NoPromotableSlot
            | DeployError::NothingToRollBack
            | DeployError::GraceUnhealthy(_)
            | DeployError::PortsExhausted(_) => StatusCode::CONFLICT,
            DeployError::ProxyReloadFailed(_) => StatusCode::BAD_GATEWAY,
            DeployError::RegistryCorrupt(_) | DeployError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

pub type DeployResult<T> = Result<T, DeployError>;
