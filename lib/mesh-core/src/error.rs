use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoreError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error("Instance already registered for service {service} at {address}:{port}")]
    DuplicateAddress {
        service: String,
        address: String,
        port: u16,
    },

    #[error("Unknown instance {instance_id} for service {service}")]
    UnknownInstance { service: String, instance_id: String },

    #[error("No healthy instance available for service: {0}")]
    NoHealthyInstance(String),

    #[error("No route matched {host}{path}")]
    NoRouteMatched { host: String, path: String },

    #[error("Upstream unavailable for service {service} after {attempts} attempts")]
    UpstreamUnavailable { service: String, attempts: u32 },

    #[error("Request deadline exceeded after {attempts} attempts")]
    Timeout { attempts: u32 },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Request body exceeds {limit} bytes")]
    PayloadTooLarge { limit: usize },

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// HTTP status surfaced to the caller for this error
    pub fn status_code(&self) -> u16 {
        match self {
            CoreError::DuplicateAddress { .. } => 409,
            CoreError::UnknownInstance { .. } => 404,
            CoreError::NoHealthyInstance(_) => 503,
            CoreError::NoRouteMatched { .. } => 404,
            CoreError::UpstreamUnavailable { .. } => 502,
            CoreError::Timeout { .. } => 504,
            CoreError::InvalidRequest(_) => 400,
            CoreError::PayloadTooLarge { .. } => 413,
            CoreError::InvalidConfiguration(_) => 400,
            CoreError::Internal(_) => 500,
        }
    }

    /// Short machine-readable kind, used as a metrics label and in events
    pub fn kind(&self) -> &'static str {
        match self {
            CoreError::DuplicateAddress { .. } => "duplicate_address",
            CoreError::UnknownInstance { .. } => "unknown_instance",
            CoreError::NoHealthyInstance(_) => "no_healthy_instance",
            CoreError::NoRouteMatched { .. } => "no_route_matched",
            CoreError::UpstreamUnavailable { .. } => "upstream_unavailable",
            CoreError::Timeout { .. } => "timeout",
            CoreError::InvalidRequest(_) => "invalid_request",
            CoreError::PayloadTooLarge { .. } => "payload_too_large",
            CoreError::InvalidConfiguration(_) => "invalid_configuration",
            CoreError::Internal(_) => "internal",
        }
    }
}
