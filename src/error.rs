//! Error types for gateway assembly and upstream selection.

pub type GatewayResult<T> = Result<T, GatewayError>;

/// Errors raised while loading configuration or assembling the gateway.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("config error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("invalid server address '{address}': {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("server '{address}' has weight {weight}, above the maximum of {max}")]
    InvalidWeight { address: String, weight: u32, max: u32 },

    #[error("route '{route}' references unknown service '{service}'")]
    UnknownService { route: String, service: String },

    #[error("invalid header name '{0}'")]
    InvalidHeader(String),

    #[error("invalid route pattern '{0}'")]
    InvalidPattern(String),

    #[error("pin '{key}' already published as {current}, refusing {requested}")]
    PinConflict {
        key: String,
        current: String,
        requested: String,
    },
}

/// Errors surfaced by a selection rule to the proxy layer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SelectionError {
    /// The routing key has a pinned binding whose server was never published.
    #[error("pinned server for routing key '{key}' is not initialized")]
    UnpublishedPin { key: String },
}
