use thiserror::Error;

/// Main error type for the orchestrator
#[derive(Error, Debug)]
pub enum ConductorError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // State store errors
    #[error("State store error: {0}")]
    StateStore(String),

    // Queue errors
    #[error("Queue rejected task: orchestrator is shutting down")]
    ShuttingDown,

    #[error("Unknown symbol: {0}")]
    UnknownSymbol(String),

    // Engine collaborator errors
    #[error("Engine cycle failed: {0}")]
    EngineCycle(String),

    #[error("Training job failed: {job} - {reason}")]
    TrainFailed { job: String, reason: String },

    // Risk management errors
    #[error("Risk limit exceeded: {0}")]
    RiskLimitExceeded(String),

    #[error("Circuit breaker active: {0}")]
    CircuitBreakerActive(String),

    // Lifecycle errors
    #[error("Invalid state transition: from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Kill switch engaged")]
    KillSwitchEngaged,

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Result type alias for ConductorError
pub type Result<T> = std::result::Result<T, ConductorError>;

/// Specific error types for risk gating
#[derive(Error, Debug, Clone)]
pub enum RiskError {
    #[error("Global exposure cap exceeded: limit ${limit}, requested ${requested}")]
    GlobalCapExceeded {
        limit: rust_decimal::Decimal,
        requested: rust_decimal::Decimal,
    },

    #[error("Symbol exposure cap exceeded for {symbol}: headroom ${headroom}")]
    SymbolCapExceeded {
        symbol: String,
        headroom: rust_decimal::Decimal,
    },

    #[error("Panic condition: {0}")]
    Panic(String),

    #[error("Drawdown halt: {reason}, cooldown until {until}")]
    DrawdownHalt { reason: String, until: String },
}

impl From<RiskError> for ConductorError {
    fn from(err: RiskError) -> Self {
        ConductorError::RiskLimitExceeded(err.to_string())
    }
}
