use thiserror::Error;

#[derive(Debug, Error)]
pub enum ThreadloomError {
    // Graph errors
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid plan direction: {0}")]
    InvalidDirection(String),

    #[error("Handle capacity exceeded: {handle} on node {node} accepts at most {capacity} edge(s)")]
    HandleCapacityViolation {
        node: String,
        handle: String,
        capacity: usize,
    },

    #[error("Incompatible handle: {source_kind} cannot connect to {handle}")]
    IncompatibleHandle { source_kind: String, handle: String },

    // Registry errors
    #[error("Node not registered: {0}")]
    NotRegistered(String),

    // Streaming errors
    #[error("Node is already streaming: {0}")]
    SessionBusy(String),

    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Cancelled by user")]
    CancelledByUser,

    #[error("Provider error: {0}")]
    ProviderError(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    // Gateway errors
    #[error("Gateway error: {0}")]
    Gateway(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ThreadloomError {
    /// Stable machine-readable kind, used in wire error payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::InvalidDirection(_) => "invalid_direction",
            Self::HandleCapacityViolation { .. } => "handle_capacity_violation",
            Self::IncompatibleHandle { .. } => "incompatible_handle",
            Self::NotRegistered(_) => "not_registered",
            Self::SessionBusy(_) => "session_busy",
            Self::TransportError(_) => "transport_error",
            Self::CancelledByUser => "cancelled_by_user",
            Self::ProviderError(_) => "provider_error",
            Self::Config(_) | Self::ConfigNotFound(_) => "config",
            Self::Database(_) => "database",
            Self::Gateway(_) => "gateway",
            Self::Io(_) => "io",
            Self::Json(_) => "json",
        }
    }
}

pub type Result<T> = std::result::Result<T, ThreadloomError>;
