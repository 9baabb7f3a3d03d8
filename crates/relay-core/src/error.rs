use thiserror::Error;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Engine timed out after {0} seconds")]
    EngineTimeout(u64),

    #[error("Engine failed: {0}")]
    Engine(String),

    #[error("Tool call denied by permission policy: {0}")]
    EngineDenied(String),

    #[error("Protocol translation error: {0}")]
    ProtocolTranslation(String),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl GatewayError {
    /// OpenAI-style error type tag for the wire body.
    pub fn error_type(&self) -> &'static str {
        match self {
            GatewayError::InvalidRequest(_) => "invalid_request_error",
            GatewayError::EngineTimeout(_) => "timeout_error",
            GatewayError::Engine(_) | GatewayError::Io(_) => "api_error",
            GatewayError::EngineDenied(_) => "permission_error",
            GatewayError::ProtocolTranslation(_) | GatewayError::Json(_) => "translation_error",
        }
    }
}
