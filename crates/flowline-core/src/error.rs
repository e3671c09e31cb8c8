use thiserror::Error;

#[derive(Debug, Error)]
pub enum FlowlineError {
    // Composition errors
    #[error("Invalid workflow: {0}")]
    InvalidWorkflow(String),

    #[error("Router '{router}' selected '{selected}', which is not one of its declared choices")]
    UnknownRoute { router: String, selected: String },

    // Unit errors
    #[error("Step failed: {0}")]
    Step(String),

    #[error("Collaborator {name} failed: {message}")]
    Collaborator { name: String, message: String },

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Storage errors
    #[error("Storage error: {0}")]
    Storage(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl FlowlineError {
    /// Whether this error is a composition fault rather than a unit failure.
    pub fn is_engine_fault(&self) -> bool {
        matches!(
            self,
            FlowlineError::InvalidWorkflow(_) | FlowlineError::UnknownRoute { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, FlowlineError>;
