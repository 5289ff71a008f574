use thiserror::Error;

/// Typed error hierarchy for the scheduled prompt engine.
///
/// Used at module boundaries (model client, job execution, config). Leaf
/// functions use `anyhow::Result`; the `Internal` variant converts via `?`.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("User {0} not found")]
    MissingUser(String),

    #[error("Model {0} not found and no fallback available")]
    ModelResolution(String),

    #[error("API error {status}: {body}")]
    Api { status: u16, body: String },

    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl EngineError {
    /// Whether the failure is job-scoped configuration/data (as opposed to a
    /// transient transport problem).
    pub fn is_data_error(&self) -> bool {
        matches!(
            self,
            Self::Config(_) | Self::MissingUser(_) | Self::ModelResolution(_)
        )
    }
}
