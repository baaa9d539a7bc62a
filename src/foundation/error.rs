/// Convenience result type used across tilefract.
pub type FractResult<T> = Result<T, FractError>;

/// Top-level error taxonomy.
///
/// Configuration errors are raised before any device work begins. Device errors and fence
/// timeouts are unrecoverable for the current run: callers abort and never write a partial image.
#[derive(thiserror::Error, Debug)]
pub enum FractError {
    /// Invalid user-provided configuration (untileable canvas, unavailable lane topology, ...).
    #[error("configuration error: {0}")]
    Config(String),

    /// A submission, allocation, mapping or fence operation failed on the device.
    #[error("device error: {0}")]
    Device(String),

    /// A fence did not signal within the configured bound; the device is treated as hung.
    #[error("fence timeout: {0}")]
    Timeout(String),

    /// Out-of-order pipeline transition or misuse of a command buffer lifecycle.
    #[error("pipeline state error: {0}")]
    State(String),

    /// The raster sink failed to persist the image.
    #[error("encode error: {0}")]
    Encode(String),

    /// Wrapped lower-level error from dependencies or IO.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl FractError {
    /// Build a [`FractError::Config`] value.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Build a [`FractError::Device`] value.
    pub fn device(msg: impl Into<String>) -> Self {
        Self::Device(msg.into())
    }

    /// Build a [`FractError::Timeout`] value.
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Build a [`FractError::State`] value.
    pub fn state(msg: impl Into<String>) -> Self {
        Self::State(msg.into())
    }

    /// Build a [`FractError::Encode`] value.
    pub fn encode(msg: impl Into<String>) -> Self {
        Self::Encode(msg.into())
    }

    /// True for errors detected before any device work (safe to report as a usage problem).
    pub fn is_config(&self) -> bool {
        matches!(self, Self::Config(_))
    }
}

#[cfg(test)]
#[path = "../../tests/unit/foundation/error.rs"]
mod tests;
