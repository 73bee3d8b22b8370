use glam::IVec3;

/// Failure of a generation or meshing delegate. The affected block steps
/// back to its previous state and is retried on a later frame.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GenerationError {
    #[error("generator failed: {0}")]
    Failed(String),
    #[error("delegate panicked: {0}")]
    Panicked(String),
    #[error("generator returned a {actual} grid, expected {expected}")]
    WrongDimensions { expected: IVec3, actual: IVec3 },
}

impl GenerationError {
    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed(reason.into())
    }

    pub(crate) fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        Self::Panicked(message)
    }
}
