use thiserror::Error;

/// All errors produced by sortline-core.
#[derive(Debug, Error)]
pub enum SortlineError {
    #[error("buffer allocation failed for shape {shape:?}: {reason}")]
    AllocationFailed { shape: Vec<usize>, reason: String },

    #[error("model load failed: {0}")]
    ModelLoadFailed(String),

    #[error("inference failed: {0}")]
    InferenceFailed(String),
}

impl SortlineError {
    pub(crate) fn allocation(shape: &[usize], reason: impl Into<String>) -> Self {
        Self::AllocationFailed {
            shape: shape.to_vec(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, SortlineError>;
