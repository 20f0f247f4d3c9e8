//! Error taxonomy shared by every crate in the workspace

use std::any::Any;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::path::PathBuf;

use thiserror::Error;

/// Remediation printed alongside out-of-memory failures
pub const OOM_HINTS: &str = "Try lowering the image size, the batch size or the number of cutouts. \
The CLIP variant also has a large impact on memory: RN50 uses the least, ViT-B/32 is the best trade-off.";

#[derive(Error, Debug)]
pub enum CgdError {
    /// Rejected before any model is touched
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Input not found: {}", .0.display())]
    MissingInput(PathBuf),

    #[error("Out of memory during {stage}: {message}\n{OOM_HINTS}")]
    OutOfMemory { stage: &'static str, message: String },

    #[error("Tensor data error: {0}")]
    Tensor(String),
}

impl CgdError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn is_out_of_memory(&self) -> bool {
        matches!(self, Self::OutOfMemory { .. })
    }
}

impl From<burn::tensor::DataError> for CgdError {
    fn from(err: burn::tensor::DataError) -> Self {
        Self::Tensor(format!("{err:?}"))
    }
}

pub type Result<T> = std::result::Result<T, CgdError>;

/// Extract the message carried by a panic payload
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Whether a backend failure message describes device memory exhaustion
///
/// Backends report allocation failures as panics with driver-specific
/// wording, so this matches the known spellings case-insensitively.
pub fn is_oom_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("out of memory")
        || lower.contains("out_of_memory")
        || lower.contains("outofmemory")
        || lower.contains("failed to allocate")
        || lower.contains("allocation failed")
}

/// Run `f`, turning a backend out-of-memory panic into
/// [`CgdError::OutOfMemory`] tagged with `stage`
///
/// Any other panic is re-raised unchanged.
pub fn catch_oom<T>(stage: &'static str, f: impl FnOnce() -> Result<T>) -> Result<T> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            if is_oom_message(&message) {
                tracing::warn!(stage, "out of memory");
                Err(CgdError::OutOfMemory { stage, message })
            } else {
                resume_unwind(payload)
            }
        }
    }
}
