//! Fatal session errors.

use thiserror::Error;

/// Errors that end the session with no recovery path. Placement rejections
/// are not errors (see `CreateVerdict`); these indicate malformed input,
/// unknown identifiers or a broken transport.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("unknown vm type index {0}")]
    UnknownVmType(usize),
    #[error("unknown placement group {0}")]
    UnknownPlacementGroup(u32),
    #[error("unknown vm {0}")]
    UnknownVm(u32),
    #[error("malformed request: {0}")]
    MalformedRequest(String),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
