//! Engine-wide error taxonomy and exit-code mapping.
//!
//! Parse and transport failures keep their own typed errors close to the
//! modules that raise them; this is the umbrella the session controller and
//! CLI harness see.

use std::path::PathBuf;

use crate::core::gateway::ModelError;
use crate::core::plan::ParseError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// A requested root does not exist or is not a directory
    #[error("invalid root {path}: {reason}")]
    InvalidRoot { path: PathBuf, reason: String },

    /// The model client failed; the transport error is opaque pass-through
    #[error("model unavailable: {0}")]
    ModelUnavailable(#[from] ModelError),

    /// The model response did not satisfy the output grammar
    #[error("malformed response: {0}")]
    Malformed(#[from] ParseError),

    /// Referenced files changed after context was gathered; nothing written
    #[error("conflicts detected in {} file(s): {}", paths.len(), format_paths(paths))]
    ConflictDetected { paths: Vec<PathBuf> },

    /// An operation failed mid-apply; all mutations were rolled back
    #[error("operation on {path} failed ({reason}); session rolled back")]
    RolledBack { path: PathBuf, reason: String },

    /// Internal engine failures or unexpected bugs
    #[error("internal error: {0:#}")]
    Internal(#[from] anyhow::Error),
}

fn format_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Exit-code mapping for the CLI harness.
/// 0=success, 2=conflict/rolled back, 3=malformed response, 4=invalid root,
/// 5=internal, 6=model unavailable.
pub fn exit_code_for(e: &EngineError) -> i32 {
    match e {
        EngineError::ConflictDetected { .. } | EngineError::RolledBack { .. } => 2,
        EngineError::Malformed(_) => 3,
        EngineError::InvalidRoot { .. } => 4,
        EngineError::Internal(_) => 5,
        EngineError::ModelUnavailable(_) => 6,
    }
}
