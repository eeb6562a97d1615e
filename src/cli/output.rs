//! CLI output: error mapping from engine errors to the CLI surface.

use crate::error::EngineError;

/// Map engine errors to a string for CLI output.
pub fn map_error(e: &EngineError) -> String {
    match e {
        EngineError::InterruptRejected(reason) => format!("Interrupt rejected: {}", reason),
        EngineError::StorageError(inner) => format!("Storage problem: {}", inner),
        other => other.to_string(),
    }
}
