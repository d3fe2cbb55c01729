//! Engine error types

use crate::module::ModuleId;
use thiserror::Error;

/// Engine error
///
/// Wiring mistakes are reported here. Failures of individual requests are
/// never errors; they travel back to the caller inside the request.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Error from the shared layer
    #[error(transparent)]
    Common(#[from] tresor_common::Error),

    /// Module registered twice
    #[error("module {0} is already registered")]
    DuplicateModule(ModuleId),

    /// Request routed to or from a module that is not registered
    #[error("module {0} is not registered")]
    UnknownModule(ModuleId),
}

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;
