//! Crate level errors.
use std::io;

use thiserror::Error;

use crate::assembly::ImageError;
use crate::compiler::CompileError;
use crate::runtime::RuntimeError;

/// Result type for session level operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// An instruction faulted while executing.
    #[error("runtime error at {0}")]
    Runtime(#[from] RuntimeError),

    #[error("entry point {type_name}::{method} not found")]
    EntryPointNotFound { type_name: String, method: String },

    #[error(transparent)]
    Compile(#[from] CompileError),

    #[error("malformed image: {0}")]
    Image(#[from] ImageError),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}
