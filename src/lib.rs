//! ristretto: an interpreter for CIL method bodies.
//!
//! Assemblies are loaded by [`session::Session`], which finds a method by
//! type and name and hands its body to the [`runtime::Runtime`].
pub mod assembly;
pub mod bytecode;
pub mod compiler;
pub mod error;
pub mod metadata;
pub mod profiler;
pub mod runtime;
pub mod session;
pub mod trace;
pub mod value;

pub use error::{Error, Result};
pub use runtime::{Config, Outcome, Runtime, Termination};
pub use session::Session;
pub use value::Value;
