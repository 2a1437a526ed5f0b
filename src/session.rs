//! Glue between the compiler driver, the assembly reader and the runtime.
use std::path::Path;

use tempfile::TempDir;
use tracing::{debug, info};

use crate::assembly::Assembly;
use crate::compiler::{self, Image};
use crate::error::{Error, Result};
use crate::runtime::{Config, Outcome, Runtime};
use crate::trace::TraceSink;

/// A loaded assembly ready to run methods from.
#[derive(Debug)]
pub struct Session {
    assembly: Assembly,
    // Keeps compiler output alive while the session exists.
    _scratch: Option<TempDir>,
}

impl Session {
    /// Compile (if needed) and load `path`.
    pub fn open(path: &Path) -> Result<Session> {
        info!(path = %path.display(), "loading");
        let image = compiler::compile(path)?;
        Session::from_image(image)
    }

    pub fn from_image(image: Image) -> Result<Session> {
        let assembly = Assembly::parse(image.bytes)?;
        Ok(Session {
            assembly,
            _scratch: image.scratch,
        })
    }

    pub fn assembly(&self) -> &Assembly {
        &self.assembly
    }

    /// Run `namespace.class::method`. An empty namespace names a type in
    /// the global namespace.
    pub fn run(
        &self,
        namespace: &str,
        class: &str,
        method: &str,
        config: Config,
        sink: &mut dyn TraceSink,
    ) -> Result<Outcome> {
        let type_name = qualified_name(namespace, class);
        let mut runtime = Runtime::new(&self.assembly, config);
        let result = runtime.invoke(&type_name, method, sink);
        if let Err(Error::EntryPointNotFound { .. }) = &result {
            if let Ok(types) = self.assembly.type_names() {
                debug!("types in assembly: {}", types.join(", "));
            }
        }
        let outcome = result?;
        info!(
            termination = %outcome.termination,
            executed = outcome.executed,
            "{type_name}::{method} finished"
        );
        Ok(outcome)
    }
}

pub fn qualified_name(namespace: &str, class: &str) -> String {
    if namespace.is_empty() {
        class.to_string()
    } else {
        format!("{namespace}.{class}")
    }
}
