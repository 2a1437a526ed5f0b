//! Drives the external C# toolchain to turn sources into an assembly image.
//!
//! Prebuilt `.dll`/`.exe` files are read as they are. Single `.cs` files go
//! through `csc`, project files through `dotnet build`. Build output lands
//! in a scratch directory that lives as long as the returned [`Image`].
use std::env;
use std::ffi::OsString;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::OnceLock;

use regex::Regex;
use tempfile::TempDir;
use thiserror::Error;
use tracing::{debug, info};

/// Kind of input accepted by [`compile`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Input {
    /// Prebuilt assembly.
    Assembly,
    /// Single C# source file.
    Source,
    /// MSBuild project.
    Project,
}

impl Input {
    pub fn classify(path: &Path) -> Option<Input> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "dll" | "exe" => Some(Input::Assembly),
            "cs" => Some(Input::Source),
            "csproj" => Some(Input::Project),
            _ => None,
        }
    }
}

/// One compiler diagnostic, `path(line,col): error CODE: message`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub path: String,
    pub line: u32,
    pub column: u32,
    pub severity: String,
    pub code: String,
    pub message: String,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}({},{}): {} {}: {}",
            self.path, self.line, self.column, self.severity, self.code, self.message
        )
    }
}

#[derive(Debug, Error)]
pub enum CompileError {
    #[error("{tool} failed with {} error(s)", count_errors(.diagnostics))]
    CompileFailure {
        tool: String,
        diagnostics: Vec<Diagnostic>,
        output: String,
    },
    #[error("unsupported input {0}, expected .dll, .exe, .cs or .csproj")]
    UnsupportedInput(PathBuf),
    #[error("cannot run {tool}: {source}")]
    Spawn {
        tool: String,
        #[source]
        source: io::Error,
    },
    #[error("build produced no output at {0}")]
    MissingOutput(PathBuf),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("bad diagnostics pattern: {0}")]
    Pattern(#[from] regex::Error),
}

impl CompileError {
    /// Lines to show after the summary of a failed build: each parsed
    /// diagnostic, or the raw tool output when nothing could be parsed.
    pub fn details(&self) -> Vec<String> {
        match self {
            CompileError::CompileFailure {
                diagnostics,
                output,
                ..
            } if diagnostics.is_empty() => output
                .lines()
                .map(str::trim_end)
                .filter(|line| !line.is_empty())
                .map(str::to_string)
                .collect(),
            CompileError::CompileFailure { diagnostics, .. } => {
                diagnostics.iter().map(Diagnostic::to_string).collect()
            }
            _ => Vec::new(),
        }
    }
}

fn count_errors(diagnostics: &[Diagnostic]) -> usize {
    diagnostics.iter().filter(|d| d.severity == "error").count()
}

/// Commands used to build sources.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Toolchain {
    pub csc: OsString,
    pub dotnet: OsString,
}

impl Toolchain {
    /// `csc` and `dotnet` from `PATH`, overridable with `RISTRETTO_CSC`
    /// and `RISTRETTO_DOTNET`.
    pub fn from_env() -> Self {
        Self {
            csc: env::var_os("RISTRETTO_CSC").unwrap_or_else(|| "csc".into()),
            dotnet: env::var_os("RISTRETTO_DOTNET").unwrap_or_else(|| "dotnet".into()),
        }
    }
}

impl Default for Toolchain {
    fn default() -> Self {
        Self::from_env()
    }
}

/// Assembly bytes, plus the scratch directory they were built in.
#[derive(Debug)]
pub struct Image {
    pub bytes: Vec<u8>,
    pub scratch: Option<TempDir>,
}

/// Compile `path` with the default toolchain.
pub fn compile(path: &Path) -> Result<Image, CompileError> {
    compile_with(&Toolchain::from_env(), path)
}

pub fn compile_with(toolchain: &Toolchain, path: &Path) -> Result<Image, CompileError> {
    let input =
        Input::classify(path).ok_or_else(|| CompileError::UnsupportedInput(path.to_path_buf()))?;
    match input {
        Input::Assembly => {
            debug!(path = %path.display(), "reading prebuilt assembly");
            Ok(Image {
                bytes: fs::read(path)?,
                scratch: None,
            })
        }
        Input::Source => {
            let scratch = tempfile::tempdir()?;
            let stem = path.file_stem().unwrap_or_else(|| "out".as_ref());
            let out = scratch.path().join(stem).with_extension("dll");
            let mut out_arg = OsString::from("-out:");
            out_arg.push(&out);

            let mut cmd = Command::new(&toolchain.csc);
            cmd.arg("-nologo")
                .arg("-target:library")
                .arg("-debug")
                .arg(out_arg)
                .arg(path);
            run_tool(cmd, &toolchain.csc)?;
            read_output(out, scratch)
        }
        Input::Project => {
            let scratch = tempfile::tempdir()?;
            let stem = path.file_stem().unwrap_or_else(|| "out".as_ref());
            let out = scratch.path().join(stem).with_extension("dll");

            let mut cmd = Command::new(&toolchain.dotnet);
            cmd.arg("build")
                .arg(path)
                .arg("-c")
                .arg("Debug")
                .arg("-o")
                .arg(scratch.path());
            run_tool(cmd, &toolchain.dotnet)?;
            read_output(out, scratch)
        }
    }
}

fn run_tool(mut cmd: Command, tool: &OsString) -> Result<(), CompileError> {
    let tool = tool.to_string_lossy().into_owned();
    info!("running {tool}");
    let output = cmd.output().map_err(|source| CompileError::Spawn {
        tool: tool.clone(),
        source,
    })?;
    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stderr));

    if output.status.success() {
        debug!("{tool} finished");
        return Ok(());
    }
    Err(CompileError::CompileFailure {
        diagnostics: parse_diagnostics(&text)?,
        tool,
        output: text,
    })
}

fn read_output(out: PathBuf, scratch: TempDir) -> Result<Image, CompileError> {
    if !out.is_file() {
        return Err(CompileError::MissingOutput(out));
    }
    Ok(Image {
        bytes: fs::read(&out)?,
        scratch: Some(scratch),
    })
}

/// Extract diagnostics from compiler output. Lines that do not look like
/// diagnostics are skipped; `dotnet build` repeats each diagnostic in its
/// summary, so duplicates are dropped.
pub fn parse_diagnostics(output: &str) -> Result<Vec<Diagnostic>, CompileError> {
    let mut diagnostics: Vec<Diagnostic> = Vec::new();
    for caps in diagnostic_pattern()?.captures_iter(output) {
        let diagnostic = Diagnostic {
            path: caps["path"].trim().to_string(),
            line: caps["line"].parse().unwrap_or(0),
            column: caps["col"].parse().unwrap_or(0),
            severity: caps["severity"].to_string(),
            code: caps["code"].to_string(),
            message: strip_project_suffix(&caps["message"]).to_string(),
        };
        if !diagnostics.contains(&diagnostic) {
            diagnostics.push(diagnostic);
        }
    }
    Ok(diagnostics)
}

static DIAGNOSTIC: OnceLock<Regex> = OnceLock::new();

fn diagnostic_pattern() -> Result<&'static Regex, CompileError> {
    if let Some(re) = DIAGNOSTIC.get() {
        return Ok(re);
    }
    let re = Regex::new(
        r"(?m)^\s*(?P<path>[^\r\n(]+)\((?P<line>\d+),(?P<col>\d+)\):\s*(?P<severity>error|warning)\s+(?P<code>[A-Z]+\d+):\s*(?P<message>[^\r\n]*?)\s*$",
    )?;
    Ok(DIAGNOSTIC.get_or_init(|| re))
}

// dotnet build appends " [path/to/project.csproj]" to every diagnostic.
fn strip_project_suffix(message: &str) -> &str {
    match message.rfind(" [") {
        Some(at) if message.ends_with(']') => &message[..at],
        _ => message,
    }
}
