//! External process execution
//!
//! The driver runs unprivileged but executes security-sensitive tools, so
//! program lookup never consults PATH: a per-program environment override
//! (`<NAME>_PROG`) is honored when it names an executable, then a fixed
//! list of system directories is searched. Execution is direct (no shell),
//! blocking, and labelled for diagnostics. Nonzero exit is fatal unless the
//! caller installs a hook deciding otherwise; the archiver in particular
//! returns 1 for noncritical warnings.

use crate::errors::{Error, Result};
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Mutex;
use tracing::debug;

/// Directories searched for programs, in order. PATH is never consulted.
pub const SECURE_PATH: [&str; 4] = ["/usr/bin", "/sbin", "/usr/sbin", "/bin"];

static PROGRAM_CACHE: Lazy<Mutex<HashMap<String, PathBuf>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Resolve a program name to an absolute path.
///
/// `<NAME>_PROG` (name uppercased, non-alphanumerics folded to `_`) wins
/// when it points at an executable file; otherwise the secure search list
/// is walked in order. Results are cached process-wide.
pub fn locate(name: &str) -> Result<PathBuf> {
    let mut cache = PROGRAM_CACHE
        .lock()
        .unwrap_or_else(|poison| poison.into_inner());
    if let Some(found) = cache.get(name) {
        return Ok(found.clone());
    }
    let found = resolve(name)?;
    debug!(program = name, path = %found.display(), "located program");
    cache.insert(name.to_owned(), found.clone());
    Ok(found)
}

/// Drop all cached program paths. Intended for tests that change
/// `<NAME>_PROG` between lookups.
pub fn clear_program_cache() {
    PROGRAM_CACHE
        .lock()
        .unwrap_or_else(|poison| poison.into_inner())
        .clear();
}

fn resolve(name: &str) -> Result<PathBuf> {
    if let Ok(explicit) = std::env::var(prog_env_var(name)) {
        let explicit = PathBuf::from(explicit);
        if is_executable(&explicit) {
            return Ok(explicit);
        }
        debug!(program = name, "ignoring non-executable program override");
    }
    for dir in SECURE_PATH {
        let candidate = Path::new(dir).join(name);
        if is_executable(&candidate) {
            return Ok(candidate);
        }
    }
    Err(Error::ProgramNotFound {
        name: name.to_owned(),
    })
}

/// Environment variable overriding the location of `name`.
pub fn prog_env_var(name: &str) -> String {
    let mut var: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    var.push_str("_PROG");
    var
}

fn is_executable(path: &Path) -> bool {
    path.metadata()
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Hook consulted with a child's exit status.
pub type ExitHook<'a> = Box<dyn FnOnce(i32) -> Result<()> + 'a>;

/// Outcome of a completed child process.
#[derive(Debug)]
pub struct RunOutput {
    /// Raw exit status.
    pub status: i32,
    /// Captured standard output, when requested.
    pub stdout: Option<String>,
}

/// One external command invocation.
///
/// Consumed by [`Runner::run`]; exit-status policy is expressed through the
/// `on_nonzero`/`on_zero` hooks. Without an `on_nonzero` hook any nonzero
/// status is fatal.
pub struct Runner<'a> {
    program: PathBuf,
    args: Vec<String>,
    label: String,
    capture_output: bool,
    suppress_output: bool,
    suppress_error: bool,
    on_nonzero: Option<ExitHook<'a>>,
    on_zero: Option<ExitHook<'a>>,
}

impl<'a> Runner<'a> {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        let program = program.into();
        let label = program
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| program.display().to_string());
        Runner {
            program,
            args: Vec::new(),
            label,
            capture_output: false,
            suppress_output: false,
            suppress_error: false,
            on_nonzero: None,
            on_zero: None,
        }
    }

    /// Diagnostic label used in errors and logs.
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Collect the child's standard output into [`RunOutput::stdout`].
    pub fn capture_output(mut self) -> Self {
        self.capture_output = true;
        self
    }

    /// Send the child's standard output to the null sink.
    pub fn suppress_output(mut self) -> Self {
        self.suppress_output = true;
        self
    }

    /// Send the child's standard error to the null sink.
    pub fn suppress_error(mut self) -> Self {
        self.suppress_error = true;
        self
    }

    /// Install the hook consulted when the child exits nonzero. The hook
    /// decides whether the status is acceptable by returning `Ok`.
    pub fn on_nonzero(mut self, hook: impl FnOnce(i32) -> Result<()> + 'a) -> Self {
        self.on_nonzero = Some(Box::new(hook));
        self
    }

    /// Install the hook consulted when the child exits zero.
    pub fn on_zero(mut self, hook: impl FnOnce(i32) -> Result<()> + 'a) -> Self {
        self.on_zero = Some(Box::new(hook));
        self
    }

    /// Spawn, block until exit, and apply the exit-status policy.
    pub fn run(self) -> Result<RunOutput> {
        let mut command = Command::new(&self.program);
        command.args(&self.args);
        if self.capture_output {
            command.stdout(Stdio::piped());
        } else if self.suppress_output {
            command.stdout(Stdio::null());
        }
        if self.suppress_error {
            command.stderr(Stdio::null());
        }
        let rendered = format!("{} {}", self.program.display(), self.args.join(" "));
        debug!(label = %self.label, command = %rendered, "running");

        let child = command.spawn().map_err(|source| Error::Spawn {
            name: self.label.clone(),
            source,
        })?;
        let output = child.wait_with_output().map_err(|source| Error::Spawn {
            name: self.label.clone(),
            source,
        })?;

        let stdout = self
            .capture_output
            .then(|| String::from_utf8_lossy(&output.stdout).into_owned());

        match output.status.code() {
            Some(0) => {
                if let Some(hook) = self.on_zero {
                    hook(0)?;
                }
                Ok(RunOutput { status: 0, stdout })
            }
            Some(status) => {
                debug!(label = %self.label, status, "child exited nonzero");
                match self.on_nonzero {
                    Some(hook) => {
                        hook(status)?;
                        Ok(RunOutput { status, stdout })
                    }
                    None => Err(Error::ExitStatus {
                        name: self.label,
                        status,
                    }),
                }
            }
            None => Err(Error::Signal {
                name: self.label,
                signal: output.status.signal().unwrap_or(0),
            }),
        }
    }
}
