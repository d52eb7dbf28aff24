//! Logging and per-stage stream redirection
//!
//! Tracing output goes to standard error with a filter derived from the
//! integer debug level (an explicit `RUST_LOG`-style environment setting
//! wins). Separately, the orchestrator redirects the process's standard
//! output and error file descriptors into a per-stage log file for the
//! duration of each stage; [`StreamRedirect`] owns the saved descriptors
//! and restores them when dropped, on every exit path.

use crate::errors::Result;
use std::fs::File;
use std::io::Write;
use std::os::fd::{AsFd, OwnedFd};
use std::path::Path;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize the tracing subscriber from the debug level.
///
/// Safe to call more than once; later calls are no-ops.
pub fn init(debug: i64) {
    let fallback = match debug {
        i64::MIN..=0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .try_init();
}

/// Scoped redirection of standard output and error to a log file.
///
/// Construction saves duplicates of file descriptors 1 and 2 and points
/// both at the log file (created or appended). Dropping the guard restores
/// the saved descriptors, so a stage that fails mid-flight still hands the
/// terminal back to the orchestrator.
pub struct StreamRedirect {
    saved_stdout: OwnedFd,
    saved_stderr: OwnedFd,
}

impl StreamRedirect {
    pub fn to_file(path: &Path) -> Result<Self> {
        let file = File::options().create(true).append(true).open(path)?;
        flush_std_handles();
        let saved_stdout = std::io::stdout().as_fd().try_clone_to_owned()?;
        let saved_stderr = std::io::stderr().as_fd().try_clone_to_owned()?;
        rustix::stdio::dup2_stdout(&file).map_err(io_error)?;
        rustix::stdio::dup2_stderr(&file).map_err(io_error)?;
        Ok(StreamRedirect {
            saved_stdout,
            saved_stderr,
        })
    }
}

impl Drop for StreamRedirect {
    fn drop(&mut self) {
        flush_std_handles();
        let _ = rustix::stdio::dup2_stdout(&self.saved_stdout);
        let _ = rustix::stdio::dup2_stderr(&self.saved_stderr);
    }
}

fn flush_std_handles() {
    let _ = std::io::stdout().flush();
    let _ = std::io::stderr().flush();
}

fn io_error(errno: rustix::io::Errno) -> crate::errors::Error {
    crate::errors::Error::Io {
        source: std::io::Error::from_raw_os_error(errno.raw_os_error()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::fs;

    // The test harness captures `println!` at the Rust layer, so these
    // tests observe the descriptor state through child processes, which
    // inherit the real fd 1.
    fn echo(line: &str) {
        let status = std::process::Command::new("/bin/echo")
            .arg(line)
            .status()
            .unwrap();
        assert!(status.success());
    }

    #[test]
    #[serial]
    fn redirect_routes_child_output_to_file_and_restores() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("stage.log");
        {
            let _guard = StreamRedirect::to_file(&log).unwrap();
            echo("inside redirect");
        }
        let contents = fs::read_to_string(&log).unwrap();
        assert!(contents.contains("inside redirect"));
        echo("outside redirect");
        let contents_after = fs::read_to_string(&log).unwrap();
        assert_eq!(contents, contents_after);
    }

    #[test]
    #[serial]
    fn nested_guards_unwind_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let outer = dir.path().join("outer.log");
        let inner = dir.path().join("inner.log");
        {
            let _outer = StreamRedirect::to_file(&outer).unwrap();
            echo("outer line");
            {
                let _inner = StreamRedirect::to_file(&inner).unwrap();
                echo("inner line");
            }
            echo("outer again");
        }
        let outer_contents = fs::read_to_string(&outer).unwrap();
        let inner_contents = fs::read_to_string(&inner).unwrap();
        assert!(outer_contents.contains("outer line"));
        assert!(outer_contents.contains("outer again"));
        assert!(!outer_contents.contains("inner line"));
        assert!(inner_contents.contains("inner line"));
    }
}
