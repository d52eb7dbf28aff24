//! Error types and handling
//!
//! Every fatal condition the driver can hit is one variant here. There is
//! no retry at any layer; callers propagate with `?` and the orchestrator
//! reifies the single top-level boundary where errors are printed and the
//! process exits nonzero.

use thiserror::Error;

/// Domain errors for the build driver
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration-related errors: missing required field, wrong shape,
    /// reference to an unknown stage
    #[error("configuration error: {message}")]
    Config { message: String },

    /// Configuration file named on the command line does not exist
    #[error("configuration file not found: {path}")]
    ConfigNotFound { path: String },

    /// The stage graph is not acyclic
    #[error("dependency cycle involving {members}")]
    Cycle { members: String },

    /// A wrapper was called in a way its parameter grammar rejects
    #[error("bad call: {message}")]
    Contract { message: String },

    /// A child process could not be started
    #[error("{name}: failed to execute: {source}")]
    Spawn {
        name: String,
        source: std::io::Error,
    },

    /// A child process was killed by a signal
    #[error("{name}: died with signal {signal}")]
    Signal { name: String, signal: i32 },

    /// A child process exited nonzero and no nonzero hook was installed
    #[error("{name}: exited with status {status}")]
    ExitStatus { name: String, status: i32 },

    /// A program was not found in the secured search path
    #[error("program not found in secure path: {name}")]
    ProgramNotFound { name: String },

    /// An expected input archive is absent or otherwise unusable
    #[error("artifact error: {message}")]
    Artifact { message: String },

    /// Template expansion kept producing new text at the iteration cap
    #[error("template expansion did not converge after {passes} passes: {value}")]
    Expansion { passes: usize, value: String },

    /// Filesystem errors from the driver's own bookkeeping (logs, archives)
    #[error("i/o error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
}

/// Convenience type alias for Results with the driver's Error
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Shorthand for a configuration error with a formatted message
    pub fn config(message: impl Into<String>) -> Self {
        Error::Config {
            message: message.into(),
        }
    }

    /// Shorthand for a call-contract error with a formatted message
    pub fn contract(message: impl Into<String>) -> Self {
        Error::Contract {
            message: message.into(),
        }
    }
}
