//! Domain-specific errors for build operations

use std::path::PathBuf;

use thiserror::Error;

/// Exit status used by supervised child processes to signal an error that
/// has already been reported on stderr. The parent must not print it again.
pub const ALREADY_LOGGED_STATUS: i32 = 10;

pub type Result<T> = std::result::Result<T, GupError>;

#[derive(Error, Debug)]
pub enum GupError {
    #[error("Don't know how to build {}", .0.display())]
    Unbuildable(PathBuf),

    #[error("Target `{target}` failed with exit status {status}{}", kept_note(.kept))]
    TargetFailed {
        target: String,
        status: i32,
        kept: Option<PathBuf>,
    },

    /// A user-facing error with a complete message of its own.
    #[error("{0}")]
    Safe(String),

    /// A supervised child already printed its error and exited with
    /// [`ALREADY_LOGGED_STATUS`]; there is nothing left to say.
    #[error("build failed")]
    AlreadyReported,

    #[error("interrupted")]
    Interrupted,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<nix::errno::Errno> for GupError {
    fn from(errno: nix::errno::Errno) -> Self {
        GupError::Io(std::io::Error::from_raw_os_error(errno as i32))
    }
}

fn kept_note(kept: &Option<PathBuf>) -> String {
    match kept {
        Some(path) => format!(" (keeping {} for inspection)", path.display()),
        None => String::new(),
    }
}
