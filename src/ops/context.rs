//! Process-wide invocation context.
//!
//! Groups the state shared by every build in one tool invocation: the run id,
//! the root working directory, and the flags propagated to child invocations.
//! The root invocation mints these values; children reconstruct them from the
//! environment.

use std::env;
use std::path::PathBuf;
use std::sync::OnceLock;

use tracing::trace;

use crate::ops::error::{GupError, Result};

pub const ENV_ROOT: &str = "GUP_ROOT";
pub const ENV_RUNID: &str = "GUP_RUNID";
pub const ENV_TARGET: &str = "GUP_TARGET";
pub const ENV_INDENT: &str = "GUP_INDENT";
pub const ENV_VERBOSE: &str = "GUP_VERBOSE";
pub const ENV_XTRACE: &str = "GUP_XTRACE";
pub const ENV_KEEP_FAILED: &str = "GUP_KEEP_FAILED";
pub const ENV_JOBSERVER: &str = "GUP_JOBSERVER";
pub const ENV_IN_PATH: &str = "GUP_IN_PATH";

static INVOCATION: OnceLock<Invocation> = OnceLock::new();

/// Settings from the command line that adjust the inherited context.
#[derive(Debug, Default, Clone, Copy)]
pub struct Overrides {
    pub verbosity: i32,
    pub xtrace: bool,
    pub keep_failed: bool,
}

#[derive(Debug, Clone)]
pub struct Invocation {
    /// Identifier shared by every build performed in this invocation tree,
    /// assigned by the root as a wall-clock millisecond timestamp.
    pub run_id: String,
    /// Working directory of the root invocation; paths in log messages are
    /// shown relative to it.
    pub root_cwd: PathBuf,
    pub is_root: bool,
    /// Log-alignment prefix; grows by two spaces per nesting level.
    pub indent: String,
    pub verbosity: i32,
    pub xtrace: bool,
    pub keep_failed: bool,
}

impl Invocation {
    /// Initialise the context exactly once and export it for children.
    pub fn init(overrides: Overrides) -> Result<&'static Invocation> {
        let is_root = env::var_os(ENV_ROOT).is_none();
        let (run_id, root_cwd) = if is_root {
            let run_id = chrono::Utc::now().timestamp_millis().to_string();
            let root_cwd = env::current_dir()?;
            env::set_var(ENV_RUNID, &run_id);
            env::set_var(ENV_ROOT, &root_cwd);
            (run_id, root_cwd)
        } else {
            let root_cwd = PathBuf::from(env::var_os(ENV_ROOT).expect("checked above"));
            let run_id = env::var(ENV_RUNID).map_err(|_| {
                GupError::Safe(format!(
                    "{} is set (to {}), but not {}",
                    ENV_ROOT,
                    root_cwd.display(),
                    ENV_RUNID
                ))
            })?;
            (run_id, root_cwd)
        };

        let indent = env::var(ENV_INDENT).unwrap_or_default();
        let xtrace = overrides.xtrace || env_flag(ENV_XTRACE);
        let keep_failed = overrides.keep_failed || env_flag(ENV_KEEP_FAILED);

        // persist for child invocations
        env::set_var(ENV_VERBOSE, overrides.verbosity.to_string());
        if xtrace {
            env::set_var(ENV_XTRACE, "1");
        }
        if keep_failed {
            env::set_var(ENV_KEEP_FAILED, "1");
        }

        let inv = Invocation {
            run_id,
            root_cwd,
            is_root,
            indent,
            verbosity: overrides.verbosity,
            xtrace,
            keep_failed,
        };
        Ok(INVOCATION.get_or_init(|| inv))
    }

    pub fn get() -> &'static Invocation {
        INVOCATION.get().expect("Invocation::init not called")
    }
}

/// Default verbosity for this process: inherited from the parent invocation,
/// zero at the root.
pub fn default_verbosity() -> i32 {
    env::var(ENV_VERBOSE)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

fn env_flag(name: &str) -> bool {
    env::var(name).as_deref() == Ok("1")
}

/// The target currently being built, when this process was spawned from a
/// build script.
pub fn parent_target() -> Option<PathBuf> {
    let target = PathBuf::from(env::var_os(ENV_TARGET)?);
    debug_assert!(target.is_absolute());
    Some(target)
}

/// Make sure `gup` can be found on `$PATH` by build scripts. Done once per
/// invocation tree, guarded by the sticky `GUP_IN_PATH` flag.
pub fn ensure_in_path() {
    if env::var(ENV_IN_PATH).as_deref() == Ok("1") {
        return;
    }
    env::set_var(ENV_IN_PATH, "1");

    let Ok(exe) = env::current_exe() else { return };
    let Some(here) = exe.parent() else { return };
    let here_real = here.canonicalize().unwrap_or_else(|_| here.to_path_buf());

    let path_var = env::var_os("PATH").unwrap_or_default();
    let entries: Vec<PathBuf> = env::split_paths(&path_var).collect();
    for entry in &entries {
        // relative $PATH entries can't be relied on from other directories
        if !entry.is_absolute() {
            continue;
        }
        if entry.canonicalize().map(|p| p == here_real).unwrap_or(false) {
            trace!("found `gup` in $PATH");
            return;
        }
    }

    trace!("`gup` not in $PATH - adding {}", here.display());
    let mut updated = vec![here.to_path_buf()];
    updated.extend(entries);
    if let Ok(joined) = env::join_paths(updated) {
        env::set_var("PATH", joined);
    }
}

/// Indent value exported to processes spawned for a build: one level deeper
/// than our own.
pub fn child_indent(inv: &Invocation) -> String {
    format!("{}  ", inv.indent)
}
