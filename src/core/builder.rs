//! Runs build scripts and installs their output.
//!
//! A script is invoked as `<interpreter…> <script> <staging_path> <target>`
//! from the builder's base directory, with `$GUP_TARGET` pointing at the
//! final target. On success the staging file atomically replaces the target;
//! a script that writes nothing is a pseudo-task.

use std::fs::{self, File};
use std::io::Read;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::{info, trace, warn};

use crate::core::dirty;
use crate::core::resolver::Builder;
use crate::io::paths::{
    absolutize, get_mtime, is_dir_lstat, is_symlink, lexists, relpath, rename_atomic, resolve_base,
    try_remove,
};
use crate::ops::context::{self, Invocation};
use crate::ops::error::{GupError, Result};
use crate::store::deps::{Deps, TargetState};

/// A buildable target: the resolved builder plus its state handle.
#[derive(Debug)]
pub struct Target {
    pub builder: Builder,
    pub path: PathBuf,
    pub state: TargetState,
}

/// Resolve `path` to a buildable target, or `None`.
pub fn prepare_build(path: &Path) -> Result<Option<Target>> {
    let resolved = resolve_base(path);
    let builder = Builder::for_target(&resolved)?;
    trace!("prepare_build({}) -> {:?}", resolved.display(), builder);
    Ok(builder.map(Target::new))
}

impl Target {
    pub fn new(builder: Builder) -> Target {
        let path = builder.target_path();
        Target {
            state: TargetState::new(path.clone()),
            path,
            builder,
        }
    }

    /// Build the target; with `update`, only if it is stale. Returns whether
    /// a build was performed.
    pub fn build_or_update(&self, update: bool) -> Result<bool> {
        if update {
            let built = dirty::build_if_dirty(self, true)?;
            if !built {
                trace!("no build needed");
            }
            Ok(built)
        } else {
            self.perform_build(false)?;
            Ok(true)
        }
    }

    /// Whether the target would be rebuilt, without building it.
    pub fn is_dirty(&self) -> Result<bool> {
        dirty::build_if_dirty(self, false)
    }

    /// Run the build under the state store's exclusive lock.
    pub fn perform_build(&self, from_update: bool) -> Result<bool> {
        let inv = Invocation::get();
        self.state
            .perform_build(&self.builder.script, &inv.run_id, |deps| {
                self.run_script(deps, from_update, inv)
            })
    }

    fn run_script(&self, deps: Option<&Deps>, from_update: bool, inv: &Invocation) -> Result<()> {
        let exe_path = absolutize(&self.builder.script);
        let exe_rel = relpath(&exe_path, &inv.root_cwd);
        let target_rel = relpath(&self.path, &inv.root_cwd);

        // the base directory may not exist yet when a gup/ mirror is in use
        fs::create_dir_all(&self.builder.basedir)?;

        let staging = absolutize(&self.state.meta_path("out"));
        try_remove(&staging)?;

        let mut cleanup_staging = true;
        let result = (|| -> Result<()> {
            info!("{}{}", inv.indent, target_rel.display());
            let pre_mtime = get_mtime(&self.path)?;

            let interp = interpreter_for(&exe_path)?;
            let mut argv: Vec<String> = interp.clone().unwrap_or_default();
            argv.push(exe_path.to_string_lossy().into_owned());
            argv.push(staging.to_string_lossy().into_owned());
            argv.push(self.builder.target.clone());

            if inv.xtrace {
                info!(" # {}", absolutize(&self.builder.basedir).display());
                info!(" + {}", argv.join(" "));
            } else {
                trace!(" from cwd: {}", absolutize(&self.builder.basedir).display());
                trace!("executing: {}", argv.join(" "));
            }

            let status = self.spawn_script(&argv, inv).map_err(|e| {
                if interp.is_none() {
                    if let GupError::Io(_) = &e {
                        return GupError::Safe(format!(
                            "{} is not executable and has no shebang line",
                            exe_rel.display()
                        ));
                    }
                }
                e
            })?;

            let post_mtime = get_mtime(&self.path)?;
            let target_changed = pre_mtime != post_mtime;
            if target_changed {
                trace!("old_mtime={pre_mtime:?}, new_mtime={post_mtime:?}");
                if !is_dir_lstat(&self.path) {
                    // directories are often created in place, which is fine
                    self.state.mark_clobbers()?;
                    let expect_clobber = deps.map_or(false, |d| d.clobbers);
                    if !(from_update && expect_clobber) {
                        warn!(
                            "{} modified {} directly",
                            exe_rel.display(),
                            self.path.display()
                        );
                    }
                }
            }

            if status != 0 {
                let mut kept = None;
                if inv.keep_failed {
                    cleanup_staging = false;
                    if lexists(&staging) {
                        kept = Some(relpath(&staging, &inv.root_cwd));
                    }
                }
                trace!("builder exited with status {status}");
                return Err(GupError::TargetFailed {
                    target: target_rel.display().to_string(),
                    status,
                    kept,
                });
            }

            if lexists(&staging) {
                if lexists(&self.path) && (is_dir_lstat(&self.path) || is_dir_lstat(&staging)) {
                    trace!("removing previous {}", self.path.display());
                    try_remove(&self.path)?;
                }
                rename_atomic(&staging, &self.path)?;
            } else if !target_changed && lexists(&self.path) && !is_symlink(&self.path) {
                // a pseudo-task has no output; a file left over from an
                // earlier script version is stale
                warn!("Removing stale target: {}", target_rel.display());
                try_remove(&self.path)?;
            }
            cleanup_staging = false;
            Ok(())
        })();

        if cleanup_staging {
            let _ = try_remove(&staging);
        }
        result
    }

    fn spawn_script(&self, argv: &[String], inv: &Invocation) -> Result<i32> {
        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..])
            .current_dir(&self.builder.basedir)
            .env(context::ENV_TARGET, absolutize(&self.path))
            .env(context::ENV_INDENT, context::child_indent(inv));

        let status = match cmd.status() {
            Ok(status) => status,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(GupError::Safe(format!("Executable not found: {}", argv[0])))
            }
            Err(e) => return Err(e.into()),
        };
        Ok(status
            .code()
            .unwrap_or_else(|| -status.signal().unwrap_or(1)))
    }
}

/// Interpreter prefix for `script`, from its shebang line. `None` when the
/// script has no shebang (it must then be directly executable).
///
/// An interpreter path starting with `.` is resolved relative to the
/// script's directory. A missing absolute interpreter is an error, except
/// for the ubiquitous `#!/usr/bin/env prog` pattern: a missing `env` is
/// elided and the remaining tokens used directly.
fn interpreter_for(script: &Path) -> Result<Option<Vec<String>>> {
    let mut file = File::open(script)?;
    let mut buf = [0u8; 255];
    let mut len = 0;
    while len < buf.len() {
        let n = file.read(&mut buf[len..])?;
        if n == 0 {
            break;
        }
        len += n;
    }
    let line = &buf[..len];
    if !line.starts_with(b"#!") {
        return Ok(None);
    }
    let line = &line[2..line.iter().position(|b| *b == b'\n').unwrap_or(len)];
    let line = String::from_utf8_lossy(line);

    let mut args: Vec<String> = line.split_whitespace().map(str::to_string).collect();
    let Some(first) = args.first_mut() else {
        return Ok(None);
    };
    if first.starts_with('.') {
        let resolved = script
            .parent()
            .unwrap_or(Path::new("/"))
            .join(first.as_str())
            .to_string_lossy()
            .into_owned();
        *first = resolved;
    }

    let bin = Path::new(&args[0]);
    if bin.is_absolute() && !bin.exists() {
        if bin.file_name().map(|n| n == "env").unwrap_or(false) {
            return Ok(Some(args[1..].to_vec()));
        }
        return Err(GupError::Safe(format!(
            "No such interpreter: {}",
            bin.display()
        )));
    }
    Ok(Some(args))
}
