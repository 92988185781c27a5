//! Actions invoked from inside build scripts to annotate the target being
//! built: `--always`, `--ifcreate`, `--contents` and `--leave`.

use std::io::{self, IsTerminal};
use std::path::{Path, PathBuf};

use filetime::FileTime;
use tracing::warn;

use crate::io::paths::lexists;
use crate::ops::context;
use crate::ops::error::{GupError, Result};
use crate::store::deps::{checksum_files, checksum_stream, Dep, FileDep, TargetState};

/// The target of the invoking build script; `None` (after a warning) when
/// run outside of one, in which case the action is a no-op.
fn invoking_target(action: &str) -> Option<PathBuf> {
    let target = context::parent_target();
    if target.is_none() {
        warn!("{action} was used outside of a gup target; ignoring");
    }
    target
}

/// Mark the invoking target as dirty on every run.
pub fn always() -> Result<()> {
    let Some(target) = invoking_target("--always") else {
        return Ok(());
    };
    TargetState::new(target).add_dependency(&Dep::Always)
}

/// Rebuild the invoking target when any of `files` (currently non-existent)
/// is created.
pub fn ifcreate(files: &[String]) -> Result<()> {
    let Some(target) = invoking_target("--ifcreate") else {
        return Ok(());
    };
    let state = TargetState::new(target.clone());
    for file in files {
        let path = Path::new(file);
        if lexists(path) {
            return Err(GupError::Safe(format!("File already exists: {file}")));
        }
        state.add_dependency(&Dep::File(FileDep::relative_to_target(
            &target, None, None, path,
        )))?;
    }
    Ok(())
}

/// Attach a content checksum to the invoking target: of the given files in
/// argument order, or of stdin when none are given.
pub fn contents(files: &[String]) -> Result<()> {
    let Some(target) = invoking_target("--contents") else {
        return Ok(());
    };
    let checksum = if files.is_empty() {
        let stdin = io::stdin();
        if stdin.is_terminal() {
            return Err(GupError::Safe(
                "--contents with no files expects input on stdin".to_string(),
            ));
        }
        checksum_stream(stdin.lock())?
    } else {
        checksum_files(files)?
    };
    TargetState::new(target).add_dependency(&Dep::Checksum(checksum))
}

/// Freshen the invoking target's mtime so an output-less build is not
/// treated as a stale pseudo-task.
pub fn leave() -> Result<()> {
    let Some(target) = invoking_target("--leave") else {
        return Ok(());
    };
    match std::fs::symlink_metadata(&target) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
        Ok(meta) => {
            if !meta.is_symlink() {
                filetime::set_file_mtime(&target, FileTime::now())?;
            }
            Ok(())
        }
    }
}
