//! Decides whether a target needs rebuilding.
//!
//! The walk recurses into every dependency that is itself a buildable
//! target, giving it the chance to rebuild first; staleness then shows up as
//! a changed mtime (or checksum) on the parent's stored record. Each child is
//! visited at most once per walk, and the run id short-circuit keeps an
//! `always:` target to a single build per invocation however many parents
//! reach it.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use tracing::{debug, trace};

use crate::core::builder::{prepare_build, Target};
use crate::io::paths::relpath;
use crate::ops::context::Invocation;
use crate::ops::error::Result;
use crate::store::deps::DirtyCheck;

/// Returns whether `target` was rebuilt (with `allow_build`), or would be
/// (without). Children are handled the same way: query mode has no side
/// effects at all.
pub fn build_if_dirty(target: &Target, allow_build: bool) -> Result<bool> {
    // the build script may itself be a target; bring it up to date first
    if let Some(parent) = &target.builder.parent {
        let parent_target = Target::new((**parent).clone());
        if build_if_dirty(&parent_target, allow_build)? {
            debug!("DIRTY: builder was rebuilt");
            return build_now(target, allow_build);
        }
    }

    let Some(deps) = target.state.load_deps()? else {
        debug!(
            "DIRTY: {} (is buildable but has no stored deps)",
            target.path.display()
        );
        return build_now(target, allow_build);
    };

    let run_id = &Invocation::get().run_id;
    if deps.already_built(run_id) {
        trace!(
            "{} was already built in this invocation",
            target.path.display()
        );
        return Ok(true);
    }

    let base = target.path.parent().unwrap_or(Path::new("/")).to_path_buf();
    let builder_path = relpath(&target.builder.script, &base);
    let mut visited: HashSet<PathBuf> = HashSet::new();

    let dirty = if allow_build {
        let mut build_child =
            |path: &Path| build_child_if_dirty(path, true, &target.path, &mut visited);
        deps.is_dirty(&mut DirtyCheck {
            base: &base,
            builder_path: &builder_path,
            target: &target.path,
            build_child: &mut build_child,
        })?
    } else {
        // query mode: report a would-be-dirty child as our own dirtiness,
        // since without building it we cannot know its eventual content
        let mut child_would_build = false;
        let mut build_child = |path: &Path| {
            if build_child_if_dirty(path, false, &target.path, &mut visited)? {
                child_would_build = true;
            }
            Ok(false)
        };
        let own = deps.is_dirty(&mut DirtyCheck {
            base: &base,
            builder_path: &builder_path,
            target: &target.path,
            build_child: &mut build_child,
        })?;
        own || child_would_build
    };
    trace!("is_dirty({}) -> {}", target.path.display(), dirty);

    if dirty {
        return build_now(target, allow_build);
    }
    Ok(false)
}

fn build_now(target: &Target, allow_build: bool) -> Result<bool> {
    if allow_build {
        target.perform_build(true)?;
    }
    Ok(true)
}

fn build_child_if_dirty(
    path: &Path,
    allow_build: bool,
    parent: &Path,
    visited: &mut HashSet<PathBuf>,
) -> Result<bool> {
    if !visited.insert(path.to_path_buf()) {
        return Ok(false);
    }
    trace!(
        "Recursing over dependency: {} -> {}",
        parent.display(),
        path.display()
    );
    match prepare_build(path)? {
        Some(child) => {
            let child_dirty = build_if_dirty(&child, allow_build)?;
            trace!("build_if_dirty({}) -> {}", path.display(), child_dirty);
            Ok(child_dirty)
        }
        None => Ok(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::resolver::Builder;
    use crate::io::paths::get_mtime;
    use crate::ops::context::{Invocation, Overrides};
    use crate::store::deps::{Dep, FileDep, FORMAT_VERSION};
    use std::fs;
    use std::path::PathBuf;
    use tempfile::tempdir;

    fn init_invocation() {
        let _ = Invocation::init(Overrides::default());
    }

    /// Write a committed deps file for `target` with the given record lines.
    fn write_deps(dir: &Path, target: &str, records: &[Dep]) {
        let meta = dir.join(crate::META_DIR);
        fs::create_dir_all(&meta).unwrap();
        let mut text = format!("version: {FORMAT_VERSION}\nrun: bygone-run\n");
        for r in records {
            text.push_str(&r.to_line().unwrap());
            text.push('\n');
        }
        fs::write(meta.join(format!("{target}.deps")), text).unwrap();
    }

    fn script_dep(dir: &Path, name: &str) -> Dep {
        Dep::Builder(FileDep {
            mtime: get_mtime(&dir.join(name)).unwrap(),
            checksum: None,
            path: PathBuf::from(name),
        })
    }

    fn target_for(dir: &Path, name: &str) -> Target {
        Target::new(
            Builder::for_target(&dir.join(name))
                .unwrap()
                .expect("target should be buildable"),
        )
    }

    #[test]
    fn unmodified_target_is_clean() {
        init_invocation();
        let tmp = tempdir().unwrap();
        let dir = tmp.path().canonicalize().unwrap();
        fs::write(dir.join("t.gup"), "#!/bin/sh\n").unwrap();
        fs::write(dir.join("input"), "data").unwrap();
        fs::write(dir.join("t"), "built").unwrap();

        write_deps(
            &dir,
            "t",
            &[
                script_dep(&dir, "t.gup"),
                Dep::File(FileDep {
                    mtime: get_mtime(&dir.join("input")).unwrap(),
                    checksum: None,
                    path: "input".into(),
                }),
                Dep::BuildTime(get_mtime(&dir.join("t")).unwrap().unwrap()),
            ],
        );

        assert!(!target_for(&dir, "t").is_dirty().unwrap());
    }

    #[test]
    fn touched_dependency_makes_target_dirty() {
        init_invocation();
        let tmp = tempdir().unwrap();
        let dir = tmp.path().canonicalize().unwrap();
        fs::write(dir.join("t.gup"), "#!/bin/sh\n").unwrap();
        fs::write(dir.join("input"), "data").unwrap();
        fs::write(dir.join("t"), "built").unwrap();

        write_deps(
            &dir,
            "t",
            &[
                script_dep(&dir, "t.gup"),
                Dep::File(FileDep {
                    mtime: get_mtime(&dir.join("input")).unwrap().map(|m| m - 1),
                    checksum: None,
                    path: "input".into(),
                }),
                Dep::BuildTime(get_mtime(&dir.join("t")).unwrap().unwrap()),
            ],
        );

        assert!(target_for(&dir, "t").is_dirty().unwrap());
    }

    #[test]
    fn missing_target_is_dirty() {
        init_invocation();
        let tmp = tempdir().unwrap();
        let dir = tmp.path().canonicalize().unwrap();
        fs::write(dir.join("t.gup"), "#!/bin/sh\n").unwrap();
        write_deps(&dir, "t", &[script_dep(&dir, "t.gup")]);

        assert!(target_for(&dir, "t").is_dirty().unwrap());
    }

    #[test]
    fn always_marked_target_is_dirty() {
        init_invocation();
        let tmp = tempdir().unwrap();
        let dir = tmp.path().canonicalize().unwrap();
        fs::write(dir.join("t.gup"), "#!/bin/sh\n").unwrap();
        fs::write(dir.join("t"), "built").unwrap();
        write_deps(
            &dir,
            "t",
            &[
                script_dep(&dir, "t.gup"),
                Dep::Always,
                Dep::BuildTime(get_mtime(&dir.join("t")).unwrap().unwrap()),
            ],
        );

        assert!(target_for(&dir, "t").is_dirty().unwrap());
    }

    #[test]
    fn changed_builder_makes_target_dirty() {
        init_invocation();
        let tmp = tempdir().unwrap();
        let dir = tmp.path().canonicalize().unwrap();
        fs::write(dir.join("t"), "built").unwrap();
        fs::write(dir.join("a.gup"), "#!/bin/sh\n").unwrap();
        fs::write(dir.join("b.gup"), "#!/bin/sh\n").unwrap();
        fs::write(dir.join("Gupfile"), "b.gup:\n\tt\n").unwrap();

        // stored record says a.gup built this, but the Gupfile now picks b.gup
        write_deps(
            &dir,
            "t",
            &[
                script_dep(&dir, "a.gup"),
                Dep::BuildTime(get_mtime(&dir.join("t")).unwrap().unwrap()),
            ],
        );

        assert!(target_for(&dir, "t").is_dirty().unwrap());
    }

    #[test]
    fn externally_modified_target_is_dirty() {
        init_invocation();
        let tmp = tempdir().unwrap();
        let dir = tmp.path().canonicalize().unwrap();
        fs::write(dir.join("t.gup"), "#!/bin/sh\n").unwrap();
        fs::write(dir.join("t"), "built").unwrap();
        let built = get_mtime(&dir.join("t")).unwrap().unwrap();
        write_deps(
            &dir,
            "t",
            &[script_dep(&dir, "t.gup"), Dep::BuildTime(built - 5)],
        );

        assert!(target_for(&dir, "t").is_dirty().unwrap());
    }

    #[test]
    fn ifcreate_dependency_fires_on_creation() {
        init_invocation();
        let tmp = tempdir().unwrap();
        let dir = tmp.path().canonicalize().unwrap();
        fs::write(dir.join("t.gup"), "#!/bin/sh\n").unwrap();
        fs::write(dir.join("t"), "built").unwrap();
        write_deps(
            &dir,
            "t",
            &[
                script_dep(&dir, "t.gup"),
                Dep::File(FileDep {
                    mtime: None,
                    checksum: None,
                    path: "watched".into(),
                }),
                Dep::BuildTime(get_mtime(&dir.join("t")).unwrap().unwrap()),
            ],
        );

        assert!(!target_for(&dir, "t").is_dirty().unwrap());
        fs::write(dir.join("watched"), "now exists").unwrap();
        assert!(target_for(&dir, "t").is_dirty().unwrap());
    }

    #[test]
    fn checksum_match_keeps_parent_clean_despite_touch() {
        init_invocation();
        let tmp = tempdir().unwrap();
        let dir = tmp.path().canonicalize().unwrap();
        fs::write(dir.join("parent.gup"), "#!/bin/sh\n").unwrap();
        fs::write(dir.join("parent"), "built").unwrap();
        fs::write(dir.join("child"), "content").unwrap();

        // the child target declares a checksum; the parent recorded it, but
        // with a stale mtime (as after an unrelated child rebuild)
        write_deps(&dir, "child", &[Dep::Checksum("cafebabe".into())]);
        write_deps(
            &dir,
            "parent",
            &[
                script_dep(&dir, "parent.gup"),
                Dep::File(FileDep {
                    mtime: get_mtime(&dir.join("child")).unwrap().map(|m| m - 7),
                    checksum: Some("cafebabe".into()),
                    path: "child".into(),
                }),
                Dep::BuildTime(get_mtime(&dir.join("parent")).unwrap().unwrap()),
            ],
        );

        assert!(!target_for(&dir, "parent").is_dirty().unwrap());

        // a different stored checksum on the child means real change
        write_deps(&dir, "child", &[Dep::Checksum("0ddba11".into())]);
        assert!(target_for(&dir, "parent").is_dirty().unwrap());
    }
}
