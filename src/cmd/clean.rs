//! `--clean`: remove `.gup` metadata directories and the targets they
//! record, provided a builder still recognises those targets.

use std::io::{self, BufRead, Write};
use std::path::Path;

use walkdir::{DirEntry, WalkDir};

use crate::core::resolver::Builder;
use crate::io::paths::{lexists, resolve_base};
use crate::ops::error::{GupError, Result};
use crate::store::deps::TargetState;
use crate::META_DIR;

#[derive(Debug)]
pub struct CleanOptions {
    /// Actually remove files; without it `-n` prints what would go.
    pub force: bool,
    pub dry_run: bool,
    /// Ask for confirmation before each removal.
    pub interactive: bool,
    /// Remove only the metadata directories, leaving targets in place.
    pub metadata_only: bool,
    pub dirs: Vec<String>,
}

pub fn clean(opts: &CleanOptions) -> Result<()> {
    if !opts.force && !opts.dry_run {
        return Err(GupError::Safe(
            "Either --force (-f) or --dry-run (-n) must be given".to_string(),
        ));
    }

    let dirs: Vec<&str> = if opts.dirs.is_empty() {
        vec!["."]
    } else {
        opts.dirs.iter().map(String::as_str).collect()
    };

    for dir in dirs {
        let walker = WalkDir::new(dir)
            .follow_links(false)
            .into_iter()
            .filter_entry(not_hidden);
        for entry in walker {
            let entry = entry.map_err(|e| GupError::Safe(e.to_string()))?;
            if !entry.file_type().is_dir() {
                continue;
            }
            let meta_dir = entry.path().join(META_DIR);
            if !meta_dir.is_dir() {
                continue;
            }

            if !opts.metadata_only {
                for name in TargetState::built_targets(&meta_dir)? {
                    let target = entry.path().join(&name);
                    if !lexists(&target) {
                        continue;
                    }
                    if Builder::for_target(&resolve_base(&target))?.is_some() {
                        remove(opts, &target, false)?;
                    }
                }
            }
            remove(opts, &meta_dir, true)?;
        }
    }
    Ok(())
}

fn not_hidden(entry: &DirEntry) -> bool {
    entry.depth() == 0
        || !entry
            .file_name()
            .to_string_lossy()
            .starts_with('.')
}

fn remove(opts: &CleanOptions, path: &Path, is_dir: bool) -> Result<()> {
    if !opts.force {
        println!("Would remove: {}", path.display());
        return Ok(());
    }

    eprintln!("Removing: {}", path.display());
    if opts.interactive {
        eprint!("   [Y/n]: ");
        io::stderr().flush()?;
        let mut answer = String::new();
        io::stdin().lock().read_line(&mut answer)?;
        if !matches!(answer.trim(), "" | "y" | "Y") {
            eprintln!("Skipped.");
            return Ok(());
        }
    }

    if !is_dir && std::fs::remove_file(path).is_ok() {
        return Ok(());
    }
    std::fs::remove_dir_all(path)?;
    Ok(())
}
