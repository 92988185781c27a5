//! Read-only queries: `--buildable`, `--dirty` and `--features`.

use std::path::Path;

use crate::core::builder::prepare_build;
use crate::core::resolver::Builder;
use crate::io::paths::resolve_base;
use crate::ops::error::Result;

/// Exit status 0 when a builder exists for `target`, 1 otherwise.
pub fn buildable(target: &str) -> Result<i32> {
    let found = Builder::for_target(&resolve_base(Path::new(target)))?;
    Ok(if found.is_some() { 0 } else { 1 })
}

/// Exit status 0 when any target is dirty (or unbuildable), 1 when all are
/// clean. Performs no builds.
pub fn dirty(targets: &[String]) -> Result<i32> {
    for target in targets {
        match prepare_build(Path::new(target))? {
            None => return Ok(0),
            Some(target) => {
                if target.is_dirty()? {
                    return Ok(0);
                }
            }
        }
    }
    Ok(1)
}

pub fn features() -> i32 {
    println!("version {}", env!("CARGO_PKG_VERSION"));
    0
}
