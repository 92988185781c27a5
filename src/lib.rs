//! gup - a recursive, user-extensible build tool
//!
//! Targets are built by user-supplied scripts which declare their own
//! dependencies at runtime by re-invoking `gup -u <dep>`. The tool resolves
//! each target to its authoritative build script (a `<name>.gup` sibling or
//! a `Gupfile` pattern match), tracks what each build consumed, and rebuilds
//! only what is stale.

pub mod cmd;
pub mod core;
pub mod io;
pub mod ops;
pub mod store;

// Re-exports for convenience
pub use crate::core::builder::prepare_build;
pub use crate::core::resolver::Builder;
pub use crate::store::deps::TargetState;

/// Per-directory metadata directory, holding `<target>.deps` records for the
/// targets built beside it.
pub const META_DIR: &str = ".gup";

/// Name of the indirect build-rules file searched up the directory tree.
pub const GUPFILE: &str = "Gupfile";
