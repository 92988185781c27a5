//! The default action: build the requested targets.

use std::path::{Path, PathBuf};

use crate::core::jobserver::{self, Jobserver};
use crate::core::task::{Prepared, Task, TaskRunner};
use crate::io::paths::resolve_base;
use crate::ops::context;
use crate::ops::error::{GupError, Result};

#[derive(Debug)]
pub struct BuildOptions {
    /// Only rebuild stale targets.
    pub update: bool,
    pub jobs: Option<usize>,
    pub targets: Vec<String>,
}

pub fn build(opts: &BuildOptions) -> Result<()> {
    context::ensure_in_path();

    let targets: Vec<&str> = if opts.targets.is_empty() {
        vec!["all"]
    } else {
        opts.targets.iter().map(String::as_str).collect()
    };

    let parent = context::parent_target();
    let mut jobserver = Jobserver::setup(opts.jobs)?;
    jobserver::install_sigint_handler()?;

    let mut runner = TaskRunner::new();
    for target in targets {
        if let Some(parent_path) = &parent {
            if resolve_base(Path::new(target)) == *parent_path {
                return Err(GupError::Safe(format!(
                    "Target `{target}` attempted to build itself"
                )));
            }
        }

        // a symlink delegates to its destination, possibly repeatedly
        let mut next = Some(Task::new(
            opts.update,
            parent.clone(),
            PathBuf::from(target),
        ));
        while let Some(task) = next.take() {
            match task.prepare()? {
                Prepared::Buildable(buildable) => runner.add(task, buildable),
                Prepared::Indirect(destination) => {
                    task.complete(None)?;
                    next = Some(destination);
                }
                Prepared::Source => task.complete(None)?,
            }
        }
    }

    runner.run(&mut jobserver)
}
