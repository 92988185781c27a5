//! The top-level build queue.
//!
//! Every requested target becomes a [`Task`] so builds can run in parallel
//! under the jobserver. When a task completes, the dependency link from the
//! requesting parent target (if any) is recorded, including one record per
//! symlink traversed on the way to the file.

use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{info, trace};

use crate::core::builder::{prepare_build, Target};
use crate::core::jobserver::Jobserver;
use crate::io::paths::{get_mtime, lexists, traverse_symlinks};
use crate::ops::context::Invocation;
use crate::ops::error::{GupError, Result, ALREADY_LOGGED_STATUS};
use crate::store::deps::{Dep, FileDep, TargetState};

/// Outcome of resolving a requested target.
#[derive(Debug)]
pub enum Prepared {
    Buildable(Target),
    /// Not buildable itself, but a symlink whose destination may be.
    Indirect(Task),
    /// Not buildable at all (already reported if tolerated).
    Source,
}

#[derive(Debug, Clone)]
pub struct Task {
    pub target_path: PathBuf,
    pub update: bool,
    /// The target being built by the invoking script, if any.
    pub parent: Option<PathBuf>,
}

impl Task {
    pub fn new(update: bool, parent: Option<PathBuf>, target_path: PathBuf) -> Task {
        Task {
            target_path,
            update,
            parent,
        }
    }

    /// Resolve this task to something buildable, delegate to a symlink
    /// destination, or fail for an unbuildable path (tolerated under
    /// `--update` when the file exists: it is simply a source).
    pub fn prepare(&self) -> Result<Prepared> {
        if let Some(target) = prepare_build(&self.target_path)? {
            return Ok(Prepared::Buildable(target));
        }

        match fs::read_link(&self.target_path) {
            Ok(dest) => {
                let dest = if dest.is_absolute() {
                    dest
                } else {
                    self.target_path
                        .parent()
                        .unwrap_or(Path::new("."))
                        .join(dest)
                };
                return Ok(Prepared::Indirect(Task::new(
                    self.update,
                    self.parent.clone(),
                    dest,
                )));
            }
            Err(e)
                if e.kind() == io::ErrorKind::NotFound
                    || e.raw_os_error() == Some(libc::EINVAL) => {}
            Err(e) => return Err(e.into()),
        }

        if self.update && lexists(&self.target_path) {
            self.report_nobuild();
            Ok(Prepared::Source)
        } else {
            Err(GupError::Unbuildable(self.target_path.clone()))
        }
    }

    /// The job body: runs in a supervised child process (or inline when
    /// serial).
    pub fn build(&self, target: &Target) -> Result<()> {
        target.build_or_update(self.update)?;
        self.complete(Some(target))
    }

    /// Record this task as a dependency of the requesting parent target,
    /// along with every symlink on the path to it.
    pub fn complete(&self, target: Option<&Target>) -> Result<()> {
        let Some(parent) = &self.parent else {
            return Ok(());
        };
        let cwd = env::current_dir()?;
        let (links, final_path) = traverse_symlinks(&cwd, &self.target_path)?;
        let mtime = get_mtime(&final_path)?;

        let parent_state = TargetState::new(parent.clone());
        let dep = match target {
            Some(t) => Dep::File(FileDep::of_target(parent, &t.state, mtime)?),
            None => Dep::File(FileDep::relative_to_target(
                parent,
                mtime,
                None,
                &self.target_path,
            )),
        };
        parent_state.add_dependency(&dep)?;

        trace!("adding intermediate links: {:?}", links);
        for link in links {
            let dep = Dep::File(FileDep::relative_to_target(
                parent,
                get_mtime(&link)?,
                None,
                &link,
            ));
            parent_state.add_dependency(&dep)?;
        }
        Ok(())
    }

    /// Interpret a supervised child's exit status in the parent.
    pub fn handle_result(rv: i32) -> Result<()> {
        trace!("build process exited with status: {rv}");
        match rv {
            0 => Ok(()),
            ALREADY_LOGGED_STATUS => Err(GupError::AlreadyReported),
            n => Err(GupError::Safe(format!(
                "unknown error in child process - exit status {n}"
            ))),
        }
    }

    fn report_nobuild(&self) {
        if Invocation::get().is_root {
            info!("{}: up to date", self.target_path.display());
        } else {
            trace!("{}: up to date", self.target_path.display());
        }
    }
}

/// Queues buildable tasks and runs them through the jobserver.
#[derive(Debug, Default)]
pub struct TaskRunner {
    tasks: Vec<(Task, Target)>,
}

impl TaskRunner {
    pub fn new() -> TaskRunner {
        TaskRunner::default()
    }

    pub fn add(&mut self, task: Task, target: Target) {
        self.tasks.push((task, target));
    }

    pub fn run(&mut self, jobserver: &mut Jobserver) -> Result<()> {
        for (task, target) in self.tasks.drain(..) {
            jobserver.start_job(
                Box::new(move || task.build(&target)),
                Box::new(Task::handle_result),
            )?;
        }
        jobserver.wait_all()
    }
}
