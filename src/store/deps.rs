//! Per-target dependency records and their on-disk format.
//!
//! Metadata for target `dir/name` lives under `dir/.gup/`: `name.deps` holds
//! the committed record of the last successful build, `name.deps2` is the
//! append-only accumulator for a build in progress, and the matching `.lock`
//! files carry the advisory locks. `name.deps` is only ever replaced by an
//! atomic rename of a fully-written `name.deps2`.

use std::cell::OnceCell;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};

use sha1::{Digest, Sha1};
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::io::paths::{get_mtime, is_dir_lstat, lexists, relpath, rename_atomic};
use crate::ops::error::{GupError, Result};
use crate::store::lock::LockFile;
use crate::META_DIR;

pub const FORMAT_VERSION: u32 = 3;

/// One stored dependency record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dep {
    /// An input file the target consumed.
    File(FileDep),
    /// The build script that produced the target.
    Builder(FileDep),
    /// The target must be rebuilt on every run.
    Always,
    /// Content fingerprint declared by the build script.
    Checksum(String),
    /// The target's mtime immediately after a successful build.
    BuildTime(i64),
    /// The invocation that last built this target.
    RunId(String),
    /// The script was seen writing the target path directly.
    Clobbers,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDep {
    /// Stored lstat mtime in microseconds; `None` means the path must not
    /// exist (it was recorded via `--ifcreate`, or was absent at build time).
    pub mtime: Option<i64>,
    /// Checksum of the dependency's contents at record time, if the child
    /// target declared one.
    pub checksum: Option<String>,
    /// Path relative to the directory of the target that owns the record.
    pub path: PathBuf,
}

impl FileDep {
    /// A record for `path`, stored relative to `target`'s directory.
    pub fn relative_to_target(
        target: &Path,
        mtime: Option<i64>,
        checksum: Option<String>,
        path: &Path,
    ) -> FileDep {
        let base = target.parent().unwrap_or(Path::new("/"));
        FileDep {
            mtime,
            checksum,
            path: relpath(path, base),
        }
    }

    /// A record for a built child target, carrying the child's declared
    /// checksum (if any) so later runs can short-circuit on content equality.
    pub fn of_target(parent: &Path, child: &TargetState, mtime: Option<i64>) -> Result<FileDep> {
        let checksum = child.load_deps()?.and_then(|d| d.checksum);
        Ok(FileDep::relative_to_target(
            parent,
            mtime,
            checksum,
            child.path(),
        ))
    }
}

impl Dep {
    pub fn parse(line: &str) -> std::result::Result<Dep, String> {
        let mut fields = line.splitn(4, ' ');
        let tag = fields.next().unwrap_or("");
        let mut next = |what: &str| {
            fields
                .next()
                .ok_or_else(|| format!("missing {what} in record: {line:?}"))
        };
        match tag {
            "file:" | "builder:" => {
                let mtime = match next("mtime")? {
                    "-" => None,
                    v => Some(v.parse::<i64>().map_err(|_| format!("bad mtime: {v:?}"))?),
                };
                let checksum = match next("checksum")? {
                    "-" => None,
                    v => Some(v.to_string()),
                };
                let path = PathBuf::from(next("path")?);
                let dep = FileDep {
                    mtime,
                    checksum,
                    path,
                };
                Ok(if tag == "file:" {
                    Dep::File(dep)
                } else {
                    Dep::Builder(dep)
                })
            }
            "always:" => Ok(Dep::Always),
            "checksum:" => Ok(Dep::Checksum(next("value")?.to_string())),
            "built:" => {
                let v = next("mtime")?;
                Ok(Dep::BuildTime(
                    v.parse().map_err(|_| format!("bad mtime: {v:?}"))?,
                ))
            }
            "run:" => Ok(Dep::RunId(next("run id")?.to_string())),
            "clobbers:" => Ok(Dep::Clobbers),
            _ => Err(format!("unknown dependency line: {line:?}")),
        }
    }

    pub fn to_line(&self) -> Result<String> {
        let line = match self {
            Dep::File(d) => format!("file: {}", file_fields(d)),
            Dep::Builder(d) => format!("builder: {}", file_fields(d)),
            Dep::Always => "always:".to_string(),
            Dep::Checksum(c) => format!("checksum: {c}"),
            Dep::BuildTime(t) => format!("built: {t}"),
            Dep::RunId(r) => format!("run: {r}"),
            Dep::Clobbers => "clobbers:".to_string(),
        };
        if line.contains('\n') {
            return Err(GupError::Safe(format!(
                "dependency record contains a newline: {line:?}"
            )));
        }
        Ok(line)
    }
}

fn file_fields(d: &FileDep) -> String {
    format!(
        "{} {} {}",
        d.mtime.map_or_else(|| "-".to_string(), |m| m.to_string()),
        d.checksum.as_deref().unwrap_or("-"),
        d.path.display()
    )
}

#[derive(Debug, Error)]
pub enum DepsParseError {
    #[error("can't read format version {0:?}")]
    VersionMismatch(String),
    #[error("invalid deps file: {0}")]
    Invalid(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// The parsed dependency record of one target.
#[derive(Debug)]
pub struct Deps {
    /// The target the record belongs to.
    pub path: PathBuf,
    /// `file:`/`builder:`/`always:`/`built:` records, in stored order.
    pub rules: Vec<Dep>,
    pub checksum: Option<String>,
    pub run_id: Option<String>,
    pub clobbers: bool,
}

impl Deps {
    pub fn parse(target: &Path, reader: impl Read) -> std::result::Result<Deps, DepsParseError> {
        let mut lines = BufReader::new(reader).lines();
        let version_line = lines
            .next()
            .ok_or_else(|| DepsParseError::Invalid("empty file".into()))??;
        trace!("version_line: {version_line}");
        let version = version_line
            .strip_prefix("version: ")
            .ok_or_else(|| DepsParseError::Invalid("missing version header".into()))?;
        if version.parse::<u32>() != Ok(FORMAT_VERSION) {
            return Err(DepsParseError::VersionMismatch(version.to_string()));
        }

        let mut deps = Deps {
            path: target.to_path_buf(),
            rules: Vec::new(),
            checksum: None,
            run_id: None,
            clobbers: false,
        };
        for line in lines {
            let line = line?;
            match Dep::parse(line.trim_end()).map_err(DepsParseError::Invalid)? {
                Dep::Checksum(c) => {
                    if deps.checksum.replace(c).is_some() {
                        return Err(DepsParseError::Invalid("duplicate checksum:".into()));
                    }
                }
                Dep::RunId(r) => {
                    if deps.run_id.replace(r).is_some() {
                        return Err(DepsParseError::Invalid("duplicate run:".into()));
                    }
                }
                Dep::Clobbers => deps.clobbers = true,
                rule => deps.rules.push(rule),
            }
        }
        Ok(deps)
    }

    /// True when this record was written by the current invocation, i.e. the
    /// target has already been brought up to date in this run.
    pub fn already_built(&self, run_id: &str) -> bool {
        self.run_id.as_deref() == Some(run_id)
    }
}

/// Handle on the stored metadata of one target.
#[derive(Debug)]
pub struct TargetState {
    path: PathBuf,
    dep_lock: OnceCell<LockFile>,
}

impl TargetState {
    pub fn new(path: PathBuf) -> TargetState {
        TargetState {
            path,
            dep_lock: OnceCell::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Target names with metadata stored in `dir` (a `.gup` directory).
    pub fn built_targets(dir: &Path) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(dir)? {
            let name = entry?.file_name();
            if let Some(target) = name.to_string_lossy().strip_suffix(".deps") {
                names.push(target.to_string());
            }
        }
        Ok(names)
    }

    pub fn meta_path(&self, ext: &str) -> PathBuf {
        let base = self.path.parent().unwrap_or(Path::new("/"));
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        base.join(META_DIR).join(format!("{name}.{ext}"))
    }

    fn ensure_meta_path(&self, ext: &str) -> Result<PathBuf> {
        let p = self.meta_path(ext);
        if let Some(parent) = p.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(p)
    }

    fn dep_lock(&self) -> Result<&LockFile> {
        if self.dep_lock.get().is_none() {
            let path = self.ensure_meta_path("deps.lock")?;
            let _ = self.dep_lock.set(LockFile::open(&path)?);
        }
        Ok(self.dep_lock.get().expect("initialised above"))
    }

    /// Read the committed dependency record, if any. An unreadable or
    /// incompatible record is reported as absent, which makes the target
    /// dirty.
    pub fn load_deps(&self) -> Result<Option<Deps>> {
        let deps_path = self.meta_path("deps");
        if !lexists(&deps_path) {
            // don't bother taking the lock
            return Ok(None);
        }

        let _guard = self.dep_lock()?.shared()?;
        let file = match File::open(&deps_path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match Deps::parse(&self.path, file) {
            Ok(deps) => {
                trace!("loaded stored deps for {}", self.path.display());
                Ok(Some(deps))
            }
            Err(DepsParseError::VersionMismatch(_)) => {
                debug!(
                    "Ignoring stored dependencies from incompatible version: {}",
                    deps_path.display()
                );
                Ok(None)
            }
            Err(e) => {
                debug!(
                    "Error loading {}: {} (assuming dirty)",
                    deps_path.display(),
                    e
                );
                Ok(None)
            }
        }
    }

    /// Append one record to the in-progress accumulator. Called from child
    /// invocations while the owning build runs, so appends serialise on the
    /// accumulator's own lock.
    pub fn add_dependency(&self, dep: &Dep) -> Result<()> {
        debug!("add dep: {} -> {:?}", self.path.display(), dep);
        let lock = LockFile::open(&self.ensure_meta_path("deps2.lock")?)?;
        let _guard = lock.exclusive()?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.meta_path("deps2"))?;
        writeln!(file, "{}", dep.to_line()?)?;
        Ok(())
    }

    pub fn mark_clobbers(&self) -> Result<()> {
        self.add_dependency(&Dep::Clobbers)
    }

    /// Run a build under the target's exclusive lock.
    ///
    /// Re-checks the stored record once the lock is held: if another process
    /// completed the build for this run id in the meantime, returns `false`
    /// without invoking `do_build`. Otherwise the accumulator is seeded with
    /// the version, run and builder headers, `do_build` runs, and on success
    /// the accumulator (plus a final `built:` stamp) atomically replaces the
    /// committed record. On failure the accumulator is deleted.
    pub fn perform_build<F>(&self, script: &Path, run_id: &str, do_build: F) -> Result<bool>
    where
        F: FnOnce(Option<&Deps>) -> Result<()>,
    {
        let lock = self.dep_lock()?;
        let _guard = lock.exclusive()?;

        let deps = self.load_deps()?;
        if let Some(deps) = &deps {
            if deps.already_built(run_id) {
                trace!(
                    "{} was completed by a concurrent process",
                    self.path.display()
                );
                return Ok(false);
            }
        }

        let builder_dep = Dep::Builder(FileDep {
            mtime: get_mtime(script)?,
            checksum: None,
            path: relpath(script, self.path.parent().unwrap_or(Path::new("/"))),
        });
        trace!("created dep {:?} from builder {}", builder_dep, script.display());

        let temp = self.ensure_meta_path("deps2")?;
        {
            let mut file = File::create(&temp)?;
            writeln!(file, "version: {FORMAT_VERSION}")?;
            writeln!(file, "{}", Dep::RunId(run_id.to_string()).to_line()?)?;
            writeln!(file, "{}", builder_dep.to_line()?)?;
        }

        match do_build(deps.as_ref()) {
            Err(e) => {
                let _ = fs::remove_file(&temp);
                Err(e)
            }
            Ok(()) => {
                // always track the build time
                if let Some(built) = get_mtime(&self.path)? {
                    let mut file = OpenOptions::new().append(true).open(&temp)?;
                    writeln!(file, "{}", Dep::BuildTime(built).to_line()?)?;
                }
                rename_atomic(&temp, &self.meta_path("deps"))?;
                Ok(true)
            }
        }
    }
}

/// SHA-1 of everything readable from `reader`, as lowercase hex.
pub fn checksum_stream(mut reader: impl Read) -> Result<String> {
    let mut hasher = Sha1::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// SHA-1 of the concatenated contents of `files`, in argument order.
pub fn checksum_files<P: AsRef<Path>>(files: &[P]) -> Result<String> {
    let mut hasher = Sha1::new();
    let mut buf = [0u8; 8192];
    for path in files {
        let mut file = File::open(path.as_ref())?;
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Context threaded through one target's dirtiness walk.
pub struct DirtyCheck<'a> {
    /// Directory containing the target; stored paths are relative to it.
    pub base: &'a Path,
    /// The current resolver's script path, relative to `base`.
    pub builder_path: &'a Path,
    /// Absolute path of the target being checked.
    pub target: &'a Path,
    /// Bring a child path up to date; returns whether it was (or would be)
    /// rebuilt. Memoised by the caller so each child runs at most once.
    pub build_child: &'a mut dyn FnMut(&Path) -> Result<bool>,
}

impl std::fmt::Debug for DirtyCheck<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirtyCheck")
            .field("base", &self.base)
            .field("builder_path", &self.builder_path)
            .field("target", &self.target)
            .finish_non_exhaustive()
    }
}

impl Deps {
    /// Whether the target needs rebuilding, per its stored records. Child
    /// targets are rebuilt (through `ctx.build_child`) as needed to answer
    /// the question.
    pub fn is_dirty(&self, ctx: &mut DirtyCheck) -> Result<bool> {
        if !lexists(&self.path) {
            debug!("DIRTY: {} (target does not exist)", self.path.display());
            return Ok(true);
        }
        for rule in &self.rules {
            if rule.is_dirty(ctx)? {
                trace!("DIRTY: {} (from rule {:?})", self.path.display(), rule);
                return Ok(true);
            }
        }
        Ok(false)
    }
}

impl Dep {
    fn is_dirty(&self, ctx: &mut DirtyCheck) -> Result<bool> {
        match self {
            Dep::Always => {
                debug!("DIRTY: always rebuild");
                Ok(true)
            }
            Dep::BuildTime(stored) => {
                let current = get_mtime(ctx.target)?;
                if current == Some(*stored) {
                    return Ok(false);
                }
                // directories are modified externally for various reasons,
                // not worth warning about
                if is_dir_lstat(ctx.target) {
                    debug!(
                        "{} was externally modified - rebuilding",
                        ctx.target.display()
                    );
                } else {
                    warn!(
                        "{} was externally modified - rebuilding",
                        ctx.target.display()
                    );
                }
                Ok(true)
            }
            Dep::Builder(dep) => {
                debug_assert!(!dep.path.is_absolute());
                if ctx.builder_path != dep.path {
                    debug!(
                        "DIRTY: builder changed from {} -> {}",
                        dep.path.display(),
                        ctx.builder_path.display()
                    );
                    return Ok(true);
                }
                dep.file_is_dirty(ctx)
            }
            Dep::File(dep) => dep.file_is_dirty(ctx),
            // metadata records, extracted at parse time
            Dep::Checksum(_) | Dep::RunId(_) | Dep::Clobbers => Ok(false),
        }
    }
}

impl FileDep {
    fn file_is_dirty(&self, ctx: &mut DirtyCheck) -> Result<bool> {
        let full = ctx.base.join(&self.path);
        let current = get_mtime(&full)?;

        // recorded as "must not exist"
        if self.mtime.is_none() {
            if current.is_some() {
                debug!("DIRTY: {} (created since last build)", self.path.display());
                return Ok(true);
            }
            return Ok(false);
        }

        // The dependency may itself be a target: give it the chance to
        // rebuild before judging our stored record against it. This is what
        // propagates staleness through chains whose intermediate files are
        // untouched on disk.
        (ctx.build_child)(&full)?;

        let current = get_mtime(&full)?;
        if current == self.mtime {
            return Ok(false);
        }
        if let Some(stored) = &self.checksum {
            let child = TargetState::new(full.clone()).load_deps()?;
            let child_checksum = child.and_then(|d| d.checksum);
            if child_checksum.as_deref() == Some(stored.as_str()) {
                trace!("{}: checksum unchanged", self.path.display());
                return Ok(false);
            }
            debug!(
                "DIRTY: {} (stored checksum is {}, current is {:?})",
                self.path.display(),
                stored,
                child_checksum
            );
            return Ok(true);
        }
        debug!(
            "DIRTY: {} (stored mtime is {:?}, current is {:?})",
            self.path.display(),
            self.mtime,
            current
        );
        Ok(true)
    }
}
