//! Token-based concurrency limiter, interoperable with GNU Make.
//!
//! One token is one byte on a pipe. Three modes: serial (a single implicit
//! token), inherited (an fd pair advertised through `$MAKEFLAGS` by a parent
//! Make), and owned (a named pipe created by the root invocation, pre-filled
//! with N-1 tokens and advertised to children as `$GUP_JOBSERVER`).
//!
//! Jobs are forked child processes; the parent supervises them through a
//! pipe fd per job that becomes readable when the child exits.

use std::collections::HashMap;
use std::env;
use std::fs;
use std::io::Write;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use nix::errno::Errno;
use nix::fcntl::{fcntl, open, FcntlArg, FdFlag, OFlag};
use nix::sys::select::{select, FdSet};
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::sys::stat::Mode;
use nix::sys::time::TimeVal;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{alarm, fork, pipe, ForkResult, Pid};
use tracing::{debug, error, trace, warn};

use crate::ops::context::ENV_JOBSERVER;
use crate::ops::error::{GupError, Result, ALREADY_LOGGED_STATUS};

/// Runs in the forked child; its error (if any) is turned into an exit
/// status there.
pub type JobFn = Box<dyn FnOnce() -> Result<()>>;
/// Runs in the parent once the child has been reaped.
pub type DoneFn = Box<dyn FnOnce(i32) -> Result<()>>;

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_sigint(_: libc::c_int) {
    INTERRUPTED.store(true, Ordering::SeqCst);
}

extern "C" fn on_sigalrm(_: libc::c_int) {}

pub fn interrupted() -> bool {
    INTERRUPTED.load(Ordering::SeqCst)
}

/// Catch SIGINT so in-flight children can be drained before exiting.
pub fn install_sigint_handler() -> Result<()> {
    let action = SigAction::new(SigHandler::Handler(on_sigint), SaFlags::empty(), SigSet::empty());
    unsafe { sigaction(Signal::SIGINT, &action) }?;
    Ok(())
}

fn borrow_fd(fd: RawFd) -> BorrowedFd<'static> {
    // fds here outlive every borrow: they are owned by the pool or inherited
    // for the life of the process
    unsafe { BorrowedFd::borrow_raw(fd) }
}

struct Job {
    fd: OwnedFd,
    pid: Pid,
    done: DoneFn,
}

impl std::fmt::Debug for TokenPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenPool")
            .field("rfd", &self.rfd)
            .field("wfd", &self.wfd)
            .field("tokens", &self.tokens)
            .field("jobs", &self.jobs.len())
            .field("toplevel", &self.toplevel)
            .finish()
    }
}

pub struct TokenPool {
    rfd: RawFd,
    wfd: RawFd,
    /// Keeps fds we opened ourselves alive (empty for inherited pairs).
    owned: Vec<OwnedFd>,
    /// Tokens held by this process; never exceeds one for long.
    tokens: usize,
    jobs: HashMap<RawFd, Job>,
    /// Total token count when this process created the pipe.
    toplevel: Option<usize>,
}

impl TokenPool {
    fn new(rfd: RawFd, wfd: RawFd, owned: Vec<OwnedFd>, toplevel: Option<usize>) -> Result<TokenPool> {
        let mut pool = TokenPool {
            rfd,
            wfd,
            owned,
            tokens: 1,
            jobs: HashMap::new(),
            toplevel,
        };
        if let Some(total) = toplevel {
            pool.release(total - 1)?;
        }
        Ok(pool)
    }

    fn release(&mut self, n: usize) -> Result<()> {
        trace!("release({n})");
        self.tokens += n;
        if self.tokens > 1 {
            let tokens = vec![b't'; self.tokens - 1];
            write_all(self.wfd, &tokens)?;
            self.tokens = 1;
        }
        Ok(())
    }

    fn release_mine(&mut self) -> Result<()> {
        debug_assert!(self.tokens >= 1);
        write_all(self.wfd, b"t")?;
        self.tokens -= 1;
        Ok(())
    }

    /// Block until a job fd (and optionally the token fd) is readable, then
    /// reap every finished child.
    fn wait(&mut self, want_token: bool) -> Result<()> {
        loop {
            let mut readfds = FdSet::new();
            for fd in self.jobs.keys() {
                readfds.insert(borrow_fd(*fd));
            }
            if want_token {
                readfds.insert(borrow_fd(self.rfd));
            }
            match select(None, &mut readfds, None, None, None) {
                Ok(_) => {
                    let ready: Vec<RawFd> = self
                        .jobs
                        .keys()
                        .copied()
                        .filter(|fd| readfds.contains(borrow_fd(*fd)))
                        .collect();
                    for fd in ready {
                        let job = self.jobs.remove(&fd).expect("fd belongs to a job");
                        trace!("done: {:?}", job.pid);
                        self.release(1)?;
                        drop(job.fd);
                        let status = waitpid(job.pid, None)?;
                        let rv = match status {
                            WaitStatus::Exited(_, code) => code,
                            WaitStatus::Signaled(_, sig, _) => -(sig as i32),
                            _ => 1,
                        };
                        trace!("done: rv={rv}");
                        (job.done)(rv)?;
                    }
                    return Ok(());
                }
                Err(Errno::EINTR) => {
                    if interrupted() {
                        return Err(GupError::Interrupted);
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Ensure this process holds one token, blocking if necessary.
    fn get_token(&mut self, reason: &str) -> Result<()> {
        debug_assert!(self.tokens <= 1);
        loop {
            if self.tokens >= 1 {
                trace!("({reason}) using own token");
                return Ok(());
            }
            trace!("({reason}) waiting for tokens...");
            self.wait(true)?;
            if self.tokens >= 1 {
                return Ok(());
            }
            match self.try_read(1)? {
                None => {
                    return Err(GupError::Safe(
                        "unexpected EOF on jobserver pipe".to_string(),
                    ))
                }
                Some(bytes) if !bytes.is_empty() => {
                    self.tokens += 1;
                    trace!("({reason}) got a token");
                    return Ok(());
                }
                Some(_) => {}
            }
        }
    }

    /// Non-blocking read of up to `n` token bytes. The fd itself stays
    /// blocking for Make compatibility, so the read is guarded by a probing
    /// `select` and a one-second alarm against the race where a peer steals
    /// the byte between the probe and our read. `None` means EOF.
    fn try_read(&mut self, n: usize) -> Result<Option<Vec<u8>>> {
        let mut readfds = FdSet::new();
        readfds.insert(borrow_fd(self.rfd));
        let mut timeout = TimeVal::new(0, 0);
        if let Err(e) = select(None, &mut readfds, None, None, &mut timeout) {
            if e == Errno::EINTR {
                return Ok(Some(Vec::new()));
            }
            return Err(e.into());
        }
        if !readfds.contains(borrow_fd(self.rfd)) {
            return Ok(Some(Vec::new()));
        }

        let previous = set_alarm_handler()?;
        let _ = alarm::set(1);
        let mut buf = vec![0u8; n];
        let res = raw_read(self.rfd, &mut buf);
        let _ = alarm::cancel();
        restore_alarm_handler(previous)?;

        match res {
            Ok(0) => Ok(None),
            Ok(count) => {
                buf.truncate(count);
                Ok(Some(buf))
            }
            Err(e) if e.raw_os_error() == Some(libc::EAGAIN)
                || e.raw_os_error() == Some(libc::EINTR) =>
            {
                Ok(Some(Vec::new()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Fork a child to run `job`, consuming one token for its duration.
    fn start_job(&mut self, job: JobFn, done: DoneFn) -> Result<()> {
        self.get_token("build")?;
        debug_assert_eq!(self.tokens, 1);
        self.tokens -= 1;

        let (read_end, write_end) = pipe()?;
        match unsafe { fork() }? {
            ForkResult::Child => {
                drop(read_end);
                let code = run_job_child(job);
                let _ = std::io::stderr().flush();
                let _ = std::io::stdout().flush();
                drop(write_end);
                unsafe { libc::_exit(code) }
            }
            ForkResult::Parent { child } => {
                fcntl(read_end.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))?;
                drop(write_end);
                trace!("started job in pid {child}");
                self.jobs.insert(
                    read_end.as_raw_fd(),
                    Job {
                        fd: read_end,
                        pid: child,
                        done,
                    },
                );
                Ok(())
            }
        }
    }

    /// Wait for every outstanding job, then (at the toplevel) reclaim all
    /// tokens to assert none leaked.
    fn wait_all(&mut self) -> Result<()> {
        let mut failure: Option<GupError> = None;

        let drained: Result<()> = (|| {
            while !self.jobs.is_empty() {
                while self.tokens >= 1 {
                    self.release_mine()?;
                }
                trace!("wait_all: waiting");
                self.wait(false)?;
            }
            Ok(())
        })();
        if let Err(e) = drained {
            failure = Some(e);
        }

        self.get_token("self")?;
        if let Some(total) = self.toplevel {
            let mut remaining = total - 1;
            debug!("awaiting {remaining} free tokens");
            while remaining > 0 {
                let bytes = self.try_read(remaining)?.unwrap_or_default();
                remaining -= bytes.len();
                if bytes.is_empty() && remaining > 0 {
                    if self.jobs.is_empty() {
                        let leak =
                            GupError::Safe(format!("on exit: expected {remaining} more tokens"));
                        return Err(failure.unwrap_or(leak));
                    }
                    if let Err(e) = self.wait(false) {
                        failure.get_or_insert(e);
                    }
                }
            }
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn run_job_child(job: JobFn) -> i32 {
    match std::panic::catch_unwind(std::panic::AssertUnwindSafe(job)) {
        Ok(Ok(())) => 0,
        Ok(Err(GupError::AlreadyReported)) | Ok(Err(GupError::Interrupted)) => {
            ALREADY_LOGGED_STATUS
        }
        Ok(Err(GupError::Io(e))) => {
            error!("{e}");
            1
        }
        Ok(Err(e)) => {
            error!("{e}");
            ALREADY_LOGGED_STATUS
        }
        // the default panic hook has already printed a backtrace
        Err(_) => 1,
    }
}

fn raw_read(fd: RawFd, buf: &mut [u8]) -> std::io::Result<usize> {
    let rc = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
    if rc < 0 {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(rc as usize)
    }
}

fn write_all(fd: RawFd, mut buf: &[u8]) -> std::io::Result<()> {
    while !buf.is_empty() {
        let rc = unsafe { libc::write(fd, buf.as_ptr().cast(), buf.len()) };
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            return Err(err);
        }
        buf = &buf[rc as usize..];
    }
    Ok(())
}

fn set_alarm_handler() -> Result<SigAction> {
    let action = SigAction::new(
        SigHandler::Handler(on_sigalrm),
        SaFlags::empty(),
        SigSet::empty(),
    );
    Ok(unsafe { sigaction(Signal::SIGALRM, &action) }?)
}

fn restore_alarm_handler(previous: SigAction) -> Result<()> {
    unsafe { sigaction(Signal::SIGALRM, &previous) }?;
    Ok(())
}

/// The process-wide job limiter.
pub enum Jobserver {
    Serial,
    /// Fd pair inherited from a parent Make.
    Inherited(TokenPool),
    /// Named pipe, either created here (toplevel) or opened from
    /// `$GUP_JOBSERVER`.
    Named { pool: TokenPool, path: PathBuf },
}

impl std::fmt::Debug for Jobserver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Jobserver::Serial => f.write_str("Jobserver::Serial"),
            Jobserver::Inherited(p) => write!(f, "Jobserver::Inherited({p:?})"),
            Jobserver::Named { pool, path } => {
                write!(f, "Jobserver::Named({pool:?}, {})", path.display())
            }
        }
    }
}

impl Jobserver {
    /// Choose the jobserver for this invocation. With no `-j`, an inherited
    /// jobserver (gup's own, or Make's) is used when present; otherwise
    /// execution is serial. `-j N` creates a fresh named pipe with N tokens.
    pub fn setup(maxjobs: Option<usize>) -> Result<Jobserver> {
        trace!("setup_jobserver({maxjobs:?})");
        if let Some(n) = maxjobs {
            if n == 0 || n >= 1000 {
                return Err(GupError::Safe(format!("invalid number of jobs: {n}")));
            }
        }

        if maxjobs.is_none() {
            if let Some(found) = Self::discover()? {
                return Ok(found);
            }
        }

        match maxjobs.unwrap_or(1) {
            1 => {
                trace!("no need for a jobserver (--jobs=1)");
                env::set_var(ENV_JOBSERVER, "0");
                Ok(Jobserver::Serial)
            }
            n => {
                let path = create_named_pipe()?;
                let (rfd, wfd, owned) = open_fifo(&path)?;
                env::set_var(ENV_JOBSERVER, &path);
                debug!("new jobserver! {n}");
                Ok(Jobserver::Named {
                    pool: TokenPool::new(rfd, wfd, owned, Some(n))?,
                    path,
                })
            }
        }
    }

    fn discover() -> Result<Option<Jobserver>> {
        if let Ok(server) = env::var(ENV_JOBSERVER) {
            if server == "0" {
                return Ok(Some(Jobserver::Serial));
            }
            let path = PathBuf::from(server);
            let (rfd, wfd, owned) = open_fifo(&path)?;
            return Ok(Some(Jobserver::Named {
                pool: TokenPool::new(rfd, wfd, owned, None)?,
                path,
            }));
        }

        // use a Make jobserver, if present
        let flags = format!(" {} ", env::var("MAKEFLAGS").unwrap_or_default());
        for key in [" --jobserver-fds=", " --jobserver-auth="] {
            let Some(offset) = flags.find(key) else { continue };
            let arg = flags[offset + key.len()..]
                .split(' ')
                .next()
                .unwrap_or("");
            let (a, b) = arg.split_once(',').unwrap_or((arg, ""));
            let a: RawFd = a.parse().unwrap_or(0);
            let b: RawFd = b.parse().unwrap_or(0);
            if a <= 0 || b <= 0 {
                warn!("invalid --jobserver-fds: {arg:?}");
                return Ok(None);
            }
            for fd in [a, b] {
                if let Err(e) = fcntl(fd, FcntlArg::F_GETFL) {
                    debug!("--jobserver-fds error on fd {fd}: {e}");
                    warn!("broken --jobserver-fds from make; prefix your Makefile rule with a \"+\"");
                    return Ok(None);
                }
            }
            return Ok(Some(Jobserver::Inherited(TokenPool::new(
                a,
                b,
                Vec::new(),
                None,
            )?)));
        }
        Ok(None)
    }

    pub fn start_job(&mut self, job: JobFn, done: DoneFn) -> Result<()> {
        match self {
            Jobserver::Serial => {
                job()?;
                done(0)
            }
            Jobserver::Inherited(pool) | Jobserver::Named { pool, .. } => {
                pool.start_job(job, done)
            }
        }
    }

    pub fn wait_all(&mut self) -> Result<()> {
        match self {
            Jobserver::Serial => Ok(()),
            Jobserver::Inherited(pool) => pool.wait_all(),
            Jobserver::Named { pool, path } => {
                let result = pool.wait_all();
                let toplevel = pool.toplevel;
                pool.owned.clear();
                if toplevel.is_some() {
                    debug!("removing jobserver ({})", path.display());
                    let _ = fs::remove_file(&path);
                }
                result
            }
        }
    }
}

fn create_named_pipe() -> Result<PathBuf> {
    let path = env::temp_dir().join(format!("gup-job-{}", std::process::id()));
    let mode = Mode::S_IRUSR | Mode::S_IWUSR;
    match nix::unistd::mkfifo(&path, mode) {
        Ok(()) => {}
        Err(Errno::EEXIST) => {
            // a pipe from a dead process with our pid; reclaim it
            warn!("removing stale jobserver file: {}", path.display());
            fs::remove_file(&path)?;
            nix::unistd::mkfifo(&path, mode)?;
        }
        Err(e) => return Err(e.into()),
    }
    trace!("created jobserver at {}", path.display());
    Ok(path)
}

fn open_fifo(path: &Path) -> Result<(RawFd, RawFd, Vec<OwnedFd>)> {
    trace!("opening jobserver at {}", path.display());
    let rfd = open(path, OFlag::O_RDONLY | OFlag::O_NONBLOCK, Mode::empty())?;
    let wfd = match open(path, OFlag::O_WRONLY, Mode::empty()) {
        Ok(fd) => fd,
        Err(e) => {
            let _ = unsafe { OwnedFd::from_raw_fd(rfd) };
            return Err(e.into());
        }
    };
    let owned = vec![unsafe { OwnedFd::from_raw_fd(rfd) }, unsafe {
        OwnedFd::from_raw_fd(wfd)
    }];

    // clear the nonblocking flag once both ends are open
    let flags = OFlag::from_bits_truncate(fcntl(rfd, FcntlArg::F_GETFL)?);
    fcntl(rfd, FcntlArg::F_SETFL(flags & !OFlag::O_NONBLOCK))?;
    fcntl(rfd, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))?;
    fcntl(wfd, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))?;
    Ok((rfd, wfd, owned))
}
