//! gup - a recursive, user-extensible build tool

use clap::Parser;
use tracing_subscriber::EnvFilter;

use gup::cmd;
use gup::cmd::build::BuildOptions;
use gup::cmd::clean::CleanOptions;
use gup::ops::context::{self, Invocation, Overrides};
use gup::ops::error::{GupError, Result};

#[derive(Parser, Debug)]
#[command(name = "gup")]
#[command(version, about = "gup - a recursive, user-extensible build tool")]
#[command(after_help = "\
Actions (if present, the action must be the only action given):
  --clean      Clean any gup-built targets
  --buildable  Check if a target is buildable
  --dirty      Check if one or more targets are out of date

Actions which can only be called from a build script:
  --always     Mark this target as always-dirty
  --leave      Mark this target as fresh, preventing removal
  --ifcreate   Rebuild the current target if the given file(s) are created
  --contents   Checksum the contents of a file (or stdin)")]
struct Cli {
    /// Only rebuild stale targets
    #[arg(short = 'u', long = "update", visible_alias = "ifchange")]
    update: bool,

    /// Number of concurrent jobs to run
    #[arg(short = 'j', long = "jobs")]
    jobs: Option<usize>,

    /// Trace build script invocations (also sets $GUP_XTRACE=1)
    #[arg(short = 'x', long = "trace")]
    trace: bool,

    /// Keep temporary output files on failure
    #[arg(long = "keep-failed")]
    keep_failed: bool,

    /// Clean any gup-built targets
    #[arg(long, conflicts_with_all = ["update", "jobs"])]
    clean: bool,

    /// Mark this target as always-dirty
    #[arg(long)]
    always: bool,

    /// Mark this target as fresh, preventing removal
    #[arg(long)]
    leave: bool,

    /// Rebuild the current target if the given file(s) are created
    #[arg(long)]
    ifcreate: bool,

    /// Checksum the contents of the given files (or stdin)
    #[arg(long)]
    contents: bool,

    /// Check if a target is buildable
    #[arg(long)]
    buildable: bool,

    /// Check if one or more targets are out of date
    #[arg(long)]
    dirty: bool,

    /// List supported features
    #[arg(long)]
    features: bool,

    /// (--clean) Just print files that would be removed
    #[arg(short = 'n', long = "dry-run")]
    dry_run: bool,

    /// (--clean) Actually remove files
    #[arg(short = 'f', long = "force")]
    force: bool,

    /// (--clean) Ask for confirmation before removing files
    #[arg(short = 'i', long = "interactive")]
    interactive: bool,

    /// (--clean) Remove .gup metadata directories, but leave targets
    #[arg(short = 'm', long = "metadata")]
    metadata: bool,

    /// Decrease verbosity
    #[arg(short = 'q', long = "quiet", action = clap::ArgAction::Count)]
    quiet: u8,

    /// Increase verbosity
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    verbose: u8,

    #[arg(value_name = "TARGET")]
    targets: Vec<String>,
}

impl Cli {
    fn is_action(&self) -> bool {
        self.clean
            || self.always
            || self.leave
            || self.ifcreate
            || self.contents
            || self.buildable
            || self.dirty
            || self.features
    }
}

fn main() {
    let cli = Cli::parse();

    let base_verbosity = if cli.is_action() {
        0
    } else {
        context::default_verbosity()
    };
    let verbosity = base_verbosity + i32::from(cli.verbose) - i32::from(cli.quiet);
    init_logging(verbosity);

    std::process::exit(match run(&cli, verbosity) {
        Ok(code) => code,
        Err(GupError::AlreadyReported) | Err(GupError::Interrupted) => 2,
        Err(e) => {
            tracing::error!("{e}");
            2
        }
    });
}

fn init_logging(verbosity: i32) {
    let level = match verbosity {
        v if v < 0 => "gup=error",
        0 => "gup=info",
        1 => "gup=debug",
        _ => "gup=trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(level))
        .with_writer(std::io::stderr)
        .with_target(false)
        .without_time()
        .init();
}

fn run(cli: &Cli, verbosity: i32) -> Result<i32> {
    Invocation::init(Overrides {
        verbosity,
        xtrace: cli.trace,
        keep_failed: cli.keep_failed,
    })?;

    // trailing separators would confuse basename-derived metadata paths
    let targets: Vec<String> = cli
        .targets
        .iter()
        .map(|t| t.trim_end_matches('/').to_string())
        .collect();

    if cli.clean {
        cmd::clean::clean(&CleanOptions {
            force: cli.force,
            dry_run: cli.dry_run,
            interactive: cli.interactive,
            metadata_only: cli.metadata,
            dirs: targets,
        })?;
        return Ok(0);
    }
    if cli.always {
        expect_no_args(&targets, "--always")?;
        cmd::mark::always()?;
        return Ok(0);
    }
    if cli.leave {
        expect_no_args(&targets, "--leave")?;
        cmd::mark::leave()?;
        return Ok(0);
    }
    if cli.ifcreate {
        if targets.is_empty() {
            return Err(GupError::Safe(
                "--ifcreate: at least one file expected".to_string(),
            ));
        }
        cmd::mark::ifcreate(&targets)?;
        return Ok(0);
    }
    if cli.contents {
        cmd::mark::contents(&targets)?;
        return Ok(0);
    }
    if cli.buildable {
        if targets.len() != 1 {
            return Err(GupError::Safe(
                "--buildable: exactly one argument expected".to_string(),
            ));
        }
        return cmd::query::buildable(&targets[0]);
    }
    if cli.dirty {
        if targets.is_empty() {
            return Err(GupError::Safe(
                "--dirty: at least one argument expected".to_string(),
            ));
        }
        return cmd::query::dirty(&targets);
    }
    if cli.features {
        expect_no_args(&targets, "--features")?;
        return Ok(cmd::query::features());
    }

    cmd::build::build(&BuildOptions {
        update: cli.update,
        jobs: cli.jobs,
        targets,
    })?;
    Ok(0)
}

fn expect_no_args(targets: &[String], action: &str) -> Result<()> {
    if targets.is_empty() {
        Ok(())
    } else {
        Err(GupError::Safe(format!("{action}: no arguments expected")))
    }
}
