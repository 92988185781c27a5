//! Parallel execution through the jobserver: throughput and the
//! once-per-run guarantee for shared dependencies.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::process::Command;
use std::time::Instant;

use tempfile::TempDir;

struct TestContext {
    dir: TempDir,
}

impl TestContext {
    fn new() -> Self {
        Self {
            dir: TempDir::new().expect("failed to create temp dir"),
        }
    }

    fn path(&self, rel: &str) -> PathBuf {
        self.dir.path().join(rel)
    }

    fn write(&self, rel: &str, contents: &str) {
        fs::write(self.path(rel), contents).expect("failed to write file");
    }

    fn write_script(&self, rel: &str, body: &str) {
        self.write(rel, &format!("#!/bin/sh\nset -e\n{body}\n"));
        let path = self.path(rel);
        let mut perms = fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&path, perms).unwrap();
    }

    fn read(&self, rel: &str) -> String {
        fs::read_to_string(self.path(rel)).expect("failed to read file")
    }

    fn gup(&self) -> Command {
        let mut cmd = Command::new(env!("CARGO_BIN_EXE_gup"));
        cmd.current_dir(self.dir.path());
        for var in [
            "GUP_ROOT",
            "GUP_RUNID",
            "GUP_TARGET",
            "GUP_JOBSERVER",
            "GUP_INDENT",
            "GUP_IN_PATH",
            "GUP_VERBOSE",
            "GUP_XTRACE",
            "GUP_KEEP_FAILED",
            "MAKEFLAGS",
        ] {
            cmd.env_remove(var);
        }
        cmd
    }
}

#[test]
fn parallel_steps_share_one_counter_build() {
    let ctx = TestContext::new();

    // refuses to run twice at once, and counts its invocations
    ctx.write_script(
        "counter.gup",
        r#"if [ -e running ]; then echo "concurrent counter build" >&2; exit 1; fi
touch running
sleep 0.3
rm running
n="$(cat count 2>/dev/null || echo 0)"
expr "$n" + 1 > count
echo done > "$1""#,
    );
    ctx.write_script(
        "step.gup",
        r#"gup -u counter
sleep 0.7
echo "$2" > "$1""#,
    );
    ctx.write(
        "Gupfile",
        "step.gup:\n\tstep1\n\tstep2\n\tstep3\n\tstep4\n\tstep5\n\tstep6\n",
    );

    let started = Instant::now();
    let child = ctx
        .gup()
        .args([
            "-u", "-j", "6", "step1", "step2", "step3", "step4", "step5", "step6",
        ])
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .spawn()
        .expect("failed to run gup");
    let pid = child.id();
    let out = child.wait_with_output().expect("failed to wait for gup");
    let elapsed = started.elapsed();
    assert!(
        out.status.success(),
        "parallel build failed: {}",
        String::from_utf8_lossy(&out.stderr)
    );

    for step in ["step1", "step2", "step3", "step4", "step5", "step6"] {
        assert_eq!(ctx.read(step).trim(), step);
    }
    assert_eq!(ctx.read("count").trim(), "1", "counter must build exactly once");

    // six serialised steps would take > 4.2s; parallel execution stays well
    // under that even on a slow machine
    assert!(
        elapsed.as_secs_f64() < 3.5,
        "parallel build took {elapsed:?}"
    );

    // the jobserver pipe is removed on clean shutdown
    assert!(!std::env::temp_dir().join(format!("gup-job-{pid}")).exists());
}

#[test]
fn second_invocation_in_the_same_run_is_a_no_op() {
    let ctx = TestContext::new();
    ctx.write_script(
        "shared.gup",
        r#"n="$(cat count 2>/dev/null || echo 0)"
expr "$n" + 1 > count
echo ok > "$1""#,
    );
    ctx.write_script("one.gup", "gup -u shared\ncat shared > \"$1\"");
    ctx.write_script("two.gup", "gup -u shared\ncat shared > \"$1\"");

    let out = ctx
        .gup()
        .args(["-u", "-j", "2", "one", "two"])
        .output()
        .expect("failed to run gup");
    assert!(
        out.status.success(),
        "build failed: {}",
        String::from_utf8_lossy(&out.stderr)
    );
    assert_eq!(ctx.read("count").trim(), "1");
    assert_eq!(ctx.read("one"), "ok\n");
    assert_eq!(ctx.read("two"), "ok\n");
}

#[test]
fn one_failing_job_fails_the_whole_run() {
    let ctx = TestContext::new();
    ctx.write_script("good.gup", "echo ok > \"$1\"");
    ctx.write_script("bad.gup", "exit 9");

    let out = ctx
        .gup()
        .args(["-u", "-j", "2", "good", "bad"])
        .output()
        .expect("failed to run gup");
    assert_eq!(out.status.code(), Some(2));
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("Target `bad` failed"), "stderr: {stderr}");
}
