//! CLI integration tests using assert_cmd.
//!
//! These tests invoke the actual `ithaca-scheduler` and `ithaca-ctl`
//! binaries. Every test uses its own temp runtime dir and config dir, so
//! instances never collide with each other or with a real installation.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

#[allow(deprecated)]
fn scheduler_cmd(env: &TestEnv) -> Command {
    let mut cmd = Command::cargo_bin("ithaca-scheduler").expect("binary should exist");
    env.apply(&mut cmd);
    cmd
}

#[allow(deprecated)]
fn ctl_cmd(env: &TestEnv) -> Command {
    let mut cmd = Command::cargo_bin("ithaca-ctl").expect("binary should exist");
    env.apply(&mut cmd);
    cmd
}

struct TestEnv {
    tmp: TempDir,
}

impl TestEnv {
    fn new() -> Self {
        let tmp = TempDir::new().expect("create temp dir");
        std::fs::write(tmp.path().join("config.json"), "{}").expect("write config");
        Self { tmp }
    }

    fn dir(&self) -> &Path {
        self.tmp.path()
    }

    fn apply(&self, cmd: &mut Command) {
        cmd.env("ITHACA_CONFIG_DIR", self.dir())
            .env("ITHACA_RUNTIME_DIR", self.dir())
            .env_remove("RUST_LOG");
    }

    fn pid_file(&self, name: &str) -> PathBuf {
        self.dir().join(format!("ithaca_scheduler_{}.pid", name))
    }

    fn socket(&self, name: &str) -> PathBuf {
        self.dir().join(format!("ithaca_scheduler_{}.sock", name))
    }

    fn status_file(&self, name: &str) -> PathBuf {
        self.dir().join(format!("ithaca_scheduler_{}_status.json", name))
    }

    fn read_pid(&self, name: &str) -> Option<i32> {
        std::fs::read_to_string(self.pid_file(name))
            .ok()?
            .trim()
            .parse()
            .ok()
    }

    /// Start a daemon instance and return its PID.
    fn launch_daemon(&self, name: &str) -> i32 {
        scheduler_cmd(self)
            .args(["--cmd", "true", "--interval", "60", "--name", name])
            .assert()
            .success()
            .stdout(predicate::str::contains(format!(
                "Scheduler '{}' started as daemon with PID",
                name
            )));
        self.read_pid(name).expect("daemon wrote its PID file")
    }

    /// Best-effort cleanup so a failed assertion does not leak a daemon.
    fn kill_leftover(&self, name: &str) {
        if let Some(pid) = self.read_pid(name) {
            unsafe {
                libc::kill(pid, libc::SIGKILL);
            }
        }
    }
}

fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    cond()
}

// ---------------------------------------------------------------------------
// Help and version
// ---------------------------------------------------------------------------

#[test]
fn test_version_flag() {
    let env = TestEnv::new();
    scheduler_cmd(&env)
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("0.1.0"));
    ctl_cmd(&env)
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("0.1.0"));
}

#[test]
fn test_scheduler_help_shows_options() {
    let env = TestEnv::new();
    scheduler_cmd(&env)
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Ithaca Scheduler"))
        .stdout(predicate::str::contains("--cmd"))
        .stdout(predicate::str::contains("--interval"))
        .stdout(predicate::str::contains("--name"))
        .stdout(predicate::str::contains("--foreground"));
}

#[test]
fn test_ctl_help_lists_subcommands() {
    let env = TestEnv::new();
    ctl_cmd(&env)
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("status"))
        .stdout(predicate::str::contains("stop"))
        .stdout(predicate::str::contains("pause"))
        .stdout(predicate::str::contains("resume"))
        .stdout(predicate::str::contains("interval"))
        .stdout(predicate::str::contains("kill"));
}

#[test]
fn test_scheduler_rejects_zero_interval() {
    let env = TestEnv::new();
    scheduler_cmd(&env)
        .args(["--cmd", "true", "--interval", "0", "--foreground"])
        .assert()
        .failure();
}

// ---------------------------------------------------------------------------
// Controller against a missing instance
// ---------------------------------------------------------------------------

#[test]
fn test_ctl_status_not_running() {
    let env = TestEnv::new();
    ctl_cmd(&env)
        .args(["status", "--name", "ghost"])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("Scheduler 'ghost' is not running"));
}

#[test]
fn test_ctl_commands_not_running() {
    let env = TestEnv::new();
    for args in [
        vec!["stop"],
        vec!["pause"],
        vec!["resume"],
        vec!["interval", "5"],
    ] {
        ctl_cmd(&env)
            .args(&args)
            .args(["-n", "ghost"])
            .assert()
            .failure()
            .code(1)
            .stderr(predicate::str::contains("is not running"));
    }
}

#[test]
fn test_ctl_kill_without_pid_file() {
    let env = TestEnv::new();
    ctl_cmd(&env)
        .args(["kill", "-n", "ghost"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("PID file not found"));
}

#[test]
fn test_ctl_kill_removes_stale_pid_file() {
    let env = TestEnv::new();
    std::fs::write(env.pid_file("stale"), "4000000").expect("write stale PID");

    ctl_cmd(&env)
        .args(["kill", "-n", "stale"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("stale PID file"));
    assert!(!env.pid_file("stale").exists());
}

// ---------------------------------------------------------------------------
// Foreground mode
// ---------------------------------------------------------------------------

#[test]
#[allow(deprecated)]
fn test_foreground_sigterm_cleans_up() {
    let env = TestEnv::new();
    let child = std::process::Command::new(assert_cmd::cargo::cargo_bin("ithaca-scheduler"))
        .args(["--cmd", "true", "--interval", "1", "-n", "fg", "--foreground"])
        .env("ITHACA_CONFIG_DIR", env.dir())
        .env("ITHACA_RUNTIME_DIR", env.dir())
        .env_remove("RUST_LOG")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .expect("spawn foreground scheduler");

    assert!(
        wait_until(Duration::from_secs(10), || env.socket("fg").exists()),
        "socket should appear"
    );
    assert_eq!(env.read_pid("fg"), Some(child.id() as i32));

    ctl_cmd(&env)
        .args(["status", "-n", "fg"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Running: true"))
        .stdout(predicate::str::contains("Mode: foreground"));

    unsafe {
        libc::kill(child.id() as i32, libc::SIGTERM);
    }
    let output = child.wait_with_output().expect("wait for scheduler");
    assert!(output.status.success(), "clean stop exits 0, got {:?}", output.status);
    let logs = String::from_utf8_lossy(&output.stderr);
    assert!(
        logs.contains(&format!(
            "Loaded config from: {}",
            env.dir().join("config.json").display()
        )),
        "config source should be logged, got: {}",
        logs
    );

    assert!(!env.socket("fg").exists(), "socket removed after SIGTERM");
    assert!(!env.pid_file("fg").exists(), "PID file removed after SIGTERM");
    let snapshot = std::fs::read_to_string(env.status_file("fg")).expect("status file kept");
    assert!(snapshot.contains("\"running\": false"), "got: {}", snapshot);
}

// ---------------------------------------------------------------------------
// Daemon mode
// ---------------------------------------------------------------------------

#[test]
fn test_daemon_lifecycle_via_ctl() {
    let env = TestEnv::new();
    let pid = env.launch_daemon("dm");
    assert_ne!(pid as u32, std::process::id());
    assert!(env.socket("dm").exists());

    ctl_cmd(&env)
        .args(["status", "-n", "dm", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"daemon_mode\": true"));

    ctl_cmd(&env)
        .args(["pause", "-n", "dm"])
        .assert()
        .success()
        .stdout("Scheduler paused\n");
    ctl_cmd(&env)
        .args(["interval", "7", "-n", "dm"])
        .assert()
        .success()
        .stdout("Interval changed to 7 seconds\n");
    ctl_cmd(&env)
        .args(["status", "-n", "dm"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Paused: true"))
        .stdout(predicate::str::contains("Interval: 7 seconds"));
    ctl_cmd(&env)
        .args(["resume", "-n", "dm"])
        .assert()
        .success()
        .stdout("Scheduler resumed\n");

    ctl_cmd(&env)
        .args(["stop", "-n", "dm"])
        .assert()
        .success()
        .stdout("Scheduler stopped\n");

    let stopped = wait_until(Duration::from_secs(5), || {
        !env.pid_file("dm").exists() && !env.socket("dm").exists()
    });
    if !stopped {
        env.kill_leftover("dm");
    }
    assert!(stopped, "daemon should remove its files after stop");
    assert!(
        env.dir().join("ithaca_scheduler_dm.log").exists(),
        "daemon logs to a file"
    );
}

#[test]
fn test_second_start_reports_already_running() {
    let env = TestEnv::new();
    let pid = env.launch_daemon("dup");

    scheduler_cmd(&env)
        .args(["--cmd", "true", "--name", "dup"])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("already running"))
        .stderr(predicate::str::contains(pid.to_string()));

    ctl_cmd(&env).args(["stop", "-n", "dup"]).assert().success();
    let stopped = wait_until(Duration::from_secs(5), || !env.pid_file("dup").exists());
    if !stopped {
        env.kill_leftover("dup");
    }
    assert!(stopped);
}

#[test]
fn test_stale_pid_file_does_not_block_start() {
    let env = TestEnv::new();
    std::fs::write(env.pid_file("stale"), "4000000").expect("write stale PID");

    let pid = env.launch_daemon("stale");
    assert_ne!(pid, 4_000_000);

    ctl_cmd(&env).args(["stop", "-n", "stale"]).assert().success();
    let stopped = wait_until(Duration::from_secs(5), || !env.pid_file("stale").exists());
    if !stopped {
        env.kill_leftover("stale");
    }
    assert!(stopped);
}

#[test]
fn test_ctl_kill_sends_sigterm() {
    let env = TestEnv::new();
    let pid = env.launch_daemon("kt");

    ctl_cmd(&env)
        .args(["kill", "-n", "kt"])
        .assert()
        .success()
        .stdout(predicate::str::contains(format!("Sent SIGTERM to scheduler 'kt' (PID {})", pid)));

    let stopped = wait_until(Duration::from_secs(5), || {
        !env.pid_file("kt").exists() && !env.socket("kt").exists()
    });
    if !stopped {
        env.kill_leftover("kt");
    }
    assert!(stopped, "SIGTERM goes through the normal cleanup");
}

#[test]
fn test_ctl_kill_force_removes_files() {
    let env = TestEnv::new();
    env.launch_daemon("kf");

    ctl_cmd(&env)
        .args(["kill", "--force", "-n", "kf"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Sent SIGKILL"));

    assert!(!env.pid_file("kf").exists());
    assert!(!env.socket("kf").exists());

    ctl_cmd(&env)
        .args(["stop", "-n", "kf"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("is not running"));
}
