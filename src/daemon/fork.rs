// Daemonizer: classic double fork, plus the launcher side that waits for the
// detached instance to come up before reporting success.

use std::io::Write;
use std::os::fd::AsRawFd;
use std::time::{Duration, Instant};

use super::{PidFile, PidState};
use crate::errors::SchedulerError;
use crate::models::InstancePaths;

const STARTUP_POLL: Duration = Duration::from_millis(100);

/// Which side of `daemonize` the caller ended up on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Detached {
    /// The original process. `child` is the intermediate child to reap.
    Launcher { child: libc::pid_t },
    /// The detached grandchild that should go on to run the instance.
    Daemon,
}

/// Detach from the controlling terminal.
///
/// Must run while the process is single-threaded: before any tokio runtime
/// or non-blocking log writer exists. The intermediate child exits inside
/// this call; only the launcher and the daemon return.
pub fn daemonize() -> Result<Detached, SchedulerError> {
    let _ = std::io::stdout().flush();
    let _ = std::io::stderr().flush();

    match unsafe { libc::fork() } {
        -1 => return Err(SchedulerError::Fork(std::io::Error::last_os_error())),
        0 => {}
        child => return Ok(Detached::Launcher { child }),
    }

    if unsafe { libc::setsid() } == -1 {
        return Err(SchedulerError::Fork(std::io::Error::last_os_error()));
    }

    match unsafe { libc::fork() } {
        -1 => return Err(SchedulerError::Fork(std::io::Error::last_os_error())),
        0 => {}
        // Session leader exits so the daemon can never reacquire a terminal.
        _ => unsafe { libc::_exit(0) },
    }

    std::env::set_current_dir("/").map_err(SchedulerError::Fork)?;
    unsafe {
        libc::umask(0o022);
    }

    let devnull = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/null")
        .map_err(SchedulerError::Fork)?;
    for target in [libc::STDIN_FILENO, libc::STDOUT_FILENO, libc::STDERR_FILENO] {
        if unsafe { libc::dup2(devnull.as_raw_fd(), target) } == -1 {
            return Err(SchedulerError::Fork(std::io::Error::last_os_error()));
        }
    }

    Ok(Detached::Daemon)
}

/// Launcher side: reap the intermediate child, then wait until the daemon
/// has written its PID file and bound its socket. Returns the daemon's PID.
pub fn await_daemon(
    child: libc::pid_t,
    paths: &InstancePaths,
    timeout: Duration,
) -> Result<u32, SchedulerError> {
    let mut status: libc::c_int = 0;
    if unsafe { libc::waitpid(child, &mut status, 0) } == -1 {
        return Err(SchedulerError::Fork(std::io::Error::last_os_error()));
    }
    if !libc::WIFEXITED(status) || libc::WEXITSTATUS(status) != 0 {
        return Err(SchedulerError::Fork(std::io::Error::other(format!(
            "intermediate child exited abnormally (wait status {})",
            status
        ))));
    }

    let pid_file = PidFile::new(paths.pid_file.clone());
    let deadline = Instant::now() + timeout;
    let mut seen = None;
    loop {
        match pid_file.state() {
            PidState::Alive(pid) if paths.socket.exists() => return Ok(pid),
            PidState::Alive(pid) => seen = Some(pid),
            // It claimed the PID file and then gave it up or died.
            _ => {
                if let Some(pid) = seen {
                    return Err(SchedulerError::Fork(std::io::Error::other(format!(
                        "Scheduler '{}' (PID {}) exited during startup; see {}",
                        paths.name,
                        pid,
                        paths.log_file.display()
                    ))));
                }
            }
        }
        if Instant::now() >= deadline {
            return Err(SchedulerError::Timeout(format!(
                "Scheduler '{}' did not come up within {}s; see {}",
                paths.name,
                timeout.as_secs(),
                paths.log_file.display()
            )));
        }
        std::thread::sleep(STARTUP_POLL);
    }
}
