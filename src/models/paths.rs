use std::path::{Path, PathBuf};

use crate::errors::SchedulerError;

/// Longest socket path accepted. `sockaddr_un.sun_path` is 104 bytes on
/// macOS/BSD and 108 on Linux; take the smaller so names are portable.
const MAX_SOCKET_PATH_BYTES: usize = 104;

/// Every well-known file belonging to one scheduler instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstancePaths {
    pub name: String,
    pub pid_file: PathBuf,
    pub status_file: PathBuf,
    pub socket: PathBuf,
    pub log_file: PathBuf,
}

impl InstancePaths {
    /// Derive the paths for `name` under `runtime_dir`, logging into `log_dir`.
    pub fn new(
        runtime_dir: &Path,
        log_dir: &Path,
        prefix: &str,
        name: &str,
    ) -> Result<Self, SchedulerError> {
        validate_name(name)?;

        let stem = format!("{}_{}", prefix, name);
        let paths = Self {
            name: name.to_string(),
            pid_file: runtime_dir.join(format!("{stem}.pid")),
            status_file: runtime_dir.join(format!("{stem}_status.json")),
            socket: runtime_dir.join(format!("{stem}.sock")),
            log_file: log_dir.join(format!("{stem}.log")),
        };

        let socket_len = paths.socket.as_os_str().len();
        if socket_len > MAX_SOCKET_PATH_BYTES {
            return Err(SchedulerError::Validation(format!(
                "Socket path {} is {} bytes; the limit is {}. Use a shorter name or runtime dir.",
                paths.socket.display(),
                socket_len,
                MAX_SOCKET_PATH_BYTES
            )));
        }

        Ok(paths)
    }
}

/// Instance names end up inside file names, so keep them to a safe alphabet.
pub fn validate_name(name: &str) -> Result<(), SchedulerError> {
    if name.is_empty() {
        return Err(SchedulerError::Validation(
            "Scheduler name must not be empty".to_string(),
        ));
    }
    if let Some(bad) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
    {
        return Err(SchedulerError::Validation(format!(
            "Scheduler name '{}' contains invalid character '{}'",
            name, bad
        )));
    }
    if name == "." || name == ".." {
        return Err(SchedulerError::Validation(format!(
            "Scheduler name '{}' is reserved",
            name
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths_are_derived_from_name() {
        let dir = Path::new("/tmp");
        let paths = InstancePaths::new(dir, dir, "ithaca_scheduler", "nightly").expect("paths");
        assert_eq!(paths.pid_file, PathBuf::from("/tmp/ithaca_scheduler_nightly.pid"));
        assert_eq!(
            paths.status_file,
            PathBuf::from("/tmp/ithaca_scheduler_nightly_status.json")
        );
        assert_eq!(paths.socket, PathBuf::from("/tmp/ithaca_scheduler_nightly.sock"));
        assert_eq!(paths.log_file, PathBuf::from("/tmp/ithaca_scheduler_nightly.log"));
    }

    #[test]
    fn test_log_dir_is_independent() {
        let paths = InstancePaths::new(
            Path::new("/run"),
            Path::new("/var/log"),
            "p",
            "a",
        )
        .expect("paths");
        assert_eq!(paths.log_file, PathBuf::from("/var/log/p_a.log"));
        assert_eq!(paths.socket, PathBuf::from("/run/p_a.sock"));
    }

    #[test]
    fn test_distinct_names_do_not_collide() {
        let dir = Path::new("/tmp");
        let a = InstancePaths::new(dir, dir, "p", "a").expect("a");
        let b = InstancePaths::new(dir, dir, "p", "b").expect("b");
        assert_ne!(a.socket, b.socket);
        assert_ne!(a.pid_file, b.pid_file);
        assert_ne!(a.status_file, b.status_file);
    }

    #[test]
    fn test_rejects_empty_and_path_like_names() {
        let dir = Path::new("/tmp");
        for name in ["", "a/b", "../x", "..", "has space", "semi;colon"] {
            let result = InstancePaths::new(dir, dir, "p", name);
            assert!(
                matches!(result, Err(SchedulerError::Validation(_))),
                "name {:?} should be rejected",
                name
            );
        }
    }

    #[test]
    fn test_accepts_common_names() {
        for name in ["scheduler", "test_daemon", "prod-1", "v1.2"] {
            assert!(validate_name(name).is_ok(), "name {:?} should be accepted", name);
        }
    }

    #[test]
    fn test_rejects_overlong_socket_path() {
        let long_dir = PathBuf::from(format!("/tmp/{}", "d".repeat(120)));
        let result = InstancePaths::new(&long_dir, &long_dir, "p", "x");
        match result {
            Err(SchedulerError::Validation(msg)) => assert!(msg.contains("Socket path")),
            other => panic!("Expected Validation error, got: {:?}", other),
        }
    }
}
