use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};

use super::{handle_command, ControlCommand, MAX_REQUEST_BYTES};
use crate::errors::SchedulerError;
use crate::scheduler::SchedulerHandle;

/// How long `accept` waits before re-checking whether the scheduler stopped.
pub const ACCEPT_POLL: Duration = Duration::from_secs(1);

/// Listens on the instance socket and applies one command per connection.
///
/// Connections are served one at a time. The server exits on its own within
/// `ACCEPT_POLL` of the scheduler reaching the stopped phase.
pub struct CommandServer {
    listener: UnixListener,
    path: PathBuf,
    handle: SchedulerHandle,
    io_timeout: Duration,
}

impl CommandServer {
    /// Bind the socket at `path`, replacing any leftover socket file.
    ///
    /// Callers must already own the instance (hold its PID file) so that a
    /// file found here cannot belong to a live server.
    pub fn bind(
        path: &Path,
        handle: SchedulerHandle,
        io_timeout: Duration,
    ) -> Result<Self, SchedulerError> {
        if path.exists() {
            tracing::warn!("Removing leftover command socket {}", path.display());
            std::fs::remove_file(path).map_err(|source| SchedulerError::Bind {
                path: path.to_path_buf(),
                source,
            })?;
        }

        let listener = UnixListener::bind(path).map_err(|source| SchedulerError::Bind {
            path: path.to_path_buf(),
            source,
        })?;
        if let Err(e) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)) {
            tracing::warn!("Failed to restrict permissions on {}: {}", path.display(), e);
        }

        tracing::info!("Command server listening on {}", path.display());
        Ok(Self {
            listener,
            path: path.to_path_buf(),
            handle,
            io_timeout,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accept loop. Returns once the scheduler has stopped.
    pub async fn serve(self) {
        while !self.handle.has_stopped() {
            let stream = match tokio::time::timeout(ACCEPT_POLL, self.listener.accept()).await {
                Err(_) => continue,
                Ok(Ok((stream, _addr))) => stream,
                Ok(Err(e)) => {
                    tracing::error!("Command server error: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            };

            if let Err(e) = self.serve_connection(stream).await {
                tracing::warn!("Command connection failed: {}", e);
            }
        }
        tracing::debug!("Command server on {} exiting", self.path.display());
    }

    /// The command is whatever the first read returns, so clients need not
    /// terminate it or close their write side before reading the response.
    async fn serve_connection(&self, mut stream: UnixStream) -> Result<(), SchedulerError> {
        let mut request = [0u8; MAX_REQUEST_BYTES];
        let len = tokio::time::timeout(self.io_timeout, stream.read(&mut request))
            .await
            .map_err(|_| SchedulerError::Timeout("reading command".to_string()))??;

        let request = String::from_utf8_lossy(&request[..len]);
        let command = ControlCommand::parse(&request);
        tracing::debug!("Received command: {:?}", command);

        let response = handle_command(&self.handle, command).await;

        tokio::time::timeout(self.io_timeout, async {
            stream.write_all(response.as_bytes()).await?;
            stream.shutdown().await
        })
        .await
        .map_err(|_| SchedulerError::Timeout("writing response".to_string()))??;

        Ok(())
    }
}
