use std::io::ErrorKind;
use std::path::Path;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

use crate::errors::SchedulerError;

/// Send one command over the socket at `socket` and return the response.
///
/// A missing socket, or one nobody is listening on, is reported as
/// `NotRunning` (named after the socket file) rather than as an I/O error.
pub async fn send_command(
    socket: &Path,
    command: &str,
    timeout: Duration,
) -> Result<String, SchedulerError> {
    let not_running = || {
        SchedulerError::NotRunning(
            socket
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| socket.display().to_string()),
        )
    };

    if !socket.exists() {
        return Err(not_running());
    }

    let exchange = async {
        let mut stream = match UnixStream::connect(socket).await {
            Ok(stream) => stream,
            Err(e) if matches!(e.kind(), ErrorKind::ConnectionRefused | ErrorKind::NotFound) => {
                return Err(not_running());
            }
            Err(e) => {
                return Err(SchedulerError::Protocol(format!(
                    "Failed to connect to {}: {}",
                    socket.display(),
                    e
                )))
            }
        };

        // One write: the server takes the first read as the whole command.
        stream.write_all(format!("{}\n", command).as_bytes()).await?;
        stream.shutdown().await?;

        let mut response = String::new();
        stream.read_to_string(&mut response).await?;
        Ok::<String, SchedulerError>(response)
    };

    tokio::time::timeout(timeout, exchange).await.map_err(|_| {
        SchedulerError::Timeout(format!(
            "No response from {} within {:?}",
            socket.display(),
            timeout
        ))
    })?
}
