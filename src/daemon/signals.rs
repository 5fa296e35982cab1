// Signal handler: SIGINT/SIGTERM stop the scheduler, SIGUSR1 pauses it and
// SIGUSR2 resumes it, for hosts where only `kill -SIGNAL <pid>` is available.

use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;

use crate::errors::SchedulerError;
use crate::scheduler::SchedulerHandle;

/// Register the handlers and spawn the task that applies them.
///
/// Registration happens before returning so a failure surfaces as a startup
/// error. Must be called from within a tokio runtime.
pub fn spawn(handle: SchedulerHandle) -> Result<JoinHandle<()>, SchedulerError> {
    let mut sigint = signal(SignalKind::interrupt()).map_err(SchedulerError::Signal)?;
    let mut sigterm = signal(SignalKind::terminate()).map_err(SchedulerError::Signal)?;
    let mut sigusr1 = signal(SignalKind::user_defined1()).map_err(SchedulerError::Signal)?;
    let mut sigusr2 = signal(SignalKind::user_defined2()).map_err(SchedulerError::Signal)?;

    Ok(tokio::spawn(async move {
        loop {
            tokio::select! {
                Some(()) = sigint.recv() => {
                    tracing::info!("Received SIGINT");
                    handle.shutdown().await;
                }
                Some(()) = sigterm.recv() => {
                    tracing::info!("Received SIGTERM");
                    handle.shutdown().await;
                }
                Some(()) = sigusr1.recv() => {
                    tracing::info!("Received SIGUSR1");
                    handle.pause().await;
                }
                Some(()) = sigusr2.recv() => {
                    tracing::info!("Received SIGUSR2");
                    handle.resume().await;
                }
                else => break,
            }
        }
    }))
}
