use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use vigil_core::tokio::{self, task::JoinHandle};

const STARTUP_STABILIZATION_WINDOW: Duration = Duration::from_millis(300);

/// Fails if a task that should run for the life of the process exits during
/// startup.
pub async fn verify_startup_subsystems(
    api_task: &mut JoinHandle<()>,
    membership_task: &mut JoinHandle<()>,
    reports_task: &mut JoinHandle<()>,
) -> Result<()> {
    verify_background_task_running("external API", api_task)
        .await
        .context("startup check failed")?;
    verify_background_task_running("membership registration", membership_task)
        .await
        .context("startup check failed")?;
    verify_background_task_running("report persistence", reports_task)
        .await
        .context("startup check failed")?;
    Ok(())
}

pub async fn verify_background_task_running(name: &str, task: &mut JoinHandle<()>) -> Result<()> {
    match tokio::time::timeout(STARTUP_STABILIZATION_WINDOW, task).await {
        Err(_) => Ok(()),
        Ok(join_res) => match join_res {
            Ok(()) => Err(anyhow!("{name} exited during startup stabilization window")),
            Err(err) => Err(anyhow!("{name} panicked during startup: {err}")),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_running_task_passes() {
        let mut task = tokio::spawn(std::future::pending::<()>());
        verify_background_task_running("pending", &mut task)
            .await
            .unwrap();
        task.abort();
    }

    #[tokio::test]
    async fn test_exited_task_fails() {
        let mut task = tokio::spawn(async {});
        let err = verify_background_task_running("early", &mut task)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("early exited"));
    }
}
