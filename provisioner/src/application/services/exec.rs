//! Commands inside running instances.

use std::time::Duration;

use crate::application::ports::{ExecBackend, Stdio};
use crate::domain::{
    BackendError, BackendResultExt, ProvisionError, Task, TaskFailure, TtySize,
};

const EXEC_POLL_INTERVAL: Duration = Duration::from_millis(50);
/// How long a closed session may keep reporting running before its exit
/// code is given up on.
const EXEC_EXIT_TIMEOUT: Duration = Duration::from_secs(10);

/// One exec session.
pub struct ExecRequest<'a> {
    pub cmd: Vec<String>,
    pub tty: bool,
    /// Applied once the session runs; ignored without a TTY.
    pub size: Option<TtySize>,
    pub stdio: Stdio<'a>,
}

/// Run a command in the instance of `task`; returns its exit code.
///
/// `backend` must be scoped to the node the task runs on.
///
/// # Errors
///
/// Returns `Transport` when the session cannot be created, started or
/// inspected, or when it ends without an exit code, and `Timeout` when it
/// still reports running after [`EXEC_EXIT_TIMEOUT`]. A failed TTY resize
/// is only logged.
pub async fn exec_in_task(
    backend: &impl ExecBackend,
    task: &Task,
    req: ExecRequest<'_>,
) -> Result<i64, ProvisionError> {
    let instance = task.container_id.as_str();
    let exec_id = backend
        .create_exec(task, &req.cmd, req.tty, req.stdio.stdin.is_some())
        .await
        .op("create exec", instance)?;

    match req.size.filter(|_| req.tty) {
        None => backend
            .start_exec(&exec_id, req.tty, req.stdio)
            .await
            .op("start exec", instance)?,
        Some(size) => {
            let session = backend.start_exec(&exec_id, true, req.stdio);
            tokio::pin!(session);
            tokio::select! {
                result = &mut session => result.op("start exec", instance)?,
                running = wait_running(backend, &exec_id) => {
                    running.op("inspect exec", instance)?;
                    if let Err(e) = backend.resize_exec(&exec_id, size).await {
                        tracing::warn!(exec = %exec_id, error = %e, "failed to resize exec tty");
                    }
                    session.await.op("start exec", instance)?;
                }
            }
        }
    }

    wait_exit_code(backend, &exec_id)
        .await
        .op("inspect exec", instance)?
        .ok_or_else(|| ProvisionError::Timeout {
            what: format!("exit code of exec {exec_id}"),
            after: EXEC_EXIT_TIMEOUT,
        })
}

/// Like [`exec_in_task`], mapping a non-zero exit to `TaskFailed`.
///
/// # Errors
///
/// Returns `TaskFailed` with the exit code on non-zero exit.
pub async fn exec_checked(
    backend: &impl ExecBackend,
    task: &Task,
    req: ExecRequest<'_>,
) -> Result<(), ProvisionError> {
    let exit_code = exec_in_task(backend, task, req).await?;
    if exit_code != 0 {
        return Err(ProvisionError::TaskFailed {
            object: task.container_id.clone(),
            failure: TaskFailure::ExitCode(exit_code),
        });
    }
    Ok(())
}

/// Poll a closed session until it stops running. `None` when it never
/// does within [`EXEC_EXIT_TIMEOUT`].
async fn wait_exit_code(
    backend: &impl ExecBackend,
    exec_id: &str,
) -> Result<Option<i64>, BackendError> {
    let settled = async {
        loop {
            let status = backend.inspect_exec(exec_id).await?;
            if !status.running {
                return status.exit_code.ok_or_else(|| {
                    BackendError::Api(anyhow::anyhow!("exec {exec_id} ended without an exit code"))
                });
            }
            tokio::time::sleep(EXEC_POLL_INTERVAL).await;
        }
    };
    tokio::select! {
        code = settled => code.map(Some),
        () = tokio::time::sleep(EXEC_EXIT_TIMEOUT) => Ok(None),
    }
}

/// Poll until the session reports running. A resize issued earlier is
/// lost on some runtimes.
async fn wait_running(
    backend: &impl ExecBackend,
    exec_id: &str,
) -> Result<(), BackendError> {
    loop {
        if backend.inspect_exec(exec_id).await?.running {
            return Ok(());
        }
        tokio::time::sleep(EXEC_POLL_INTERVAL).await;
    }
}
