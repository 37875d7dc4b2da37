use std::path::Path;

use async_trait::async_trait;

use crate::error::EngineError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, or -1 when the process was killed by a signal.
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

/// Runs installer hook scripts. `env` is added on top of the inherited
/// environment.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(
        &self,
        path: &Path,
        args: &[String],
        env: &[(String, String)],
    ) -> Result<CommandOutput, EngineError>;
}

/// Spawns the command as a child process and waits for it.
pub struct TaskCommandRunner;

#[async_trait]
impl CommandRunner for TaskCommandRunner {
    async fn run(
        &self,
        path: &Path,
        args: &[String],
        env: &[(String, String)],
    ) -> Result<CommandOutput, EngineError> {
        run_process(path, args, env).await
    }
}

/// Spawn `path` and capture its output. The child is killed if the returned
/// future is dropped.
pub(crate) async fn run_process(
    path: &Path,
    args: &[String],
    env: &[(String, String)],
) -> Result<CommandOutput, EngineError> {
    let output = tokio::process::Command::new(path)
        .args(args)
        .envs(env.iter().map(|(k, v)| (k, v)))
        .stdin(std::process::Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|source| EngineError::Command {
            command: path.display().to_string(),
            source,
        })?;
    Ok(CommandOutput {
        status: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[tokio::test]
    async fn captures_exit_code_and_output() {
        let out = TaskCommandRunner
            .run(
                Path::new("/bin/sh"),
                &["-c".into(), "echo \"$GREETING\"; echo err >&2; exit 3".into()],
                &[("GREETING".into(), "hi".into())],
            )
            .await
            .unwrap();
        assert_eq!(out.status, 3);
        assert_eq!(out.stdout, "hi\n");
        assert_eq!(out.stderr, "err\n");
        assert!(!out.success());
    }

    #[tokio::test]
    async fn missing_program_is_an_error() {
        let err = TaskCommandRunner
            .run(Path::new("/no/such/program"), &[], &[])
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Command { .. }));
    }
}
