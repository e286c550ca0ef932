//! Emulates a persistent shell over one-off sandbox commands.
//!
//! Every command is a fresh remote invocation, so the working directory is
//! tracked in the registry and `cd` never reaches the sandbox.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::classify;
use crate::registry::{SessionRegistry, DEFAULT_WORKING_DIR};
use crate::sandbox::{RunOptions, Sandbox, SandboxError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShellResponse {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    /// Working directory after the command.
    pub cwd: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ShellError {
    #[error("Sandbox not found")]
    SessionNotFound,
    #[error(transparent)]
    Sandbox(#[from] SandboxError),
}

/// Resolves a `cd` target against `cwd`. `~` and an empty target go home,
/// `..` drops the last segment, a leading `/` is absolute and anything else
/// is a child of `cwd`.
pub fn resolve_dir(cwd: &str, target: &str) -> String {
    match target {
        "" | "~" => DEFAULT_WORKING_DIR.to_string(),
        ".." => match cwd.trim_end_matches('/').rsplit_once('/') {
            Some(("", _)) | None => "/".to_string(),
            Some((parent, _)) => parent.to_string(),
        },
        absolute if absolute.starts_with('/') => absolute.to_string(),
        relative => match relative.strip_prefix("~/") {
            Some(rest) => format!("{DEFAULT_WORKING_DIR}/{rest}"),
            None => format!("{}/{relative}", cwd.trim_end_matches('/')),
        },
    }
}

pub struct InteractiveShell {
    registry: Arc<SessionRegistry>,
}

impl InteractiveShell {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }

    /// Runs one command for a session that already has a sandbox. Sessions
    /// are never created here.
    pub async fn run(&self, session_id: &str, raw: &str) -> Result<ShellResponse, ShellError> {
        let sandbox = self.registry.get(session_id).ok_or(ShellError::SessionNotFound)?;
        let cwd = self.registry.working_dir(session_id);
        let command = raw.trim();

        if command == "cd" || command.starts_with("cd ") {
            let target = command[2..].trim();
            return Ok(self.change_dir(sandbox.as_ref(), session_id, &cwd, target).await);
        }

        if classify::is_background(command) {
            let process = sandbox.spawn(command, Some(cwd.as_str())).await?;
            let pid = process.pid.map_or_else(|| "unknown".to_string(), |pid| pid.to_string());
            info!(session_id, command, %pid, "started background process");
            return Ok(ShellResponse {
                stdout: format!("Started background process (PID: {pid})\n"),
                stderr: String::new(),
                exit_code: 0,
                cwd,
            });
        }

        debug!(session_id, %cwd, command, "running interactive command");
        match sandbox.run(command, RunOptions::in_dir(cwd.as_str())).await {
            Ok(output) => Ok(ShellResponse {
                stdout: output.stdout,
                stderr: output.stderr,
                exit_code: output.exit_code,
                cwd,
            }),
            Err(SandboxError::CommandExit {
                exit_code,
                stdout,
                stderr,
            }) => Ok(ShellResponse {
                stdout,
                stderr,
                exit_code,
                cwd,
            }),
            Err(err) => Err(err.into()),
        }
    }

    async fn change_dir(&self, sandbox: &dyn Sandbox, session_id: &str, cwd: &str, target: &str) -> ShellResponse {
        let resolved = resolve_dir(cwd, target);
        let quoted = shlex::try_quote(&resolved).map_or_else(|_| "''".into(), |q| q.into_owned());
        let check = format!("test -d {quoted} && echo exists || echo missing");

        let exists = match sandbox.run(&check, RunOptions::in_dir(cwd)).await {
            Ok(output) => output.stdout.trim() == "exists",
            Err(err) => {
                debug!(session_id, path = %resolved, error = %err, "directory check failed");
                false
            }
        };

        if exists {
            self.registry.set_working_dir(session_id, resolved.as_str());
            ShellResponse {
                stdout: String::new(),
                stderr: String::new(),
                exit_code: 0,
                cwd: resolved,
            }
        } else {
            ShellResponse {
                stdout: String::new(),
                stderr: format!("cd: {target}: No such file or directory\n"),
                exit_code: 1,
                cwd: cwd.to_string(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::DEFAULT_TEMPLATE;
    use crate::testing::{FakeProvider, FakeSandbox, Reply};

    async fn bootstrapped(sandbox: Arc<FakeSandbox>) -> (InteractiveShell, Arc<SessionRegistry>) {
        let registry = Arc::new(SessionRegistry::new(FakeProvider::new(sandbox), DEFAULT_TEMPLATE));
        registry.get_or_create("s1").await.unwrap();
        (InteractiveShell::new(registry.clone()), registry)
    }

    #[test]
    fn test_resolve_dir() {
        assert_eq!(resolve_dir("/home/user/app", ".."), "/home/user");
        assert_eq!(resolve_dir("/home/user", "app"), "/home/user/app");
        assert_eq!(resolve_dir("/home/user/app", "/tmp"), "/tmp");
        assert_eq!(resolve_dir("/tmp", "~"), "/home/user");
        assert_eq!(resolve_dir("/tmp", ""), "/home/user");
        assert_eq!(resolve_dir("/tmp", "~/app"), "/home/user/app");
        assert_eq!(resolve_dir("/home", ".."), "/");
        assert_eq!(resolve_dir("/", ".."), "/");
    }

    #[tokio::test]
    async fn test_unknown_session_is_not_created() {
        let provider = FakeProvider::new(FakeSandbox::new());
        let registry = Arc::new(SessionRegistry::new(provider.clone(), DEFAULT_TEMPLATE));
        let shell = InteractiveShell::new(registry);

        let err = shell.run("missing", "ls").await.unwrap_err();
        assert!(matches!(err, ShellError::SessionNotFound));
        assert_eq!(err.to_string(), "Sandbox not found");
        assert_eq!(provider.created(), 0);
    }

    #[tokio::test]
    async fn test_cd_up_commits_when_directory_exists() {
        let sandbox = FakeSandbox::new();
        sandbox.on("test -d", Reply::stdout("exists\n"));
        let (shell, registry) = bootstrapped(sandbox.clone()).await;
        registry.set_working_dir("s1", "/home/user/app");

        let response = shell.run("s1", "cd ..").await.unwrap();
        assert_eq!(response.exit_code, 0);
        assert_eq!(response.cwd, "/home/user");
        assert_eq!(registry.working_dir("s1"), "/home/user");
        assert!(sandbox.commands().iter().all(|c| !c.starts_with("cd")));
    }

    #[tokio::test]
    async fn test_cd_to_missing_directory_keeps_cwd() {
        let sandbox = FakeSandbox::new();
        sandbox.on("test -d", Reply::stdout("missing\n"));
        let (shell, registry) = bootstrapped(sandbox).await;
        registry.set_working_dir("s1", "/home/user/app");

        let response = shell.run("s1", "cd ..").await.unwrap();
        assert_eq!(response.exit_code, 1);
        assert_eq!(response.stderr, "cd: ..: No such file or directory\n");
        assert_eq!(registry.working_dir("s1"), "/home/user/app");
    }

    #[tokio::test]
    async fn test_failed_directory_check_counts_as_missing() {
        let sandbox = FakeSandbox::new();
        sandbox.on("test -d", Reply::Backend("connection lost".to_string()));
        let (shell, registry) = bootstrapped(sandbox).await;

        let response = shell.run("s1", "cd app").await.unwrap();
        assert_eq!(response.exit_code, 1);
        assert_eq!(registry.working_dir("s1"), "/home/user");
    }

    #[tokio::test]
    async fn test_commands_run_in_tracked_directory() {
        let sandbox = FakeSandbox::new();
        sandbox.on("ls", Reply::stdout("package.json\n"));
        let (shell, registry) = bootstrapped(sandbox.clone()).await;
        registry.set_working_dir("s1", "/home/user/app");

        let response = shell.run("s1", "ls").await.unwrap();
        assert_eq!(response.stdout, "package.json\n");
        assert_eq!(response.cwd, "/home/user/app");
        let run = sandbox.runs().pop().unwrap();
        assert_eq!(run.cwd.as_deref(), Some("/home/user/app"));
        assert_eq!(run.timeout, None);
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_reported_not_raised() {
        let sandbox = FakeSandbox::new();
        sandbox.on("cat nope", Reply::exit(1, "cat: nope: No such file or directory"));
        let (shell, _) = bootstrapped(sandbox).await;

        let response = shell.run("s1", "cat nope").await.unwrap();
        assert_eq!(response.exit_code, 1);
        assert_eq!(response.stderr, "cat: nope: No such file or directory");
    }

    #[tokio::test]
    async fn test_dev_server_starts_in_background() {
        let sandbox = FakeSandbox::new();
        let (shell, registry) = bootstrapped(sandbox.clone()).await;
        registry.set_working_dir("s1", "/home/user/app");

        let response = shell.run("s1", "npm run dev").await.unwrap();
        assert_eq!(response.stdout, "Started background process (PID: 4242)\n");
        assert_eq!(response.exit_code, 0);
        assert_eq!(
            sandbox.spawned(),
            vec![("npm run dev".to_string(), Some("/home/user/app".to_string()))]
        );
        assert!(sandbox.runs().is_empty());
    }
}
