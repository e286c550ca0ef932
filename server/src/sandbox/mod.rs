//! The remote execution capability the executor runs against.
//!
//! A sandbox is an isolated machine that can take a file by path, run a
//! command in a working directory (foreground with a timeout, or detached),
//! and name a routable host for an internal port. Relative file paths resolve
//! against [`HOME_DIR`].

mod docker;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

pub use docker::{DockerSandbox, DockerSandboxProvider};

/// Home directory inside every sandbox; also the default working directory.
pub const HOME_DIR: &str = "/home/user";

/// Where detached commands write their combined output.
pub const BACKGROUND_LOG_DIR: &str = "/tmp/codeforge";

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub cwd: Option<String>,
    /// `None` leaves the backend's own default in place.
    pub timeout: Option<Duration>,
}

impl RunOptions {
    pub fn in_dir(cwd: impl Into<String>) -> Self {
        Self {
            cwd: Some(cwd.into()),
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackgroundProcess {
    pub pid: Option<u32>,
}

#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    /// The command ran and exited non-zero.
    #[error("Command exited with code {exit_code} and error:\n{stderr}")]
    CommandExit {
        exit_code: i32,
        stdout: String,
        stderr: String,
    },
    #[error("command timeout after {}s: deadline exceeded", .0.as_secs())]
    Timeout(Duration),
    #[error("sandbox backend unavailable: {0}")]
    Unavailable(String),
    #[error("sandbox io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Backend(String),
}

impl SandboxError {
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            SandboxError::CommandExit { exit_code, .. } => Some(*exit_code),
            _ => None,
        }
    }
}

#[async_trait]
pub trait Sandbox: Send + Sync {
    fn id(&self) -> &str;

    async fn write_file(&self, path: &str, content: &str) -> Result<(), SandboxError>;

    async fn read_file(&self, path: &str) -> Result<String, SandboxError>;

    /// Runs `command` to completion. A non-zero exit is reported as
    /// [`SandboxError::CommandExit`].
    async fn run(&self, command: &str, options: RunOptions) -> Result<CommandOutput, SandboxError>;

    /// Launches `command` detached, with no execution timeout.
    async fn spawn(&self, command: &str, cwd: Option<&str>) -> Result<BackgroundProcess, SandboxError>;

    /// Externally routable `host[:port]` for an internal port.
    async fn host(&self, port: u16) -> Result<String, SandboxError>;

    /// Scheme the routable host is served over.
    fn url_scheme(&self) -> &'static str {
        "https"
    }
}

#[async_trait]
pub trait SandboxProvider: Send + Sync {
    async fn create(&self, template: &str, idle_timeout: Duration) -> Result<Arc<dyn Sandbox>, SandboxError>;
}

/// Resolves a sandbox path the way the file API does.
pub fn absolute_path(path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("{HOME_DIR}/{}", path.trim_start_matches("./"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_text_carries_classification_markers() {
        let exit = SandboxError::CommandExit {
            exit_code: -1,
            stdout: String::new(),
            stderr: "npm WARN deprecated".to_string(),
        };
        assert_eq!(exit.to_string(), "Command exited with code -1 and error:\nnpm WARN deprecated");
        assert_eq!(exit.exit_code(), Some(-1));

        let timeout = SandboxError::Timeout(Duration::from_secs(600));
        assert_eq!(timeout.to_string(), "command timeout after 600s: deadline exceeded");
        assert_eq!(timeout.exit_code(), None);
    }

    #[test]
    fn test_absolute_path() {
        assert_eq!(absolute_path("/etc/hosts"), "/etc/hosts");
        assert_eq!(absolute_path("app/page.tsx"), "/home/user/app/page.tsx");
        assert_eq!(absolute_path("./package.json"), "/home/user/package.json");
    }
}
