use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command as TokioCommand;
use tracing::{debug, info};
use uuid::Uuid;

use super::{
    absolute_path, BackgroundProcess, CommandOutput, RunOptions, Sandbox, SandboxError, SandboxProvider,
    BACKGROUND_LOG_DIR, HOME_DIR,
};

/// Applied when the caller leaves the timeout unset.
const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(60);
const CREATE_TIMEOUT: Duration = Duration::from_secs(300);
const CONTROL_TIMEOUT: Duration = Duration::from_secs(30);

// $1 is the target path; content arrives on stdin.
const WRITE_SCRIPT: &str = r#"mkdir -p "$(dirname "$1")" && cat > "$1""#;
// $1 is the command, $2 the log file. Prints the detached PID.
const SPAWN_SCRIPT: &str =
    r#"mkdir -p "$(dirname "$2")" && nohup sh -c "$1" > "$2" 2>&1 < /dev/null & echo $!"#;

/// Creates one detached container per sandbox through the local `docker` CLI.
/// The container runs `sleep <idle timeout>` and is removed when it exits.
pub struct DockerSandboxProvider {
    fallback_image: String,
    published_ports: Vec<u16>,
}

impl DockerSandboxProvider {
    pub fn new(fallback_image: impl Into<String>) -> Self {
        Self {
            fallback_image: fallback_image.into(),
            published_ports: vec![3000],
        }
    }

    pub fn with_published_ports(mut self, ports: Vec<u16>) -> Self {
        self.published_ports = ports;
        self
    }

    /// Templates that already name an image (`node:20`, `org/image`) are used
    /// directly; named templates map to the configured image.
    fn image_for(&self, template: &str) -> String {
        if template.contains(':') || template.contains('/') {
            template.to_string()
        } else {
            self.fallback_image.clone()
        }
    }
}

#[async_trait]
impl SandboxProvider for DockerSandboxProvider {
    async fn create(&self, template: &str, idle_timeout: Duration) -> Result<Arc<dyn Sandbox>, SandboxError> {
        if which::which("docker").is_err() {
            return Err(SandboxError::Unavailable("docker not found in PATH".to_string()));
        }

        let name = format!("codeforge-{}", Uuid::new_v4().simple());
        let image = self.image_for(template);
        let label = format!("codeforge.template={template}");
        let idle = idle_timeout.as_secs().max(1).to_string();
        let ports: Vec<String> = self.published_ports.iter().map(u16::to_string).collect();

        let mut args = vec!["run", "-d", "--rm", "--name", name.as_str(), "--label", label.as_str(), "-w", HOME_DIR];
        for port in &ports {
            args.push("-p");
            args.push(port.as_str());
        }
        args.extend([image.as_str(), "sleep", idle.as_str()]);

        info!(container = %name, %image, template, "creating docker sandbox");
        docker(&args, None, CREATE_TIMEOUT).await?;

        let sandbox: Arc<dyn Sandbox> = Arc::new(DockerSandbox { name });
        Ok(sandbox)
    }
}

pub struct DockerSandbox {
    name: String,
}

#[async_trait]
impl Sandbox for DockerSandbox {
    fn id(&self) -> &str {
        &self.name
    }

    async fn write_file(&self, path: &str, content: &str) -> Result<(), SandboxError> {
        let target = absolute_path(path);
        debug!(container = %self.name, path = %target, bytes = content.len(), "writing file");
        docker(
            &["exec", "-i", self.name.as_str(), "sh", "-c", WRITE_SCRIPT, "sh", target.as_str()],
            Some(content.as_bytes()),
            CONTROL_TIMEOUT,
        )
        .await?;
        Ok(())
    }

    async fn read_file(&self, path: &str) -> Result<String, SandboxError> {
        let target = absolute_path(path);
        let output = docker(&["exec", self.name.as_str(), "cat", "--", target.as_str()], None, CONTROL_TIMEOUT).await?;
        Ok(output.stdout)
    }

    async fn run(&self, command: &str, options: RunOptions) -> Result<CommandOutput, SandboxError> {
        let cwd = options.cwd.unwrap_or_else(|| HOME_DIR.to_string());
        let timeout = options.timeout.unwrap_or(DEFAULT_COMMAND_TIMEOUT);
        debug!(container = %self.name, %cwd, command, "running command");
        docker(&["exec", "-w", cwd.as_str(), self.name.as_str(), "sh", "-c", command], None, timeout).await
    }

    async fn spawn(&self, command: &str, cwd: Option<&str>) -> Result<BackgroundProcess, SandboxError> {
        let cwd = cwd.unwrap_or(HOME_DIR);
        let log = format!("{BACKGROUND_LOG_DIR}/{}.log", Uuid::new_v4().simple());
        let output = docker(
            &["exec", "-w", cwd, self.name.as_str(), "sh", "-c", SPAWN_SCRIPT, "sh", command, log.as_str()],
            None,
            CONTROL_TIMEOUT,
        )
        .await?;
        let pid = output.stdout.trim().parse().ok();
        info!(container = %self.name, ?pid, %log, command, "started background command");
        Ok(BackgroundProcess { pid })
    }

    async fn host(&self, port: u16) -> Result<String, SandboxError> {
        let spec = format!("{port}/tcp");
        let output = docker(&["port", self.name.as_str(), spec.as_str()], None, CONTROL_TIMEOUT).await?;
        parse_published_port(&output.stdout)
            .map(|host_port| format!("localhost:{host_port}"))
            .ok_or_else(|| SandboxError::Backend(format!("port {port} is not published by {}", self.name)))
    }

    // published ports are plain loopback binds
    fn url_scheme(&self) -> &'static str {
        "http"
    }
}

/// Runs the docker CLI, feeding `stdin` if given. Non-zero exits become
/// [`SandboxError::CommandExit`]; the client is killed when `timeout` elapses.
async fn docker(args: &[&str], stdin: Option<&[u8]>, timeout: Duration) -> Result<CommandOutput, SandboxError> {
    let mut child = TokioCommand::new("docker")
        .args(args)
        .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    if let (Some(bytes), Some(mut pipe)) = (stdin, child.stdin.take()) {
        pipe.write_all(bytes).await?;
        pipe.shutdown().await?;
    }

    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(result) => result?,
        Err(_) => return Err(SandboxError::Timeout(timeout)),
    };

    let exit_code = output.status.code().unwrap_or(-1);
    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

    if output.status.success() {
        Ok(CommandOutput {
            exit_code,
            stdout,
            stderr,
        })
    } else {
        Err(SandboxError::CommandExit {
            exit_code,
            stdout,
            stderr,
        })
    }
}

/// `docker port` prints one `address:port` line per binding (`0.0.0.0:49153`,
/// `[::]:49153`). The first binding's host port is used.
fn parse_published_port(output: &str) -> Option<u16> {
    output
        .lines()
        .find_map(|line| line.trim().rsplit(':').next()?.parse().ok())
}
