use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::classify::{self, CommandKind, FailureKind, HOST_BINDING_DIAGNOSTIC};
use crate::models::{
    tail_chars, Action, ActionOutcome, FileOutcome, OutcomeStatus, ProgressEvent, ShellOutcome, STDOUT_TAIL_CHARS,
};
use crate::readiness::{self, Readiness, ReadinessPolicy};
use crate::registry::SessionRegistry;
use crate::sandbox::{RunOptions, Sandbox, SandboxError, HOME_DIR};

const INSTALL_PROBE: &str = "test -d node_modules && ls node_modules | wc -l";
const MODULES_LISTING_PROBE: &str = "ls -la node_modules 2>/dev/null | wc -l";
const PROCESS_DIAGNOSTICS: &str = "ps aux | grep -v grep | grep node | head -5";
/// `ls -la` of an empty directory still prints `.` and `..`.
const TRIVIAL_LISTING_LINES: usize = 2;

const EVENT_BUFFER: usize = 32;

/// Timeouts and locations used while running an action list.
#[derive(Debug, Clone)]
pub struct ExecutionPolicy {
    /// Working directory for artifact commands.
    pub work_dir: String,
    /// Foreground timeout on the single-shot path.
    pub simple_timeout: Duration,
    pub install_timeout: Duration,
    pub command_timeout: Duration,
    /// Timeout for the `node_modules` checks run while reclassifying.
    pub probe_timeout: Duration,
    /// When a benign-looking failure cannot be verified against the
    /// dependency directory, report it as completed anyway. Turning this off
    /// reports such failures as failed.
    pub lenient_reclassification: bool,
    pub readiness: ReadinessPolicy,
}

impl ExecutionPolicy {
    /// Port the generated application's dev server listens on. The preview
    /// URL and the readiness poll both use it.
    pub fn preview_port(&self) -> u16 {
        self.readiness.port
    }
}

impl Default for ExecutionPolicy {
    fn default() -> Self {
        Self {
            work_dir: HOME_DIR.to_string(),
            simple_timeout: Duration::from_secs(300),
            install_timeout: Duration::from_secs(600),
            command_timeout: Duration::from_secs(120),
            probe_timeout: Duration::from_secs(10),
            lenient_reclassification: true,
            readiness: ReadinessPolicy::default(),
        }
    }
}

/// Runs action lists against a session's sandbox, creating the sandbox on
/// first use.
pub struct ActionExecutor {
    registry: Arc<SessionRegistry>,
    policy: ExecutionPolicy,
}

impl ActionExecutor {
    pub fn new(registry: Arc<SessionRegistry>, policy: ExecutionPolicy) -> Self {
        Self { registry, policy }
    }

    pub fn policy(&self) -> &ExecutionPolicy {
        &self.policy
    }

    /// Single-shot execution. Shell failures are recorded as `failed` with
    /// exit code 1 and never reclassified; sandbox creation, file writes and
    /// background launches that raise abort the whole call.
    pub async fn execute(&self, session_id: &str, actions: &[Action]) -> Result<Vec<ActionOutcome>, SandboxError> {
        let sandbox = self.registry.get_or_create(session_id).await?;
        let mut outcomes = Vec::with_capacity(actions.len());

        for (index, action) in actions.iter().enumerate() {
            debug!(session_id, action_index = index, "executing action");
            let outcome = match action {
                Action::File(file) => {
                    sandbox.write_file(&file.file_path, &file.content).await?;
                    ActionOutcome::File(FileOutcome::created(&file.file_path))
                }
                Action::Shell(shell) if classify::is_background(&shell.command) => {
                    let process = sandbox.spawn(&shell.command, None).await?;
                    ActionOutcome::Shell(ShellOutcome::started(&shell.command, process.pid))
                }
                Action::Shell(shell) => {
                    let options = RunOptions::default().with_timeout(self.policy.simple_timeout);
                    let outcome = match sandbox.run(&shell.command, options).await {
                        Ok(output) => ShellOutcome {
                            stderr: Some(output.stderr),
                            ..ShellOutcome::completed(&shell.command, output.exit_code, output.stdout)
                        },
                        Err(err) => {
                            warn!(session_id, command = %shell.command, error = %err, "command failed");
                            ShellOutcome::failed(&shell.command, err.to_string()).with_exit_code(Some(1))
                        }
                    };
                    ActionOutcome::Shell(outcome)
                }
            };
            outcomes.push(outcome);
        }

        Ok(outcomes)
    }

    /// Public URL of the session's dev-server port, or `None` when the
    /// session has no sandbox.
    pub async fn preview_url(&self, session_id: &str) -> Result<Option<String>, SandboxError> {
        let Some(sandbox) = self.registry.get(session_id) else {
            return Ok(None);
        };
        let host = sandbox.host(self.policy.preview_port()).await?;
        Ok(Some(format!("{}://{host}", sandbox.url_scheme())))
    }

    /// Streams progress while running `actions` on a spawned task. The
    /// stream always ends with one `complete` or `error` event. Dropping the
    /// receiver stops delivery; the run itself carries on.
    pub fn execute_streaming(self: &Arc<Self>, session_id: String, actions: Vec<Action>) -> mpsc::Receiver<ProgressEvent> {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let executor = Arc::clone(self);

        tokio::spawn(async move {
            let terminal = match executor.run_streaming(&session_id, &actions, &tx).await {
                Ok(preview_url) => {
                    info!(session_id = %session_id, actions = actions.len(), ?preview_url, "execution finished");
                    ProgressEvent::Complete { preview_url }
                }
                Err(err) => {
                    error!(session_id = %session_id, error = %err, "execution aborted");
                    ProgressEvent::Error {
                        message: err.to_string(),
                    }
                }
            };
            emit(&tx, terminal).await;
        });

        rx
    }

    async fn run_streaming(
        &self,
        session_id: &str,
        actions: &[Action],
        tx: &mpsc::Sender<ProgressEvent>,
    ) -> Result<Option<String>, SandboxError> {
        let sandbox = self.registry.get_or_create(session_id).await?;

        for (index, action) in actions.iter().enumerate() {
            emit(tx, ProgressEvent::executing(index, action.clone())).await;

            let outcome = match action {
                Action::File(file) => {
                    sandbox.write_file(&file.file_path, &file.content).await?;
                    debug!(session_id, action_index = index, path = %file.file_path, "file written");
                    ActionOutcome::File(FileOutcome::created(&file.file_path))
                }
                Action::Shell(shell) => {
                    let command = shell.command.as_str();
                    let outcome = match classify::classify_command(command) {
                        CommandKind::Background => self.launch_background(sandbox.as_ref(), index, command, tx).await,
                        kind => self.run_foreground(sandbox.as_ref(), command, kind).await,
                    };
                    info!(session_id, action_index = index, command, status = ?outcome.status, "shell action finished");
                    ActionOutcome::Shell(outcome)
                }
            };

            emit(tx, ProgressEvent::completed(index, outcome)).await;
        }

        self.preview_url(session_id).await
    }

    async fn launch_background(
        &self,
        sandbox: &dyn Sandbox,
        index: usize,
        command: &str,
        tx: &mpsc::Sender<ProgressEvent>,
    ) -> ShellOutcome {
        let process = match sandbox.spawn(command, Some(self.policy.work_dir.as_str())).await {
            Ok(process) => process,
            Err(err) => {
                let text = err.to_string();
                error!(command, error = %text, "background command failed to start");
                if classify::is_binding_error(&text) {
                    return ShellOutcome::failed(command, HOST_BINDING_DIAGNOSTIC);
                }
                return ShellOutcome::failed(command, text);
            }
        };

        tokio::time::sleep(self.policy.readiness.initial_delay).await;
        emit(tx, ProgressEvent::waiting_for_server(index)).await;

        let mut outcome = ShellOutcome::started(command, process.pid);
        match readiness::wait_until_ready(sandbox, &self.policy.readiness).await {
            Readiness::Ready { attempts } => {
                outcome.ready = Some(true);
                outcome.wait_time = Some(attempts);
            }
            Readiness::NotReady { attempts, last_error } => {
                outcome.status = OutcomeStatus::Timeout;
                outcome.ready = Some(false);
                outcome.wait_time = Some(attempts);
                outcome.error = last_error;
                outcome.debug_info = Some(self.process_diagnostics(sandbox).await);
            }
        }
        outcome
    }

    async fn process_diagnostics(&self, sandbox: &dyn Sandbox) -> String {
        let options = RunOptions::default().with_timeout(self.policy.readiness.probe_timeout);
        match sandbox.run(PROCESS_DIAGNOSTICS, options).await {
            Ok(output) if !output.stdout.trim().is_empty() => output.stdout.trim().to_string(),
            Ok(_) => "No process info".to_string(),
            Err(err) => {
                debug!(error = %err, "could not collect process diagnostics");
                "No process info".to_string()
            }
        }
    }

    async fn run_foreground(&self, sandbox: &dyn Sandbox, command: &str, kind: CommandKind) -> ShellOutcome {
        let (command_line, timeout) = match kind {
            CommandKind::Install => (classify::optimize_install_command(command), self.policy.install_timeout),
            _ => (command.to_string(), self.policy.command_timeout),
        };
        let options = RunOptions::in_dir(&self.policy.work_dir).with_timeout(timeout);

        match sandbox.run(&command_line, options).await {
            Ok(output) => ShellOutcome::completed(command, output.exit_code, tail_chars(&output.stdout, STDOUT_TAIL_CHARS)),
            Err(err) => self.reclassify(sandbox, command, kind, &err).await,
        }
    }

    /// Decides whether a raised command failure really failed. Package
    /// managers report warnings and slow installs as errors, so the
    /// dependency directory is checked before accepting the failure.
    async fn reclassify(&self, sandbox: &dyn Sandbox, command: &str, kind: CommandKind, err: &SandboxError) -> ShellOutcome {
        let error_text = err.to_string();

        // 1. Installs that left a populated node_modules succeeded.
        if kind == CommandKind::Install {
            if let Some(installed) = self.count_lines(sandbox, INSTALL_PROBE).await {
                if installed > 0 {
                    info!(command, installed, "install raised but dependencies are present");
                    return ShellOutcome::completed_with_warning(
                        command,
                        "npm install completed with warnings (dependencies installed)",
                    );
                }
            }
        }

        match classify::classify_failure(&error_text) {
            // 2. Warnings and deprecations surfaced as a non-zero exit.
            FailureKind::Benign => match self.count_lines(sandbox, MODULES_LISTING_PROBE).await {
                Some(lines) if lines > TRIVIAL_LISTING_LINES => {
                    info!(command, "benign failure reclassified");
                    ShellOutcome::completed_with_warning(command, "Completed with npm warnings (safe to ignore)")
                }
                _ if self.policy.lenient_reclassification => {
                    warn!(command, error = %error_text, "unverified benign failure reported as completed");
                    ShellOutcome::completed_with_warning(command, "Completed with warnings")
                }
                _ => ShellOutcome::failed(command, error_text).with_exit_code(err.exit_code()),
            },
            // 3. Timed out, possibly after finishing the useful work.
            FailureKind::Timeout => match self.count_lines(sandbox, MODULES_LISTING_PROBE).await {
                Some(lines) if lines > TRIVIAL_LISTING_LINES => ShellOutcome::completed_with_warning(
                    command,
                    "Installation timed out but dependencies appear to be installed",
                ),
                Some(_) => ShellOutcome::failed(command, "Installation timeout - dependencies not fully installed"),
                None => ShellOutcome::failed(command, "Installation timeout"),
            },
            // 4. A real failure.
            FailureKind::Genuine => {
                warn!(command, error = %error_text, "command failed");
                ShellOutcome::failed(command, error_text).with_exit_code(err.exit_code())
            }
        }
    }

    /// Runs a counting probe in the work dir. `None` when the probe raised or
    /// printed something other than a number.
    async fn count_lines(&self, sandbox: &dyn Sandbox, probe: &str) -> Option<usize> {
        let options = RunOptions::in_dir(&self.policy.work_dir).with_timeout(self.policy.probe_timeout);
        match sandbox.run(probe, options).await {
            Ok(output) => output.stdout.trim().parse().ok(),
            Err(err) => {
                debug!(probe, error = %err, "dependency probe failed");
                None
            }
        }
    }
}

async fn emit(tx: &mpsc::Sender<ProgressEvent>, event: ProgressEvent) {
    if tx.send(event).await.is_err() {
        debug!("progress receiver dropped");
    }
}
