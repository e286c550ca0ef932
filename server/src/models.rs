use serde::{Deserialize, Serialize};

/// Characters of stdout kept on a shell outcome. Install and build output is
/// large and only its tail is useful in a progress event.
pub const STDOUT_TAIL_CHARS: usize = 1000;

// ---- Artifact schema ----

/// A parsed bundle of ordered actions. `actions` is in document order, which
/// is also execution order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub id: Option<String>,
    pub title: Option<String>,
    #[serde(default)]
    pub actions: Vec<Action>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Action {
    File(FileAction),
    Shell(ShellAction),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileAction {
    #[serde(rename = "filePath", alias = "filepath")]
    pub file_path: String,
    #[serde(default)]
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShellAction {
    pub command: String,
}

impl Action {
    pub fn file(path: impl Into<String>, content: impl Into<String>) -> Self {
        Action::File(FileAction {
            file_path: path.into(),
            content: content.into(),
        })
    }

    pub fn shell(command: impl Into<String>) -> Self {
        Action::Shell(ShellAction {
            command: command.into(),
        })
    }

    /// Checks the invariants a submitted action must hold before it reaches
    /// a sandbox: a non-empty file path, a non-blank command.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Action::File(file) if file.file_path.is_empty() => {
                Err("file action requires a non-empty filePath".to_string())
            }
            Action::Shell(shell) if shell.command.trim().is_empty() => {
                Err("shell action requires a non-empty command".to_string())
            }
            _ => Ok(()),
        }
    }
}

// ---- Outcomes ----

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeStatus {
    Created,
    #[default]
    Completed,
    Started,
    Failed,
    Timeout,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ActionOutcome {
    File(FileOutcome),
    Shell(ShellOutcome),
}

impl ActionOutcome {
    pub fn status(&self) -> OutcomeStatus {
        match self {
            ActionOutcome::File(file) => file.status,
            ActionOutcome::Shell(shell) => shell.status,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileOutcome {
    pub path: String,
    pub status: OutcomeStatus,
}

impl FileOutcome {
    pub fn created(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            status: OutcomeStatus::Created,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ShellOutcome {
    pub command: String,
    pub status: OutcomeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub background: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_time: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug_info: Option<String>,
}

impl ShellOutcome {
    pub fn completed(command: impl Into<String>, exit_code: i32, stdout: String) -> Self {
        Self {
            command: command.into(),
            status: OutcomeStatus::Completed,
            exit_code: Some(exit_code),
            stdout: Some(stdout),
            ..Default::default()
        }
    }

    /// A raised failure overridden to success after independent evidence.
    pub fn completed_with_warning(command: impl Into<String>, warning: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            status: OutcomeStatus::Completed,
            warning: Some(warning.into()),
            ..Default::default()
        }
    }

    pub fn failed(command: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            status: OutcomeStatus::Failed,
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn started(command: impl Into<String>, pid: Option<u32>) -> Self {
        Self {
            command: command.into(),
            status: OutcomeStatus::Started,
            background: true,
            pid,
            ..Default::default()
        }
    }

    pub fn with_exit_code(mut self, exit_code: Option<i32>) -> Self {
        self.exit_code = exit_code;
        self
    }
}

/// Keeps the last `max_chars` characters of `text`.
pub fn tail_chars(text: &str, max_chars: usize) -> String {
    let total = text.chars().count();
    if total <= max_chars {
        return text.to_string();
    }
    text.chars().skip(total - max_chars).collect()
}

// ---- Progress stream ----

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
    Executing,
    WaitingForServer,
    Completed,
}

/// One record on the streaming execution path. Every stream ends with exactly
/// one `Complete` or `Error`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    Progress {
        action_index: usize,
        status: ProgressStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        action: Option<Action>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<ActionOutcome>,
    },
    Complete {
        preview_url: Option<String>,
    },
    Error {
        message: String,
    },
}

impl ProgressEvent {
    pub fn executing(action_index: usize, action: Action) -> Self {
        ProgressEvent::Progress {
            action_index,
            status: ProgressStatus::Executing,
            action: Some(action),
            result: None,
        }
    }

    pub fn waiting_for_server(action_index: usize) -> Self {
        ProgressEvent::Progress {
            action_index,
            status: ProgressStatus::WaitingForServer,
            action: None,
            result: None,
        }
    }

    pub fn completed(action_index: usize, result: ActionOutcome) -> Self {
        ProgressEvent::Progress {
            action_index,
            status: ProgressStatus::Completed,
            action: None,
            result: Some(result),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ProgressEvent::Complete { .. } | ProgressEvent::Error { .. })
    }
}
