//! Scripted sandbox and provider used by the unit tests.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::llm::{ChatMessage, ChatModel};
use crate::sandbox::{
    absolute_path, BackgroundProcess, CommandOutput, RunOptions, Sandbox, SandboxError, SandboxProvider,
};

#[derive(Debug, Clone)]
pub enum Reply {
    Stdout(String),
    Exit { code: i32, stderr: String },
    Timeout,
    Backend(String),
}

impl Reply {
    pub fn stdout(text: &str) -> Self {
        Reply::Stdout(text.to_string())
    }

    pub fn exit(code: i32, stderr: &str) -> Self {
        Reply::Exit {
            code,
            stderr: stderr.to_string(),
        }
    }

    fn to_result(&self, timeout: Option<Duration>) -> Result<CommandOutput, SandboxError> {
        match self {
            Reply::Stdout(stdout) => Ok(CommandOutput {
                exit_code: 0,
                stdout: stdout.clone(),
                stderr: String::new(),
            }),
            Reply::Exit { code, stderr } => Err(SandboxError::CommandExit {
                exit_code: *code,
                stdout: String::new(),
                stderr: stderr.clone(),
            }),
            Reply::Timeout => Err(SandboxError::Timeout(timeout.unwrap_or(Duration::from_secs(60)))),
            Reply::Backend(message) => Err(SandboxError::Backend(message.clone())),
        }
    }
}

struct Rule {
    pattern: String,
    reply: Reply,
    remaining: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedRun {
    pub command: String,
    pub cwd: Option<String>,
    pub timeout: Option<Duration>,
}

/// In-memory sandbox. Commands are answered by the first rule whose pattern
/// is a substring of the command; unmatched commands succeed with no output.
#[derive(Default)]
pub struct FakeSandbox {
    rules: Mutex<Vec<Rule>>,
    runs: Mutex<Vec<RecordedRun>>,
    spawned: Mutex<Vec<(String, Option<String>)>>,
    files: Mutex<BTreeMap<String, String>>,
    spawn_error: Mutex<Option<String>>,
    write_error: Mutex<Option<String>>,
}

impl FakeSandbox {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn on(&self, pattern: &str, reply: Reply) -> &Self {
        self.push_rule(pattern, reply, None)
    }

    /// Like [`FakeSandbox::on`] but only for the next `times` matches.
    pub fn on_times(&self, pattern: &str, times: usize, reply: Reply) -> &Self {
        self.push_rule(pattern, reply, Some(times))
    }

    fn push_rule(&self, pattern: &str, reply: Reply, remaining: Option<usize>) -> &Self {
        self.rules.lock().unwrap().push(Rule {
            pattern: pattern.to_string(),
            reply,
            remaining,
        });
        self
    }

    pub fn fail_spawn(&self, message: &str) {
        *self.spawn_error.lock().unwrap() = Some(message.to_string());
    }

    pub fn fail_writes(&self, message: &str) {
        *self.write_error.lock().unwrap() = Some(message.to_string());
    }

    pub fn put_file(&self, path: &str, content: &str) {
        self.files.lock().unwrap().insert(absolute_path(path), content.to_string());
    }

    pub fn runs(&self) -> Vec<RecordedRun> {
        self.runs.lock().unwrap().clone()
    }

    pub fn commands(&self) -> Vec<String> {
        self.runs().into_iter().map(|run| run.command).collect()
    }

    pub fn count_matching(&self, pattern: &str) -> usize {
        self.commands().iter().filter(|c| c.contains(pattern)).count()
    }

    pub fn spawned(&self) -> Vec<(String, Option<String>)> {
        self.spawned.lock().unwrap().clone()
    }

    pub fn file(&self, path: &str) -> Option<String> {
        self.files.lock().unwrap().get(&absolute_path(path)).cloned()
    }
}

#[async_trait]
impl Sandbox for FakeSandbox {
    fn id(&self) -> &str {
        "fake-sandbox"
    }

    async fn write_file(&self, path: &str, content: &str) -> Result<(), SandboxError> {
        if let Some(message) = self.write_error.lock().unwrap().clone() {
            return Err(SandboxError::Backend(message));
        }
        self.put_file(path, content);
        Ok(())
    }

    async fn read_file(&self, path: &str) -> Result<String, SandboxError> {
        self.file(path)
            .ok_or_else(|| SandboxError::Backend(format!("file not found: {path}")))
    }

    async fn run(&self, command: &str, options: RunOptions) -> Result<CommandOutput, SandboxError> {
        self.runs.lock().unwrap().push(RecordedRun {
            command: command.to_string(),
            cwd: options.cwd.clone(),
            timeout: options.timeout,
        });
        let mut rules = self.rules.lock().unwrap();
        let rule = rules
            .iter_mut()
            .find(|rule| command.contains(&rule.pattern) && rule.remaining != Some(0));
        match rule {
            Some(rule) => {
                if let Some(remaining) = rule.remaining.as_mut() {
                    *remaining -= 1;
                }
                rule.reply.to_result(options.timeout)
            }
            None => Ok(CommandOutput::default()),
        }
    }

    async fn spawn(&self, command: &str, cwd: Option<&str>) -> Result<BackgroundProcess, SandboxError> {
        self.spawned
            .lock()
            .unwrap()
            .push((command.to_string(), cwd.map(str::to_string)));
        match self.spawn_error.lock().unwrap().clone() {
            Some(message) => Err(SandboxError::Backend(message)),
            None => Ok(BackgroundProcess { pid: Some(4242) }),
        }
    }

    async fn host(&self, port: u16) -> Result<String, SandboxError> {
        Ok(format!("{port}-fake-sandbox.test"))
    }
}

pub struct FakeProvider {
    sandbox: Arc<FakeSandbox>,
    created: AtomicUsize,
    templates: Mutex<Vec<String>>,
    create_error: Mutex<Option<String>>,
    create_delay: Duration,
}

impl FakeProvider {
    pub fn new(sandbox: Arc<FakeSandbox>) -> Arc<Self> {
        Arc::new(Self::unwrapped(sandbox))
    }

    fn unwrapped(sandbox: Arc<FakeSandbox>) -> Self {
        Self {
            sandbox,
            created: AtomicUsize::new(0),
            templates: Mutex::new(Vec::new()),
            create_error: Mutex::new(None),
            create_delay: Duration::ZERO,
        }
    }

    /// Provider whose creations take `delay`, widening the window for races.
    pub fn delayed(sandbox: Arc<FakeSandbox>, delay: Duration) -> Arc<Self> {
        let mut provider = Self::unwrapped(sandbox);
        provider.create_delay = delay;
        Arc::new(provider)
    }

    pub fn fail_next_create(&self, message: &str) {
        *self.create_error.lock().unwrap() = Some(message.to_string());
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn templates(&self) -> Vec<String> {
        self.templates.lock().unwrap().clone()
    }
}

#[async_trait]
impl SandboxProvider for FakeProvider {
    async fn create(&self, template: &str, _idle_timeout: Duration) -> Result<Arc<dyn Sandbox>, SandboxError> {
        if !self.create_delay.is_zero() {
            tokio::time::sleep(self.create_delay).await;
        }
        if let Some(message) = self.create_error.lock().unwrap().take() {
            return Err(SandboxError::Unavailable(message));
        }
        self.created.fetch_add(1, Ordering::SeqCst);
        self.templates.lock().unwrap().push(template.to_string());
        let sandbox: Arc<dyn Sandbox> = self.sandbox.clone();
        Ok(sandbox)
    }
}

/// Chat model that answers every request with the same text.
pub struct FakeChatModel {
    reply: String,
    seen: Mutex<Vec<Vec<ChatMessage>>>,
}

impl FakeChatModel {
    pub fn new(reply: &str) -> Arc<Self> {
        Arc::new(Self {
            reply: reply.to_string(),
            seen: Mutex::new(Vec::new()),
        })
    }

    pub fn requests(&self) -> Vec<Vec<ChatMessage>> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChatModel for FakeChatModel {
    async fn complete(&self, messages: &[ChatMessage]) -> anyhow::Result<String> {
        self.seen.lock().unwrap().push(messages.to_vec());
        Ok(self.reply.clone())
    }
}
