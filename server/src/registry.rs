use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use tokio::sync::OnceCell;
use tracing::info;

use crate::sandbox::{Sandbox, SandboxError, SandboxProvider, HOME_DIR};

/// Working directory a session starts in and returns to on `cd ~`.
pub const DEFAULT_WORKING_DIR: &str = HOME_DIR;
pub const DEFAULT_TEMPLATE: &str = "code-interpreter-v1";
pub const SANDBOX_IDLE_TIMEOUT: Duration = Duration::from_secs(3600);

struct SessionEntry {
    sandbox: OnceCell<Arc<dyn Sandbox>>,
    working_dir: RwLock<String>,
}

impl SessionEntry {
    fn new() -> Self {
        Self {
            sandbox: OnceCell::new(),
            working_dir: RwLock::new(DEFAULT_WORKING_DIR.to_string()),
        }
    }
}

/// Process-wide map from session id to its sandbox and shell working
/// directory. Entries live for the life of the process.
///
/// Each session's sandbox is created at most once: concurrent first requests
/// for the same id wait on the same creation and receive the same handle. A
/// failed creation leaves the slot empty so a later request can retry.
pub struct SessionRegistry {
    provider: Arc<dyn SandboxProvider>,
    template: String,
    idle_timeout: Duration,
    sessions: Mutex<HashMap<String, Arc<SessionEntry>>>,
}

impl SessionRegistry {
    pub fn new(provider: Arc<dyn SandboxProvider>, template: impl Into<String>) -> Self {
        Self {
            provider,
            template: template.into(),
            idle_timeout: SANDBOX_IDLE_TIMEOUT,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    fn entry(&self, session_id: &str) -> Arc<SessionEntry> {
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        sessions
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(SessionEntry::new()))
            .clone()
    }

    /// The session's sandbox, if one has been created.
    pub fn get(&self, session_id: &str) -> Option<Arc<dyn Sandbox>> {
        let sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        sessions.get(session_id)?.sandbox.get().cloned()
    }

    pub async fn get_or_create(&self, session_id: &str) -> Result<Arc<dyn Sandbox>, SandboxError> {
        let entry = self.entry(session_id);
        let sandbox = entry
            .sandbox
            .get_or_try_init(|| async {
                info!(session_id, template = %self.template, "creating sandbox for session");
                let sandbox = self.provider.create(&self.template, self.idle_timeout).await?;
                info!(session_id, sandbox_id = sandbox.id(), "sandbox ready");
                Ok::<_, SandboxError>(sandbox)
            })
            .await?;
        Ok(Arc::clone(sandbox))
    }

    pub fn working_dir(&self, session_id: &str) -> String {
        let sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        match sessions.get(session_id) {
            Some(entry) => entry
                .working_dir
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
            None => DEFAULT_WORKING_DIR.to_string(),
        }
    }

    pub fn set_working_dir(&self, session_id: &str, path: impl Into<String>) {
        let entry = self.entry(session_id);
        let mut working_dir = entry.working_dir.write().unwrap_or_else(PoisonError::into_inner);
        *working_dir = path.into();
    }
}
