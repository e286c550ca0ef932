//! Read-only views into a session's sandbox: log files, port state and the
//! process table. Each accessor returns `Ok(None)` when the session has no
//! sandbox.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::readiness::{is_listening, port_listing_command};
use crate::registry::SessionRegistry;
use crate::sandbox::{RunOptions, SandboxError, BACKGROUND_LOG_DIR, HOME_DIR};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LogsResponse {
    File { logs: String, source: String },
    Unreadable { error: String },
    /// Directory listing per known log location.
    Listings(BTreeMap<String, LogListing>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogListing {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listing: Option<String>,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortStatus {
    pub port: u16,
    pub stdout: String,
    pub stderr: String,
    pub is_listening: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessList {
    pub processes: String,
    pub error: String,
}

pub struct SandboxInspector {
    registry: Arc<SessionRegistry>,
    work_dir: String,
}

impl SandboxInspector {
    /// `work_dir` is the directory artifact commands run in; the dev-server
    /// trace directory is looked up under it.
    pub fn new(registry: Arc<SessionRegistry>, work_dir: impl Into<String>) -> Self {
        Self {
            registry,
            work_dir: work_dir.into(),
        }
    }

    fn log_locations(&self) -> Vec<String> {
        vec![
            format!("{HOME_DIR}/.npm/_logs"),
            format!("{}/.next/trace", self.work_dir),
            BACKGROUND_LOG_DIR.to_string(),
        ]
    }

    /// Reads `file_path` when given, otherwise lists the known log locations.
    pub async fn logs(&self, session_id: &str, file_path: Option<&str>) -> Result<Option<LogsResponse>, SandboxError> {
        let Some(sandbox) = self.registry.get(session_id) else {
            return Ok(None);
        };

        if let Some(path) = file_path {
            let response = match sandbox.read_file(path).await {
                Ok(logs) => LogsResponse::File {
                    logs,
                    source: path.to_string(),
                },
                Err(err) => LogsResponse::Unreadable { error: err.to_string() },
            };
            return Ok(Some(response));
        }

        let mut listings = BTreeMap::new();
        for location in self.log_locations() {
            let entry = match sandbox.run(&format!("ls -la {location}"), RunOptions::default()).await {
                Ok(output) => LogListing {
                    listing: Some(output.stdout),
                    error: output.stderr,
                },
                Err(err) => LogListing {
                    listing: None,
                    error: err.to_string(),
                },
            };
            listings.insert(location, entry);
        }
        Ok(Some(LogsResponse::Listings(listings)))
    }

    pub async fn port_status(&self, session_id: &str, port: u16) -> Result<Option<PortStatus>, SandboxError> {
        let Some(sandbox) = self.registry.get(session_id) else {
            return Ok(None);
        };
        let output = sandbox.run(&port_listing_command(port), RunOptions::default()).await?;
        Ok(Some(PortStatus {
            port,
            is_listening: is_listening(&output.stdout, port),
            stdout: output.stdout,
            stderr: output.stderr,
        }))
    }

    pub async fn processes(&self, session_id: &str) -> Result<Option<ProcessList>, SandboxError> {
        let Some(sandbox) = self.registry.get(session_id) else {
            return Ok(None);
        };
        let output = sandbox.run("ps aux", RunOptions::default()).await?;
        Ok(Some(ProcessList {
            processes: output.stdout,
            error: output.stderr,
        }))
    }
}
