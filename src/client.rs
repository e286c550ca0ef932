use anyhow::{bail, Context, Result};
use futures_util::StreamExt;
use reqwest::header::ACCEPT;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use url::Url;

use codeforge_server::generation::Generated;
use codeforge_server::llm::ModelProvider;
use codeforge_server::models::{Action, ProgressEvent};
use codeforge_server::shell::ShellResponse;

#[derive(Clone)]
pub struct Client {
    base: Url,
    http: reqwest::Client,
}

impl Client {
    pub fn new(base: &str) -> Result<Self> {
        let mut base = Url::parse(base).with_context(|| format!("invalid server url {base:?}"))?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        Ok(Self {
            base,
            http: reqwest::Client::new(),
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base.join(path).with_context(|| format!("building url for {path}"))
    }

    async fn post_json<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        let res = self.http.post(self.endpoint(path)?).json(body).send().await?;
        let status = res.status();
        if !status.is_success() {
            bail!("{path} failed with {status}: {}", error_detail(&res.text().await.unwrap_or_default()));
        }
        res.json().await.with_context(|| format!("decoding {path} response"))
    }

    pub async fn generate(&self, prompt: &str, provider: ModelProvider) -> Result<Generated> {
        self.post_json("api/generate", &json!({ "prompt": prompt, "model_provider": provider }))
            .await
    }

    pub async fn terminal(&self, session_id: &str, command: &str) -> Result<ShellResponse> {
        self.post_json("api/terminal", &json!({ "session_id": session_id, "command": command }))
            .await
    }

    /// Submits `actions` to the streaming endpoint and hands each progress
    /// event to `on_event` as it arrives. Returns the terminal event.
    pub async fn execute(
        &self,
        session_id: &str,
        actions: &[Action],
        mut on_event: impl FnMut(&ProgressEvent),
    ) -> Result<ProgressEvent> {
        let res = self
            .http
            .post(self.endpoint("api/execute")?)
            .header(ACCEPT, "text/event-stream")
            .json(&json!({ "session_id": session_id, "actions": actions }))
            .send()
            .await?;
        let status = res.status();
        if !status.is_success() {
            bail!("api/execute failed with {status}: {}", error_detail(&res.text().await.unwrap_or_default()));
        }

        let mut decoder = SseDecoder::default();
        let mut body = res.bytes_stream();
        while let Some(chunk) = body.next().await {
            for data in decoder.push(&chunk.context("reading event stream")?) {
                let event: ProgressEvent =
                    serde_json::from_str(&data).with_context(|| format!("decoding progress event {data:?}"))?;
                on_event(&event);
                if event.is_terminal() {
                    return Ok(event);
                }
            }
        }
        bail!("event stream ended without a complete or error event")
    }
}

/// Pulls `detail` out of an error body, falling back to the raw text.
fn error_detail(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("detail").and_then(|d| d.as_str()).map(str::to_string))
        .unwrap_or_else(|| body.to_string())
}

/// Incremental `text/event-stream` parser yielding the `data` payload of
/// each complete event. Comment lines (keep-alives) are dropped.
#[derive(Default)]
pub struct SseDecoder {
    buffer: String,
}

impl SseDecoder {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));
        if self.buffer.contains('\r') {
            self.buffer = self.buffer.replace("\r\n", "\n");
        }

        let mut payloads = Vec::new();
        while let Some(end) = self.buffer.find("\n\n") {
            let block: String = self.buffer.drain(..end + 2).collect();
            let data: Vec<&str> = block
                .lines()
                .filter_map(|line| line.strip_prefix("data:"))
                .map(|value| value.strip_prefix(' ').unwrap_or(value))
                .collect();
            if !data.is_empty() {
                payloads.push(data.join("\n"));
            }
        }
        payloads
    }
}
