use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::llm::{ChatMessage, ChatModel, ModelProvider};
use crate::models::Artifact;
use crate::parser::parse_artifact;
use crate::prompts::build_messages;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Generated {
    pub content: String,
    pub artifact: Option<Artifact>,
}

#[derive(Debug, thiserror::Error)]
pub enum GenerateError {
    #[error("no API key configured for the {0} provider")]
    NotConfigured(ModelProvider),
    #[error("{0:#}")]
    Model(anyhow::Error),
}

/// Asks the selected model for code and extracts the artifact from its reply.
#[derive(Default)]
pub struct CodeGenerator {
    gpt: Option<Arc<dyn ChatModel>>,
    claude: Option<Arc<dyn ChatModel>>,
}

impl CodeGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_model(mut self, provider: ModelProvider, model: Arc<dyn ChatModel>) -> Self {
        match provider {
            ModelProvider::Gpt => self.gpt = Some(model),
            ModelProvider::Claude => self.claude = Some(model),
        }
        self
    }

    fn model(&self, provider: ModelProvider) -> Option<&Arc<dyn ChatModel>> {
        match provider {
            ModelProvider::Gpt => self.gpt.as_ref(),
            ModelProvider::Claude => self.claude.as_ref(),
        }
    }

    pub async fn generate(
        &self,
        prompt: &str,
        history: &[ChatMessage],
        provider: ModelProvider,
    ) -> Result<Generated, GenerateError> {
        let model = self.model(provider).ok_or(GenerateError::NotConfigured(provider))?;
        let messages = build_messages(prompt, history);

        let content = model.complete(&messages).await.map_err(GenerateError::Model)?;
        let artifact = parse_artifact(&content);
        match &artifact {
            Some(artifact) => info!(%provider, actions = artifact.actions.len(), "generated artifact"),
            None => warn!(%provider, chars = content.len(), "response contained no complete artifact"),
        }

        Ok(Generated { content, artifact })
    }
}
