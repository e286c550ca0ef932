use std::env;

use anyhow::{bail, Result};

use crate::llm::{DEFAULT_ANTHROPIC_MODEL, DEFAULT_OPENAI_MODEL};
use crate::registry::DEFAULT_TEMPLATE;

pub const DEFAULT_SANDBOX_IMAGE: &str = "node:20-bookworm";
pub const DEFAULT_ALLOWED_ORIGIN: &str = "http://localhost:3000";

/// Server settings read from the environment (and `.env`, loaded by the
/// binary before this runs).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub openai_api_key: Option<String>,
    pub anthropic_api_key: Option<String>,
    pub openai_model: String,
    pub anthropic_model: String,
    pub sandbox_template: String,
    /// Docker image backing named templates.
    pub sandbox_image: String,
    pub allowed_origin: String,
    pub strict_reclassification: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            openai_api_key: None,
            anthropic_api_key: None,
            openai_model: DEFAULT_OPENAI_MODEL.to_string(),
            anthropic_model: DEFAULT_ANTHROPIC_MODEL.to_string(),
            sandbox_template: DEFAULT_TEMPLATE.to_string(),
            sandbox_image: DEFAULT_SANDBOX_IMAGE.to_string(),
            allowed_origin: DEFAULT_ALLOWED_ORIGIN.to_string(),
            strict_reclassification: false,
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        // blank values count as unset
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let defaults = Self::default();

        let strict_reclassification = match var("FORGE_STRICT_RECLASSIFICATION") {
            None => defaults.strict_reclassification,
            Some(value) => parse_bool(&value)?,
        };

        Ok(Self {
            openai_api_key: var("OPENAI_API_KEY"),
            anthropic_api_key: var("ANTHROPIC_API_KEY"),
            openai_model: var("OPENAI_MODEL").unwrap_or(defaults.openai_model),
            anthropic_model: var("ANTHROPIC_MODEL").unwrap_or(defaults.anthropic_model),
            sandbox_template: var("FORGE_SANDBOX_TEMPLATE").unwrap_or(defaults.sandbox_template),
            sandbox_image: var("FORGE_SANDBOX_IMAGE").unwrap_or(defaults.sandbox_image),
            allowed_origin: var("FORGE_ALLOWED_ORIGIN").unwrap_or(defaults.allowed_origin),
            strict_reclassification,
        })
    }
}

fn parse_bool(value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => bail!("FORGE_STRICT_RECLASSIFICATION must be a boolean, got {other:?}"),
    }
}
