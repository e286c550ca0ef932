pub mod api;
pub mod classify;
pub mod config;
pub mod execution;
pub mod generation;
pub mod inspect;
pub mod llm;
pub mod models;
pub mod parser;
pub mod prompts;
pub mod readiness;
pub mod registry;
pub mod sandbox;
pub mod shell;

#[cfg(test)]
mod testing;
