use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use codeforge_server::api::{cors_layer, router, AppState};
use codeforge_server::config::ServerConfig;
use codeforge_server::execution::ExecutionPolicy;
use codeforge_server::generation::CodeGenerator;
use codeforge_server::llm::{AnthropicChat, ModelProvider, OpenAiChat};
use codeforge_server::registry::SessionRegistry;
use codeforge_server::sandbox::DockerSandboxProvider;

const LOCAL_SERVER_HOST: &str = "127.0.0.1:8000";

#[derive(Parser, Debug)]
#[command(name = "codeforge-server", version, about = "CodeForge generation and sandbox server")]
struct ServerCli {
    /// Server host and port
    #[arg(long, default_value = LOCAL_SERVER_HOST)]
    bind: String,
    /// Verbose logs
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let cli = ServerCli::parse();

    let filter = if cli.verbose { "info" } else { "warn" };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("FORGE_LOG").unwrap_or_else(|_| filter.into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = ServerConfig::from_env().context("loading configuration")?;
    start_server(&cli.bind, config).await
}

fn code_generator(config: &ServerConfig) -> CodeGenerator {
    let mut generator = CodeGenerator::new();
    match &config.openai_api_key {
        Some(key) => {
            generator = generator.with_model(ModelProvider::Gpt, Arc::new(OpenAiChat::new(key, &config.openai_model)))
        }
        None => warn!("OPENAI_API_KEY not set; the gpt provider is disabled"),
    }
    match &config.anthropic_api_key {
        Some(key) => {
            generator = generator.with_model(
                ModelProvider::Claude,
                Arc::new(AnthropicChat::new(key, &config.anthropic_model)),
            )
        }
        None => warn!("ANTHROPIC_API_KEY not set; the claude provider is disabled"),
    }
    generator
}

async fn start_server(bind_addr: &str, config: ServerConfig) -> Result<()> {
    let policy = ExecutionPolicy {
        lenient_reclassification: !config.strict_reclassification,
        ..ExecutionPolicy::default()
    };
    let provider = Arc::new(
        DockerSandboxProvider::new(&config.sandbox_image).with_published_ports(vec![policy.preview_port()]),
    );
    let registry = Arc::new(SessionRegistry::new(provider, &config.sandbox_template));
    info!(template = registry.template(), image = %config.sandbox_image, "sandbox backend: docker");
    let state = AppState::new(registry, policy, code_generator(&config));

    let app = router(state)
        .layer(cors_layer(&config.allowed_origin)?)
        .layer(TraceLayer::new_for_http());

    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("binding {bind_addr}"))?;
    println!("🌐 Server listening on http://{}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}
