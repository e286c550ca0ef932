mod client;
mod config;

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use codeforge_server::llm::ModelProvider;
use codeforge_server::models::{ActionOutcome, Artifact, ProgressEvent, ProgressStatus};
use codeforge_server::parser::parse_artifact;

use crate::client::Client;
use crate::config::{DEFAULT_SERVER_URL, DEFAULT_SESSION, SERVER_URL_ENV};

#[derive(Parser, Debug)]
#[command(name = "forge", version, about = "CodeForge CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
    /// Server base URL
    #[arg(long, global = true, env = SERVER_URL_ENV, default_value = DEFAULT_SERVER_URL)]
    server: String,
    /// Verbose logs
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Extract the artifact from a saved model reply and print it as JSON
    Parse {
        /// File holding the raw reply
        file: PathBuf,
    },
    /// Generate a project from a prompt
    Generate {
        prompt: String,
        #[arg(long, value_enum, default_value_t = Provider::Gpt)]
        provider: Provider,
        #[arg(long, default_value = DEFAULT_SESSION)]
        session: String,
        /// Execute the generated actions in the session's sandbox
        #[arg(long)]
        run: bool,
    },
    /// Run a command in a session's interactive shell
    Terminal {
        #[arg(long, default_value = DEFAULT_SESSION)]
        session: String,
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum Provider {
    Gpt,
    Claude,
}

impl From<Provider> for ModelProvider {
    fn from(p: Provider) -> Self {
        match p {
            Provider::Gpt => ModelProvider::Gpt,
            Provider::Claude => ModelProvider::Claude,
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "info" } else { "warn" };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("FORGE_LOG").unwrap_or_else(|_| filter.into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    match cli.command {
        Commands::Parse { file } => cmd_parse(&file),
        Commands::Generate { prompt, provider, session, run } => {
            let client = Client::new(&cli.server)?;
            cmd_generate(&client, &prompt, provider.into(), &session, run).await
        }
        Commands::Terminal { session, command } => {
            let client = Client::new(&cli.server)?;
            cmd_terminal(&client, &session, &command.join(" ")).await
        }
    }
}

fn read_artifact(path: &Path) -> Result<Option<Artifact>> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    Ok(parse_artifact(&text))
}

fn cmd_parse(path: &Path) -> Result<ExitCode> {
    match read_artifact(path)? {
        Some(artifact) => {
            println!("{}", serde_json::to_string_pretty(&artifact)?);
            Ok(ExitCode::SUCCESS)
        }
        None => {
            eprintln!("❌ No complete artifact found in {}", path.display());
            Ok(ExitCode::FAILURE)
        }
    }
}

async fn cmd_generate(
    client: &Client,
    prompt: &str,
    provider: ModelProvider,
    session: &str,
    run: bool,
) -> Result<ExitCode> {
    println!("🤖 Generating with {provider}…");
    let generated = client.generate(prompt, provider).await?;

    let Some(artifact) = generated.artifact else {
        println!("{}", generated.content);
        eprintln!("⚠️  The reply contained no runnable artifact");
        return Ok(ExitCode::FAILURE);
    };
    let title = artifact.title.as_deref().or(artifact.id.as_deref()).unwrap_or("untitled");
    println!("📦 {} ({} actions)", title, artifact.actions.len());
    if !run {
        println!("{}", serde_json::to_string_pretty(&artifact)?);
        return Ok(ExitCode::SUCCESS);
    }

    info!(session, "executing artifact");
    let last = client
        .execute(session, &artifact.actions, |event| {
            if let Some(line) = describe(event) {
                println!("{line}");
            }
        })
        .await?;

    Ok(match last {
        ProgressEvent::Complete { preview_url } => {
            match preview_url {
                Some(url) => println!("✅ Preview: {url}"),
                None => println!("✅ Done"),
            }
            ExitCode::SUCCESS
        }
        ProgressEvent::Error { message } => {
            eprintln!("❌ {message}");
            ExitCode::FAILURE
        }
        ProgressEvent::Progress { .. } => ExitCode::FAILURE,
    })
}

async fn cmd_terminal(client: &Client, session: &str, command: &str) -> Result<ExitCode> {
    let res = client.terminal(session, command).await?;
    print!("{}", res.stdout);
    eprint!("{}", res.stderr);
    // exit statuses are a single byte
    Ok(ExitCode::from(res.exit_code.clamp(0, 255) as u8))
}

/// One console line per progress event; terminal events are reported by the caller.
fn describe(event: &ProgressEvent) -> Option<String> {
    let ProgressEvent::Progress { action_index, status, result, .. } = event else {
        return None;
    };
    let n = action_index + 1;
    Some(match (status, result) {
        (ProgressStatus::Executing, _) => format!("▶️  [{n}] executing"),
        (ProgressStatus::WaitingForServer, _) => format!("⏳ [{n}] waiting for dev server"),
        (ProgressStatus::Completed, Some(ActionOutcome::File(file))) => format!("📝 [{n}] wrote {}", file.path),
        (ProgressStatus::Completed, Some(ActionOutcome::Shell(shell))) => {
            let mut line = format!("🔧 [{n}] {} → {:?}", shell.command, shell.status);
            if let Some(warning) = &shell.warning {
                line.push_str(&format!(" ({warning})"));
            }
            if let Some(error) = &shell.error {
                line.push_str(&format!(": {error}"));
            }
            line
        }
        (ProgressStatus::Completed, None) => format!("✔️  [{n}] completed"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use codeforge_server::models::{FileOutcome, ShellOutcome};
    use std::io::Write;

    #[test]
    fn test_read_artifact_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"Here you go
<artifact id="hello" title="Hello">
<action type="file" filePath="index.js">console.log("hi")</action>
<action type="shell">node index.js</action>
</artifact>"#
        )
        .unwrap();

        let artifact = read_artifact(file.path()).unwrap().unwrap();
        assert_eq!(artifact.id.as_deref(), Some("hello"));
        assert_eq!(artifact.actions.len(), 2);
    }

    #[test]
    fn test_read_artifact_without_closing_tag() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"<artifact id="x" title="X"><action type="shell">ls</action>"#).unwrap();
        assert_eq!(read_artifact(file.path()).unwrap(), None);
        assert!(read_artifact(Path::new("/definitely/missing.txt")).is_err());
    }

    #[test]
    fn test_describe_events() {
        assert_eq!(
            describe(&ProgressEvent::completed(0, ActionOutcome::File(FileOutcome::created("app/page.tsx")))),
            Some("📝 [1] wrote app/page.tsx".to_string())
        );
        let warned = ShellOutcome::completed_with_warning("npm install", "Completed with warnings");
        let line = describe(&ProgressEvent::completed(2, ActionOutcome::Shell(warned))).unwrap();
        assert!(line.starts_with("🔧 [3] npm install"));
        assert!(line.ends_with("(Completed with warnings)"));
        assert_eq!(describe(&ProgressEvent::Complete { preview_url: None }), None);
    }

    #[test]
    fn test_cli_parses_terminal_command() {
        let cli = Cli::try_parse_from(["forge", "terminal", "--session", "s1", "ls", "-la"]).unwrap();
        match cli.command {
            Commands::Terminal { session, command } => {
                assert_eq!(session, "s1");
                assert_eq!(command.join(" "), "ls -la");
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
