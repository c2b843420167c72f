//! Terminal harness for the fallback chat handler.
//!
//! Reads one utterance per line from stdin, routes it the way a voice
//! assistant would and prints the spoken phrases to stdout. Ctrl-C cancels
//! the reply in progress. Tracing goes to stderr.

use async_trait::async_trait;
use clap::Parser;
use ollama_chat::{ChatConfig, FallbackRegistry, FallbackRouter, MessageContext, VoiceHost};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Chat with an Ollama model as a voice-assistant fallback.
#[derive(Parser)]
#[command(name = "ollama-chat", version, about)]
struct Cli {
    /// Path to TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the model name.
    #[arg(short, long)]
    model: Option<String>,

    /// Override the Ollama base URL.
    #[arg(long)]
    host: Option<String>,

    /// Write the effective configuration to the config path and exit.
    #[arg(long)]
    write_config: bool,
}

/// Prints phrases instead of synthesizing them.
struct StdoutVoice;

#[async_trait]
impl VoiceHost for StdoutVoice {
    async fn speak(
        &self,
        text: &str,
        expect_response: bool,
        _wait: bool,
    ) -> ollama_chat::Result<()> {
        let mut out = std::io::stdout().lock();
        write!(out, "{text}")?;
        if expect_response {
            writeln!(out)?;
        }
        out.flush()?;
        Ok(())
    }

    async fn speak_dialog(&self, name: &str) -> ollama_chat::Result<()> {
        let line = match name {
            "noproblem" => "No problem.",
            other => other,
        };
        println!("{line}");
        Ok(())
    }
}

/// Single-handler registry: there is nothing else in the chain.
struct LoggingRegistry;

impl FallbackRegistry for LoggingRegistry {
    fn register_fallback(&self, handler: &str, priority: i32) -> ollama_chat::Result<()> {
        info!(priority, "register fallback {handler}");
        Ok(())
    }

    fn remove_fallback(&self, handler: &str) -> ollama_chat::Result<()> {
        info!("remove fallback {handler}");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("ollama_chat=info,warn")),
        )
        .init();

    let cli = Cli::parse();

    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(ChatConfig::default_config_path);
    let mut config = if config_path.exists() {
        ChatConfig::from_file(&config_path)?
    } else {
        ChatConfig::default()
    };
    if let Some(model) = cli.model {
        config.model = model;
    }
    if let Some(host) = cli.host {
        config.host = host;
    }

    if cli.write_config {
        config.save_to_file(&config_path)?;
        println!("wrote {}", config_path.display());
        return Ok(());
    }

    info!(model = %config.model, host = %config.host, "ollama-chat starting");

    let mut router =
        FallbackRouter::from_config(config, Arc::new(StdoutVoice), Arc::new(LoggingRegistry))?;
    router.initialize()?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let mut context = MessageContext::new();
        router
            .handle_utterance(std::slice::from_ref(&line), &mut context)
            .await;
        if let Some(lang) = context.get(ollama_chat::host::LANG_KEY) {
            info!("detected lang {lang}");
        }

        if router.converse(Some(line.as_str())).await {
            continue;
        }

        let cancel = router.cancel_handle();
        let turn = router.handle_fallback(&line);
        tokio::pin!(turn);
        let handled = tokio::select! {
            handled = &mut turn => handled,
            _ = tokio::signal::ctrl_c() => {
                cancel.cancel();
                turn.await
            }
        };
        if !handled {
            println!("(not handled)");
        }
    }

    router.shutdown()?;
    info!("ollama-chat shut down cleanly");
    Ok(())
}
