//! CLI command definitions and handlers

pub mod config;
pub mod repl;
pub mod sessions;

use crate::chat::ChatOrchestrator;
use crate::config::Config;
use crate::content::{ContentSplitter, RedactionConfig};
use crate::request::{HttpTransport, RequestController};
use crate::store::{FileCache, MemoryCache, SessionCache, SessionStore, STORAGE_FILE};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::sync::Arc;

/// QuantChat - streaming market-analysis chat assistant
#[derive(Parser, Debug)]
#[command(name = "quantchat")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Interactive chat in the terminal (default)
    Chat,

    /// Manage saved conversations
    Sessions(sessions::SessionsArgs),

    /// Show or initialize configuration
    Config(config::ConfigArgs),
}

/// Build the session cache the way the config asks for it.
pub(crate) fn build_cache(config: &Config) -> Box<dyn SessionCache> {
    if !config.session.persist {
        return Box::new(MemoryCache::new());
    }
    match &config.session.storage_path {
        Some(path) => Box::new(FileCache::new(path.join(STORAGE_FILE))),
        None => match FileCache::in_data_dir() {
            Some(cache) => Box::new(cache),
            None => {
                tracing::warn!("no data directory available, sessions will not persist");
                Box::new(MemoryCache::new())
            }
        },
    }
}

/// Assemble the full orchestrator stack from configuration.
pub(crate) fn build_orchestrator(config: &Config) -> Result<ChatOrchestrator> {
    let api_key = config
        .backend
        .api_key
        .clone()
        .context("no API key configured; set QUANTCHAT_API_KEY or backend.api_key")?;

    let mut redaction = RedactionConfig::default();
    if let Some(placeholder) = &config.redaction.placeholder {
        redaction.placeholder = placeholder.clone();
    }

    let transport = Arc::new(HttpTransport::new(config.backend.endpoint.clone(), api_key));
    let controller = RequestController::new(
        transport,
        ContentSplitter::new(redaction),
        config.backend.user.clone(),
    );
    let store = SessionStore::new(build_cache(config));
    Ok(ChatOrchestrator::new(store, controller))
}
