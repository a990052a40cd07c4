//! Saved-conversation management commands

use crate::config::Config;
use crate::store::SessionStore;
use anyhow::Result;
use clap::{Args, Subcommand};

#[derive(Args, Debug)]
pub struct SessionsArgs {
    #[command(subcommand)]
    pub action: SessionsAction,
}

#[derive(Subcommand, Debug)]
pub enum SessionsAction {
    /// List saved conversations, most recently used first
    List,

    /// Delete a conversation by id
    Delete { id: String },

    /// Rename a conversation
    Rename { id: String, title: String },
}

pub async fn execute(args: SessionsArgs) -> Result<()> {
    let config = Config::load().await?;
    let mut store = SessionStore::new(super::build_cache(&config));

    match args.action {
        SessionsAction::List => {
            if store.sessions().is_empty() {
                println!("No saved conversations");
                return Ok(());
            }
            for session in store.sessions() {
                let used = session
                    .last_used_at
                    .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                    .unwrap_or_default();
                println!(
                    "{}  {:<20}  {} messages  {}",
                    session.id,
                    session.title,
                    session.messages.len(),
                    used
                );
            }
        }
        SessionsAction::Delete { id } => {
            if store.delete_session(&id) {
                println!("Deleted {id}");
            } else {
                anyhow::bail!("No session with id {id}");
            }
        }
        SessionsAction::Rename { id, title } => {
            if store.rename_session(&id, &title) {
                println!("Renamed {id}");
            } else {
                anyhow::bail!("No session with id {id}, or empty title");
            }
        }
    }
    Ok(())
}
