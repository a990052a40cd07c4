//! Interactive terminal chat
//!
//! A thin presentation collaborator over the orchestrator: reads lines from
//! stdin, sends them, and prints the completed answer plus follow-up
//! suggestions. Slash commands cover the session operations.

use crate::chat::ChatOrchestrator;
use crate::config::Config;
use crate::store::{ChangeKind, Role};
use anyhow::Result;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

pub async fn run() -> Result<()> {
    let config = Config::load().await?;
    let orchestrator = Arc::new(super::build_orchestrator(&config)?);

    // Surface turn progress through the store's change feed.
    let mut events = orchestrator.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if event.change == ChangeKind::TurnStarted {
                eprintln!("…");
            }
        }
    });

    println!("quantchat — 输入问题开始对话 (/help 查看命令)");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim().to_string();
        if line.is_empty() {
            continue;
        }
        match line.as_str() {
            "/quit" | "/exit" => break,
            "/help" => {
                println!("/new 新会话  /sessions 历史  /select <n> 切换  /delete <n> 删除  /quit 退出");
            }
            "/new" => {
                orchestrator.new_session();
                println!("(新会话)");
            }
            "/sessions" => {
                orchestrator.with_store(|store| {
                    for (i, session) in store.sessions().iter().enumerate() {
                        let marker = if store.active_id() == Some(session.id.as_str()) {
                            "*"
                        } else {
                            " "
                        };
                        println!("{marker} {i}: {} — {}", session.title, session.preview);
                    }
                });
            }
            _ if line.starts_with("/select ") || line.starts_with("/delete ") => {
                let index: Option<usize> = line
                    .split_whitespace()
                    .nth(1)
                    .and_then(|n| n.parse().ok());
                let id = index.and_then(|i| {
                    orchestrator.with_store(|store| store.sessions().get(i).map(|s| s.id.clone()))
                });
                match (line.starts_with("/select "), id) {
                    (true, Some(id)) => {
                        orchestrator.select_session(&id);
                        print_transcript(&orchestrator);
                    }
                    (false, Some(id)) => {
                        orchestrator.delete_session(&id);
                        println!("(已删除)");
                    }
                    _ => println!("无效的会话序号"),
                }
            }
            _ if line.starts_with('/') => println!("未知命令，/help 查看可用命令"),
            _ => {
                orchestrator.send(&line).await;
                print_latest_answer(&orchestrator);
            }
        }
    }
    Ok(())
}

fn print_latest_answer(orchestrator: &ChatOrchestrator) {
    let messages = orchestrator.active_messages();
    if let Some(reasoning) = messages.iter().rev().find(|m| m.thinking) {
        eprintln!("[分析] {}", reasoning.content);
    }
    if let Some(answer) = messages
        .iter()
        .rev()
        .find(|m| m.role == Role::Assistant && !m.thinking)
    {
        println!("{}", answer.content);
    }
    let suggestions = orchestrator.suggestions();
    if !suggestions.is_empty() {
        println!("【推荐问题】");
        for (i, suggestion) in suggestions.iter().enumerate() {
            println!("{}. {suggestion}", i + 1);
        }
    }
}

fn print_transcript(orchestrator: &ChatOrchestrator) {
    for message in orchestrator.active_messages() {
        match message.role {
            Role::User => println!("> {}", message.content),
            Role::Assistant if message.thinking => eprintln!("[分析] {}", message.content),
            Role::Assistant => println!("{}", message.content),
        }
    }
}
