//! `tidewire chat`: Interactive or single-message chat mode.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use tidewire_core::{Attachment, AttachmentKind, StreamMode};
use tidewire_runtime::{
    AssistantRuntime, NextReplyMode, ToolPhase, TurnEvent, TurnOutcome, TurnRequest,
};
use tokio::io::{AsyncBufReadExt, BufReader};

use super::{build_runtime, load_config};

pub async fn run(
    message: Option<String>,
    chat_id: String,
    history: Option<PathBuf>,
    attach: Vec<PathBuf>,
) -> anyhow::Result<()> {
    let config = load_config()?;
    let runtime = Arc::new(build_runtime(&config, &chat_id, history.as_deref()).await?);
    let attachments = attach
        .iter()
        .map(|p| read_attachment(p))
        .collect::<anyhow::Result<Vec<_>>>()?;

    if let Some(msg) = message {
        // Single message mode
        let request = TurnRequest::new(&chat_id, msg).with_attachments(attachments);
        send(&runtime, request).await?;
        return Ok(());
    }

    // Interactive mode
    println!();
    println!("  Tidewire: Interactive Mode");
    println!();
    println!("  Backend:   {}", config.backend.base_url);
    println!("  Model:     {}", display_model(&runtime.model_id()));
    println!("  Chat:      {chat_id}");
    println!();
    println!("  Type your message and press Enter. Ctrl+C stops a reply or exits.");
    println!("  Commands: /compress, /mode, /usage, exit");
    println!();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut pending = attachments;

    prompt()?;
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else { break };
        let line = line.trim();
        match line {
            "" => {}
            "exit" | "quit" => break,
            "/compress" => match runtime.compress_now(&chat_id, "").await {
                Ok(candidate) => println!(
                    "  History compressed ({}): {} → {} messages, ~{} tokens saved",
                    candidate.strategy,
                    candidate.source_messages,
                    candidate.target_messages,
                    candidate.saved_tokens
                ),
                Err(e) => eprintln!("  [Error] {e}"),
            },
            "/mode" => {
                let mode = runtime.guard().cycle_next_reply_mode(&chat_id);
                println!("  Next reply mode: {mode}");
                if mode == NextReplyMode::Full {
                    println!("  (history is sent uncompressed)");
                }
            }
            "/usage" => {
                let usage = runtime.guard().sync(&chat_id, "", &[]).await;
                println!(
                    "  Context: {}/{} tokens ({}%)",
                    usage.used_tokens,
                    usage.context_window,
                    usage.percent()
                );
            }
            text => {
                let request = TurnRequest::new(&chat_id, text)
                    .with_attachments(std::mem::take(&mut pending));
                if let Err(e) = send(&runtime, request).await {
                    eprintln!("  [Error] {e:#}");
                }
                println!();
            }
        }
        prompt()?;
    }

    println!();
    println!("  Goodbye!");
    println!();
    Ok(())
}

fn prompt() -> anyhow::Result<()> {
    print!("  You > ");
    std::io::stdout().flush()?;
    Ok(())
}

fn display_model(model: &str) -> &str {
    if model.is_empty() { "(backend default)" } else { model }
}

/// Run one turn, printing the reply as it streams. Ctrl+C stops it.
async fn send(runtime: &Arc<AssistantRuntime>, request: TurnRequest) -> anyhow::Result<TurnOutcome> {
    let chat_id = request.chat_id.clone();
    let mut turn = runtime.spawn_turn(request);
    let mut shown = String::new();
    let mut stdout = std::io::stdout();

    loop {
        tokio::select! {
            event = turn.events.recv() => {
                let Some(event) = event else { break };
                match event {
                    TurnEvent::Partial { text } => {
                        match text.strip_prefix(shown.as_str()) {
                            Some(rest) => print!("{rest}"),
                            None => print!("\n{text}"),
                        }
                        stdout.flush()?;
                        shown = text;
                    }
                    TurnEvent::Model { label } => eprintln!("  [{label}]"),
                    TurnEvent::Status { message } => eprintln!("  … {message}"),
                    TurnEvent::Tool { phase, payload } => {
                        let name = payload.get("name").and_then(|v| v.as_str()).unwrap_or("tool");
                        match phase {
                            ToolPhase::Start => eprintln!("  [tool] {name} …"),
                            ToolPhase::Result => eprintln!("  [tool] {name} done"),
                        }
                    }
                    TurnEvent::Compressed(c) => eprintln!(
                        "  [history compressed: {} → {} messages, ~{} tokens saved]",
                        c.source_messages, c.target_messages, c.saved_tokens
                    ),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                runtime.stop(&chat_id).await;
            }
        }
    }

    let outcome = turn.result.await.context("Turn task failed")??;
    // Fallback replies arrive whole and a final reply may rewrite the stream.
    match outcome.text.strip_prefix(shown.as_str()) {
        Some(rest) => println!("{rest}"),
        None => println!("\n{}", outcome.text),
    }
    if outcome.cancelled {
        eprintln!("  [stopped]");
    } else if outcome.mode != StreamMode::Streaming {
        eprintln!("  [{}]", outcome.mode.as_str());
    }
    if let Some(model) = &outcome.served_by {
        eprintln!("  [served by {model}]");
    }
    Ok(outcome)
}

/// Attach a file: UTF-8 files are inlined as text, anything else by name.
fn read_attachment(path: &Path) -> anyhow::Result<Attachment> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("Failed to read attachment {}", path.display()))?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    let size = bytes.len() as u64;

    Ok(match String::from_utf8(bytes) {
        Ok(text) => Attachment::text(name, text),
        Err(_) => Attachment {
            name,
            kind: AttachmentKind::Document,
            size,
            ..Attachment::default()
        },
    })
}
