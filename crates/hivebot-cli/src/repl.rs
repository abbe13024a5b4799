//! Interactive console — the simplest inbound channel.
//!
//! Publishes each line as a `console` inbound record and waits for the
//! matching terminal outbound before prompting again.

use std::sync::Arc;

use anyhow::Result;
use colored::Colorize;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use tokio::sync::mpsc;

use hivebot_core::bus::types::{ChatState, InboundMessage, OutboundMessage};
use hivebot_core::bus::MessageBus;

const CHANNEL: &str = "console";
const CHAT_ID: &str = "operator";

/// Publish one message, print the reply, and return.
pub async fn send_once(bus: &Arc<MessageBus>, message: &str) -> Result<()> {
    let (mut rx, _sub) = bus.subscribe_outbound();
    let id = publish(bus, message).await?;
    let reply = await_terminal(&mut rx, &id).await?;
    print_reply(&reply);
    Ok(())
}

/// Read-eval loop until EOF or Ctrl-C.
pub async fn run_console(bus: &Arc<MessageBus>) -> Result<()> {
    let (mut rx, _sub) = bus.subscribe_outbound();
    let mut editor = DefaultEditor::new()?;
    println!("{}", "hivebot console — Ctrl-D to exit".dimmed());

    loop {
        let (line, returned_editor) = tokio::task::spawn_blocking(move || {
            let mut editor = editor;
            let line = editor.readline("hive> ");
            (line, editor)
        })
        .await?;
        editor = returned_editor;

        let line = match line {
            Ok(line) => line,
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => break,
            Err(e) => return Err(e.into()),
        };
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let _ = editor.add_history_entry(trimmed);

        let id = publish(bus, trimmed).await?;
        let reply = await_terminal(&mut rx, &id).await?;
        print_reply(&reply);
    }

    Ok(())
}

async fn publish(bus: &Arc<MessageBus>, content: &str) -> Result<String> {
    let mut msg = InboundMessage::new(CHANNEL, "operator", CHAT_ID, content);
    let id = msg.id.clone();
    msg.metadata
        .insert("account".to_string(), "console".to_string());
    bus.publish_inbound(msg).await?;
    Ok(id)
}

async fn await_terminal(
    rx: &mut mpsc::Receiver<OutboundMessage>,
    id: &str,
) -> Result<OutboundMessage> {
    loop {
        let msg = rx
            .recv()
            .await
            .ok_or_else(|| anyhow::anyhow!("outbound channel closed"))?;
        if msg.id == id && msg.chat_state.is_some() {
            return Ok(msg);
        }
    }
}

fn print_reply(msg: &OutboundMessage) {
    match msg.chat_state {
        Some(ChatState::Error) => println!("{}", msg.content.red()),
        _ => println!("{}", msg.content.green()),
    }
}
