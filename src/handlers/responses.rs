use std::time::Duration;

use anyhow::Result;
use teloxide::prelude::*;
use teloxide::types::{ChatAction, InputFile};
use tokio::task::JoinHandle;
use tracing::warn;

use crate::config::CONFIG;
use crate::studio::Reply;
use crate::utils::timing::{complete_command_timer, CommandTimer};

const CHAT_ACTION_INTERVAL: Duration = Duration::from_secs(4);
const CAPTION_LIMIT: usize = 1024;

/// Keeps a chat action ("uploading photo...", "typing...") visible until dropped.
pub struct ChatStatus {
    task_handle: Option<JoinHandle<()>>,
}

impl ChatStatus {
    pub fn start(bot: &Bot, chat_id: ChatId, action: ChatAction) -> Self {
        let bot = bot.clone();
        let task_handle = tokio::spawn(async move {
            loop {
                if let Err(err) = bot.send_chat_action(chat_id, action.clone()).await {
                    warn!("send_chat_action failed: {err}");
                }
                tokio::time::sleep(CHAT_ACTION_INTERVAL).await;
            }
        });
        ChatStatus {
            task_handle: Some(task_handle),
        }
    }
}

impl Drop for ChatStatus {
    fn drop(&mut self) {
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
    }
}

/// Splits on the last newline inside each window, or hard-cuts when there is none.
fn split_text(text: &str, limit: usize) -> Vec<String> {
    let limit = limit.max(1);
    let mut chunks = Vec::new();
    let mut rest = text;
    while rest.chars().count() > limit {
        let cut = rest
            .char_indices()
            .nth(limit)
            .map(|(index, _)| index)
            .unwrap_or(rest.len());
        let split_at = rest[..cut]
            .rfind('\n')
            .filter(|index| *index > 0)
            .unwrap_or(cut);
        chunks.push(rest[..split_at].to_string());
        rest = rest[split_at..].trim_start_matches('\n');
    }
    if !rest.is_empty() || chunks.is_empty() {
        chunks.push(rest.to_string());
    }
    chunks
}

fn clip_caption(caption: &str) -> String {
    if caption.chars().count() <= CAPTION_LIMIT {
        return caption.to_string();
    }
    let mut clipped: String = caption.chars().take(CAPTION_LIMIT - 3).collect();
    clipped.push_str("...");
    clipped
}

fn render_text(reply: &Reply) -> Option<String> {
    match reply {
        Reply::Text(text) => Some(text.clone()),
        Reply::Warning(text) => Some(format!("⚠️ {text}")),
        Reply::Error(text) => Some(format!("❌ {text}")),
        Reply::Photo { .. } | Reply::Document { .. } => None,
    }
}

async fn send_text(bot: &Bot, chat_id: ChatId, text: &str) -> Result<()> {
    for chunk in split_text(text, CONFIG.telegram_max_length) {
        if chunk.trim().is_empty() {
            continue;
        }
        bot.send_message(chat_id, chunk).await?;
    }
    Ok(())
}

async fn send_document(
    bot: &Bot,
    chat_id: ChatId,
    bytes: Vec<u8>,
    file_name: String,
    caption: Option<&str>,
) -> Result<()> {
    let mut request = bot.send_document(chat_id, InputFile::memory(bytes).file_name(file_name));
    if let Some(caption) = caption {
        request = request.caption(clip_caption(caption));
    }
    request.await?;
    Ok(())
}

/// Draws handler output in order. Telegram refuses some photos (size, extreme
/// ratios); those are resent as documents.
pub async fn send_replies(bot: &Bot, chat_id: ChatId, replies: Vec<Reply>) -> Result<()> {
    for reply in replies {
        if let Some(text) = render_text(&reply) {
            send_text(bot, chat_id, &text).await?;
            continue;
        }
        match reply {
            Reply::Photo {
                bytes,
                file_name,
                caption,
            } => {
                let sent = bot
                    .send_photo(
                        chat_id,
                        InputFile::memory(bytes.clone()).file_name(file_name.clone()),
                    )
                    .caption(clip_caption(&caption))
                    .await;
                if let Err(err) = sent {
                    warn!("send_photo failed, falling back to document: {err}");
                    send_document(bot, chat_id, bytes, file_name, Some(caption.as_str())).await?;
                }
            }
            Reply::Document {
                bytes,
                file_name,
                caption,
            } => {
                send_document(bot, chat_id, bytes, file_name, caption.as_deref()).await?;
            }
            Reply::Text(_) | Reply::Warning(_) | Reply::Error(_) => {}
        }
    }
    Ok(())
}

fn turn_status(replies: &[Reply]) -> (&'static str, Option<String>) {
    let error = replies.iter().find_map(|reply| match reply {
        Reply::Error(text) => Some(text.clone()),
        _ => None,
    });
    if error.is_some() {
        return ("error", error);
    }
    let warning = replies.iter().find_map(|reply| match reply {
        Reply::Warning(text) => Some(text.clone()),
        _ => None,
    });
    if warning.is_some() {
        return ("rejected", warning);
    }
    ("success", None)
}

/// Sends a turn's replies and closes its timer with a status derived from them.
pub async fn finish_turn(
    bot: &Bot,
    chat_id: ChatId,
    mut timer: CommandTimer,
    replies: Vec<Reply>,
) -> Result<()> {
    let (status, detail) = turn_status(&replies);
    let sent = send_replies(bot, chat_id, replies).await;
    match &sent {
        Ok(()) => complete_command_timer(&mut timer, status, detail),
        Err(err) => complete_command_timer(&mut timer, "error", Some(format!("delivery: {err}"))),
    }
    sent
}
