use anyhow::Result;
use teloxide::prelude::*;
use teloxide::types::FileId;
use tracing::{info, warn};

use crate::config::CONFIG;
use crate::handlers::access;
use crate::handlers::responses::finish_turn;
use crate::llm::media::{decode_image, download_media};
use crate::state::AppState;
use crate::studio::references::ReferenceKind;
use crate::studio::Reply;
use crate::utils::timing::start_command_timer;

const IMAGE_EXTENSIONS: [&str; 5] = [".png", ".jpg", ".jpeg", ".webp", ".gif"];

/// A Telegram file that should become a reference image.
#[derive(Debug, Clone)]
struct UploadSource {
    file_id: FileId,
    name: String,
    declared_mime: Option<String>,
}

pub async fn get_file_url(bot: &Bot, file_id: &FileId) -> Result<String> {
    let file = bot.get_file(file_id.clone()).await?;
    Ok(format!(
        "https://api.telegram.org/file/bot{}/{}",
        CONFIG.bot_token, file.path
    ))
}

/// Telegram recompresses photos and drops their names; the unique id is stable
/// across re-sends of the same picture.
fn photo_name(unique_id: &str) -> String {
    format!("photo_{unique_id}.jpg")
}

fn document_name(file_name: Option<&str>, unique_id: &str) -> String {
    file_name
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| format!("document_{unique_id}"))
}

fn is_image_document(mime_type: Option<&str>, file_name: Option<&str>) -> bool {
    let mime_is_image = mime_type
        .map(|mime| mime.starts_with("image/"))
        .unwrap_or(false);
    let name_is_image = file_name
        .map(|name| {
            let lower = name.to_ascii_lowercase();
            IMAGE_EXTENSIONS.iter().any(|ext| lower.ends_with(ext))
        })
        .unwrap_or(false);
    mime_is_image || name_is_image
}

/// The caption's first word may name the target store; otherwise the session default applies.
fn upload_kind(caption: Option<&str>, fallback: ReferenceKind) -> ReferenceKind {
    caption
        .and_then(|text| text.split_whitespace().next())
        .and_then(ReferenceKind::parse)
        .unwrap_or(fallback)
}

fn upload_source(message: &Message) -> Option<Result<UploadSource, Reply>> {
    if let Some(photo) = message.photo().and_then(|sizes| sizes.last()) {
        return Some(Ok(UploadSource {
            file_id: photo.file.id.clone(),
            name: photo_name(&photo.file.unique_id.to_string()),
            declared_mime: Some("image/jpeg".to_string()),
        }));
    }

    let document = message.document()?;
    let mime_type = document
        .mime_type
        .as_ref()
        .map(|mime| mime.essence_str().to_string());
    if !is_image_document(mime_type.as_deref(), document.file_name.as_deref()) {
        return Some(Err(Reply::Warning(
            "Only images (PNG, JPEG, WebP) can be used as references.".to_string(),
        )));
    }
    Some(Ok(UploadSource {
        file_id: document.file.id.clone(),
        name: document_name(
            document.file_name.as_deref(),
            &document.file.unique_id.to_string(),
        ),
        declared_mime: mime_type,
    }))
}

pub fn message_has_upload(message: &Message) -> bool {
    message.photo().is_some() || message.document().is_some()
}

pub async fn upload_handler(bot: Bot, state: AppState, message: Message) -> Result<()> {
    let Some(source) = upload_source(&message) else {
        return Ok(());
    };
    let chat_id = message.chat.id;
    let timer = start_command_timer("upload", chat_id.0, message.caption());
    let mut session = state.session(chat_id.0).lock_owned().await;

    if !access::is_allowed(&session) {
        return finish_turn(&bot, chat_id, timer, vec![access::login_required()]).await;
    }
    let source = match source {
        Ok(source) => source,
        Err(reply) => return finish_turn(&bot, chat_id, timer, vec![reply]).await,
    };

    let kind = upload_kind(message.caption(), session.upload_target());
    if session.store(kind).contains(&source.name) {
        let reply = Reply::Text(format!(
            "'{}' is already in {} references; skipped.",
            source.name,
            kind.label()
        ));
        return finish_turn(&bot, chat_id, timer, vec![reply]).await;
    }

    let url = match get_file_url(&bot, &source.file_id).await {
        Ok(url) => url,
        Err(err) => {
            warn!("get_file failed for upload '{}': {err}", source.name);
            let reply = Reply::Error("Telegram did not hand over that file. Try again.".to_string());
            return finish_turn(&bot, chat_id, timer, vec![reply]).await;
        }
    };
    let Some(bytes) = download_media(&url).await else {
        let reply = Reply::Error("Could not download that image. Try again.".to_string());
        return finish_turn(&bot, chat_id, timer, vec![reply]).await;
    };
    info!(name = %source.name, kind = kind.label(), size = bytes.len(), "Reference upload received");

    let reply = match decode_image(bytes, source.declared_mime.as_deref()) {
        Ok(image) => session.add_reference(kind, &source.name, image),
        Err(err) => {
            warn!("Rejected upload '{}': {err}", source.name);
            Reply::Error(format!("'{}' is not a readable image.", source.name))
        }
    };
    finish_turn(&bot, chat_id, timer, vec![reply]).await
}
