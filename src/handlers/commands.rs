use anyhow::Result;
use chrono::Utc;
use teloxide::prelude::*;
use teloxide::types::ChatAction;
use tokio::sync::OwnedMutexGuard;
use tracing::{error, info};

use crate::config::CONFIG;
use crate::handlers::access::{self, OPEN_COMMANDS};
use crate::handlers::responses::{finish_turn, send_replies, ChatStatus};
use crate::llm::{call_prompt_assistant, generate_persona_image};
use crate::state::AppState;
use crate::studio::references::ReferenceKind;
use crate::studio::session::{SessionContext, UpscaleJob};
use crate::studio::upscale::render_upscaled_png;
use crate::studio::{Reply, StudioError};
use crate::utils::timing::{start_command_timer, CommandTimer};

type Session = OwnedMutexGuard<SessionContext>;

const HELP_TEXT: &str = "\
Valeria Studio

References
/identity - new uploads go to IDENTITY (face, body)
/style - new uploads go to STYLE (pose, light, composition)
Send photos or image files; caption 'identity' or 'style' to override.
/refs - list both stores
/toggle <identity|style> <n> - include or exclude one reference
/remove <identity|style> <n> - delete one reference
/clear <identity|style|all> - empty a store

Scene
/prompt [text] - show or replace the scene description
/improve [command] - ask the prompt assistant. Verbs: Improve:, Fashion Recipe:, Portrait Recipe:, Describe:
/glossary - reload the style glossary

Render
/engine [n] - list or pick the render engine
/ratio [w:h] - list or pick the aspect ratio
/generate [text] - render the scene (optionally replacing it first)

Results
/history - show the session gallery, newest first
/download [n] - original PNG
/upscale [n] - 4K PNG
/recycle [n] - copy a result into STYLE references

/login <password> - unlock a private studio";

/// Locks the chat's session for the whole turn. `None` means the turn was
/// refused and the refusal has already been sent.
async fn open_session(
    bot: &Bot,
    state: &AppState,
    message: &Message,
    command: &str,
    timer: CommandTimer,
) -> Result<Option<(Session, CommandTimer)>> {
    let session = state.session(message.chat.id.0).lock_owned().await;
    if OPEN_COMMANDS.contains(&command) || access::is_allowed(&session) {
        return Ok(Some((session, timer)));
    }
    info!(chat_id = message.chat.id.0, command, "Command refused before login");
    finish_turn(bot, message.chat.id, timer, vec![access::login_required()]).await?;
    Ok(None)
}

fn optional_arg(arg: &str) -> Option<&str> {
    let trimmed = arg.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn usage(text: &str) -> Reply {
    Reply::Warning(format!("Usage: {text}"))
}

/// Blank means the newest result.
fn parse_history_index(arg: &str, command: &str) -> Result<usize, Reply> {
    match optional_arg(arg) {
        None => Ok(0),
        Some(value) => value
            .trim_start_matches('#')
            .parse::<usize>()
            .map_err(|_| usage(&format!("/{command} <n> (0 is the newest result)"))),
    }
}

fn parse_kind_and_index(arg: &str, command: &str) -> Result<(ReferenceKind, usize), Reply> {
    let invalid = || usage(&format!("/{command} <identity|style> <n>"));
    let mut words = arg.split_whitespace();
    let kind = words.next().and_then(ReferenceKind::parse).ok_or_else(invalid)?;
    let index = words
        .next()
        .and_then(|value| value.trim_start_matches('#').parse::<usize>().ok())
        .ok_or_else(invalid)?;
    if words.next().is_some() {
        return Err(invalid());
    }
    Ok((kind, index))
}

fn parse_clear_target(arg: &str) -> Result<Vec<ReferenceKind>, Reply> {
    match arg.trim().to_lowercase().as_str() {
        "all" | "both" => Ok(vec![ReferenceKind::Identity, ReferenceKind::Style]),
        other => ReferenceKind::parse(other)
            .map(|kind| vec![kind])
            .ok_or_else(|| usage("/clear <identity|style|all>")),
    }
}

fn settle(result: Result<Reply, StudioError>) -> Reply {
    result.unwrap_or_else(StudioError::into_reply)
}

fn status_line(session: &SessionContext) -> String {
    format!(
        "Persona: {}\nEngine: {}\nAspect ratio: {}\nReferences: {} identity ({} active), {} style ({} active)\nResults in history: {}",
        session.settings().persona_name,
        session.engine().name,
        session.aspect_ratio(),
        session.identity.len(),
        session.identity.active_count(),
        session.style.len(),
        session.style.active_count(),
        session.history.len()
    )
}

/// Runs a synchronous session command under the usual turn bookkeeping.
async fn run_simple<F>(
    bot: Bot,
    state: AppState,
    message: Message,
    command: &str,
    arg: Option<&str>,
    action: F,
) -> Result<()>
where
    F: FnOnce(&mut SessionContext) -> Vec<Reply>,
{
    let timer = start_command_timer(command, message.chat.id.0, arg);
    let Some((mut session, timer)) = open_session(&bot, &state, &message, command, timer).await?
    else {
        return Ok(());
    };
    let replies = action(&mut *session);
    finish_turn(&bot, message.chat.id, timer, replies).await
}

pub async fn start_handler(bot: Bot, state: AppState, message: Message) -> Result<()> {
    let gate_enabled = CONFIG.access_gate_enabled();
    run_simple(bot, state, message, "start", None, move |session| {
        let mut text = format!(
            "Welcome to the studio of {}.\n\n{}",
            session.settings().persona_name,
            status_line(session)
        );
        if gate_enabled && !session.is_authenticated() {
            text.push_str("\n\nThis studio is private: /login <password> to begin.");
        } else {
            text.push_str("\n\nUpload identity photos, write a scene with /prompt, then /generate. /help lists everything.");
        }
        vec![Reply::Text(text)]
    })
    .await
}

pub async fn help_handler(bot: Bot, state: AppState, message: Message) -> Result<()> {
    run_simple(bot, state, message, "help", None, |_| {
        vec![Reply::Text(HELP_TEXT.to_string())]
    })
    .await
}

pub async fn login_handler(bot: Bot, state: AppState, message: Message, password: String) -> Result<()> {
    let chat_id = message.chat.id.0;
    // Never log the password itself.
    run_simple(bot, state, message, "login", None, move |session| {
        vec![access::login(chat_id, session, &password)]
    })
    .await
}

pub async fn engine_handler(bot: Bot, state: AppState, message: Message, arg: String) -> Result<()> {
    run_simple(bot, state, message, "engine", Some(arg.as_str()), |session| {
        vec![match optional_arg(&arg) {
            None => session.engine_listing(),
            Some(selector) => settle(session.select_engine(selector)),
        }]
    })
    .await
}

pub async fn ratio_handler(bot: Bot, state: AppState, message: Message, arg: String) -> Result<()> {
    run_simple(bot, state, message, "ratio", Some(arg.as_str()), |session| {
        vec![match optional_arg(&arg) {
            None => session.ratio_listing(),
            Some(ratio) => settle(session.select_aspect_ratio(ratio)),
        }]
    })
    .await
}

pub async fn upload_target_handler(
    bot: Bot,
    state: AppState,
    message: Message,
    kind: ReferenceKind,
) -> Result<()> {
    run_simple(bot, state, message, kind.label(), None, move |session| {
        vec![session.set_upload_target(kind)]
    })
    .await
}

pub async fn refs_handler(bot: Bot, state: AppState, message: Message) -> Result<()> {
    run_simple(bot, state, message, "refs", None, |session| {
        vec![session.references_summary()]
    })
    .await
}

pub async fn toggle_handler(bot: Bot, state: AppState, message: Message, arg: String) -> Result<()> {
    run_simple(bot, state, message, "toggle", Some(arg.as_str()), |session| {
        vec![match parse_kind_and_index(&arg, "toggle") {
            Ok((kind, index)) => settle(session.toggle_reference(kind, index)),
            Err(reply) => reply,
        }]
    })
    .await
}

pub async fn remove_handler(bot: Bot, state: AppState, message: Message, arg: String) -> Result<()> {
    run_simple(bot, state, message, "remove", Some(arg.as_str()), |session| {
        vec![match parse_kind_and_index(&arg, "remove") {
            Ok((kind, index)) => settle(session.remove_reference(kind, index)),
            Err(reply) => reply,
        }]
    })
    .await
}

pub async fn clear_handler(bot: Bot, state: AppState, message: Message, arg: String) -> Result<()> {
    run_simple(bot, state, message, "clear", Some(arg.as_str()), |session| {
        match parse_clear_target(&arg) {
            Ok(kinds) => kinds
                .into_iter()
                .map(|kind| session.clear_references(kind))
                .collect(),
            Err(reply) => vec![reply],
        }
    })
    .await
}

pub async fn prompt_handler(bot: Bot, state: AppState, message: Message, arg: String) -> Result<()> {
    run_simple(bot, state, message, "prompt", Some(arg.as_str()), |session| {
        vec![match optional_arg(&arg) {
            None => session.show_prompt(),
            Some(text) => session.edit_prompt(text),
        }]
    })
    .await
}

pub async fn history_handler(bot: Bot, state: AppState, message: Message) -> Result<()> {
    run_simple(bot, state, message, "history", None, |session| {
        session.history_gallery()
    })
    .await
}

pub async fn download_handler(bot: Bot, state: AppState, message: Message, arg: String) -> Result<()> {
    run_simple(bot, state, message, "download", Some(arg.as_str()), |session| {
        vec![match parse_history_index(&arg, "download") {
            Ok(index) => settle(session.download(index)),
            Err(reply) => reply,
        }]
    })
    .await
}

pub async fn recycle_handler(bot: Bot, state: AppState, message: Message, arg: String) -> Result<()> {
    run_simple(bot, state, message, "recycle", Some(arg.as_str()), |session| {
        vec![match parse_history_index(&arg, "recycle") {
            Ok(index) => settle(session.recycle(index, Utc::now())),
            Err(reply) => reply,
        }]
    })
    .await
}

pub async fn glossary_handler(bot: Bot, state: AppState, message: Message) -> Result<()> {
    let glossary = state.glossary.clone();
    run_simple(bot, state, message, "glossary", None, move |_| {
        glossary.invalidate();
        let load = glossary.get();
        let mut replies = Vec::new();
        if load.glossary.is_empty() {
            replies.push(Reply::Warning(format!(
                "No style glossary found in {}. The assistant will work without one.",
                CONFIG.style_glossary_dir.display()
            )));
        } else {
            let names: Vec<&str> = load.glossary.category_names().collect();
            replies.push(Reply::Text(format!(
                "Style glossary reloaded: {} categor{} ({}).",
                load.glossary.len(),
                if load.glossary.len() == 1 { "y" } else { "ies" },
                names.join(", ")
            )));
        }
        replies.extend(load.warnings.iter().cloned().map(Reply::Warning));
        replies
    })
    .await
}

pub async fn generate_handler(bot: Bot, state: AppState, message: Message, arg: String) -> Result<()> {
    let chat_id = message.chat.id;
    let timer = start_command_timer("generate", chat_id.0, Some(arg.as_str()));
    let Some((mut session, timer)) =
        open_session(&bot, &state, &message, "generate", timer).await?
    else {
        return Ok(());
    };

    if let Some(text) = optional_arg(&arg) {
        session.edit_prompt(text);
    }
    let request = match session.prepare_generation() {
        Ok(request) => request,
        Err(err) => return finish_turn(&bot, chat_id, timer, vec![err.into_reply()]).await,
    };

    send_replies(
        &bot,
        chat_id,
        vec![Reply::Text(format!(
            "Rendering {} with {} at {} ({} identity, {} style references)...",
            request.persona_name,
            request.engine.name,
            request.aspect_ratio,
            request.identity.len(),
            request.style.len()
        ))],
    )
    .await?;

    let outcome = {
        let _status = ChatStatus::start(&bot, chat_id, ChatAction::UploadPhoto);
        generate_persona_image(&request).await
    };
    let reply = settle(session.apply_generation(&request, outcome, Utc::now()));
    finish_turn(&bot, chat_id, timer, vec![reply]).await
}

pub async fn improve_handler(bot: Bot, state: AppState, message: Message, arg: String) -> Result<()> {
    let chat_id = message.chat.id;
    let timer = start_command_timer("improve", chat_id.0, Some(arg.as_str()));
    let Some((mut session, timer)) =
        open_session(&bot, &state, &message, "improve", timer).await?
    else {
        return Ok(());
    };

    let command = match session.assistant_command(optional_arg(&arg)) {
        Ok(command) => command,
        Err(err) => return finish_turn(&bot, chat_id, timer, vec![err.into_reply()]).await,
    };
    let glossary = state.glossary.get();
    let outcome = {
        let _status = ChatStatus::start(&bot, chat_id, ChatAction::Typing);
        call_prompt_assistant(
            &command,
            &session.settings().persona_name,
            Some(&glossary.glossary),
        )
        .await
    };
    let reply = settle(session.apply_assistant(outcome));
    finish_turn(&bot, chat_id, timer, vec![reply]).await
}

pub async fn upscale_handler(bot: Bot, state: AppState, message: Message, arg: String) -> Result<()> {
    let chat_id = message.chat.id;
    let timer = start_command_timer("upscale", chat_id.0, Some(arg.as_str()));
    let Some((mut session, timer)) =
        open_session(&bot, &state, &message, "upscale", timer).await?
    else {
        return Ok(());
    };

    let index = match parse_history_index(&arg, "upscale") {
        Ok(index) => index,
        Err(reply) => return finish_turn(&bot, chat_id, timer, vec![reply]).await,
    };
    let job = match session.plan_upscale(index) {
        Ok(job) => job,
        Err(err) => return finish_turn(&bot, chat_id, timer, vec![err.into_reply()]).await,
    };

    let reply = match job {
        UpscaleJob::Cached { index, png } => session.upscaled_document(index, png),
        UpscaleJob::Render {
            index,
            entry_id,
            image,
            target_width,
        } => {
            let _status = ChatStatus::start(&bot, chat_id, ChatAction::UploadDocument);
            let rendered =
                tokio::task::spawn_blocking(move || render_upscaled_png(&image, target_width)).await;
            match rendered {
                Ok(Ok(png)) => session.finish_upscale(index, entry_id, png),
                Ok(Err(err)) => StudioError::Upscale(err.to_string()).into_reply(),
                Err(err) => {
                    error!("Upscale worker failed: {err}");
                    StudioError::Upscale("the resize worker stopped unexpectedly".to_string())
                        .into_reply()
                }
            }
        }
    };
    finish_turn(&bot, chat_id, timer, vec![reply]).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_and_index_arguments() {
        assert_eq!(
            parse_kind_and_index("identity 2", "toggle").unwrap(),
            (ReferenceKind::Identity, 2)
        );
        assert_eq!(
            parse_kind_and_index(" style #0 ", "remove").unwrap(),
            (ReferenceKind::Style, 0)
        );
        assert!(parse_kind_and_index("2 identity", "toggle").is_err());
        assert!(parse_kind_and_index("style", "toggle").is_err());
        assert!(parse_kind_and_index("style 1 2", "toggle").is_err());
    }

    #[test]
    fn history_index_defaults_to_newest() {
        assert_eq!(parse_history_index("", "download").unwrap(), 0);
        assert_eq!(parse_history_index(" #3 ", "download").unwrap(), 3);
        assert!(matches!(
            parse_history_index("last", "upscale"),
            Err(Reply::Warning(text)) if text.contains("/upscale")
        ));
    }

    #[test]
    fn clear_accepts_one_store_or_both() {
        assert_eq!(parse_clear_target("style").unwrap(), vec![ReferenceKind::Style]);
        assert_eq!(
            parse_clear_target("ALL").unwrap(),
            vec![ReferenceKind::Identity, ReferenceKind::Style]
        );
        assert!(parse_clear_target("").is_err());
    }

    #[test]
    fn validation_failures_settle_as_warnings() {
        assert!(matches!(settle(Err(StudioError::EmptyPrompt)), Reply::Warning(_)));
        assert!(matches!(
            settle(Err(StudioError::Generation("503".to_string()))),
            Reply::Error(_)
        ));
    }
}
