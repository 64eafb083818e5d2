use std::error::Error;

use dotenvy::dotenv;
use teloxide::dispatching::UpdateFilterExt;
use teloxide::prelude::*;
use teloxide::utils::command::BotCommands;
use tracing::{info, warn};

mod config;
mod handlers;
mod llm;
mod state;
mod studio;
mod utils;

use config::CONFIG;
use handlers::{commands, uploads};
use state::AppState;
use studio::glossary::GlossaryCache;
use studio::references::ReferenceKind;
use utils::logging::init_logging;

#[derive(BotCommands, Clone)]
#[command(rename_rule = "lowercase", description = "Valeria studio commands:")]
enum Command {
    #[command(description = "welcome and session status")]
    Start,
    #[command(description = "list every command")]
    Help,
    #[command(description = "unlock a private studio")]
    Login(String),
    #[command(description = "list or pick the render engine")]
    Engine(String),
    #[command(description = "list or pick the aspect ratio")]
    Ratio(String),
    #[command(description = "send new uploads to identity references")]
    Identity,
    #[command(description = "send new uploads to style references")]
    Style,
    #[command(description = "list reference images")]
    Refs,
    #[command(description = "include or exclude a reference")]
    Toggle(String),
    #[command(description = "delete a reference")]
    Remove(String),
    #[command(description = "empty a reference store")]
    Clear(String),
    #[command(description = "show or replace the scene description")]
    Prompt(String),
    #[command(description = "ask the prompt assistant")]
    Improve(String),
    #[command(description = "render the scene")]
    Generate(String),
    #[command(description = "show the session gallery")]
    History,
    #[command(description = "download a result as PNG")]
    Download(String),
    #[command(description = "download a 4K upscale")]
    Upscale(String),
    #[command(description = "reuse a result as a style reference")]
    Recycle(String),
    #[command(description = "reload the style glossary")]
    Glossary,
}

type HandlerResult = Result<(), Box<dyn Error + Send + Sync>>;

#[tokio::main]
async fn main() -> HandlerResult {
    dotenv().ok();
    let _guards = init_logging(&std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()));

    let bot = Bot::new(CONFIG.bot_token.clone());
    info!(
        persona = %CONFIG.persona_name,
        engines = CONFIG.render_engines.len(),
        engines_file = %CONFIG.render_engines_config_path.display(),
        log_level = %CONFIG.log_level,
        gate = CONFIG.access_gate_enabled(),
        "Starting Valeria studio bot"
    );
    if CONFIG.gemini_api_key.trim().is_empty() {
        warn!("GEMINI_API_KEY is empty; generation and the prompt assistant will fail");
    }

    let glossary = GlossaryCache::new(CONFIG.style_glossary_dir.clone());
    let loaded = glossary.get();
    info!(categories = loaded.glossary.len(), "Style glossary ready");
    for warning in &loaded.warnings {
        warn!("{warning}");
    }
    let state = AppState::new(CONFIG.session_settings(), glossary);

    if let Err(err) = bot.set_my_commands(Command::bot_commands()).await {
        warn!("Failed to register bot commands: {err}");
    }

    let command_handler = dptree::entry()
        .filter_command::<Command>()
        .endpoint(handle_command);

    let message_handler = Update::filter_message()
        .branch(command_handler)
        .branch(dptree::filter(|msg: Message| uploads::message_has_upload(&msg)).endpoint(handle_upload))
        .endpoint(ignore_message);

    Dispatcher::builder(bot, message_handler)
        .dependencies(dptree::deps![state])
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    Ok(())
}

async fn handle_command(
    bot: Bot,
    state: AppState,
    message: Message,
    command: Command,
) -> HandlerResult {
    match command {
        Command::Start => commands::start_handler(bot, state, message).await?,
        Command::Help => commands::help_handler(bot, state, message).await?,
        Command::Login(password) => commands::login_handler(bot, state, message, password).await?,
        Command::Engine(arg) => commands::engine_handler(bot, state, message, arg).await?,
        Command::Ratio(arg) => commands::ratio_handler(bot, state, message, arg).await?,
        Command::Identity => {
            commands::upload_target_handler(bot, state, message, ReferenceKind::Identity).await?
        }
        Command::Style => {
            commands::upload_target_handler(bot, state, message, ReferenceKind::Style).await?
        }
        Command::Refs => commands::refs_handler(bot, state, message).await?,
        Command::Toggle(arg) => commands::toggle_handler(bot, state, message, arg).await?,
        Command::Remove(arg) => commands::remove_handler(bot, state, message, arg).await?,
        Command::Clear(arg) => commands::clear_handler(bot, state, message, arg).await?,
        Command::Prompt(arg) => commands::prompt_handler(bot, state, message, arg).await?,
        Command::Improve(arg) => commands::improve_handler(bot, state, message, arg).await?,
        Command::Generate(arg) => commands::generate_handler(bot, state, message, arg).await?,
        Command::History => commands::history_handler(bot, state, message).await?,
        Command::Download(arg) => commands::download_handler(bot, state, message, arg).await?,
        Command::Upscale(arg) => commands::upscale_handler(bot, state, message, arg).await?,
        Command::Recycle(arg) => commands::recycle_handler(bot, state, message, arg).await?,
        Command::Glossary => commands::glossary_handler(bot, state, message).await?,
    }
    Ok(())
}

async fn handle_upload(bot: Bot, state: AppState, message: Message) -> HandlerResult {
    uploads::upload_handler(bot, state, message).await?;
    Ok(())
}

async fn ignore_message(_message: Message) -> HandlerResult {
    Ok(())
}
