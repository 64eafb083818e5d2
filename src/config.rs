use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Result;
use once_cell::sync::Lazy;
use serde::Deserialize;
use tracing::{info, warn};

use crate::studio::history::DEFAULT_HISTORY_CAPACITY;
use crate::studio::session::SessionSettings;
use crate::studio::upscale::DEFAULT_UPSCALE_WIDTH;

pub const SUPPORTED_ASPECT_RATIOS: [&str; 7] = ["2:3", "9:16", "1:1", "16:9", "3:2", "4:5", "5:4"];

#[derive(Debug, Clone, Deserialize)]
struct RenderEnginesFile {
    engines: Vec<RenderEngineEntry>,
}

#[derive(Debug, Clone, Deserialize)]
struct RenderEngineEntry {
    name: String,
    model: String,
}

/// A selectable image-generation model: what the operator sees and what the API receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderEngine {
    pub name: String,
    pub model: String,
}

impl RenderEngine {
    pub fn new(name: &str, model: &str) -> Self {
        Self {
            name: name.to_string(),
            model: model.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bot_token: String,
    pub log_level: String,
    pub gemini_api_key: String,
    pub gemini_base_url: String,
    pub gemini_assistant_model: String,
    pub gemini_temperature: f32,
    pub gemini_request_timeout_seconds: u64,
    pub gemini_safety_settings: String,
    pub render_engines_config_path: PathBuf,
    pub render_engines: Vec<RenderEngine>,
    pub access_password: String,
    pub style_glossary_dir: PathBuf,
    pub persona_name: String,
    pub persona_file_prefix: String,
    pub history_capacity: usize,
    pub upscale_target_width: u32,
    pub default_aspect_ratio: String,
    pub telegram_max_length: usize,
}

pub static CONFIG: Lazy<Config> =
    Lazy::new(|| Config::load().expect("Failed to load configuration"));

fn env_string(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_f32(name: &str, default: f32) -> f32 {
    env::var(name)
        .ok()
        .and_then(|value| value.parse::<f32>().ok())
        .unwrap_or(default)
}

fn env_u32(name: &str, default: u32) -> u32 {
    env::var(name)
        .ok()
        .and_then(|value| value.parse::<u32>().ok())
        .unwrap_or(default)
}

fn env_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_usize(name: &str, default: usize) -> usize {
    env::var(name)
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
        .unwrap_or(default)
}

fn normalize_default_aspect_ratio(value: String) -> String {
    let trimmed = value.trim();
    if SUPPORTED_ASPECT_RATIOS.contains(&trimmed) {
        return trimmed.to_string();
    }
    warn!(
        "Unsupported DEFAULT_ASPECT_RATIO value '{}'; defaulting to {}.",
        value, SUPPORTED_ASPECT_RATIOS[0]
    );
    SUPPORTED_ASPECT_RATIOS[0].to_string()
}

fn normalize_gemini_safety_settings(value: String) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return "standard".to_string();
    }

    let lowered = trimmed.to_lowercase();
    match lowered.as_str() {
        "permissive" | "off" | "none" => "permissive".to_string(),
        "standard" => "standard".to_string(),
        _ => {
            warn!(
                "Unknown GEMINI_SAFETY_SETTINGS value '{}'; defaulting to standard.",
                value
            );
            "standard".to_string()
        }
    }
}

fn resolve_relative_path(value: &str) -> PathBuf {
    let path = PathBuf::from(value);
    if path.is_absolute() {
        return path;
    }
    env::current_dir()
        .unwrap_or_else(|_| PathBuf::from("."))
        .join(path)
}

pub fn built_in_render_engines() -> Vec<RenderEngine> {
    vec![
        RenderEngine::new(
            "Nano Banana Pro (Gemini 3 Pro Image)",
            "gemini-3-pro-image-preview",
        ),
        RenderEngine::new(
            "Nano Banana (Gemini 2.5 Flash Image)",
            "gemini-2.5-flash-image",
        ),
    ]
}

fn load_render_engines_from_path(path: &Path) -> Vec<RenderEngine> {
    if !path.exists() {
        info!("Render engine config not found at {}", path.display());
        return Vec::new();
    }

    let raw = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) => {
            warn!(
                "Failed to read render engine config at {}: {}",
                path.display(),
                err
            );
            return Vec::new();
        }
    };

    parse_render_engines(&raw).unwrap_or_else(|err| {
        warn!(
            "Failed to parse render engine config at {}: {}",
            path.display(),
            err
        );
        Vec::new()
    })
}

fn parse_render_engines(raw: &str) -> Result<Vec<RenderEngine>> {
    let parsed: RenderEnginesFile = serde_json::from_str(raw)?;
    let mut engines: Vec<RenderEngine> = Vec::new();
    for entry in parsed.engines {
        let name = entry.name.trim();
        let model = entry.model.trim();
        if name.is_empty() || model.is_empty() {
            continue;
        }
        if engines.iter().any(|engine| engine.name == name) {
            warn!("Duplicate render engine name '{}' ignored", name);
            continue;
        }
        engines.push(RenderEngine::new(name, model));
    }
    Ok(engines)
}

fn build_render_engines(path: &Path) -> Vec<RenderEngine> {
    let engines = load_render_engines_from_path(path);
    if !engines.is_empty() {
        info!(
            "Loaded {} render engine(s) from {}",
            engines.len(),
            path.display()
        );
        return engines;
    }
    info!("Using built-in render engines");
    built_in_render_engines()
}

impl Config {
    pub fn load() -> Result<Self> {
        let bot_token = env::var("BOT_TOKEN").unwrap_or_default();
        if bot_token.trim().is_empty() {
            return Err(anyhow::anyhow!("BOT_TOKEN is required"));
        }

        let render_engines_config_path = resolve_relative_path(&env_string(
            "RENDER_ENGINES_CONFIG_PATH",
            "render_engines.json",
        ));
        let render_engines = build_render_engines(&render_engines_config_path);

        let persona_file_prefix = env_string("PERSONA_FILE_PREFIX", "valeria")
            .trim()
            .to_lowercase();

        Ok(Config {
            bot_token,
            log_level: env_string("LOG_LEVEL", "info").to_lowercase(),
            gemini_api_key: env_string("GEMINI_API_KEY", ""),
            gemini_base_url: env_string(
                "GEMINI_BASE_URL",
                "https://generativelanguage.googleapis.com/v1beta",
            )
            .trim_end_matches('/')
            .to_string(),
            gemini_assistant_model: env_string("GEMINI_ASSISTANT_MODEL", "gemini-2.5-flash"),
            gemini_temperature: env_f32("GEMINI_TEMPERATURE", 0.7),
            gemini_request_timeout_seconds: env_u64("GEMINI_REQUEST_TIMEOUT_SECONDS", 180),
            gemini_safety_settings: normalize_gemini_safety_settings(env_string(
                "GEMINI_SAFETY_SETTINGS",
                "standard",
            )),
            render_engines_config_path,
            render_engines,
            access_password: env_string("ACCESS_PASSWORD", ""),
            style_glossary_dir: resolve_relative_path(&env_string(
                "STYLE_GLOSSARY_DIR",
                "style_glossary",
            )),
            persona_name: env_string("PERSONA_NAME", "Valeria Desvelada"),
            persona_file_prefix: if persona_file_prefix.is_empty() {
                "valeria".to_string()
            } else {
                persona_file_prefix
            },
            history_capacity: env_usize("HISTORY_CAPACITY", DEFAULT_HISTORY_CAPACITY).max(1),
            upscale_target_width: env_u32("UPSCALE_TARGET_WIDTH", DEFAULT_UPSCALE_WIDTH).max(1),
            default_aspect_ratio: normalize_default_aspect_ratio(env_string(
                "DEFAULT_ASPECT_RATIO",
                SUPPORTED_ASPECT_RATIOS[0],
            )),
            telegram_max_length: env_usize("TELEGRAM_MAX_LENGTH", 4000),
        })
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            persona_name: self.persona_name.clone(),
            file_prefix: self.persona_file_prefix.clone(),
            history_capacity: self.history_capacity,
            upscale_width: self.upscale_target_width,
            engines: self.render_engines.clone(),
            default_aspect_ratio: self.default_aspect_ratio.clone(),
        }
    }

    pub fn access_gate_enabled(&self) -> bool {
        !self.access_password.trim().is_empty()
    }
}

pub const IDENTITY_DIRECTIVE: &str = "IDENTITY INSTRUCTIONS:\n1. Replicate EXACTLY the facial and body features shown in the first group of images (Identity references). The person in the output must be unmistakably the same woman.";

pub const STYLE_DIRECTIVE: &str = "STYLE INSTRUCTIONS:\n2. Use the second group of images (if any) ONLY as a reference for pose, lighting and composition. Never copy faces or bodies from them.";

pub const PROMPT_ASSISTANT_SYSTEM_PROMPT: &str = r#"You are the creative director and prompt engineer behind the virtual model "{persona}". You write scene descriptions that an image model will render using fixed identity reference photos of {persona}.

### RULES
1. Write in English, in a single flowing paragraph unless a recipe below asks for structure.
2. Describe environment, action, wardrobe, lighting, camera and mood concretely. Never describe her face or body shape: identity comes from the reference photos.
3. CRITICAL: The name "{persona}" MUST appear verbatim in every answer so the renderer keeps her identity consistent.
4. Return ONLY the final prompt text. No preamble, no markdown headings, no quotes.

### STYLE GLOSSARY
Use this glossary as vocabulary for fashion, poses, lighting and locations. Prefer its terms when they fit.
{glossary}

### COMMANDS
The operator starts their message with one of these verbs:
- "Improve:" Rewrite the given draft into a richer, more photographic prompt. Keep every element the operator asked for.
- "Fashion Recipe:" Build an editorial fashion shot. Structure it as: outfit (garments, fabrics, colors), styling (accessories, hair, makeup), setting, pose, lighting, camera.
- "Portrait Recipe:" Build a close or medium portrait. Structure it as: framing and lens, expression, light setup, background, color grade.
- "Describe:" Turn the operator's short idea into a neutral, literal scene description without embellishment.
If no verb is present, treat the message as "Improve:"."#;
