use chrono::{DateTime, Utc};
use image::DynamicImage;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{info, warn};

use crate::config::{RenderEngine, SUPPORTED_ASPECT_RATIOS};
use crate::llm::gemini::{GeminiOutcome, ImageGenerationRequest};
use crate::llm::media::{decode_image, DecodedImage};
use crate::studio::history::HistoryStore;
use crate::studio::prompt::{PromptSource, PromptState};
use crate::studio::references::{ReferenceKind, ReferenceStore};
use crate::studio::{Reply, StudioError};

static RATIO_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*(\d{1,2})\s*[:xX/]\s*(\d{1,2})\s*$").expect("valid ratio regex"));

fn invalid_index(kind: &'static str, index: usize, len: usize) -> StudioError {
    StudioError::InvalidIndex { kind, index, len }
}

/// Per-session knobs, resolved from configuration once at startup.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub persona_name: String,
    pub file_prefix: String,
    pub history_capacity: usize,
    pub upscale_width: u32,
    pub engines: Vec<RenderEngine>,
    pub default_aspect_ratio: String,
}

/// Work needed to serve an upscaled download.
#[derive(Debug, Clone)]
pub enum UpscaleJob {
    Cached {
        index: usize,
        png: Vec<u8>,
    },
    Render {
        index: usize,
        entry_id: u64,
        image: DynamicImage,
        target_width: u32,
    },
}

/// Everything one chat owns. Created on the chat's first message and dropped
/// with the process.
#[derive(Debug)]
pub struct SessionContext {
    settings: SessionSettings,
    pub identity: ReferenceStore,
    pub style: ReferenceStore,
    pub history: HistoryStore,
    pub prompt: PromptState,
    engine: RenderEngine,
    aspect_ratio: String,
    upload_target: ReferenceKind,
    authenticated: bool,
}

impl SessionContext {
    pub fn new(settings: SessionSettings) -> Self {
        let engine = settings
            .engines
            .first()
            .cloned()
            .unwrap_or_else(|| RenderEngine::new("Gemini Image", "gemini-2.5-flash-image"));
        let aspect_ratio = settings.default_aspect_ratio.clone();
        let history = HistoryStore::new(settings.history_capacity);
        Self {
            settings,
            identity: ReferenceStore::new(ReferenceKind::Identity),
            style: ReferenceStore::new(ReferenceKind::Style),
            history,
            prompt: PromptState::default(),
            engine,
            aspect_ratio,
            upload_target: ReferenceKind::Identity,
            authenticated: false,
        }
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    pub fn engine(&self) -> &RenderEngine {
        &self.engine
    }

    pub fn aspect_ratio(&self) -> &str {
        &self.aspect_ratio
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    pub fn mark_authenticated(&mut self) {
        self.authenticated = true;
    }

    pub fn upload_target(&self) -> ReferenceKind {
        self.upload_target
    }

    pub fn set_upload_target(&mut self, kind: ReferenceKind) -> Reply {
        self.upload_target = kind;
        let hint = match kind {
            ReferenceKind::Identity => "face, body and signature outfits",
            ReferenceKind::Style => "lighting, composition or pose",
        };
        Reply::Text(format!(
            "New uploads go to {} references ({}). Caption a photo with 'identity' or 'style' to override.\n\n{}",
            kind.label().to_uppercase(),
            hint,
            self.describe_store(kind)
        ))
    }

    pub fn store(&self, kind: ReferenceKind) -> &ReferenceStore {
        match kind {
            ReferenceKind::Identity => &self.identity,
            ReferenceKind::Style => &self.style,
        }
    }

    pub fn store_mut(&mut self, kind: ReferenceKind) -> &mut ReferenceStore {
        match kind {
            ReferenceKind::Identity => &mut self.identity,
            ReferenceKind::Style => &mut self.style,
        }
    }

    pub fn engine_listing(&self) -> Reply {
        let lines: Vec<String> = self
            .settings
            .engines
            .iter()
            .enumerate()
            .map(|(position, engine)| {
                let marker = if *engine == self.engine { "▶" } else { " " };
                format!("{} {}. {} ({})", marker, position + 1, engine.name, engine.model)
            })
            .collect();
        Reply::Text(format!(
            "Render engines:\n{}\n\nSelect with /engine <number>.",
            lines.join("\n")
        ))
    }

    /// Accepts a 1-based position, a display name or a model id.
    pub fn select_engine(&mut self, selector: &str) -> Result<Reply, StudioError> {
        let selector = selector.trim();
        let by_position = selector
            .parse::<usize>()
            .ok()
            .and_then(|position| position.checked_sub(1))
            .and_then(|index| self.settings.engines.get(index));
        let engine = by_position
            .or_else(|| {
                self.settings.engines.iter().find(|engine| {
                    engine.name.eq_ignore_ascii_case(selector)
                        || engine.model.eq_ignore_ascii_case(selector)
                })
            })
            .cloned()
            .ok_or_else(|| StudioError::UnknownEngine(selector.to_string()))?;
        info!(engine = %engine.name, model = %engine.model, "Render engine selected");
        let reply = Reply::Text(format!("Render engine set to {}.", engine.name));
        self.engine = engine;
        Ok(reply)
    }

    pub fn ratio_listing(&self) -> Reply {
        Reply::Text(format!(
            "Aspect ratio: {}\nAvailable: {}\n\nSelect with /ratio <w:h>.",
            self.aspect_ratio,
            SUPPORTED_ASPECT_RATIOS.join(", ")
        ))
    }

    pub fn select_aspect_ratio(&mut self, input: &str) -> Result<Reply, StudioError> {
        let normalized = RATIO_RE
            .captures(input)
            .map(|caps| format!("{}:{}", &caps[1], &caps[2]))
            .unwrap_or_else(|| input.trim().to_string());
        if !SUPPORTED_ASPECT_RATIOS.contains(&normalized.as_str()) {
            return Err(StudioError::UnsupportedAspectRatio(input.trim().to_string()));
        }
        self.aspect_ratio = normalized;
        Ok(Reply::Text(format!("Aspect ratio set to {}.", self.aspect_ratio)))
    }

    pub fn add_reference(&mut self, kind: ReferenceKind, name: &str, image: DecodedImage) -> Reply {
        let (width, height) = image.dimensions();
        let store = self.store_mut(kind);
        if !store.add(name, image) {
            return Reply::Text(format!(
                "'{}' is already in {} references; skipped.",
                name,
                kind.label()
            ));
        }
        let index = store.len() - 1;
        let active = store.get(index).map(|item| item.active).unwrap_or_default();
        info!(kind = kind.label(), name, width, height, "Reference image added");
        Reply::Text(format!(
            "Added '{}' to {} references as #{} ({}x{}, {}).",
            name,
            kind.label().to_uppercase(),
            index,
            width,
            height,
            if active { "active" } else { "inactive" }
        ))
    }

    pub fn remove_reference(&mut self, kind: ReferenceKind, index: usize) -> Result<Reply, StudioError> {
        let len = self.store(kind).len();
        let removed = self
            .store_mut(kind)
            .remove(index)
            .ok_or_else(|| invalid_index(kind.label(), index, len))?;
        Ok(Reply::Text(format!(
            "Removed '{}' from {} references.\n\n{}",
            removed.name,
            kind.label(),
            self.describe_store(kind)
        )))
    }

    pub fn toggle_reference(&mut self, kind: ReferenceKind, index: usize) -> Result<Reply, StudioError> {
        let len = self.store(kind).len();
        let active = self
            .store_mut(kind)
            .toggle(index)
            .ok_or_else(|| invalid_index(kind.label(), index, len))?;
        Ok(Reply::Text(format!(
            "{} reference #{} is now {}.\n\n{}",
            kind.label().to_uppercase(),
            index,
            if active { "active" } else { "inactive" },
            self.describe_store(kind)
        )))
    }

    pub fn clear_references(&mut self, kind: ReferenceKind) -> Reply {
        let removed = self.store_mut(kind).clear();
        Reply::Text(format!(
            "Cleared {} {} reference(s).",
            removed,
            kind.label()
        ))
    }

    fn describe_store(&self, kind: ReferenceKind) -> String {
        let store = self.store(kind);
        if store.is_empty() {
            return format!("{}: empty", kind.label().to_uppercase());
        }
        let lines: Vec<String> = store
            .iter()
            .enumerate()
            .map(|(index, item)| {
                format!(
                    "  {} #{} {}",
                    if item.active { "[x]" } else { "[ ]" },
                    index,
                    item.name
                )
            })
            .collect();
        format!(
            "{} ({} active of {}):\n{}",
            kind.label().to_uppercase(),
            store.active_count(),
            store.len(),
            lines.join("\n")
        )
    }

    pub fn references_summary(&self) -> Reply {
        Reply::Text(format!(
            "{}\n\n{}\n\nUploads go to {}.",
            self.describe_store(ReferenceKind::Identity),
            self.describe_store(ReferenceKind::Style),
            self.upload_target.label().to_uppercase()
        ))
    }

    pub fn edit_prompt(&mut self, text: &str) -> Reply {
        self.prompt.edit(text);
        Reply::Text(format!("Scene description updated:\n\n{}", self.prompt.text()))
    }

    pub fn show_prompt(&self) -> Reply {
        if self.prompt.is_blank() {
            return Reply::Text(
                "No scene description yet. Set one with /prompt <text> or ask /improve.".to_string(),
            );
        }
        let origin = match self.prompt.source() {
            PromptSource::Operator => "your edit",
            PromptSource::Assistant => "the prompt assistant",
        };
        Reply::Text(format!(
            "Current scene description (revision {}, from {}):\n\n{}",
            self.prompt.revision(),
            origin,
            self.prompt.text()
        ))
    }

    /// Validates and snapshots what the generation call needs.
    pub fn prepare_generation(&self) -> Result<ImageGenerationRequest, StudioError> {
        if self.prompt.is_blank() {
            return Err(StudioError::EmptyPrompt);
        }
        let identity: Vec<_> = self
            .identity
            .active_images()
            .into_iter()
            .map(DecodedImage::payload)
            .collect();
        if identity.is_empty() {
            return Err(StudioError::MissingIdentity);
        }
        let style = self
            .style
            .active_images()
            .into_iter()
            .map(DecodedImage::payload)
            .collect();

        Ok(ImageGenerationRequest {
            engine: self.engine.clone(),
            persona_name: self.settings.persona_name.clone(),
            aspect_ratio: self.aspect_ratio.clone(),
            scene: self.prompt.text().to_string(),
            identity,
            style,
        })
    }

    /// Records a successful result; any other outcome leaves the session as it was.
    pub fn apply_generation(
        &mut self,
        request: &ImageGenerationRequest,
        outcome: GeminiOutcome,
        now: DateTime<Utc>,
    ) -> Result<Reply, StudioError> {
        let (bytes, mime_type) = match outcome {
            GeminiOutcome::Image { bytes, mime_type } => (bytes, mime_type),
            GeminiOutcome::Empty => return Err(StudioError::EmptyApiResponse),
            GeminiOutcome::Text(text) => return Err(StudioError::NoImageInResponse(text)),
            GeminiOutcome::Failure(reason) => return Err(StudioError::Generation(reason)),
        };

        let decoded = decode_image(bytes, Some(mime_type.as_str()))
            .map_err(|err| StudioError::Generation(err.to_string()))?;
        let result = if decoded.mime_type == "image/png" {
            decoded
        } else {
            DecodedImage::from_bitmap(decoded.image)
                .map_err(|err| StudioError::Generation(err.to_string()))?
        };
        let (width, height) = result.dimensions();

        if let Some(evicted) = self.history.push(
            result,
            &request.engine.name,
            &request.aspect_ratio,
            now,
        ) {
            info!(entry_id = evicted.id, "History full; evicted oldest result");
        }
        info!(width, height, engine = %request.engine.name, "Generation stored in history");

        let png = self
            .history
            .get(0)
            .map(|entry| entry.image.bytes.clone())
            .unwrap_or_default();
        Ok(Reply::Photo {
            bytes: png,
            file_name: self.download_name(0),
            caption: format!(
                "{} | Format {} | #0 ({})\n/download 0 · /upscale 0 · /recycle 0",
                self.settings.persona_name, request.aspect_ratio, request.engine.name
            ),
        })
    }

    /// The text sent to the prompt assistant. Without an argument the current
    /// prompt is improved.
    pub fn assistant_command(&self, argument: Option<&str>) -> Result<String, StudioError> {
        match argument.map(str::trim).filter(|value| !value.is_empty()) {
            Some(command) => Ok(command.to_string()),
            None if self.prompt.is_blank() => Err(StudioError::EmptyPrompt),
            None => Ok(format!("Improve: {}", self.prompt.text())),
        }
    }

    pub fn apply_assistant(&mut self, outcome: GeminiOutcome) -> Result<Reply, StudioError> {
        let text = match outcome {
            GeminiOutcome::Text(text) if !text.trim().is_empty() => text,
            GeminiOutcome::Text(_) | GeminiOutcome::Empty | GeminiOutcome::Image { .. } => {
                return Err(StudioError::EmptyAssistantResponse)
            }
            GeminiOutcome::Failure(reason) => return Err(StudioError::Assistant(reason)),
        };
        if !text.contains(&self.settings.persona_name) {
            warn!("Prompt assistant answer does not mention the persona name");
        }
        self.prompt.replace_from_assistant(&text);
        Ok(Reply::Text(format!(
            "Scene description replaced (revision {}):\n\n{}\n\nRun /generate when ready.",
            self.prompt.revision(),
            self.prompt.text()
        )))
    }

    fn download_name(&self, index: usize) -> String {
        format!("{}_{}.png", self.settings.file_prefix, index)
    }

    fn upscaled_name(&self, index: usize) -> String {
        format!("{}_4k_{}.png", self.settings.file_prefix, index)
    }

    pub fn history_gallery(&self) -> Vec<Reply> {
        if self.history.is_empty() {
            return vec![Reply::Text("No results yet. Use /generate.".to_string())];
        }
        let mut replies = vec![Reply::Text(format!(
            "Session history ({} of {}), newest first:",
            self.history.len(),
            self.history.capacity()
        ))];
        replies.extend(self.history.iter().enumerate().map(|(index, entry)| {
            Reply::Photo {
                bytes: entry.image.bytes.clone(),
                file_name: self.download_name(index),
                caption: format!(
                    "#{} | {} | {} | {}",
                    index,
                    entry.aspect_ratio,
                    entry.engine,
                    entry.created_at.format("%H:%M:%S UTC")
                ),
            }
        }));
        replies
    }

    pub fn download(&self, index: usize) -> Result<Reply, StudioError> {
        let entry = self
            .history
            .get(index)
            .ok_or_else(|| invalid_index("history", index, self.history.len()))?;
        Ok(Reply::Document {
            bytes: entry.image.bytes.clone(),
            file_name: self.download_name(index),
            caption: None,
        })
    }

    pub fn plan_upscale(&self, index: usize) -> Result<UpscaleJob, StudioError> {
        let entry = self
            .history
            .get(index)
            .ok_or_else(|| invalid_index("history", index, self.history.len()))?;
        if let Some(png) = entry.upscaled() {
            return Ok(UpscaleJob::Cached {
                index,
                png: png.to_vec(),
            });
        }
        Ok(UpscaleJob::Render {
            index,
            entry_id: entry.id,
            image: entry.image.image.clone(),
            target_width: self.settings.upscale_width,
        })
    }

    pub fn finish_upscale(&mut self, index: usize, entry_id: u64, png: Vec<u8>) -> Reply {
        if !self.history.cache_upscaled(entry_id, png.clone()) {
            warn!(entry_id, "Upscaled entry left history before caching");
        }
        self.upscaled_document(index, png)
    }

    pub fn upscaled_document(&self, index: usize, png: Vec<u8>) -> Reply {
        Reply::Document {
            bytes: png,
            file_name: self.upscaled_name(index),
            caption: Some(format!("{} | {}px", self.settings.persona_name, self.settings.upscale_width)),
        }
    }

    /// Copies a result into the style references under a fresh name.
    pub fn recycle(&mut self, index: usize, now: DateTime<Utc>) -> Result<Reply, StudioError> {
        let entry = self
            .history
            .get(index)
            .ok_or_else(|| invalid_index("history", index, self.history.len()))?;
        let image = entry.image.clone();
        let base = format!("recycled_{}_{}", now.format("%Y%m%d%H%M%S%3f"), entry.id);

        let mut name = format!("{base}.png");
        let mut suffix = 1;
        while self.style.contains(&name) {
            name = format!("{base}_{suffix}.png");
            suffix += 1;
        }

        let reply = self.add_reference(ReferenceKind::Style, &name, image);
        info!(history_index = index, name = %name, "History entry recycled as style reference");
        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::llm::gemini::{image_outcome, GeminiResponse};
    use crate::llm::media::encode_png;

    fn settings() -> SessionSettings {
        SessionSettings {
            persona_name: "Valeria Desvelada".to_string(),
            file_prefix: "valeria".to_string(),
            history_capacity: 10,
            upscale_width: 64,
            engines: vec![
                RenderEngine::new("Pro", "gemini-3-pro-image-preview"),
                RenderEngine::new("Fast", "gemini-2.5-flash-image"),
            ],
            default_aspect_ratio: "2:3".to_string(),
        }
    }

    fn reference(width: u32) -> DecodedImage {
        DecodedImage::from_bitmap(DynamicImage::new_rgb8(width, 2)).unwrap()
    }

    fn image_outcome_of(width: u32, height: u32) -> GeminiOutcome {
        GeminiOutcome::Image {
            bytes: encode_png(&DynamicImage::new_rgb8(width, height)).unwrap(),
            mime_type: "image/png".to_string(),
        }
    }

    fn ready_session() -> SessionContext {
        let mut session = SessionContext::new(settings());
        session.add_reference(ReferenceKind::Identity, "face.jpg", reference(3));
        session.edit_prompt("Valeria in a Paris cafe");
        session
    }

    fn generate(session: &mut SessionContext, width: u32) {
        let request = session.prepare_generation().unwrap();
        session
            .apply_generation(&request, image_outcome_of(width, 4), Utc::now())
            .unwrap();
    }

    #[test]
    fn generation_requires_prompt_and_active_identity() {
        let mut session = SessionContext::new(settings());
        assert!(matches!(session.prepare_generation(), Err(StudioError::EmptyPrompt)));

        session.edit_prompt("Valeria at the beach");
        assert!(matches!(session.prepare_generation(), Err(StudioError::MissingIdentity)));

        session.add_reference(ReferenceKind::Identity, "face.jpg", reference(3));
        session.toggle_reference(ReferenceKind::Identity, 0).unwrap();
        assert!(matches!(session.prepare_generation(), Err(StudioError::MissingIdentity)));

        session.toggle_reference(ReferenceKind::Identity, 0).unwrap();
        assert!(session.prepare_generation().is_ok());
    }

    #[test]
    fn request_snapshots_only_active_references_in_order() {
        let mut session = ready_session();
        session.add_reference(ReferenceKind::Identity, "body.jpg", reference(4));
        session.add_reference(ReferenceKind::Style, "pose-a.jpg", reference(5));
        session.add_reference(ReferenceKind::Style, "pose-b.jpg", reference(6));
        session.toggle_reference(ReferenceKind::Style, 0).unwrap();
        session.select_engine("2").unwrap();
        session.select_aspect_ratio("9x16").unwrap();

        let request = session.prepare_generation().unwrap();
        assert_eq!(request.identity.len(), 2);
        assert_eq!(request.identity[0], session.identity.get(0).unwrap().image.payload());
        assert_eq!(request.style, vec![session.style.get(1).unwrap().image.payload()]);
        assert_eq!(request.engine.model, "gemini-2.5-flash-image");
        assert_eq!(request.aspect_ratio, "9:16");
        assert_eq!(request.scene, "Valeria in a Paris cafe");
    }

    #[test]
    fn zero_part_response_leaves_history_unchanged() {
        let mut session = ready_session();
        let request = session.prepare_generation().unwrap();
        let response: GeminiResponse =
            serde_json::from_str(r#"{"candidates":[{"content":{"parts":[]}}]}"#).unwrap();

        let result = session.apply_generation(&request, image_outcome(&response), Utc::now());
        assert!(matches!(result, Err(StudioError::EmptyApiResponse)));
        assert!(session.history.is_empty());

        let result = session.apply_generation(
            &request,
            GeminiOutcome::Failure("timeout".to_string()),
            Utc::now(),
        );
        assert!(matches!(result, Err(StudioError::Generation(_))));
        assert!(session.history.is_empty());
    }

    #[test]
    fn successful_generation_lands_at_history_head() {
        let mut session = ready_session();
        generate(&mut session, 7);
        let request = session.prepare_generation().unwrap();

        let reply = session
            .apply_generation(&request, image_outcome_of(9, 4), Utc::now())
            .unwrap();
        match reply {
            Reply::Photo { file_name, caption, .. } => {
                assert_eq!(file_name, "valeria_0.png");
                assert!(caption.contains("Format 2:3"));
            }
            other => panic!("unexpected reply {other:?}"),
        }
        assert_eq!(session.history.len(), 2);
        assert_eq!(session.history.get(0).unwrap().image.dimensions(), (9, 4));
    }

    #[test]
    fn undecodable_image_is_a_generation_failure() {
        let mut session = ready_session();
        let request = session.prepare_generation().unwrap();
        let outcome = GeminiOutcome::Image {
            bytes: vec![1, 2, 3],
            mime_type: "image/png".to_string(),
        };

        assert!(matches!(
            session.apply_generation(&request, outcome, Utc::now()),
            Err(StudioError::Generation(_))
        ));
        assert!(session.history.is_empty());
    }

    #[test]
    fn empty_assistant_answer_keeps_prompt() {
        let mut session = ready_session();
        let revision = session.prompt.revision();

        let result = session.apply_assistant(GeminiOutcome::Empty);
        assert!(matches!(result, Err(StudioError::EmptyAssistantResponse)));
        let result = session.apply_assistant(GeminiOutcome::Failure("503".to_string()));
        assert!(matches!(result, Err(StudioError::Assistant(_))));

        assert_eq!(session.prompt.text(), "Valeria in a Paris cafe");
        assert_eq!(session.prompt.revision(), revision);
    }

    #[test]
    fn assistant_answer_replaces_prompt() {
        let mut session = ready_session();
        session
            .apply_assistant(GeminiOutcome::Text(
                "Valeria Desvelada sips espresso on a Parisian terrace".to_string(),
            ))
            .unwrap();
        assert_eq!(
            session.prompt.text(),
            "Valeria Desvelada sips espresso on a Parisian terrace"
        );
    }

    #[test]
    fn assistant_command_defaults_to_improving_current_prompt() {
        let session = ready_session();
        assert_eq!(
            session.assistant_command(None).unwrap(),
            "Improve: Valeria in a Paris cafe"
        );
        assert_eq!(
            session.assistant_command(Some("Fashion Recipe: red gown")).unwrap(),
            "Fashion Recipe: red gown"
        );

        let empty = SessionContext::new(settings());
        assert!(matches!(empty.assistant_command(Some("  ")), Err(StudioError::EmptyPrompt)));
    }

    #[test]
    fn recycle_copies_into_style_without_touching_history() {
        let mut session = ready_session();
        generate(&mut session, 8);
        let now = Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap();

        session.recycle(0, now).unwrap();
        session.recycle(0, now).unwrap();

        assert_eq!(session.history.len(), 1);
        assert_eq!(session.style.len(), 2);
        let first = session.style.get(0).unwrap();
        let second = session.style.get(1).unwrap();
        assert_ne!(first.name, second.name);
        assert!(first.name.starts_with("recycled_20260102030405"));
        assert_eq!(first.image.bytes, session.history.get(0).unwrap().image.bytes);
        assert!(first.active);
    }

    #[test]
    fn recycle_rejects_stale_index() {
        let mut session = ready_session();
        assert!(matches!(
            session.recycle(0, Utc::now()),
            Err(StudioError::InvalidIndex { kind: "history", index: 0, len: 0 })
        ));
        assert!(session.style.is_empty());
    }

    #[test]
    fn downloads_use_persona_file_names() {
        let mut session = ready_session();
        generate(&mut session, 8);
        generate(&mut session, 9);

        match session.download(1).unwrap() {
            Reply::Document { file_name, bytes, .. } => {
                assert_eq!(file_name, "valeria_1.png");
                assert_eq!(bytes, session.history.get(1).unwrap().image.bytes);
            }
            other => panic!("unexpected reply {other:?}"),
        }
        assert!(session.download(2).is_err());
    }

    #[test]
    fn upscale_is_rendered_once_then_cached() {
        let mut session = ready_session();
        generate(&mut session, 8);

        let (index, entry_id) = match session.plan_upscale(0).unwrap() {
            UpscaleJob::Render { index, entry_id, target_width, .. } => {
                assert_eq!(target_width, 64);
                (index, entry_id)
            }
            other => panic!("expected a render job, got {other:?}"),
        };
        let reply = session.finish_upscale(index, entry_id, vec![7, 7]);
        assert!(matches!(reply, Reply::Document { ref file_name, .. } if file_name == "valeria_4k_0.png"));

        match session.plan_upscale(0).unwrap() {
            UpscaleJob::Cached { png, .. } => assert_eq!(png, vec![7, 7]),
            other => panic!("expected cached bytes, got {other:?}"),
        }
    }

    #[test]
    fn engine_and_ratio_selection() {
        let mut session = SessionContext::new(settings());
        assert_eq!(session.engine().name, "Pro");

        session.select_engine("fast").unwrap();
        assert_eq!(session.engine().model, "gemini-2.5-flash-image");
        session.select_engine("gemini-3-pro-image-preview").unwrap();
        assert_eq!(session.engine().name, "Pro");
        assert!(matches!(session.select_engine("3"), Err(StudioError::UnknownEngine(_))));
        assert_eq!(session.engine().name, "Pro");

        session.select_aspect_ratio(" 16 : 9 ").unwrap();
        assert_eq!(session.aspect_ratio(), "16:9");
        assert!(matches!(
            session.select_aspect_ratio("21:9"),
            Err(StudioError::UnsupportedAspectRatio(_))
        ));
        assert_eq!(session.aspect_ratio(), "16:9");
    }

    #[test]
    fn duplicate_upload_reports_skip() {
        let mut session = SessionContext::new(settings());
        session.add_reference(ReferenceKind::Style, "pose.png", reference(2));
        let reply = session.add_reference(ReferenceKind::Style, "pose.png", reference(5));

        assert!(matches!(reply, Reply::Text(ref text) if text.contains("skipped")));
        assert_eq!(session.style.len(), 1);
    }
}
