pub mod glossary;
pub mod history;
pub mod prompt;
pub mod references;
pub mod session;
pub mod upscale;

/// A rendering directive produced by a command handler. The Telegram layer
/// draws these; handlers never talk to the chat directly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Text(String),
    Warning(String),
    Error(String),
    Photo {
        bytes: Vec<u8>,
        file_name: String,
        caption: String,
    },
    Document {
        bytes: Vec<u8>,
        file_name: String,
        caption: Option<String>,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum StudioError {
    #[error("Upload at least one active IDENTITY reference first.")]
    MissingIdentity,
    #[error("Write a scene description first (/prompt <text>).")]
    EmptyPrompt,
    #[error("There is no {kind} entry #{index} (have {len}).")]
    InvalidIndex {
        kind: &'static str,
        index: usize,
        len: usize,
    },
    #[error("Unknown render engine '{0}'. Use /engine to list them.")]
    UnknownEngine(String),
    #[error("Unsupported aspect ratio '{0}'. Use /ratio to list them.")]
    UnsupportedAspectRatio(String),
    #[error("The API returned no content.")]
    EmptyApiResponse,
    #[error("The model did not return a valid image.{}", explanation(.0))]
    NoImageInResponse(String),
    #[error("Image generation failed: {0}")]
    Generation(String),
    #[error("The prompt assistant returned an empty answer. Your prompt was left unchanged.")]
    EmptyAssistantResponse,
    #[error("Prompt assistant failed: {0}. Your prompt was left unchanged.")]
    Assistant(String),
    #[error("Upscale failed: {0}")]
    Upscale(String),
}

fn explanation(text: &str) -> String {
    if text.trim().is_empty() {
        String::new()
    } else {
        format!(" Model said: {}", text.trim())
    }
}

impl StudioError {
    /// Validation problems are warnings; everything else is an error.
    pub fn into_reply(self) -> Reply {
        match self {
            StudioError::MissingIdentity
            | StudioError::EmptyPrompt
            | StudioError::InvalidIndex { .. }
            | StudioError::UnknownEngine(_)
            | StudioError::UnsupportedAspectRatio(_) => Reply::Warning(self.to_string()),
            _ => Reply::Error(self.to_string()),
        }
    }
}
