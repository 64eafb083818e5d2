use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::studio::glossary::GlossaryCache;
use crate::studio::session::{SessionContext, SessionSettings};

pub type SharedSession = Arc<tokio::sync::Mutex<SessionContext>>;

/// Process-wide state handed to every handler. Sessions live in memory only.
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<SessionSettings>,
    pub glossary: Arc<GlossaryCache>,
    sessions: Arc<Mutex<HashMap<i64, SharedSession>>>,
}

impl AppState {
    pub fn new(settings: SessionSettings, glossary: GlossaryCache) -> Self {
        AppState {
            settings: Arc::new(settings),
            glossary: Arc::new(glossary),
            sessions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// The chat's session, created on first contact.
    pub fn session(&self, chat_id: i64) -> SharedSession {
        let mut sessions = self.sessions.lock();
        let open = sessions.len();
        Arc::clone(sessions.entry(chat_id).or_insert_with(|| {
            tracing::info!(chat_id, open_sessions = open + 1, "Opening new studio session");
            Arc::new(tokio::sync::Mutex::new(SessionContext::new(
                (*self.settings).clone(),
            )))
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RenderEngine;

    fn state() -> AppState {
        let settings = SessionSettings {
            persona_name: "Valeria Desvelada".to_string(),
            file_prefix: "valeria".to_string(),
            history_capacity: 3,
            upscale_width: 64,
            engines: vec![RenderEngine::new("Fast", "gemini-2.5-flash-image")],
            default_aspect_ratio: "2:3".to_string(),
        };
        AppState::new(
            settings,
            GlossaryCache::new(std::env::temp_dir().join("valeria-state-glossary")),
        )
    }

    #[tokio::test]
    async fn sessions_are_isolated_per_chat() {
        let state = state();
        state.session(1).lock().await.edit_prompt("first chat");

        assert!(state.session(2).lock().await.prompt.is_blank());
        assert_eq!(state.session(1).lock().await.prompt.text(), "first chat");
        assert!(Arc::ptr_eq(&state.session(1), &state.session(1)));
    }
}
