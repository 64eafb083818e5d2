use std::collections::HashMap;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::config::CONFIG;
use crate::studio::session::SessionContext;
use crate::studio::Reply;

const LOGIN_RETRY_DELAY: Duration = Duration::from_secs(3);

static FAILED_LOGINS: Lazy<Mutex<HashMap<i64, Instant>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Commands a locked chat may still run.
pub const OPEN_COMMANDS: [&str; 3] = ["start", "help", "login"];

fn gate_allows(password: &str, session: &SessionContext) -> bool {
    password.trim().is_empty() || session.is_authenticated()
}

pub fn is_allowed(session: &SessionContext) -> bool {
    gate_allows(&CONFIG.access_password, session)
}

pub fn login_required() -> Reply {
    Reply::Warning("This studio is private. Send /login <password> first.".to_string())
}

fn is_throttled(chat_id: i64, now: Instant) -> bool {
    let failures = FAILED_LOGINS.lock();
    failures
        .get(&chat_id)
        .map(|last| now.duration_since(*last) < LOGIN_RETRY_DELAY)
        .unwrap_or(false)
}

fn attempt_login(password: &str, chat_id: i64, session: &mut SessionContext, given: &str) -> Reply {
    if password.trim().is_empty() {
        return Reply::Text("No password is configured; the studio is open.".to_string());
    }
    if session.is_authenticated() {
        return Reply::Text("Already logged in.".to_string());
    }
    let now = Instant::now();
    if is_throttled(chat_id, now) {
        return Reply::Warning("Too many attempts. Wait a few seconds and retry.".to_string());
    }
    if given.trim() != password.trim() {
        FAILED_LOGINS.lock().insert(chat_id, now);
        warn!(chat_id, "Rejected studio login");
        return Reply::Error("Wrong password.".to_string());
    }
    FAILED_LOGINS.lock().remove(&chat_id);
    session.mark_authenticated();
    info!(chat_id, "Studio login accepted");
    Reply::Text("Access granted. Welcome to the studio.".to_string())
}

pub fn login(chat_id: i64, session: &mut SessionContext, given: &str) -> Reply {
    attempt_login(&CONFIG.access_password, chat_id, session, given)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RenderEngine;
    use crate::studio::session::SessionSettings;

    fn session() -> SessionContext {
        SessionContext::new(SessionSettings {
            persona_name: "Valeria Desvelada".to_string(),
            file_prefix: "valeria".to_string(),
            history_capacity: 2,
            upscale_width: 64,
            engines: vec![RenderEngine::new("Fast", "gemini-2.5-flash-image")],
            default_aspect_ratio: "2:3".to_string(),
        })
    }

    #[test]
    fn empty_password_disables_the_gate() {
        let session = session();
        assert!(gate_allows("", &session));
        assert!(gate_allows("   ", &session));
        assert!(!gate_allows("secret", &session));
    }

    #[test]
    fn correct_password_unlocks_the_session() {
        let mut session = session();
        let reply = attempt_login("secret", 9001, &mut session, " secret ");

        assert!(matches!(reply, Reply::Text(_)));
        assert!(session.is_authenticated());
        assert!(gate_allows("secret", &session));
    }

    #[test]
    fn failed_login_throttles_the_next_attempt() {
        let mut session = session();
        let first = attempt_login("secret", 9002, &mut session, "guess");
        let second = attempt_login("secret", 9002, &mut session, "secret");

        assert!(matches!(first, Reply::Error(_)));
        assert!(matches!(second, Reply::Warning(_)));
        assert!(!session.is_authenticated());
    }
}
