pub mod gemini;
pub mod media;

pub use gemini::{call_prompt_assistant, generate_persona_image};
