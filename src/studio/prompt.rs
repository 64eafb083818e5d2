#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptSource {
    Operator,
    Assistant,
}

/// The editable scene description. Last write wins.
#[derive(Debug, Clone)]
pub struct PromptState {
    text: String,
    revision: u64,
    source: PromptSource,
}

impl Default for PromptState {
    fn default() -> Self {
        Self {
            text: String::new(),
            revision: 0,
            source: PromptSource::Operator,
        }
    }
}

impl PromptState {
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn is_blank(&self) -> bool {
        self.text.trim().is_empty()
    }

    /// Bumped on every write so the editor knows to resynchronize.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn source(&self) -> PromptSource {
        self.source
    }

    pub fn edit(&mut self, text: &str) {
        self.write(text, PromptSource::Operator);
    }

    pub fn replace_from_assistant(&mut self, text: &str) {
        self.write(text, PromptSource::Assistant);
    }

    fn write(&mut self, text: &str, source: PromptSource) {
        self.text = text.trim().to_string();
        self.revision += 1;
        self.source = source;
    }
}
