//! In-memory conversation history.
//!
//! Turns are appended in order and never edited. The list is cleared only
//! on an explicit reset.

use crate::inference::types::{Content, Part};

/// Ordered list of role-tagged turns.
#[derive(Debug, Clone, Default)]
pub struct ConversationHistory {
    turns: Vec<Content>,
}

impl ConversationHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_user_text(&mut self, text: &str) {
        self.turns.push(Content::user_text(text));
    }

    pub fn push_model_text(&mut self, text: &str) {
        self.turns.push(Content::model_text(text));
    }

    /// Append a prebuilt turn (e.g. an image turn).
    pub fn push_turn(&mut self, turn: Content) {
        self.turns.push(turn);
    }

    pub fn clear(&mut self) {
        self.turns.clear();
    }

    pub fn turns(&self) -> &[Content] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// Turns to replay on a text query.
    ///
    /// Inline image data is stripped so earlier screenshots are not re-sent
    /// with every follow-up. The question text of an image turn is kept.
    /// Turns left with no parts are dropped.
    pub fn request_contents(&self) -> Vec<Content> {
        self.turns
            .iter()
            .filter_map(|turn| {
                let parts: Vec<Part> = turn
                    .parts
                    .iter()
                    .filter(|p| !p.is_inline_data())
                    .cloned()
                    .collect();
                if parts.is_empty() {
                    None
                } else {
                    Some(Content {
                        role: turn.role,
                        parts,
                    })
                }
            })
            .collect()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
