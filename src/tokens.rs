//! Clickable word tokens and the translation toggle.

use serde::Serialize;

use crate::vocabulary::{Topic, TranslationMap};

/// Marker shown for words the topic has no translation for.
pub const UNKNOWN_TRANSLATION: &str = "???";

const PUNCTUATION: [char; 6] = ['.', ',', '!', '?', ';', ':'];

pub fn strip_punctuation(word: &str) -> String {
    word.chars().filter(|c| !PUNCTUATION.contains(c)).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DisplayState {
    Source,
    Target,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Token {
    pub index: usize,
    /// Text as it appeared, punctuation included.
    pub original: String,
    pub clean: String,
    /// Form that is spoken and sent as context.
    pub source: String,
    pub target: String,
    pub display: DisplayState,
    pub reading: bool,
    /// Bumped on every toggle so the client can replay its pulse animation.
    pub pulse: u32,
}

/// Result of one toggle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToggleOutcome {
    pub display: DisplayState,
    /// Word to speak aloud, present only on a reveal that is allowed to speak.
    pub speak: Option<String>,
}

impl Token {
    pub fn new(index: usize, original: &str, target: String) -> Self {
        let clean = strip_punctuation(original);
        Self {
            index,
            original: original.to_string(),
            source: clean.clone(),
            clean,
            target,
            display: DisplayState::Source,
            reading: false,
            pulse: 0,
        }
    }

    /// What the client should currently draw for this token.
    pub fn shown_text(&self) -> &str {
        match self.display {
            DisplayState::Source => &self.original,
            DisplayState::Target => &self.target,
        }
    }

    pub fn is_translated(&self) -> bool {
        self.display == DisplayState::Target
    }

    /// Flips the token between its source and target forms.
    ///
    /// Revealing the target asks for the source word to be spoken unless
    /// `suppress_speech` is set; callers pass `true` while a full-text reading
    /// is in progress.
    pub fn toggle(&mut self, suppress_speech: bool) -> ToggleOutcome {
        self.pulse = self.pulse.wrapping_add(1);
        match self.display {
            DisplayState::Source => {
                self.display = DisplayState::Target;
                let speak = (!suppress_speech && !self.source.is_empty()).then(|| self.source.clone());
                ToggleOutcome {
                    display: self.display,
                    speak,
                }
            }
            DisplayState::Target => {
                self.display = DisplayState::Source;
                ToggleOutcome {
                    display: self.display,
                    speak: None,
                }
            }
        }
    }

    pub fn restore_source(&mut self) {
        self.display = DisplayState::Source;
    }
}

/// Splits text on whitespace runs into tokens, resolving each target with
/// `translate(clean)`.
pub fn tokenize<F>(text: &str, mut translate: F) -> Vec<Token>
where
    F: FnMut(&str) -> String,
{
    text.split_whitespace()
        .enumerate()
        .map(|(index, word)| {
            let clean = strip_punctuation(word);
            let target = translate(&clean);
            Token::new(index, word, target)
        })
        .collect()
}

/// Joined English text of a topic, one space between entries.
pub fn topic_text(topic: &Topic) -> String {
    topic
        .words
        .iter()
        .map(|item| item.en.as_str())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Builds the main text tokens for a topic.
pub fn render(topic: &Topic, translations: &TranslationMap) -> Vec<Token> {
    tokenize(&topic_text(topic), |clean| {
        translations
            .lookup(clean)
            .unwrap_or(UNKNOWN_TRANSLATION)
            .to_string()
    })
}

/// Source forms joined by single spaces; punctuation is not spoken.
pub fn spoken_text(tokens: &[Token]) -> String {
    tokens
        .iter()
        .map(|token| token.source.as_str())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Every token back to its source form with no reading highlight.
pub fn reset_all(tokens: &mut [Token]) {
    for token in tokens {
        token.restore_source();
        token.reading = false;
    }
}

/// Translated tokens back to source form; indices of the changed tokens.
pub fn clear_translations(tokens: &mut [Token]) -> Vec<usize> {
    tokens
        .iter_mut()
        .filter(|token| token.is_translated())
        .map(|token| {
            token.restore_source();
            token.index
        })
        .collect()
}

pub fn clear_highlights(tokens: &mut [Token]) {
    for token in tokens {
        token.reading = false;
    }
}
