//! Vocabulary chat assistant.

mod responders;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::future::join_all;
use serde::Serialize;
use tracing::{info, warn};

use crate::error::ReaderError;
use crate::tokens::{strip_punctuation, tokenize, Token, ToggleOutcome};
use crate::translate::WordTranslator;
use crate::vocabulary::TranslationMap;

pub use responders::{
    CannedResponder, ChatPrompt, RemoteCompletionResponder, Responder, ResponderKind,
    SYSTEM_INSTRUCTION,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Sender {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum MessageBody {
    Text(String),
    Tokens(Vec<Token>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatMessage {
    pub id: usize,
    pub sender: Sender,
    pub body: MessageBody,
}

/// Outcome of one `send`.
#[derive(Debug, Clone)]
pub struct ChatExchange {
    pub question: ChatMessage,
    pub reply: ChatMessage,
    pub answered_by: ResponderKind,
    /// The remote responder needs a (new) API key.
    pub credential_required: bool,
    /// Short inline explanation when the reply came from a fallback.
    pub notice: Option<String>,
}

pub struct ChatAssistant {
    responders: Vec<Arc<dyn Responder>>,
    translator: Arc<dyn WordTranslator>,
    log: Mutex<Vec<ChatMessage>>,
    busy: AtomicBool,
}

impl ChatAssistant {
    /// `responders` are tried in order. A [`CannedResponder`] is always
    /// appended so every prompt gets an answer.
    pub fn new(mut responders: Vec<Arc<dyn Responder>>, translator: Arc<dyn WordTranslator>) -> Self {
        responders.push(Arc::new(CannedResponder));
        Self {
            responders,
            translator,
            log: Mutex::new(Vec::new()),
            busy: AtomicBool::new(false),
        }
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    /// Posts `text` and appends the assistant's tokenized reply.
    ///
    /// Returns `None` for whitespace-only input or while a previous message is
    /// still waiting for its answer.
    pub async fn send(
        &self,
        text: &str,
        context: &str,
        translations: &TranslationMap,
    ) -> Option<ChatExchange> {
        let pending = self.post_question(text)?;
        let exchange = pending.answer(context, translations).await;
        Some(exchange)
    }

    /// Appends the user's message and marks the assistant busy until the
    /// returned [`PendingReply`] is answered or dropped.
    ///
    /// Returns `None` for whitespace-only input or while another reply is
    /// pending; nothing is appended then.
    pub fn post_question(&self, text: &str) -> Option<PendingReply<'_>> {
        let user_text = text.trim();
        if user_text.is_empty() {
            return None;
        }
        if self.busy.swap(true, Ordering::SeqCst) {
            warn!("Chat message ignored while a reply is pending");
            return None;
        }
        let question = self.append(Sender::User, MessageBody::Text(user_text.to_string()));
        Some(PendingReply {
            chat: self,
            user_text: user_text.to_string(),
            question,
        })
    }

    /// Tokenizes a reply. Each target comes from the topic vocabulary, then the
    /// remote translator, then the word itself in parentheses.
    pub async fn reply_tokens(&self, text: &str, translations: &TranslationMap) -> Vec<Token> {
        let mut missing = HashSet::new();
        for word in text.split_whitespace() {
            let clean = strip_punctuation(word);
            if !clean.is_empty() && translations.lookup(&clean).is_none() {
                missing.insert(clean.to_lowercase());
            }
        }

        let lookups = missing.into_iter().map(|word| async move {
            let result = self.translator.translate(&word).await;
            (word, result)
        });
        let remote: HashMap<String, String> = join_all(lookups)
            .await
            .into_iter()
            .filter_map(|(word, result)| result.ok().map(|translated| (word, translated)))
            .collect();

        tokenize(text, |clean| {
            // Pure punctuation has nothing to translate or speak.
            if clean.is_empty() {
                return String::new();
            }
            translations
                .lookup(clean)
                .map(str::to_string)
                .or_else(|| remote.get(&clean.to_lowercase()).cloned())
                .unwrap_or_else(|| format!("({clean})"))
        })
    }

    /// Toggles one reply token; user messages have no tokens.
    pub fn toggle_word(
        &self,
        message_id: usize,
        token_index: usize,
        suppress_speech: bool,
    ) -> Option<(Token, ToggleOutcome)> {
        let mut log = self.log.lock().ok()?;
        let message = log.get_mut(message_id)?;
        let MessageBody::Tokens(tokens) = &mut message.body else {
            return None;
        };
        let token = tokens.get_mut(token_index)?;
        let outcome = token.toggle(suppress_speech);
        Some((token.clone(), outcome))
    }

    fn append(&self, sender: Sender, body: MessageBody) -> ChatMessage {
        let mut log = match self.log.lock() {
            Ok(log) => log,
            Err(poisoned) => poisoned.into_inner(),
        };
        let message = ChatMessage {
            id: log.len(),
            sender,
            body,
        };
        log.push(message.clone());
        message
    }
}

/// A posted question whose reply is still being produced. Holds the busy flag.
pub struct PendingReply<'a> {
    chat: &'a ChatAssistant,
    user_text: String,
    pub question: ChatMessage,
}

impl PendingReply<'_> {
    /// Runs the responder chain and appends the tokenized reply. The busy flag
    /// stays set until `self` is dropped.
    pub async fn answer(&self, context: &str, translations: &TranslationMap) -> ChatExchange {
        let prompt = ChatPrompt {
            user_text: self.user_text.clone(),
            context: context.to_string(),
        };

        let mut credential_required = false;
        let mut notice = None;
        let mut answer = None;
        for responder in &self.chat.responders {
            match responder.respond(&prompt).await {
                Ok(reply) => {
                    answer = Some((responder.kind(), reply));
                    break;
                }
                Err(ReaderError::MissingCredential) => {
                    credential_required = true;
                }
                Err(ReaderError::Authorization(message)) => {
                    warn!("Completion API rejected the key: {message}");
                    credential_required = true;
                    notice = Some("Your API key was not accepted. Please enter a new one.".to_string());
                }
                Err(err) => {
                    warn!(responder = ?responder.kind(), "Responder failed: {err}");
                    notice = Some("The assistant is offline right now. Here is a quick tip instead.".to_string());
                }
            }
        }
        let (answered_by, reply_text) = answer.unwrap_or_else(|| {
            (
                ResponderKind::Canned,
                CannedResponder::answer(&prompt.user_text).to_string(),
            )
        });
        info!(answered_by = ?answered_by, "Chat reply ready");

        let tokens = self.chat.reply_tokens(&reply_text, translations).await;
        let reply = self.chat.append(Sender::Assistant, MessageBody::Tokens(tokens));

        ChatExchange {
            question: self.question.clone(),
            reply,
            answered_by,
            credential_required,
            notice,
        }
    }
}

impl Drop for PendingReply<'_> {
    fn drop(&mut self) {
        self.chat.busy.store(false, Ordering::SeqCst);
    }
}
