use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::config::ChatConfig;
use crate::credentials::CredentialStore;
use crate::error::{ReaderError, ReaderResult};

pub const SYSTEM_INSTRUCTION: &str = "You are a friendly English teacher helping an Arabic-speaking \
learner with vocabulary. Answer in simple English, in 200 words or fewer.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponderKind {
    RemoteCompletion,
    Canned,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatPrompt {
    pub user_text: String,
    /// Text of the passage currently on screen.
    pub context: String,
}

/// One strategy in the reply chain. An error hands the prompt to the next one.
#[async_trait]
pub trait Responder: Send + Sync {
    fn kind(&self) -> ResponderKind;

    async fn respond(&self, prompt: &ChatPrompt) -> ReaderResult<String>;
}

#[derive(Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
}

#[derive(Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Deserialize)]
struct CompletionMessage {
    content: String,
}

/// OpenAI-compatible chat completion endpoint.
pub struct RemoteCompletionResponder {
    client: Client,
    api_url: String,
    model: String,
    max_tokens: u32,
    temperature: f32,
    credentials: Arc<CredentialStore>,
}

impl RemoteCompletionResponder {
    pub fn new(config: &ChatConfig, credentials: Arc<CredentialStore>) -> Self {
        Self {
            client: Client::new(),
            api_url: config.api_url.clone(),
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            credentials,
        }
    }

    pub(crate) fn request_body(&self, prompt: &ChatPrompt) -> Value {
        let mut system = SYSTEM_INSTRUCTION.to_string();
        if !prompt.context.trim().is_empty() {
            system.push_str("\nThe learner is reading this text: ");
            system.push_str(prompt.context.trim());
        }
        json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": system },
                { "role": "user", "content": prompt.user_text },
            ],
            "max_tokens": self.max_tokens,
            "temperature": self.temperature,
        })
    }
}

fn error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|value| {
            value
                .pointer("/error/message")
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_else(|| body.trim().to_string())
}

#[async_trait]
impl Responder for RemoteCompletionResponder {
    fn kind(&self) -> ResponderKind {
        ResponderKind::RemoteCompletion
    }

    async fn respond(&self, prompt: &ChatPrompt) -> ReaderResult<String> {
        let api_key = self.credentials.get().ok_or(ReaderError::MissingCredential)?;

        let response = self
            .client
            .post(&self.api_url)
            .bearer_auth(api_key)
            .json(&self.request_body(prompt))
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            let body = response.text().await.unwrap_or_default();
            if let Err(err) = self.credentials.clear() {
                warn!("Could not erase rejected API key: {err:#}");
            }
            return Err(ReaderError::Authorization(error_message(&body)));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ReaderError::RemoteApi(format!(
                "completion failed with status {status}: {}",
                error_message(&body)
            )));
        }

        let parsed: CompletionResponse = response.json().await?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content.trim().to_string())
            .filter(|content| !content.is_empty())
            .ok_or_else(|| ReaderError::RemoteApi("completion had no content".to_string()))?;
        debug!(chars = content.len(), "Completion received");
        Ok(content)
    }
}

const CANNED_RESPONSES: [(&str, &str); 7] = [
    (
        "what",
        "Good question! Click any word in the text to see its Arabic meaning. \
         Try to guess the meaning from the words around it first.",
    ),
    (
        "how",
        "Read the text slowly, click the words you do not know, then press Read to hear \
         the whole text. Repeat each word after you hear it.",
    ),
    (
        "meaning",
        "To find the meaning of a word, click it once. Click it again to go back to English.",
    ),
    (
        "pronounce",
        "Click a word to hear it spoken. You can also press Read and follow the highlighted \
         words while you listen.",
    ),
    (
        "translate",
        "Every word in the text can be translated. Click it to switch between English and Arabic.",
    ),
    (
        "learn",
        "Learn a few new words every day. Read the text, listen to it, and use the new \
         words in your own sentences.",
    ),
    (
        "help",
        "I can help you with words from the text. Ask me what a word means, how to say it, \
         or how to use it in a sentence.",
    ),
];

const GENERIC_RESPONSE: &str = "That is a great thing to ask. Keep reading the text and \
click any word you do not know. Practice a little every day!";

/// Offline keyword answers. Never fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct CannedResponder;

impl CannedResponder {
    pub fn answer(text: &str) -> &'static str {
        let lowered = text.to_lowercase();
        CANNED_RESPONSES
            .iter()
            .find(|(keyword, _)| lowered.contains(keyword))
            .map(|(_, response)| *response)
            .unwrap_or(GENERIC_RESPONSE)
    }
}

#[async_trait]
impl Responder for CannedResponder {
    fn kind(&self) -> ResponderKind {
        ResponderKind::Canned
    }

    async fn respond(&self, prompt: &ChatPrompt) -> ReaderResult<String> {
        Ok(Self::answer(&prompt.user_text).to_string())
    }
}
