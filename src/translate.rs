//! Remote single-word translation, used for chat replies when the topic
//! vocabulary has no entry.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

use crate::config::TranslationConfig;
use crate::error::{ReaderError, ReaderResult};

#[async_trait]
pub trait WordTranslator: Send + Sync {
    async fn translate(&self, word: &str) -> ReaderResult<String>;
}

#[derive(Deserialize)]
struct MyMemoryResponse {
    #[serde(rename = "responseData")]
    response_data: MyMemoryData,
    #[serde(rename = "responseStatus", default)]
    response_status: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct MyMemoryData {
    #[serde(rename = "translatedText")]
    translated_text: String,
}

/// Client for a MyMemory-style `GET ?q=..&langpair=..` endpoint.
pub struct HttpWordTranslator {
    client: Client,
    service_url: String,
    lang_pair: String,
}

impl HttpWordTranslator {
    pub fn new(config: &TranslationConfig) -> Self {
        Self {
            client: Client::new(),
            service_url: config.service_url.clone(),
            lang_pair: config.lang_pair.clone(),
        }
    }
}

fn status_is_ok(status: &Option<serde_json::Value>) -> bool {
    match status {
        None => true,
        Some(value) => value.as_u64() == Some(200) || value.as_str() == Some("200"),
    }
}

#[async_trait]
impl WordTranslator for HttpWordTranslator {
    async fn translate(&self, word: &str) -> ReaderResult<String> {
        let response = self
            .client
            .get(&self.service_url)
            .query(&[("q", word), ("langpair", self.lang_pair.as_str())])
            .send()
            .await?
            .error_for_status()?;
        let parsed: MyMemoryResponse = response.json().await?;
        if !status_is_ok(&parsed.response_status) {
            return Err(ReaderError::RemoteApi(format!(
                "translation service rejected {word:?}"
            )));
        }
        let translated = parsed.response_data.translated_text.trim().to_string();
        if translated.is_empty() {
            return Err(ReaderError::RemoteApi(format!("empty translation for {word:?}")));
        }
        debug!(word, %translated, "Remote translation");
        Ok(translated)
    }
}
