use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{ReaderError, ReaderResult};
use crate::tokens::strip_punctuation;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VocabularyEntry {
    pub en: String,
    pub ar: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topic {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub words: Vec<VocabularyEntry>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicCatalog {
    pub topics: Vec<Topic>,
}

/// Row for the topic selector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TopicSummary {
    pub id: String,
    pub name: String,
}

/// Lowercased, punctuation-free English word to Arabic translation. Later
/// entries overwrite earlier ones with the same key.
#[derive(Debug, Clone, Default)]
pub struct TranslationMap {
    entries: HashMap<String, String>,
}

impl TranslationMap {
    pub fn from_entries(words: &[VocabularyEntry]) -> Self {
        let mut entries = HashMap::with_capacity(words.len());
        for item in words {
            entries.insert(strip_punctuation(&item.en).to_lowercase(), item.ar.clone());
        }
        Self { entries }
    }

    pub fn lookup(&self, word: &str) -> Option<&str> {
        self.entries.get(&word.to_lowercase()).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Where the topic catalog comes from.
#[derive(Debug, Clone)]
pub enum TopicSource {
    File(PathBuf),
    Http(String),
    Static(TopicCatalog),
}

impl TopicSource {
    /// `http://` and `https://` locations are fetched, anything else is a path.
    pub fn from_location(location: &str) -> Self {
        let trimmed = location.trim();
        if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
            TopicSource::Http(trimmed.to_string())
        } else {
            TopicSource::File(PathBuf::from(trimmed))
        }
    }

    pub async fn fetch(&self) -> ReaderResult<TopicCatalog> {
        match self {
            TopicSource::File(path) => {
                let body = tokio::fs::read_to_string(path).await.map_err(|err| {
                    ReaderError::DataLoad(format!("Failed to read {}: {err}", path.display()))
                })?;
                serde_json::from_str(&body).map_err(|err| {
                    ReaderError::DataLoad(format!("Malformed catalog {}: {err}", path.display()))
                })
            }
            TopicSource::Http(url) => {
                let response = reqwest::get(url)
                    .await
                    .map_err(|err| ReaderError::DataLoad(format!("Request failed for {url}: {err}")))?;
                let status = response.status();
                if !status.is_success() {
                    return Err(ReaderError::DataLoad(format!(
                        "Request to {url} failed with status {status}"
                    )));
                }
                response
                    .json::<TopicCatalog>()
                    .await
                    .map_err(|err| ReaderError::DataLoad(format!("Malformed catalog from {url}: {err}")))
            }
            TopicSource::Static(catalog) => Ok(catalog.clone()),
        }
    }
}

/// Holds the selected topic and its translation lookup.
pub struct VocabularyStore {
    source: TopicSource,
    topic: Option<Topic>,
    translations: TranslationMap,
}

impl VocabularyStore {
    pub fn new(source: TopicSource) -> Self {
        Self {
            source,
            topic: None,
            translations: TranslationMap::default(),
        }
    }

    pub fn source(&self) -> &TopicSource {
        &self.source
    }

    pub async fn fetch_catalog(&self) -> ReaderResult<Vec<TopicSummary>> {
        let catalog = self.source.fetch().await?;
        Ok(catalog
            .topics
            .into_iter()
            .map(|topic| TopicSummary {
                id: topic.id,
                name: topic.name,
            })
            .collect())
    }

    /// Fetches a topic by id without touching the current selection.
    pub async fn fetch_topic(source: &TopicSource, topic_id: &str) -> ReaderResult<Topic> {
        let catalog = source.fetch().await?;
        catalog
            .topics
            .into_iter()
            .find(|topic| topic.id == topic_id)
            .ok_or_else(|| ReaderError::TopicNotFound(topic_id.to_string()))
    }

    /// Replaces the current topic and rebuilds the lookup.
    pub fn install(&mut self, topic: Topic) -> &Topic {
        self.translations = TranslationMap::from_entries(&topic.words);
        info!(
            topic = %topic.name,
            words = topic.words.len(),
            entries = self.translations.len(),
            "Topic loaded"
        );
        self.topic.insert(topic)
    }

    pub fn topic(&self) -> Option<&Topic> {
        self.topic.as_ref()
    }

    pub fn translations(&self) -> &TranslationMap {
        &self.translations
    }

    pub fn entry_count(&self) -> usize {
        self.topic.as_ref().map_or(0, |topic| topic.words.len())
    }
}
