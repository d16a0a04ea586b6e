use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{ReaderError, ReaderResult};

pub const DEFAULT_CONFIG_FILE: &str = "vocab-reader.toml";
const CREDENTIAL_FILE_NAME: &str = "credential.json";

pub const DEFAULT_READING_RATE: f32 = 0.85;
pub const DEFAULT_WORD_RATE: f32 = 0.9;

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub data: DataConfig,
    pub speech: SpeechConfig,
    pub chat: ChatConfig,
    pub translation: TranslationConfig,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct DataConfig {
    /// Path to the topic catalog, or an http(s) URL serving it.
    pub source: String,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            source: "data.json".to_string(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SpeechEngineKind {
    Command,
    Remote,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct SpeechConfig {
    pub engine: SpeechEngineKind,
    pub command: String,
    pub lang: String,
    pub reading_rate: f32,
    pub word_rate: f32,
    pub pitch: f32,
    pub volume: f32,
    pub remote_url: String,
    pub remote_token: String,
    pub remote_voice_id: String,
}

impl Default for SpeechConfig {
    fn default() -> Self {
        Self {
            engine: SpeechEngineKind::Command,
            command: "espeak-ng".to_string(),
            lang: "en-US".to_string(),
            reading_rate: DEFAULT_READING_RATE,
            word_rate: DEFAULT_WORD_RATE,
            pitch: 1.0,
            volume: 1.0,
            remote_url: "http://127.0.0.1:8765".to_string(),
            remote_token: String::new(),
            remote_voice_id: "0".to_string(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ChatConfig {
    pub api_url: String,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    /// Where the API key is kept; defaults to the user config directory.
    pub credential_file: Option<PathBuf>,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.openai.com/v1/chat/completions".to_string(),
            model: "gpt-3.5-turbo".to_string(),
            max_tokens: 300,
            temperature: 0.7,
            credential_file: None,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct TranslationConfig {
    pub service_url: String,
    pub lang_pair: String,
}

impl Default for TranslationConfig {
    fn default() -> Self {
        Self {
            service_url: "https://api.mymemory.translated.net/get".to_string(),
            lang_pair: "en|ar".to_string(),
        }
    }
}

impl Config {
    pub fn validate(&self) -> ReaderResult<()> {
        validate_rate(self.speech.reading_rate)?;
        validate_rate(self.speech.word_rate)?;
        if !(0.5..=2.0).contains(&self.speech.pitch) {
            return Err(ReaderError::Config("pitch must be in [0.5, 2.0]".to_string()));
        }
        if !(0.0..=2.0).contains(&self.speech.volume) {
            return Err(ReaderError::Config("volume must be in [0.0, 2.0]".to_string()));
        }
        if self.data.source.trim().is_empty() {
            return Err(ReaderError::Config("data.source cannot be empty".to_string()));
        }
        Ok(())
    }

    pub fn credential_path(&self) -> PathBuf {
        if let Some(path) = &self.chat.credential_file {
            return path.clone();
        }
        dirs::config_dir()
            .map(|dir| dir.join("vocab-reader").join(CREDENTIAL_FILE_NAME))
            .unwrap_or_else(|| PathBuf::from(CREDENTIAL_FILE_NAME))
    }
}

pub fn validate_rate(rate: f32) -> ReaderResult<()> {
    if !(0.25..=4.0).contains(&rate) {
        return Err(ReaderError::Config("rate must be in [0.25, 4.0]".to_string()));
    }
    Ok(())
}

/// Reads and validates a TOML config. A missing file yields the defaults.
pub fn load_config_from_file(file_path: &Path) -> ReaderResult<Config> {
    let config = match fs::read_to_string(file_path) {
        Ok(contents) => toml::from_str::<Config>(&contents).map_err(|e| {
            ReaderError::Config(format!("Failed to parse {}: {}", file_path.display(), e))
        })?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Config::default(),
        Err(e) => {
            return Err(ReaderError::Config(format!(
                "Failed to read {}: {}",
                file_path.display(),
                e
            )))
        }
    };
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let config: Config = toml::from_str(
            r#"
            [speech]
            reading_rate = 1.2

            [chat]
            model = "gpt-4o-mini"
            "#,
        )
        .unwrap();
        assert_eq!(config.speech.reading_rate, 1.2);
        assert_eq!(config.speech.word_rate, DEFAULT_WORD_RATE);
        assert_eq!(config.speech.engine, SpeechEngineKind::Command);
        assert_eq!(config.chat.model, "gpt-4o-mini");
        assert_eq!(config.data.source, "data.json");
        assert_eq!(config.translation.lang_pair, "en|ar");
    }

    #[test]
    fn engine_kind_parses_snake_case() {
        let config: Config = toml::from_str("[speech]\nengine = \"remote\"\n").unwrap();
        assert_eq!(config.speech.engine, SpeechEngineKind::Remote);
    }

    #[test]
    fn out_of_range_rate_is_rejected() {
        let mut config = Config::default();
        config.speech.reading_rate = 5.0;
        assert!(matches!(config.validate(), Err(ReaderError::Config(_))));
        assert!(validate_rate(0.25).is_ok());
        assert!(validate_rate(0.1).is_err());
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        let config = load_config_from_file(&path).unwrap();
        assert_eq!(config.speech.reading_rate, DEFAULT_READING_RATE);
    }

    #[test]
    fn explicit_credential_file_wins() {
        let mut config = Config::default();
        config.chat.credential_file = Some(PathBuf::from("/tmp/key.json"));
        assert_eq!(config.credential_path(), PathBuf::from("/tmp/key.json"));
    }

    #[test]
    fn default_credential_lives_in_platform_config_dir() {
        let path = Config::default().credential_path();
        assert!(path.ends_with(Path::new("vocab-reader").join(CREDENTIAL_FILE_NAME)));
        if let Some(dir) = dirs::config_dir() {
            assert!(path.starts_with(dir));
        }
    }

    #[test]
    fn shipped_config_matches_defaults() {
        let config: Config = toml::from_str(include_str!("../vocab-reader.toml")).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.speech.reading_rate, DEFAULT_READING_RATE);
        assert_eq!(config.chat.max_tokens, ChatConfig::default().max_tokens);
    }
}
