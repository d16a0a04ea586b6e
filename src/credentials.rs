use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

#[derive(Default, Serialize, Deserialize)]
struct CredentialFile {
    api_key: Option<String>,
}

enum Cached {
    NotLoaded,
    Loaded(Option<String>),
}

/// The single API key of the completion service.
///
/// Read from disk on first use, then served from memory for the rest of the
/// process. Without a path it never touches the filesystem.
pub struct CredentialStore {
    path: Option<PathBuf>,
    cached: Mutex<Cached>,
}

impl CredentialStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path: Some(path),
            cached: Mutex::new(Cached::NotLoaded),
        }
    }

    pub fn in_memory(initial: Option<String>) -> Self {
        Self {
            path: None,
            cached: Mutex::new(Cached::Loaded(normalize_key(initial))),
        }
    }

    pub fn get(&self) -> Option<String> {
        let mut guard = self.cached.lock().ok()?;
        if matches!(*guard, Cached::NotLoaded) {
            *guard = Cached::Loaded(self.read_from_disk());
        }
        match &*guard {
            Cached::Loaded(key) => key.clone(),
            Cached::NotLoaded => None,
        }
    }

    pub fn set(&self, key: &str) -> Result<()> {
        let normalized =
            normalize_key(Some(key.to_string())).ok_or_else(|| anyhow!("API key cannot be empty"))?;
        self.write_to_disk(Some(normalized.clone()))?;
        let mut guard = self.cached.lock().map_err(|_| anyhow!("Credential lock poisoned"))?;
        *guard = Cached::Loaded(Some(normalized));
        info!("API key stored");
        Ok(())
    }

    /// Forgets the key so the next request asks for a new one.
    pub fn clear(&self) -> Result<()> {
        {
            let mut guard = self.cached.lock().map_err(|_| anyhow!("Credential lock poisoned"))?;
            *guard = Cached::Loaded(None);
        }
        self.write_to_disk(None)?;
        info!("API key cleared");
        Ok(())
    }

    fn read_from_disk(&self) -> Option<String> {
        let path = self.path.as_ref()?;
        let body = std::fs::read_to_string(path).ok()?;
        match serde_json::from_str::<CredentialFile>(&body) {
            Ok(parsed) => normalize_key(parsed.api_key),
            Err(err) => {
                warn!(path = %path.display(), "Ignoring unreadable credential file: {err}");
                None
            }
        }
    }

    fn write_to_disk(&self, api_key: Option<String>) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if api_key.is_none() && !path.exists() {
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create credential directory {}", parent.display())
            })?;
        }
        let serialized = serde_json::to_string_pretty(&CredentialFile { api_key })?;
        std::fs::write(path, serialized)
            .with_context(|| format!("Failed to write credential file {}", path.display()))?;
        Ok(())
    }
}

fn normalize_key(value: Option<String>) -> Option<String> {
    value.and_then(|raw| {
        let normalized = raw.trim().to_string();
        if normalized.is_empty() {
            None
        } else {
            Some(normalized)
        }
    })
}
