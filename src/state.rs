use std::sync::{Arc, Mutex, MutexGuard};

use tokio::task::JoinHandle;

use crate::error::{ReaderError, ReaderResult};
use crate::speech::UtteranceId;
use crate::timing::TimingTable;
use crate::tokens::Token;
use crate::vocabulary::{TopicSource, VocabularyStore};

/// One full-text read-aloud pass.
pub struct ReadingSession {
    pub generation: u64,
    pub utterance: UtteranceId,
    pub timings: TimingTable,
    /// Highlighted token, `None` until the engine reports the start.
    pub current_index: Option<usize>,
    pub(crate) advance: Option<JoinHandle<()>>,
}

impl ReadingSession {
    pub(crate) fn abort(mut self) {
        if let Some(task) = self.advance.take() {
            task.abort();
        }
    }
}

/// Everything the reader knows at runtime.
pub struct ReaderState {
    pub store: VocabularyStore,
    pub tokens: Vec<Token>,
    pub reading: Option<ReadingSession>,
    /// Increases with every reading session; stale timer callbacks compare
    /// against it.
    pub generation: u64,
    pub reading_rate: f32,
    pub word_rate: f32,
}

impl ReaderState {
    pub fn new(source: TopicSource, reading_rate: f32, word_rate: f32) -> Self {
        Self {
            store: VocabularyStore::new(source),
            tokens: Vec::new(),
            reading: None,
            generation: 0,
            reading_rate,
            word_rate,
        }
    }

    pub fn is_reading(&self) -> bool {
        self.reading.is_some()
    }

    pub fn highlighted(&self) -> Vec<usize> {
        self.tokens
            .iter()
            .filter(|token| token.reading)
            .map(|token| token.index)
            .collect()
    }
}

#[derive(Clone)]
pub struct SharedState {
    inner: Arc<Mutex<ReaderState>>,
}

impl SharedState {
    pub fn new(state: ReaderState) -> Self {
        Self {
            inner: Arc::new(Mutex::new(state)),
        }
    }

    pub fn lock(&self) -> ReaderResult<MutexGuard<'_, ReaderState>> {
        self.inner
            .lock()
            .map_err(|_| ReaderError::State("State lock poisoned".to_string()))
    }
}
