//! Error types for the reader.

use thiserror::Error;

pub type ReaderResult<T> = Result<T, ReaderError>;

/// Failures surfaced by the reader components.
///
/// None of these are fatal: the command loop turns each one into an `error`
/// or `chat_notice` event and leaves the controls usable.
#[derive(Debug, Error)]
pub enum ReaderError {
    /// Vocabulary source unreachable or malformed.
    #[error("vocabulary data error: {0}")]
    DataLoad(String),

    #[error("topic not found: {0}")]
    TopicNotFound(String),

    /// The speech engine refused or aborted an utterance.
    #[error("speech engine error: {0}")]
    SpeechEngine(String),

    /// Network failure or non-2xx answer from a remote collaborator.
    #[error("remote api error: {0}")]
    RemoteApi(String),

    /// 401-class response; the stored credential is no longer valid.
    #[error("authorization failed: {0}")]
    Authorization(String),

    #[error("no api credential configured")]
    MissingCredential,

    #[error("state error: {0}")]
    State(String),

    #[error("config error: {0}")]
    Config(String),
}

impl From<reqwest::Error> for ReaderError {
    fn from(err: reqwest::Error) -> Self {
        if err.status() == Some(reqwest::StatusCode::UNAUTHORIZED) {
            ReaderError::Authorization(err.to_string())
        } else {
            ReaderError::RemoteApi(err.to_string())
        }
    }
}
