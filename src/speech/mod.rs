//! Speech synthesis collaborators.
//!
//! An engine plays at most one utterance at a time and reports progress as
//! [`SpeechEvent`]s on the channel it was built with. Starting a new utterance
//! supersedes whatever was playing.

mod command;
mod remote;

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;

use crate::config::{SpeechConfig, SpeechEngineKind};
use crate::error::ReaderResult;

pub use command::CommandSpeechEngine;
pub use remote::RemoteSpeechEngine;

pub type UtteranceId = Uuid;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpeechRequest {
    pub utterance: UtteranceId,
    pub text: String,
    pub lang: String,
    pub rate: f32,
    pub pitch: f32,
    pub volume: f32,
}

impl SpeechRequest {
    pub fn new(text: impl Into<String>, settings: &SpeechConfig, rate: f32) -> Self {
        Self {
            utterance: Uuid::new_v4(),
            text: text.into(),
            lang: settings.lang.clone(),
            rate,
            pitch: settings.pitch,
            volume: settings.volume,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpeechEventKind {
    Started,
    Finished,
    Cancelled,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpeechEvent {
    pub utterance: UtteranceId,
    pub kind: SpeechEventKind,
}

impl SpeechEvent {
    pub fn new(utterance: UtteranceId, kind: SpeechEventKind) -> Self {
        Self { utterance, kind }
    }
}

pub type SpeechEventSender = UnboundedSender<SpeechEvent>;

pub trait SpeechEngine: Send + Sync {
    /// Queues `request` for playback, cancelling any utterance in flight.
    /// Returns once the request is accepted; playback is reported through
    /// events.
    fn speak(&self, request: SpeechRequest) -> ReaderResult<()>;

    /// Stops whatever is playing. Safe to call when idle.
    fn cancel(&self);
}

pub fn build_engine(settings: &SpeechConfig, events: SpeechEventSender) -> Arc<dyn SpeechEngine> {
    match settings.engine {
        SpeechEngineKind::Command => Arc::new(CommandSpeechEngine::new(&settings.command, events)),
        SpeechEngineKind::Remote => Arc::new(RemoteSpeechEngine::new(
            &settings.remote_url,
            &settings.remote_token,
            &settings.remote_voice_id,
            events,
        )),
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;

    use super::*;

    /// Records requests; tests drive the events by hand.
    #[derive(Default)]
    pub(crate) struct ScriptedSpeechEngine {
        pub(crate) requests: Mutex<Vec<SpeechRequest>>,
        pub(crate) cancels: Mutex<usize>,
    }

    impl ScriptedSpeechEngine {
        pub(crate) fn spoken(&self) -> Vec<SpeechRequest> {
            self.requests.lock().unwrap().clone()
        }

        pub(crate) fn last(&self) -> SpeechRequest {
            self.spoken().last().cloned().expect("no speech requested")
        }

        pub(crate) fn cancel_count(&self) -> usize {
            *self.cancels.lock().unwrap()
        }
    }

    impl SpeechEngine for ScriptedSpeechEngine {
        fn speak(&self, request: SpeechRequest) -> ReaderResult<()> {
            self.requests.lock().unwrap().push(request);
            Ok(())
        }

        fn cancel(&self) {
            *self.cancels.lock().unwrap() += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_takes_settings_and_rate() {
        let settings = SpeechConfig::default();
        let request = SpeechRequest::new("hello", &settings, 0.9);
        assert_eq!(request.lang, "en-US");
        assert_eq!(request.rate, 0.9);
        assert_eq!(request.pitch, 1.0);
        assert_eq!(request.volume, 1.0);
        assert_ne!(request.utterance, SpeechRequest::new("hello", &settings, 0.9).utterance);
    }
}
