use std::process::Stdio;
use std::sync::{Arc, Mutex};

use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use super::{SpeechEngine, SpeechEvent, SpeechEventKind, SpeechEventSender, SpeechRequest, UtteranceId};
use crate::error::{ReaderError, ReaderResult};

const BASE_WORDS_PER_MINUTE: f32 = 175.0;
const BASE_PITCH: f32 = 50.0;
const BASE_AMPLITUDE: f32 = 100.0;

struct ActiveUtterance {
    utterance: UtteranceId,
    cancel: oneshot::Sender<()>,
}

/// On-device synthesis through an `espeak-ng` compatible program.
pub struct CommandSpeechEngine {
    program: String,
    events: SpeechEventSender,
    active: Arc<Mutex<Option<ActiveUtterance>>>,
}

impl CommandSpeechEngine {
    pub fn new(program: &str, events: SpeechEventSender) -> Self {
        Self {
            program: program.to_string(),
            events,
            active: Arc::new(Mutex::new(None)),
        }
    }
}

/// Maps rate, pitch and volume multipliers onto espeak's absolute scales.
pub(crate) fn command_args(request: &SpeechRequest) -> Vec<String> {
    let wpm = (BASE_WORDS_PER_MINUTE * request.rate).round().clamp(80.0, 450.0);
    let pitch = (BASE_PITCH * request.pitch).round().clamp(0.0, 99.0);
    let amplitude = (BASE_AMPLITUDE * request.volume).round().clamp(0.0, 200.0);
    vec![
        "-v".to_string(),
        request.lang.to_lowercase(),
        "-s".to_string(),
        format!("{wpm}"),
        "-p".to_string(),
        format!("{pitch}"),
        "-a".to_string(),
        format!("{amplitude}"),
        // Text after "--" is never parsed as an option.
        "--".to_string(),
        request.text.trim().to_string(),
    ]
}

impl SpeechEngine for CommandSpeechEngine {
    fn speak(&self, request: SpeechRequest) -> ReaderResult<()> {
        if request.text.trim().is_empty() {
            return Err(ReaderError::SpeechEngine("Speak text cannot be empty".to_string()));
        }
        self.cancel();

        let mut command = Command::new(&self.program);
        command
            .args(command_args(&request))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        let child = command.spawn().map_err(|err| {
            ReaderError::SpeechEngine(format!("Failed to launch {}: {err}", self.program))
        })?;

        let (cancel_tx, cancel_rx) = oneshot::channel();
        {
            let mut guard = self
                .active
                .lock()
                .map_err(|_| ReaderError::SpeechEngine("Speech state lock poisoned".to_string()))?;
            *guard = Some(ActiveUtterance {
                utterance: request.utterance,
                cancel: cancel_tx,
            });
        }

        debug!(utterance = %request.utterance, chars = request.text.len(), "Speech process started");
        let _ = self
            .events
            .send(SpeechEvent::new(request.utterance, SpeechEventKind::Started));

        tokio::spawn(wait_for_exit(
            child,
            cancel_rx,
            request.utterance,
            self.program.clone(),
            self.events.clone(),
            self.active.clone(),
        ));
        Ok(())
    }

    fn cancel(&self) {
        let previous = match self.active.lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };
        if let Some(active) = previous {
            debug!(utterance = %active.utterance, "Cancelling speech process");
            let _ = active.cancel.send(());
        }
    }
}

async fn wait_for_exit(
    mut child: Child,
    cancel_rx: oneshot::Receiver<()>,
    utterance: UtteranceId,
    program: String,
    events: SpeechEventSender,
    active: Arc<Mutex<Option<ActiveUtterance>>>,
) {
    let kind = tokio::select! {
        status = child.wait() => match status {
            Ok(status) if status.success() => SpeechEventKind::Finished,
            Ok(status) => SpeechEventKind::Failed(format!("{program} exited with {status}")),
            Err(err) => SpeechEventKind::Failed(format!("Failed to wait for {program}: {err}")),
        },
        _ = cancel_rx => {
            if let Err(err) = child.kill().await {
                warn!(%utterance, "Failed to kill speech process: {err}");
            }
            SpeechEventKind::Cancelled
        }
    };

    if let Ok(mut guard) = active.lock() {
        if guard.as_ref().map(|a| a.utterance) == Some(utterance) {
            *guard = None;
        }
    }
    let _ = events.send(SpeechEvent::new(utterance, kind));
}
