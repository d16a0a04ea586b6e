//! Full-text reading with word highlighting.
//!
//! A session is one utterance of the whole passage. Highlighting is driven by
//! a single task that sleeps through the estimated word start times and moves
//! the highlight one token per wakeup. Every wakeup re-checks the session
//! generation so a superseded or stopped session never touches the tokens.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::SpeechConfig;
use crate::error::ReaderResult;
use crate::ipc::{emit, EventSender, ReaderEvent, StopReason};
use crate::speech::{SpeechEngine, SpeechEvent, SpeechEventKind, SpeechRequest};
use crate::state::{ReadingSession, SharedState};
use crate::timing::{TimingTable, WordTimingPolicy};
use crate::tokens::{clear_highlights, spoken_text};

#[derive(Clone)]
pub struct ReadAloud {
    state: SharedState,
    speech: Arc<dyn SpeechEngine>,
    events: EventSender,
    policy: WordTimingPolicy,
    settings: SpeechConfig,
}

impl ReadAloud {
    pub fn new(
        state: SharedState,
        speech: Arc<dyn SpeechEngine>,
        events: EventSender,
        settings: SpeechConfig,
    ) -> Self {
        Self {
            state,
            speech,
            events,
            policy: WordTimingPolicy::default(),
            settings,
        }
    }

    pub fn with_policy(mut self, policy: WordTimingPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Starts reading the rendered tokens, replacing any session in progress.
    /// Returns `false` when there is nothing to read.
    pub fn start(&self) -> ReaderResult<bool> {
        let (generation, request, total) = {
            let mut guard = self.state.lock()?;
            if guard.tokens.is_empty() {
                return Ok(false);
            }
            if let Some(prior) = guard.reading.take() {
                debug!(generation = prior.generation, "Superseding reading session");
                prior.abort();
                clear_highlights(&mut guard.tokens);
                emit(
                    &self.events,
                    ReaderEvent::ReadingStopped {
                        reason: StopReason::Superseded,
                    },
                );
            }

            guard.generation += 1;
            let generation = guard.generation;
            let rate = guard.reading_rate;
            let words: Vec<&str> = guard.tokens.iter().map(|token| token.source.as_str()).collect();
            let timings = TimingTable::build(&self.policy, &words, rate);
            let request = SpeechRequest::new(spoken_text(&guard.tokens), &self.settings, rate);
            let total = guard.tokens.len();
            guard.reading = Some(ReadingSession {
                generation,
                utterance: request.utterance,
                timings,
                current_index: None,
                advance: None,
            });
            (generation, request, total)
        };

        info!(generation, words = total, "Reading started");
        emit(&self.events, ReaderEvent::ReadingStarted { total });

        if let Err(err) = self.speech.speak(request) {
            warn!("Speech engine refused the passage: {err}");
            self.end_session(generation, StopReason::Error)?;
            return Err(err);
        }
        Ok(true)
    }

    /// Cancels speech and clears every highlight. Safe to call at any time.
    pub fn stop(&self) -> ReaderResult<()> {
        self.speech.cancel();
        let mut guard = self.state.lock()?;
        if let Some(session) = guard.reading.take() {
            info!(generation = session.generation, "Reading stopped");
            session.abort();
        }
        clear_highlights(&mut guard.tokens);
        emit(
            &self.events,
            ReaderEvent::ReadingStopped {
                reason: StopReason::Stopped,
            },
        );
        Ok(())
    }

    /// Routes an engine event to the session it belongs to. Events of other
    /// utterances (single words, superseded sessions) are ignored.
    pub fn handle_speech_event(&self, event: &SpeechEvent) -> ReaderResult<()> {
        let generation = {
            let guard = self.state.lock()?;
            match guard.reading.as_ref() {
                Some(session) if session.utterance == event.utterance => session.generation,
                _ => {
                    debug!(utterance = %event.utterance, kind = ?event.kind, "Speech event outside reading session");
                    return Ok(());
                }
            }
        };

        match &event.kind {
            SpeechEventKind::Started => self.begin_highlighting(generation),
            SpeechEventKind::Finished => self.end_session(generation, StopReason::Finished),
            SpeechEventKind::Cancelled => self.end_session(generation, StopReason::Stopped),
            SpeechEventKind::Failed(message) => {
                warn!(generation, "Speech failed mid-reading: {message}");
                self.end_session(generation, StopReason::Error)
            }
        }
    }

    fn begin_highlighting(&self, generation: u64) -> ReaderResult<()> {
        let mut guard = self.state.lock()?;
        let state = &mut *guard;
        let Some(session) = active_session(&mut state.reading, generation) else {
            return Ok(());
        };
        if session.current_index.is_some() {
            return Ok(());
        }
        session.current_index = Some(0);
        let total = state.tokens.len();
        if let Some(first) = state.tokens.first_mut() {
            first.reading = true;
        }
        emit(
            &self.events,
            ReaderEvent::ReadingProgress {
                index: 0,
                previous: None,
                position: 1,
                total,
            },
        );
        if total > 1 {
            session.advance = Some(tokio::spawn(advance_highlights(
                self.state.clone(),
                self.events.clone(),
                generation,
            )));
        }
        Ok(())
    }

    fn end_session(&self, generation: u64, reason: StopReason) -> ReaderResult<()> {
        let mut guard = self.state.lock()?;
        if active_session(&mut guard.reading, generation).is_none() {
            return Ok(());
        }
        if let Some(session) = guard.reading.take() {
            session.abort();
        }
        clear_highlights(&mut guard.tokens);
        info!(generation, reason = ?reason, "Reading ended");
        emit(&self.events, ReaderEvent::ReadingStopped { reason });
        Ok(())
    }
}

fn active_session(reading: &mut Option<ReadingSession>, generation: u64) -> Option<&mut ReadingSession> {
    reading
        .as_mut()
        .filter(|session| session.generation == generation)
}

/// Moves the highlight forward until the last token, one sleep per word.
async fn advance_highlights(state: SharedState, events: EventSender, generation: u64) {
    loop {
        let delay = {
            let Ok(mut guard) = state.lock() else {
                return;
            };
            let Some(session) = active_session(&mut guard.reading, generation) else {
                return;
            };
            let Some(delay) = session.current_index.and_then(|i| session.timings.delay_after(i)) else {
                return;
            };
            delay
        };

        tokio::time::sleep(delay).await;

        let Ok(mut guard) = state.lock() else {
            return;
        };
        let state_ref = &mut *guard;
        let total = state_ref.tokens.len();
        let Some(session) = active_session(&mut state_ref.reading, generation) else {
            return;
        };
        let Some(previous) = session.current_index else {
            return;
        };
        let next = previous + 1;
        if next >= total {
            return;
        }
        session.current_index = Some(next);
        state_ref.tokens[previous].reading = false;
        state_ref.tokens[next].reading = true;
        emit(
            &events,
            ReaderEvent::ReadingProgress {
                index: next,
                previous: Some(previous),
                position: next + 1,
                total,
            },
        );
        if next + 1 >= total {
            return;
        }
    }
}
