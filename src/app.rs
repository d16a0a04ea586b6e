//! Command dispatcher: maps client commands onto the reader components.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tracing::{debug, info, warn};

use crate::chat::{ChatAssistant, Responder, RemoteCompletionResponder};
use crate::config::{validate_rate, Config, SpeechConfig};
use crate::credentials::CredentialStore;
use crate::error::ReaderError;
use crate::ipc::{self, emit, emit_error, EventSender, ReaderCommand, ReaderEvent};
use crate::read_aloud::ReadAloud;
use crate::speech::{build_engine, SpeechEngine, SpeechEvent, SpeechRequest};
use crate::state::{ReaderState, SharedState};
use crate::tokens::{clear_translations, render, reset_all, spoken_text};
use crate::translate::{HttpWordTranslator, WordTranslator};
use crate::vocabulary::{TopicSource, VocabularyStore};

const WRITER_FLUSH_GRACE: Duration = Duration::from_millis(250);

fn to_cmd_error(err: impl std::fmt::Display) -> String {
    format!("{err:#}")
}

#[derive(Clone)]
pub struct ReaderApp {
    state: SharedState,
    read_aloud: ReadAloud,
    chat: Arc<ChatAssistant>,
    credentials: Arc<CredentialStore>,
    speech: Arc<dyn SpeechEngine>,
    settings: SpeechConfig,
    events: EventSender,
}

impl ReaderApp {
    pub fn new(
        state: SharedState,
        speech: Arc<dyn SpeechEngine>,
        chat: Arc<ChatAssistant>,
        credentials: Arc<CredentialStore>,
        settings: SpeechConfig,
        events: EventSender,
    ) -> Self {
        let read_aloud = ReadAloud::new(state.clone(), speech.clone(), events.clone(), settings.clone());
        Self {
            state,
            read_aloud,
            chat,
            credentials,
            speech,
            settings,
            events,
        }
    }

    /// Wires the collaborators named by `config`.
    pub fn from_config(
        config: &Config,
        source: TopicSource,
        speech: Arc<dyn SpeechEngine>,
        events: EventSender,
    ) -> Self {
        let credentials = Arc::new(CredentialStore::new(config.credential_path()));
        let remote: Arc<dyn Responder> =
            Arc::new(RemoteCompletionResponder::new(&config.chat, credentials.clone()));
        let translator: Arc<dyn WordTranslator> = Arc::new(HttpWordTranslator::new(&config.translation));
        let chat = Arc::new(ChatAssistant::new(vec![remote], translator));
        let state = SharedState::new(ReaderState::new(
            source,
            config.speech.reading_rate,
            config.speech.word_rate,
        ));
        Self::new(state, speech, chat, credentials, config.speech.clone(), events)
    }

    pub fn state(&self) -> &SharedState {
        &self.state
    }

    /// Returns `false` once the client asked to shut down.
    pub async fn handle_command(&self, command: ReaderCommand) -> bool {
        debug!(command = ?command, "Command received");
        let result = match command {
            ReaderCommand::Ping => {
                emit(&self.events, ReaderEvent::Pong);
                Ok(())
            }
            ReaderCommand::ListTopics => self.list_topics().await,
            ReaderCommand::SelectTopic { topic_id } => self.select_topic(&topic_id).await,
            ReaderCommand::ToggleWord { index } => self.toggle_word(index),
            ReaderCommand::ToggleChatWord { message_id, index } => self.toggle_chat_word(message_id, index),
            ReaderCommand::ReadAloud => self.read_aloud(),
            ReaderCommand::StopReading => self.stop_reading(),
            ReaderCommand::ResetAll => self.reset_all(),
            ReaderCommand::ClearTranslations => self.clear_translations(),
            ReaderCommand::SetSpeechRate { rate } => self.set_speech_rate(rate),
            ReaderCommand::SendChat { text } => {
                let app = self.clone();
                tokio::spawn(async move {
                    if let Err(err) = app.send_chat(&text).await {
                        warn!("Chat failed: {err:#}");
                        emit_error(&app.events, &to_cmd_error(err));
                    }
                });
                Ok(())
            }
            ReaderCommand::SetApiKey { api_key } => self.set_api_key(&api_key),
            ReaderCommand::Shutdown => {
                info!("Shutdown requested");
                if let Err(err) = self.stop_reading() {
                    warn!("Stop on shutdown failed: {err:#}");
                }
                return false;
            }
        };
        if let Err(err) = result {
            warn!("Command failed: {err:#}");
            emit_error(&self.events, &to_cmd_error(err));
        }
        true
    }

    pub fn handle_speech_event(&self, event: &SpeechEvent) {
        if let Err(err) = self.read_aloud.handle_speech_event(event) {
            warn!("Speech event handling failed: {err:#}");
            emit_error(&self.events, &to_cmd_error(err));
        }
    }

    pub async fn list_topics(&self) -> Result<()> {
        let source = self.state.lock()?.store.source().clone();
        let topics = VocabularyStore::new(source)
            .fetch_catalog()
            .await
            .context("Failed to list topics")?;
        emit(&self.events, ReaderEvent::Topics { topics });
        Ok(())
    }

    /// Loads and renders a topic. On failure the previous topic stays on screen.
    pub async fn select_topic(&self, topic_id: &str) -> Result<()> {
        let source = self.state.lock()?.store.source().clone();
        let topic = VocabularyStore::fetch_topic(&source, topic_id)
            .await
            .with_context(|| format!("Failed to load topic {topic_id}"))?;

        self.read_aloud.stop()?;
        let event = {
            let mut guard = self.state.lock()?;
            let state = &mut *guard;
            let topic_id = topic.id.clone();
            let topic_name = topic.name.clone();
            state.store.install(topic);
            state.tokens = state
                .store
                .topic()
                .map(|topic| render(topic, state.store.translations()))
                .unwrap_or_default();
            ReaderEvent::Rendered {
                topic_id,
                topic_name,
                entry_count: state.store.entry_count(),
                tokens: state.tokens.clone(),
            }
        };
        emit(&self.events, event);
        Ok(())
    }

    pub fn toggle_word(&self, index: usize) -> Result<()> {
        let (token, outcome, rate) = {
            let mut guard = self.state.lock()?;
            let suppress = guard.is_reading();
            let rate = guard.word_rate;
            let token = guard
                .tokens
                .get_mut(index)
                .ok_or_else(|| ReaderError::State(format!("No token at index {index}")))?;
            let outcome = token.toggle(suppress);
            (token.clone(), outcome, rate)
        };
        debug!(index, display = ?outcome.display, "Token toggled");
        emit(&self.events, ReaderEvent::TokenUpdated { token });
        if let Some(word) = outcome.speak {
            self.speak_word(word, rate)?;
        }
        Ok(())
    }

    pub fn toggle_chat_word(&self, message_id: usize, index: usize) -> Result<()> {
        let (suppress, rate) = {
            let guard = self.state.lock()?;
            (guard.is_reading(), guard.word_rate)
        };
        let (token, outcome) = self
            .chat
            .toggle_word(message_id, index, suppress)
            .ok_or_else(|| ReaderError::State(format!("No reply word {index} in message {message_id}")))?;
        emit(&self.events, ReaderEvent::ChatTokenUpdated { message_id, token });
        if let Some(word) = outcome.speak {
            self.speak_word(word, rate)?;
        }
        Ok(())
    }

    fn speak_word(&self, word: String, rate: f32) -> Result<()> {
        let request = SpeechRequest::new(word, &self.settings, rate);
        self.speech.speak(request).context("Failed to speak word")?;
        Ok(())
    }

    pub fn read_aloud(&self) -> Result<()> {
        if !self.read_aloud.start()? {
            debug!("Nothing to read");
        }
        Ok(())
    }

    pub fn stop_reading(&self) -> Result<()> {
        self.read_aloud.stop()?;
        Ok(())
    }

    pub fn reset_all(&self) -> Result<()> {
        self.read_aloud.stop()?;
        let tokens = {
            let mut guard = self.state.lock()?;
            reset_all(&mut guard.tokens);
            guard.tokens.clone()
        };
        for token in tokens {
            emit(&self.events, ReaderEvent::TokenUpdated { token });
        }
        Ok(())
    }

    pub fn clear_translations(&self) -> Result<()> {
        let changed = {
            let mut guard = self.state.lock()?;
            let indices = clear_translations(&mut guard.tokens);
            indices
                .into_iter()
                .filter_map(|index| guard.tokens.get(index).cloned())
                .collect::<Vec<_>>()
        };
        for token in changed {
            emit(&self.events, ReaderEvent::TokenUpdated { token });
        }
        Ok(())
    }

    /// Applies to the next reading session; a session in progress keeps its
    /// timing.
    pub fn set_speech_rate(&self, rate: f32) -> Result<()> {
        validate_rate(rate)?;
        self.state.lock()?.reading_rate = rate;
        info!(rate, "Reading rate changed");
        emit(&self.events, ReaderEvent::SpeechRateChanged { rate });
        Ok(())
    }

    /// Shows the question right away, then the reply once the responder chain
    /// answers. Blank input, or input while a reply is pending, emits nothing.
    pub async fn send_chat(&self, text: &str) -> Result<()> {
        let (context, translations) = {
            let guard = self.state.lock()?;
            (spoken_text(&guard.tokens), guard.store.translations().clone())
        };
        let Some(pending) = self.chat.post_question(text) else {
            debug!("Chat input ignored");
            return Ok(());
        };

        emit(&self.events, ReaderEvent::ChatBusy { busy: true });
        emit(
            &self.events,
            ReaderEvent::ChatMessage {
                message: pending.question.clone(),
                answered_by: None,
            },
        );

        let exchange = pending.answer(&context, &translations).await;
        if let Some(notice) = exchange.notice {
            emit(&self.events, ReaderEvent::ChatNotice { message: notice });
        }
        emit(
            &self.events,
            ReaderEvent::ChatMessage {
                message: exchange.reply,
                answered_by: Some(exchange.answered_by),
            },
        );
        if exchange.credential_required {
            emit(&self.events, ReaderEvent::CredentialRequired);
        }
        // Release only after `busy: false` is out, so a later send's
        // `busy: true` cannot be overtaken.
        emit(&self.events, ReaderEvent::ChatBusy { busy: false });
        drop(pending);
        Ok(())
    }

    pub fn set_api_key(&self, api_key: &str) -> Result<()> {
        self.credentials.set(api_key)?;
        emit(&self.events, ReaderEvent::CredentialStored);
        Ok(())
    }
}

/// Runs the reader until stdin closes or the client sends `shutdown`.
pub async fn run_app(config: Config) -> Result<()> {
    config.validate().context("Invalid configuration")?;
    let source = TopicSource::from_location(&config.data.source);

    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (speech_tx, speech_rx) = mpsc::unbounded_channel();
    let speech = build_engine(&config.speech, speech_tx);
    let app = ReaderApp::from_config(&config, source, speech, event_tx.clone());

    let writer = tokio::spawn(ipc::write_events(event_rx));
    let commands = ipc::spawn_stdin_reader(event_tx.clone());
    info!(source = %config.data.source, engine = ?config.speech.engine, "Reader ready");
    emit(&event_tx, ReaderEvent::Ready);

    command_loop(&app, commands, speech_rx).await;

    // The stdin thread keeps a sender alive, so the writer only gets a short
    // grace period to flush.
    drop(app);
    drop(event_tx);
    if tokio::time::timeout(WRITER_FLUSH_GRACE, writer).await.is_err() {
        debug!("Event writer still open at exit");
    }
    Ok(())
}

async fn command_loop(
    app: &ReaderApp,
    mut commands: UnboundedReceiver<ReaderCommand>,
    mut speech_events: UnboundedReceiver<SpeechEvent>,
) {
    loop {
        tokio::select! {
            command = commands.recv() => {
                let Some(command) = command else {
                    info!("Client closed the command stream");
                    break;
                };
                if !app.handle_command(command).await {
                    break;
                }
            }
            Some(event) = speech_events.recv() => {
                app.handle_speech_event(&event);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc::UnboundedReceiver;

    use async_trait::async_trait;

    use super::*;
    use crate::chat::{ChatPrompt, MessageBody, ResponderKind};
    use crate::error::ReaderResult;
    use crate::speech::testing::ScriptedSpeechEngine;
    use crate::speech::SpeechEventKind;
    use crate::tokens::DisplayState;
    use crate::translate::testing::TableTranslator;
    use crate::vocabulary::tests::greetings_catalog;

    struct Harness {
        app: ReaderApp,
        engine: Arc<ScriptedSpeechEngine>,
        credentials: Arc<CredentialStore>,
        events: UnboundedReceiver<ReaderEvent>,
    }

    struct SlowResponder;

    #[async_trait]
    impl Responder for SlowResponder {
        fn kind(&self) -> ResponderKind {
            ResponderKind::RemoteCompletion
        }

        async fn respond(&self, _prompt: &ChatPrompt) -> ReaderResult<String> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok("Slow reply.".to_string())
        }
    }

    fn harness() -> Harness {
        let credentials = Arc::new(CredentialStore::in_memory(None));
        let remote: Arc<dyn Responder> = Arc::new(RemoteCompletionResponder::new(
            &crate::config::ChatConfig::default(),
            credentials.clone(),
        ));
        harness_with(remote, credentials)
    }

    fn harness_with(remote: Arc<dyn Responder>, credentials: Arc<CredentialStore>) -> Harness {
        let engine = Arc::new(ScriptedSpeechEngine::default());
        let chat = Arc::new(ChatAssistant::new(
            vec![remote],
            Arc::new(TableTranslator::with(&[("click", "انقر")])),
        ));
        let state = SharedState::new(ReaderState::new(TopicSource::Static(greetings_catalog()), 0.85, 0.9));
        let (tx, events) = mpsc::unbounded_channel();
        let app = ReaderApp::new(state, engine.clone(), chat, credentials.clone(), SpeechConfig::default(), tx);
        Harness {
            app,
            engine,
            credentials,
            events,
        }
    }

    impl Harness {
        fn drain(&mut self) -> Vec<ReaderEvent> {
            let mut out = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                out.push(event);
            }
            out
        }

        fn errors(&mut self) -> Vec<String> {
            self.drain()
                .into_iter()
                .filter_map(|event| match event {
                    ReaderEvent::Error { message } => Some(message),
                    _ => None,
                })
                .collect()
        }
    }

    #[tokio::test]
    async fn select_topic_renders_tokens() {
        let mut h = harness();
        h.app.select_topic("greetings").await.unwrap();
        let rendered = h.drain().into_iter().find_map(|event| match event {
            ReaderEvent::Rendered {
                topic_id,
                entry_count,
                tokens,
                ..
            } => Some((topic_id, entry_count, tokens)),
            _ => None,
        });
        let (topic_id, entry_count, tokens) = rendered.unwrap();
        assert_eq!(topic_id, "greetings");
        assert_eq!(entry_count, 2);
        let targets: Vec<_> = tokens.iter().map(|t| t.target.as_str()).collect();
        assert_eq!(targets, ["مرحبا", "عالم"]);
    }

    #[tokio::test]
    async fn unknown_topic_keeps_previous_render() {
        let mut h = harness();
        h.app.select_topic("greetings").await.unwrap();
        h.drain();
        assert!(h.app.handle_command(ReaderCommand::SelectTopic { topic_id: "plants".into() }).await);
        let errors = h.errors();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("plants"));
        assert_eq!(h.app.state().lock().unwrap().tokens.len(), 2);
    }

    #[tokio::test]
    async fn toggle_reveals_and_speaks_at_word_rate() {
        let mut h = harness();
        h.app.select_topic("greetings").await.unwrap();
        h.drain();

        h.app.toggle_word(0).unwrap();
        let request = h.engine.last();
        assert_eq!(request.text, "Hello");
        assert_eq!(request.rate, 0.9);
        match h.drain().as_slice() {
            [ReaderEvent::TokenUpdated { token }] => {
                assert_eq!(token.display, DisplayState::Target);
                assert_eq!(token.shown_text(), "مرحبا");
            }
            other => panic!("unexpected events {other:?}"),
        }

        h.app.toggle_word(0).unwrap();
        assert_eq!(h.engine.spoken().len(), 1);
        assert_eq!(h.app.state().lock().unwrap().tokens[0].shown_text(), "Hello,");

        assert!(h.app.toggle_word(7).is_err());
    }

    #[tokio::test]
    async fn toggle_is_silent_while_reading() {
        let mut h = harness();
        h.app.select_topic("greetings").await.unwrap();
        h.app.read_aloud().unwrap();
        let spoken = h.engine.spoken().len();

        h.app.toggle_word(1).unwrap();
        assert_eq!(h.engine.spoken().len(), spoken);
        assert!(h.app.state().lock().unwrap().tokens[1].is_translated());
        h.drain();
    }

    #[tokio::test]
    async fn reset_and_clear() {
        let h = harness();
        h.app.select_topic("greetings").await.unwrap();
        h.app.toggle_word(0).unwrap();
        h.app.toggle_word(1).unwrap();

        h.app.clear_translations().unwrap();
        assert!(h.app.state().lock().unwrap().tokens.iter().all(|t| !t.is_translated()));

        h.app.toggle_word(1).unwrap();
        h.app.read_aloud().unwrap();
        let utterance = h.engine.last().utterance;
        h.app.handle_speech_event(&SpeechEvent::new(utterance, SpeechEventKind::Started));
        assert_eq!(h.app.state().lock().unwrap().highlighted(), vec![0]);

        h.app.reset_all().unwrap();
        let guard = h.app.state().lock().unwrap();
        assert!(guard.tokens.iter().all(|t| !t.is_translated() && !t.reading));
        assert!(!guard.is_reading());
    }

    #[tokio::test]
    async fn speech_rate_is_validated() {
        let mut h = harness();
        h.app.set_speech_rate(1.25).unwrap();
        assert_eq!(h.app.state().lock().unwrap().reading_rate, 1.25);
        assert!(h.app.set_speech_rate(9.0).is_err());
        assert_eq!(h.app.state().lock().unwrap().reading_rate, 1.25);
        assert!(h.drain().contains(&ReaderEvent::SpeechRateChanged { rate: 1.25 }));
    }

    #[tokio::test]
    async fn chat_without_key_requests_credential() {
        let mut h = harness();
        h.app.select_topic("greetings").await.unwrap();
        h.drain();
        h.app.send_chat("How do I click?").await.unwrap();

        let events = h.drain();
        assert_eq!(events.first(), Some(&ReaderEvent::ChatBusy { busy: true }));
        assert_eq!(events.last(), Some(&ReaderEvent::ChatBusy { busy: false }));
        assert!(events.contains(&ReaderEvent::CredentialRequired));
        let reply = events
            .iter()
            .find_map(|event| match event {
                ReaderEvent::ChatMessage {
                    message,
                    answered_by: Some(kind),
                } => Some((message.clone(), *kind)),
                _ => None,
            })
            .unwrap();
        assert_eq!(reply.1, ResponderKind::Canned);
        let MessageBody::Tokens(tokens) = &reply.0.body else {
            panic!("reply should be tokenized");
        };
        assert!(tokens.iter().any(|t| t.clean == "click" && t.target == "انقر"));

        h.app.toggle_chat_word(reply.0.id, 0).unwrap();
        assert_eq!(h.engine.spoken().len(), 1);
        assert!(h.app.toggle_chat_word(0, 0).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn question_is_shown_while_reply_is_pending() {
        let mut h = harness_with(Arc::new(SlowResponder), Arc::new(CredentialStore::in_memory(None)));
        assert!(h.app.handle_command(ReaderCommand::SendChat { text: "hello".into() }).await);
        tokio::time::sleep(Duration::from_millis(100)).await;

        let events = h.drain();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], ReaderEvent::ChatBusy { busy: true });
        assert!(matches!(
            &events[1],
            ReaderEvent::ChatMessage { message, answered_by: None }
                if message.body == MessageBody::Text("hello".into())
        ));

        // Input while the reply is pending is dropped without busy events.
        assert!(h.app.handle_command(ReaderCommand::SendChat { text: "again".into() }).await);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(h.drain().is_empty());

        tokio::time::sleep(Duration::from_secs(5)).await;
        let events = h.drain();
        assert_eq!(events.last(), Some(&ReaderEvent::ChatBusy { busy: false }));
        assert!(events.iter().any(|event| matches!(
            event,
            ReaderEvent::ChatMessage {
                answered_by: Some(ResponderKind::RemoteCompletion),
                ..
            }
        )));
        assert_eq!(
            events
                .iter()
                .filter(|event| matches!(event, ReaderEvent::ChatBusy { .. }))
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn blank_chat_emits_nothing() {
        let mut h = harness();
        h.app.send_chat("   ").await.unwrap();
        assert!(h.drain().is_empty());
    }

    #[tokio::test]
    async fn api_key_is_stored() {
        let mut h = harness();
        assert!(h.app.set_api_key("  ").is_err());
        h.app.set_api_key(" sk-new ").unwrap();
        assert_eq!(h.credentials.get().as_deref(), Some("sk-new"));
        assert!(h.drain().contains(&ReaderEvent::CredentialStored));
    }

    #[tokio::test]
    async fn shutdown_stops_the_loop() {
        let mut h = harness();
        assert!(!h.app.handle_command(ReaderCommand::Shutdown).await);
        assert_eq!(h.engine.cancel_count(), 1);
        h.drain();
    }

    #[tokio::test]
    async fn ping_answers_pong() {
        let mut h = harness();
        assert!(h.app.handle_command(ReaderCommand::Ping).await);
        assert_eq!(h.drain(), vec![ReaderEvent::Pong]);
    }
}
