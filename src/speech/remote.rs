use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use futures_util::StreamExt;
use reqwest::{Client, Method};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use super::{SpeechEngine, SpeechEvent, SpeechEventKind, SpeechEventSender, SpeechRequest, UtteranceId};
use crate::error::{ReaderError, ReaderResult};

const TERMINAL_EVENTS: [&str; 3] = ["JOB_DONE", "JOB_CANCELED", "JOB_ERROR"];

#[derive(Deserialize)]
struct SpeakHttpResponse {
    job_id: String,
    ws_url: String,
}

#[derive(Default)]
struct JobState {
    /// Engine job of the utterance currently in flight.
    last_job: Option<(UtteranceId, String)>,
    /// Utterances superseded or cancelled before their job id was known.
    pending_cancel: HashSet<UtteranceId>,
    active_utterance: Option<UtteranceId>,
    suppressed_job_ids: HashSet<String>,
}

/// Speech served by a local engine over HTTP with a websocket event stream.
pub struct RemoteSpeechEngine {
    base_url: String,
    token: String,
    voice_id: String,
    client: Client,
    events: SpeechEventSender,
    state: Arc<Mutex<JobState>>,
}

impl RemoteSpeechEngine {
    pub fn new(base_url: &str, token: &str, voice_id: &str, events: SpeechEventSender) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            voice_id: voice_id.to_string(),
            client: Client::new(),
            events,
            state: Arc::new(Mutex::new(JobState::default())),
        }
    }
}

pub(crate) fn speak_body(voice_id: &str, request: &SpeechRequest) -> Value {
    json!({
        "voice_id": voice_id,
        "text": request.text.trim(),
        "settings": {
            "language": request.lang,
            "rate": request.rate,
            "pitch": request.pitch,
            "volume": request.volume,
        }
    })
}

/// Maps an engine websocket event onto a speech event kind.
pub(crate) fn event_kind(payload: &Value) -> Option<SpeechEventKind> {
    match payload.get("type").and_then(Value::as_str)? {
        "JOB_STARTED" => Some(SpeechEventKind::Started),
        "JOB_DONE" => Some(SpeechEventKind::Finished),
        "JOB_CANCELED" => Some(SpeechEventKind::Cancelled),
        "JOB_ERROR" => Some(SpeechEventKind::Failed(
            payload
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("engine reported an error")
                .to_string(),
        )),
        _ => None,
    }
}

impl SpeechEngine for RemoteSpeechEngine {
    fn speak(&self, request: SpeechRequest) -> ReaderResult<()> {
        if request.text.trim().is_empty() {
            return Err(ReaderError::SpeechEngine("Speak text cannot be empty".to_string()));
        }
        self.cancel();
        {
            let mut guard = self
                .state
                .lock()
                .map_err(|_| ReaderError::SpeechEngine("Speech state lock poisoned".to_string()))?;
            guard.active_utterance = Some(request.utterance);
        }

        let job = SpeakJob {
            base_url: self.base_url.clone(),
            token: self.token.clone(),
            client: self.client.clone(),
            events: self.events.clone(),
            state: self.state.clone(),
            utterance: request.utterance,
            body: speak_body(&self.voice_id, &request),
        };
        tokio::spawn(async move {
            let utterance = job.utterance;
            let events = job.events.clone();
            let state = job.state.clone();
            if let Err(err) = job.run().await {
                warn!(%utterance, "Remote speech failed: {err:#}");
                let _ = events.send(SpeechEvent::new(
                    utterance,
                    SpeechEventKind::Failed(format!("{err:#}")),
                ));
            }
            if let Ok(mut guard) = state.lock() {
                guard.pending_cancel.remove(&utterance);
                if guard.active_utterance == Some(utterance) {
                    guard.active_utterance = None;
                }
            };
        });
        Ok(())
    }

    fn cancel(&self) {
        let job_id = match self.state.lock() {
            Ok(mut guard) => {
                let job = guard.last_job.take();
                let active = guard.active_utterance.take();
                if job.is_none() {
                    if let Some(utterance) = active {
                        guard.pending_cancel.insert(utterance);
                    }
                }
                job.map(|(_, job_id)| {
                    guard.suppressed_job_ids.insert(job_id.clone());
                    if guard.suppressed_job_ids.len() > 128 {
                        guard.suppressed_job_ids.clear();
                        guard.suppressed_job_ids.insert(job_id.clone());
                    }
                    job_id
                })
            }
            Err(_) => None,
        };

        let Some(job_id) = job_id else {
            return;
        };
        let client = self.client.clone();
        let url = format!("{}/v1/cancel", self.base_url);
        let token = self.token.clone();
        tokio::spawn(async move {
            if let Err(err) =
                request_json(&client, Method::POST, &url, &token, Some(json!({ "job_id": job_id }))).await
            {
                warn!("Cancel request failed: {err:#}");
            }
        });
    }
}

struct SpeakJob {
    base_url: String,
    token: String,
    client: Client,
    events: SpeechEventSender,
    state: Arc<Mutex<JobState>>,
    utterance: UtteranceId,
    body: Value,
}

impl SpeakJob {
    async fn run(self) -> Result<()> {
        let payload = request_json(
            &self.client,
            Method::POST,
            &format!("{}/v1/speak", self.base_url),
            &self.token,
            Some(self.body.clone()),
        )
        .await?;
        let response: SpeakHttpResponse =
            serde_json::from_value(payload).context("Invalid /v1/speak response shape")?;

        let cancelled_early = {
            let mut guard = self.state.lock().map_err(|_| anyhow!("State lock poisoned"))?;
            if guard.pending_cancel.remove(&self.utterance) {
                true
            } else {
                guard.last_job = Some((self.utterance, response.job_id.clone()));
                false
            }
        };
        if cancelled_early {
            debug!(job_id = %response.job_id, "Utterance superseded before start");
            request_json(
                &self.client,
                Method::POST,
                &format!("{}/v1/cancel", self.base_url),
                &self.token,
                Some(json!({ "job_id": response.job_id })),
            )
            .await?;
            let _ = self
                .events
                .send(SpeechEvent::new(self.utterance, SpeechEventKind::Cancelled));
            return Ok(());
        }

        self.relay_ws_events(&response.ws_url, &response.job_id).await
    }

    async fn relay_ws_events(&self, ws_url: &str, job_id: &str) -> Result<()> {
        let protocol_header = format!("auth.bearer.v1, {}", self.token);
        let mut request = ws_url
            .into_client_request()
            .context("Failed to construct WS request")?;
        request
            .headers_mut()
            .insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_str(&protocol_header)?);

        let (mut socket, _) = tokio_tungstenite::connect_async(request)
            .await
            .context("Failed to connect WS stream")?;

        let mut terminal_seen = false;
        while let Some(message) = socket.next().await {
            if self.is_suppressed(job_id) {
                break;
            }
            match message {
                Ok(Message::Text(text)) => {
                    let Ok(parsed) = serde_json::from_str::<Value>(&text) else {
                        continue;
                    };
                    let Some(kind) = event_kind(&parsed) else {
                        continue;
                    };
                    let kind_name = parsed.get("type").and_then(Value::as_str).unwrap_or_default();
                    let terminal = TERMINAL_EVENTS.contains(&kind_name);
                    let _ = self.events.send(SpeechEvent::new(self.utterance, kind));
                    if terminal {
                        terminal_seen = true;
                        break;
                    }
                }
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(err) => return Err(anyhow!("WS stream read error: {err}")),
            }
        }

        let suppressed = {
            let mut guard = self.state.lock().map_err(|_| anyhow!("State lock poisoned"))?;
            if guard.last_job.as_ref().map(|(_, id)| id.as_str()) == Some(job_id) {
                guard.last_job = None;
            }
            guard.suppressed_job_ids.remove(job_id)
        };
        if suppressed {
            let _ = self
                .events
                .send(SpeechEvent::new(self.utterance, SpeechEventKind::Cancelled));
        } else if !terminal_seen {
            return Err(anyhow!("Speech stream closed before the job finished"));
        }
        Ok(())
    }

    fn is_suppressed(&self, job_id: &str) -> bool {
        match self.state.lock() {
            Ok(guard) => guard.suppressed_job_ids.contains(job_id),
            Err(_) => false,
        }
    }
}

async fn request_json(
    client: &Client,
    method: Method,
    url: &str,
    token: &str,
    body: Option<Value>,
) -> Result<Value> {
    let mut request = client
        .request(method, url)
        .header("Authorization", format!("Bearer {token}"));

    if let Some(payload) = body {
        request = request.json(&payload);
    }

    let response = request.send().await.with_context(|| format!("Request failed for {url}"))?;
    let status = response.status();
    if !status.is_success() {
        let body_text = response.text().await.unwrap_or_else(|_| String::new());
        return Err(anyhow!("Request to {url} failed with status {status}: {body_text}"));
    }

    response
        .json::<Value>()
        .await
        .with_context(|| format!("Failed to decode JSON response for {url}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SpeechConfig;
    use futures_util::SinkExt;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;
    use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};

    #[test]
    fn ws_events_map_to_speech_events() {
        assert_eq!(event_kind(&json!({"type": "JOB_STARTED"})), Some(SpeechEventKind::Started));
        assert_eq!(event_kind(&json!({"type": "JOB_DONE"})), Some(SpeechEventKind::Finished));
        assert_eq!(
            event_kind(&json!({"type": "JOB_CANCELED"})),
            Some(SpeechEventKind::Cancelled)
        );
        assert_eq!(
            event_kind(&json!({"type": "JOB_ERROR", "error": "out of memory"})),
            Some(SpeechEventKind::Failed("out of memory".into()))
        );
        assert_eq!(event_kind(&json!({"type": "AUDIO_CHUNK"})), None);
        assert_eq!(event_kind(&json!({"kind": "JOB_DONE"})), None);
    }

    #[test]
    fn speak_body_carries_settings() {
        let request = SpeechRequest::new(" hi ", &SpeechConfig::default(), 0.85);
        let body = speak_body("alba", &request);
        assert_eq!(body["voice_id"], "alba");
        assert_eq!(body["text"], "hi");
        assert_eq!(body["settings"]["language"], "en-US");
        assert_eq!(body["settings"]["pitch"], 1.0);
    }

    #[tokio::test]
    async fn unreachable_engine_reports_failure_event() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let engine = RemoteSpeechEngine::new("http://127.0.0.1:9", "token", "0", tx);
        let request = SpeechRequest::new("hello", &SpeechConfig::default(), 1.0);
        let utterance = request.utterance;
        engine.speak(request).unwrap();
        let event = rx.recv().await.unwrap();
        assert_eq!(event.utterance, utterance);
        assert!(matches!(event.kind, SpeechEventKind::Failed(_)));
    }

    fn engine(base_url: &str) -> (RemoteSpeechEngine, mpsc::UnboundedReceiver<SpeechEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (RemoteSpeechEngine::new(base_url, "token", "0", tx), rx)
    }

    fn request(text: &str) -> SpeechRequest {
        SpeechRequest::new(text, &SpeechConfig::default(), 1.0)
    }

    #[tokio::test]
    async fn superseded_utterances_stay_pending_until_their_job_id_arrives() {
        let (engine, _rx) = engine("http://127.0.0.1:9");
        let (first, second, third) = (request("one"), request("two"), request("three"));
        let (a, b, c) = (first.utterance, second.utterance, third.utterance);
        engine.speak(first).unwrap();
        engine.speak(second).unwrap();
        engine.speak(third).unwrap();

        let guard = engine.state.lock().unwrap();
        assert_eq!(guard.pending_cancel, HashSet::from([a, b]));
        assert_eq!(guard.active_utterance, Some(c));
        assert!(guard.last_job.is_none());
    }

    #[tokio::test]
    async fn job_cancelled_before_start_is_cancelled_on_engine() {
        let mut stub = crate::testing::serve_sequence(vec![
            (
                "200 OK",
                json!({"job_id": "job-a", "ws_url": "ws://127.0.0.1:9/v1/ws"}).to_string(),
            ),
            ("200 OK", "{}".to_string()),
        ])
        .await;
        let (engine, mut rx) = engine(&stub.base);
        let speak = request("hello");
        let utterance = speak.utterance;
        engine.speak(speak).unwrap();
        engine.cancel();

        let event = rx.recv().await.unwrap();
        assert_eq!(event, SpeechEvent::new(utterance, SpeechEventKind::Cancelled));

        let speak_request = stub.next_request().await;
        assert!(speak_request.starts_with("POST /v1/speak"));
        assert!(speak_request.to_lowercase().contains("authorization: bearer token"));
        let cancel_request = stub.next_request().await;
        assert!(cancel_request.starts_with("POST /v1/cancel"));
        assert!(cancel_request.contains("job-a"));

        let guard = engine.state.lock().unwrap();
        assert!(guard.pending_cancel.is_empty());
        assert!(guard.last_job.is_none());
    }

    #[tokio::test]
    async fn cancel_of_running_job_suppresses_its_events() {
        let mut stub = crate::testing::serve_sequence(vec![("200 OK", "{}".to_string())]).await;
        let (engine, _rx) = engine(&stub.base);
        let utterance = uuid::Uuid::new_v4();
        {
            let mut guard = engine.state.lock().unwrap();
            guard.last_job = Some((utterance, "job-7".to_string()));
            guard.active_utterance = Some(utterance);
        }
        engine.cancel();
        {
            let guard = engine.state.lock().unwrap();
            assert!(guard.suppressed_job_ids.contains("job-7"));
            assert!(guard.last_job.is_none());
            assert!(guard.pending_cancel.is_empty());
        }

        let cancel_request = stub.next_request().await;
        assert!(cancel_request.starts_with("POST /v1/cancel"));
        assert!(cancel_request.contains("job-7"));
    }

    fn accept_bearer(request: &Request, mut response: Response) -> Result<Response, ErrorResponse> {
        assert!(request.headers().contains_key(SEC_WEBSOCKET_PROTOCOL));
        response
            .headers_mut()
            .insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static("auth.bearer.v1"));
        Ok(response)
    }

    #[tokio::test]
    async fn stream_closed_before_terminal_event_is_failure() {
        let ws_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let ws_addr = ws_listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (socket, _) = ws_listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_hdr_async(socket, accept_bearer).await.unwrap();
            ws.send(Message::Text(json!({"type": "JOB_STARTED", "job_id": "job-s"}).to_string()))
                .await
                .unwrap();
            let _ = ws.close(None).await;
        });
        let stub = crate::testing::serve_sequence(vec![(
            "200 OK",
            json!({"job_id": "job-s", "ws_url": format!("ws://{ws_addr}/v1/ws")}).to_string(),
        )])
        .await;
        let (engine, mut rx) = engine(&stub.base);
        let speak = request("hello");
        let utterance = speak.utterance;
        engine.speak(speak).unwrap();

        assert_eq!(
            rx.recv().await.unwrap(),
            SpeechEvent::new(utterance, SpeechEventKind::Started)
        );
        let failed = rx.recv().await.unwrap();
        assert_eq!(failed.utterance, utterance);
        assert!(matches!(failed.kind, SpeechEventKind::Failed(msg) if msg.contains("closed before")));
        assert_eq!(engine.state.lock().unwrap().active_utterance, None);
    }
}
