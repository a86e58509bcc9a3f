use std::fmt::Display;
use std::time::Duration;

use council_chat::backend::{DecodeSnafu, StatusSnafu};
use council_chat::chat::{Conversation, ConversationId, ConversationSummary, StreamEvent};
use council_chat::{
    BackendError, BackendResult, BoxFuture, CouncilBackend, TurnStreamHandle, TurnWorker,
    make_turn_stream,
};
use futures::{Stream, StreamExt};
use reqwest::Url;
use serde::Serialize;
use serde::de::DeserializeOwned;
use snafu::{ResultExt, ensure};
use tokio::sync::{mpsc, oneshot};

use crate::error::{BuildClientSnafu, ClientResult, InvalidBaseUrlSnafu};
use crate::sse::SseDecoder;

pub const DEFAULT_BASE_URL: &str = "http://localhost:8001";
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub base_url: String,
    pub connect_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

#[derive(Debug, Serialize)]
struct SendMessageBody<'a> {
    content: &'a str,
}

/// Talks to the council service over HTTP; turn replies arrive as SSE.
#[derive(Debug, Clone)]
pub struct HttpCouncilBackend {
    http: reqwest::Client,
    base_url: Url,
}

impl HttpCouncilBackend {
    pub fn new(config: ClientConfig) -> ClientResult<Self> {
        let base_url = parse_base_url(&config.base_url)?;
        let http = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .context(BuildClientSnafu {
                stage: "build-http-client",
            })?;

        tracing::debug!(%base_url, "council client ready");
        Ok(Self { http, base_url })
    }

    // Segments are percent-encoded, so an id can never add path components.
    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn conversations_url(&self) -> Url {
        self.endpoint(&["api", "conversations"])
    }

    fn conversation_url(&self, conversation_id: &ConversationId) -> Url {
        self.endpoint(&["api", "conversations", conversation_id.as_str()])
    }

    fn message_stream_url(&self, conversation_id: &ConversationId) -> Url {
        self.endpoint(&[
            "api",
            "conversations",
            conversation_id.as_str(),
            "message",
            "stream",
        ])
    }

    async fn read_json<T>(response: reqwest::Response, stage: &'static str) -> BackendResult<T>
    where
        T: DeserializeOwned,
    {
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|source| transport(stage, source))?;
        if !status.is_success() {
            return StatusSnafu {
                stage,
                status: status.as_u16(),
                body,
            }
            .fail();
        }
        serde_json::from_str(&body).context(DecodeSnafu { stage })
    }
}

impl CouncilBackend for HttpCouncilBackend {
    fn list_conversations<'a>(&'a self) -> BoxFuture<'a, BackendResult<Vec<ConversationSummary>>> {
        Box::pin(async move {
            let stage = "list-conversations";
            let response = self
                .http
                .get(self.conversations_url())
                .send()
                .await
                .map_err(|source| transport(stage, source))?;
            Self::read_json(response, stage).await
        })
    }

    fn get_conversation<'a>(
        &'a self,
        conversation_id: &'a ConversationId,
    ) -> BoxFuture<'a, BackendResult<Conversation>> {
        Box::pin(async move {
            let stage = "get-conversation";
            let response = self
                .http
                .get(self.conversation_url(conversation_id))
                .send()
                .await
                .map_err(|source| transport(stage, source))?;
            Self::read_json(response, stage).await
        })
    }

    fn create_conversation<'a>(&'a self) -> BoxFuture<'a, BackendResult<Conversation>> {
        Box::pin(async move {
            let stage = "create-conversation";
            let response = self
                .http
                .post(self.conversations_url())
                .json(&serde_json::json!({}))
                .send()
                .await
                .map_err(|source| transport(stage, source))?;
            Self::read_json(response, stage).await
        })
    }

    fn send_message_stream<'a>(
        &'a self,
        conversation_id: &'a ConversationId,
        content: &'a str,
    ) -> BoxFuture<'a, BackendResult<TurnStreamHandle>> {
        Box::pin(async move {
            let stage = "open-turn-stream";
            let response = self
                .http
                .post(self.message_stream_url(conversation_id))
                .json(&SendMessageBody { content })
                .send()
                .await
                .map_err(|source| transport(stage, source))?;

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return StatusSnafu {
                    stage,
                    status: status.as_u16(),
                    body,
                }
                .fail();
            }

            tracing::debug!(%conversation_id, "turn stream opened");
            let (event_tx, stream, cancel_rx) = make_turn_stream(conversation_id.clone());
            let worker: TurnWorker = Box::pin(run_turn_worker(
                conversation_id.clone(),
                response.bytes_stream(),
                event_tx,
                cancel_rx,
            ));
            Ok(TurnStreamHandle { stream, worker })
        })
    }
}

/// Trims the configured base URL and drops trailing slashes.
pub fn normalize_base_url(raw: &str) -> ClientResult<String> {
    parse_base_url(raw)?;
    Ok(raw.trim().trim_end_matches('/').to_string())
}

fn parse_base_url(raw: &str) -> ClientResult<Url> {
    let trimmed = raw.trim().trim_end_matches('/');
    let parsed = Url::parse(trimmed).map_err(|source| {
        InvalidBaseUrlSnafu {
            stage: "parse-base-url",
            base_url: raw.to_string(),
            details: source.to_string(),
        }
        .build()
    })?;
    ensure!(
        matches!(parsed.scheme(), "http" | "https"),
        InvalidBaseUrlSnafu {
            stage: "check-base-url-scheme",
            base_url: raw.to_string(),
            details: format!("unsupported scheme `{}`", parsed.scheme()),
        }
    );
    Ok(parsed)
}

fn transport(stage: &'static str, source: reqwest::Error) -> BackendError {
    BackendError::Transport {
        stage,
        source: Box::new(source),
    }
}

// Returns false once the consumer is gone or the event ended the turn.
fn forward(event_tx: &mpsc::UnboundedSender<StreamEvent>, event: StreamEvent) -> bool {
    let terminal = event.kind.is_terminal();
    event_tx.send(event).is_ok() && !terminal
}

async fn run_turn_worker<S, B, E>(
    conversation_id: ConversationId,
    body: S,
    event_tx: mpsc::UnboundedSender<StreamEvent>,
    mut cancel_rx: oneshot::Receiver<()>,
) where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: Display,
{
    let mut body = std::pin::pin!(body);
    let mut decoder = SseDecoder::new();

    loop {
        tokio::select! {
            _ = &mut cancel_rx => {
                tracing::debug!(%conversation_id, "turn stream cancelled");
                return;
            }
            next_chunk = body.next() => {
                match next_chunk {
                    Some(Ok(chunk)) => {
                        for event in decoder.push(chunk.as_ref()) {
                            if !forward(&event_tx, event) {
                                return;
                            }
                        }
                    }
                    Some(Err(error)) => {
                        tracing::warn!(
                            %conversation_id,
                            %error,
                            "turn stream emitted an error chunk"
                        );
                        let _ = event_tx.send(StreamEvent::error(format!(
                            "connection to the council was interrupted: {error}"
                        )));
                        return;
                    }
                    None => break,
                }
            }
        }
    }

    if let Some(event) = decoder.finish() {
        forward(&event_tx, event);
    }
    tracing::debug!(%conversation_id, "turn stream body ended");
}
