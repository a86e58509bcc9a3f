use std::future::Future;
use std::pin::Pin;

use snafu::Snafu;
use tokio::sync::{mpsc, oneshot};

use crate::chat::{Conversation, ConversationId, ConversationSummary, StreamEvent};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
pub type TurnWorker = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;
pub type BackendResult<T> = Result<T, BackendError>;
pub type BoxedError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum BackendError {
    #[snafu(display("backend transport failed on `{stage}`: {source}"))]
    Transport {
        stage: &'static str,
        source: BoxedError,
    },
    #[snafu(display("backend returned status {status} on `{stage}`: {body}"))]
    Status {
        stage: &'static str,
        status: u16,
        body: String,
    },
    #[snafu(display("failed to decode backend payload on `{stage}`: {source}"))]
    Decode {
        stage: &'static str,
        source: serde_json::Error,
    },
}

/// Ordered receiver for the staged events of one turn.
pub struct TurnEventStream {
    conversation_id: ConversationId,
    events: mpsc::UnboundedReceiver<StreamEvent>,
    cancel_tx: Option<oneshot::Sender<()>>,
}

/// An opened turn: the event receiver plus the future that pumps the transport.
pub struct TurnStreamHandle {
    pub stream: TurnEventStream,
    pub worker: TurnWorker,
}

impl TurnEventStream {
    pub fn new(
        conversation_id: ConversationId,
        events: mpsc::UnboundedReceiver<StreamEvent>,
        cancel_tx: oneshot::Sender<()>,
    ) -> Self {
        Self {
            conversation_id,
            events,
            cancel_tx: Some(cancel_tx),
        }
    }

    pub fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }

    pub async fn recv(&mut self) -> Option<StreamEvent> {
        self.events.recv().await
    }
}

impl Drop for TurnEventStream {
    fn drop(&mut self) {
        if let Some(cancel_tx) = self.cancel_tx.take() {
            let _ = cancel_tx.send(());
        }
    }
}

/// Remote council service consumed by the chat controller.
pub trait CouncilBackend: Send + Sync {
    fn list_conversations<'a>(&'a self) -> BoxFuture<'a, BackendResult<Vec<ConversationSummary>>>;
    fn get_conversation<'a>(
        &'a self,
        conversation_id: &'a ConversationId,
    ) -> BoxFuture<'a, BackendResult<Conversation>>;
    fn create_conversation<'a>(&'a self) -> BoxFuture<'a, BackendResult<Conversation>>;
    /// Resolves once the turn's stream is open; fails if it could not be opened at all.
    fn send_message_stream<'a>(
        &'a self,
        conversation_id: &'a ConversationId,
        content: &'a str,
    ) -> BoxFuture<'a, BackendResult<TurnStreamHandle>>;
}

/// Builds the channel pair backing a [`TurnEventStream`].
///
/// The worker keeps the sender and the cancel receiver; the consumer gets the stream.
pub fn make_turn_stream(
    conversation_id: ConversationId,
) -> (
    mpsc::UnboundedSender<StreamEvent>,
    TurnEventStream,
    oneshot::Receiver<()>,
) {
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (cancel_tx, cancel_rx) = oneshot::channel();
    (
        event_tx,
        TurnEventStream::new(conversation_id, event_rx, cancel_tx),
        cancel_rx,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::StageSlot;

    #[tokio::test]
    async fn turn_stream_delivers_events_in_order() {
        let (event_tx, mut stream, _cancel_rx) = make_turn_stream(ConversationId::new("c-1"));
        event_tx
            .send(StreamEvent::stage_start(StageSlot::Stage1))
            .expect("receiver alive");
        event_tx.send(StreamEvent::complete()).expect("receiver alive");
        drop(event_tx);

        assert_eq!(
            stream.recv().await,
            Some(StreamEvent::stage_start(StageSlot::Stage1))
        );
        assert_eq!(stream.recv().await, Some(StreamEvent::complete()));
        assert_eq!(stream.recv().await, None);
        assert_eq!(stream.conversation_id().as_str(), "c-1");
    }

    #[tokio::test]
    async fn dropping_the_stream_signals_the_worker() {
        let (_event_tx, stream, cancel_rx) = make_turn_stream(ConversationId::new("c-1"));

        drop(stream);

        assert!(cancel_rx.await.is_ok());
    }
}
