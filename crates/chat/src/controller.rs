use std::sync::Arc;

use snafu::ResultExt;
use tokio::sync::{Mutex, watch};

use crate::backend::{CouncilBackend, TurnStreamHandle};
use crate::chat::{
    ConversationEpoch, ConversationId, ConversationSummary, EventOutcome, FollowUp,
    ReconcileRejection, SessionPhase, SessionTarget, StageLoading, StreamEvent, StreamReconciler,
    TranscriptSnapshot, TranscriptStore,
};
use crate::error::{ChatError, ChatResult, FetchFailedSnafu};

/// Read model published after every state change.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatViewState {
    pub transcript: TranscriptSnapshot,
    /// True while a turn is sending, streaming, or reloading its final snapshot.
    pub busy: bool,
    pub phase: SessionPhase,
    pub conversations: Vec<ConversationSummary>,
    pub active_conversation_id: Option<ConversationId>,
    pub notice: Option<String>,
}

/// How a call to [`ChatController::send_message`] ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnOutcome {
    /// Nothing was sent: blank input, no conversation, or a turn already running.
    Skipped,
    Completed,
    /// The user switched conversations mid-turn; the rest of the stream was discarded.
    Superseded,
}

#[derive(Debug)]
enum TurnResolution {
    Completed,
    Superseded,
    Failed(String),
}

#[derive(Debug, Default)]
struct ControllerState {
    transcript: TranscriptStore,
    reconciler: StreamReconciler,
    conversations: Vec<ConversationSummary>,
    active_conversation_id: Option<ConversationId>,
    epoch: ConversationEpoch,
    finalizing: Option<ConversationEpoch>,
    notice: Option<String>,
}

impl ControllerState {
    fn busy(&self) -> bool {
        self.reconciler.busy() || self.finalizing == Some(self.epoch)
    }

    fn view(&self) -> ChatViewState {
        ChatViewState {
            transcript: self.transcript.snapshot(),
            busy: self.busy(),
            phase: self.reconciler.phase(),
            conversations: self.conversations.clone(),
            active_conversation_id: self.active_conversation_id.clone(),
            notice: self.notice.clone(),
        }
    }

    fn activate(&mut self, conversation_id: ConversationId) {
        self.active_conversation_id = Some(conversation_id);
        self.epoch = self.epoch.next();
        self.finalizing = None;
        self.notice = None;
        self.reconciler.observe_epoch(&mut self.transcript, self.epoch);
    }
}

/// Drives the transcript and reconciler against a [`CouncilBackend`].
///
/// The state lock is never held across a backend call; every await happens
/// between short critical sections, and each section ends by publishing a
/// fresh [`ChatViewState`].
pub struct ChatController {
    backend: Arc<dyn CouncilBackend>,
    state: Mutex<ControllerState>,
    view_tx: watch::Sender<ChatViewState>,
}

impl ChatController {
    pub fn new(backend: Arc<dyn CouncilBackend>) -> Self {
        let (view_tx, _view_rx) = watch::channel(ChatViewState::default());
        Self {
            backend,
            state: Mutex::new(ControllerState::default()),
            view_tx,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<ChatViewState> {
        self.view_tx.subscribe()
    }

    /// Latest published view.
    pub fn state(&self) -> ChatViewState {
        self.view_tx.borrow().clone()
    }

    /// Reloads the conversation index. On failure the previous list stays.
    pub async fn refresh_conversations(&self) -> ChatResult<()> {
        let conversations = self
            .backend
            .list_conversations()
            .await
            .inspect_err(|error| tracing::error!(%error, "failed to load conversations"))
            .context(FetchFailedSnafu {
                stage: "list-conversations",
                entity: "conversation list",
            })?;

        let mut state = self.state.lock().await;
        tracing::debug!(count = conversations.len(), "conversation index refreshed");
        state.conversations = conversations;
        self.publish(&state);
        Ok(())
    }

    /// Makes `conversation_id` active and loads its transcript.
    ///
    /// Any live turn is superseded before the fetch starts; a snapshot that
    /// arrives after the user moved on again is dropped.
    pub async fn select_conversation(&self, conversation_id: ConversationId) -> ChatResult<()> {
        let epoch = {
            let mut state = self.state.lock().await;
            // A failed load leaves the id active without its transcript; retry then.
            if state.active_conversation_id.as_ref() == Some(&conversation_id)
                && state.transcript.conversation_id() == Some(&conversation_id)
            {
                return Ok(());
            }
            tracing::info!(%conversation_id, "conversation selected");
            state.activate(conversation_id.clone());
            self.publish(&state);
            state.epoch
        };
        self.load_conversation(&conversation_id, epoch).await
    }

    /// Creates a conversation, prepends it to the index and opens it.
    pub async fn create_conversation(&self) -> ChatResult<ConversationId> {
        let conversation = self
            .backend
            .create_conversation()
            .await
            .inspect_err(|error| tracing::error!(%error, "failed to create conversation"))
            .context(FetchFailedSnafu {
                stage: "create-conversation",
                entity: "new conversation",
            })?;

        let conversation_id = conversation.id.clone();
        let mut state = self.state.lock().await;
        state
            .conversations
            .retain(|summary| summary.id != conversation_id);
        state.conversations.insert(0, conversation.summary());
        state.activate(conversation_id.clone());
        state.transcript.load(conversation);
        tracing::info!(%conversation_id, "conversation created");
        self.publish(&state);
        Ok(conversation_id)
    }

    /// Runs one user turn to its end.
    ///
    /// Returns `Skipped` when the input was not accepted, and an error when the
    /// stream failed to open or the turn was rolled back.
    pub async fn send_message(&self, content: &str) -> ChatResult<TurnOutcome> {
        let Some(target) = self.begin_turn(content).await else {
            return Ok(TurnOutcome::Skipped);
        };

        let opened = self
            .backend
            .send_message_stream(&target.conversation_id, content)
            .await;
        let TurnStreamHandle { mut stream, worker } = match opened {
            Ok(handle) => handle,
            Err(source) => {
                tracing::error!(
                    conversation_id = %target.conversation_id,
                    error = %source,
                    "failed to open turn stream"
                );
                self.roll_back_open(&target, format!("Failed to send message: {source}"))
                    .await;
                return Err(ChatError::StreamOpenFailed {
                    stage: "open-turn-stream",
                    conversation_id: target.conversation_id,
                    source,
                });
            }
        };
        tokio::spawn(worker);

        let mut resolution = None;
        while let Some(event) = stream.recv().await {
            if resolution.is_some() {
                tracing::trace!(
                    session_id = target.session_id.0,
                    kind = %event.kind.name(),
                    "dropping event for a settled turn"
                );
                continue;
            }
            let follow_up = self.apply_event(&target, event, &mut resolution).await;
            self.run_follow_up(&target, follow_up).await;
        }

        let resolution = match resolution {
            Some(resolution) => resolution,
            None => self.close_turn(&target).await,
        };
        match resolution {
            TurnResolution::Completed => Ok(TurnOutcome::Completed),
            TurnResolution::Superseded => Ok(TurnOutcome::Superseded),
            TurnResolution::Failed(message) => Err(ChatError::StreamError {
                stage: "apply-turn-event",
                conversation_id: target.conversation_id,
                message,
            }),
        }
    }

    async fn begin_turn(&self, content: &str) -> Option<SessionTarget> {
        let mut state = self.state.lock().await;
        let Some(conversation_id) = state.active_conversation_id.clone() else {
            tracing::debug!("no active conversation; submission ignored");
            return None;
        };
        if state.busy() {
            tracing::debug!(%conversation_id, "turn already running; submission ignored");
            return None;
        }

        let epoch = state.epoch;
        let begun = {
            let ControllerState {
                transcript,
                reconciler,
                ..
            } = &mut *state;
            reconciler.begin(transcript, conversation_id, epoch, content)
        };
        match begun {
            Ok(target) => {
                state.notice = None;
                self.publish(&state);
                Some(target)
            }
            Err(rejection) => {
                tracing::debug!(?rejection, "submission not accepted");
                None
            }
        }
    }

    async fn roll_back_open(&self, target: &SessionTarget, notice: String) {
        let mut state = self.state.lock().await;
        let epoch = state.epoch;
        let rolled_back = {
            let ControllerState {
                transcript,
                reconciler,
                ..
            } = &mut *state;
            reconciler.fail_open(transcript, target, epoch, notice.clone())
        };
        match rolled_back {
            Ok(_) => state.notice = Some(notice),
            Err(rejection) => {
                tracing::debug!(?rejection, "open failure arrived for an inactive turn")
            }
        }
        self.publish(&state);
    }

    async fn apply_event(
        &self,
        target: &SessionTarget,
        event: StreamEvent,
        resolution: &mut Option<TurnResolution>,
    ) -> FollowUp {
        let mut state = self.state.lock().await;
        let epoch = state.epoch;
        let kind = event.kind.clone();
        let applied = {
            let ControllerState {
                transcript,
                reconciler,
                ..
            } = &mut *state;
            reconciler.apply(transcript, target, epoch, event)
        };

        let follow_up = match applied {
            Ok(EventOutcome::Applied { follow_up, .. }) => follow_up,
            Ok(EventOutcome::Ignored { .. }) => FollowUp::NONE,
            Ok(EventOutcome::Completed { follow_up }) => {
                tracing::info!(
                    conversation_id = %target.conversation_id,
                    session_id = target.session_id.0,
                    "turn completed"
                );
                if follow_up.reload_conversation {
                    state.finalizing = Some(target.epoch);
                }
                *resolution = Some(TurnResolution::Completed);
                follow_up
            }
            Ok(EventOutcome::Errored { message }) => {
                tracing::warn!(
                    conversation_id = %target.conversation_id,
                    session_id = target.session_id.0,
                    %message,
                    "turn failed"
                );
                state.notice = Some(message.clone());
                *resolution = Some(TurnResolution::Failed(message));
                FollowUp::NONE
            }
            Err(
                ReconcileRejection::Stale { .. }
                | ReconcileRejection::NoActiveSession
                | ReconcileRejection::SessionMismatch { .. },
            ) => {
                tracing::debug!(
                    session_id = target.session_id.0,
                    kind = %kind.name(),
                    "turn no longer active; discarding the rest of its stream"
                );
                *resolution = Some(TurnResolution::Superseded);
                FollowUp::NONE
            }
            Err(rejection) => {
                tracing::warn!(?rejection, kind = %kind.name(), "stream event rejected");
                FollowUp::NONE
            }
        };
        self.publish(&state);
        follow_up
    }

    async fn run_follow_up(&self, target: &SessionTarget, follow_up: FollowUp) {
        if follow_up.reload_index {
            // Failure is logged and leaves the previous index in place.
            let _ = self.refresh_conversations().await;
        }
        if !follow_up.reload_conversation {
            return;
        }

        let reloaded = self
            .load_conversation(&target.conversation_id, target.epoch)
            .await;
        let mut state = self.state.lock().await;
        if state.finalizing == Some(target.epoch) {
            state.finalizing = None;
        }
        if reloaded.is_err() && state.epoch == target.epoch {
            // The stream is over, so nothing will clear stages it left open.
            state
                .transcript
                .mutate_last_assistant(|draft| draft.loading = StageLoading::default());
            state.transcript.drop_last_assistant_if_blank();
        }
        self.publish(&state);
    }

    async fn close_turn(&self, target: &SessionTarget) -> TurnResolution {
        let mut state = self.state.lock().await;
        let epoch = state.epoch;
        let closed = {
            let ControllerState {
                transcript,
                reconciler,
                ..
            } = &mut *state;
            reconciler.stream_closed(transcript, target, epoch)
        };
        let resolution = match closed {
            Ok(EventOutcome::Errored { message }) => {
                tracing::warn!(
                    conversation_id = %target.conversation_id,
                    session_id = target.session_id.0,
                    "turn stream closed without a terminal event"
                );
                state.notice = Some(message.clone());
                TurnResolution::Failed(message)
            }
            Ok(_) | Err(_) => TurnResolution::Superseded,
        };
        self.publish(&state);
        resolution
    }

    async fn load_conversation(
        &self,
        conversation_id: &ConversationId,
        epoch: ConversationEpoch,
    ) -> ChatResult<()> {
        let conversation = self
            .backend
            .get_conversation(conversation_id)
            .await
            .inspect_err(|error| {
                tracing::error!(%conversation_id, %error, "failed to load conversation")
            })
            .context(FetchFailedSnafu {
                stage: "get-conversation",
                entity: "conversation",
            })?;

        let mut state = self.state.lock().await;
        if state.epoch != epoch {
            tracing::debug!(%conversation_id, "discarding snapshot of an inactive conversation");
            return Ok(());
        }
        if state.reconciler.busy() {
            tracing::debug!(%conversation_id, "turn in flight; snapshot not applied");
            return Ok(());
        }
        state.transcript.load(conversation);
        self.publish(&state);
        Ok(())
    }

    fn publish(&self, state: &ControllerState) {
        self.view_tx.send_replace(state.view());
    }
}
