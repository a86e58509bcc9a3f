use crate::chat::events::{FollowUp, StreamEvent, StreamEventKind, StreamEventPayload};
use crate::chat::message::{
    AssistantMessage, ConversationEpoch, ConversationId, SessionTarget, StageSlot, StreamSessionId,
};
use crate::chat::transcript::{DraftHandle, TranscriptRejection, TranscriptStore};

/// Notice surfaced when the transport ends without a terminal event.
pub const STREAM_ENDED_EARLY: &str = "stream ended before a terminal event";

const DEFAULT_STREAM_ERROR: &str = "the council reported an error";

/// Lifecycle phase of the current (or most recent) stream session.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SessionPhase {
    #[default]
    Idle,
    Sending,
    Streaming,
    Completed,
    Errored {
        message: String,
    },
    Superseded,
}

impl SessionPhase {
    /// Live phases still own their draft and keep the UI busy.
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Sending | Self::Streaming)
    }
}

/// One streaming exchange and the draft it owns.
#[derive(Debug, Clone, PartialEq, Eq)]
struct StreamSession {
    target: SessionTarget,
    draft: DraftHandle,
    phase: SessionPhase,
}

/// Result of applying one accepted event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventOutcome {
    Applied {
        kind: StreamEventKind,
        follow_up: FollowUp,
    },
    Completed {
        follow_up: FollowUp,
    },
    Errored {
        message: String,
    },
    Ignored {
        kind: StreamEventKind,
    },
}

/// Why a request to the reconciler was refused without touching the transcript.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileRejection {
    AlreadyStreaming {
        active: SessionTarget,
    },
    EmptyContent,
    NoConversation,
    ConversationMismatch {
        expected: ConversationId,
    },
    NoActiveSession,
    /// The event belongs to a different session than the live one.
    SessionMismatch {
        active: SessionTarget,
        attempted: SessionTarget,
    },
    /// The active conversation changed since the session opened; the event was discarded.
    Stale {
        target: SessionTarget,
        live_epoch: ConversationEpoch,
    },
    NotSending,
}

/// Draft transformation one event kind maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DraftEffect {
    Untouched,
    StartStage(StageSlot),
    CompleteStage(StageSlot),
}

impl DraftEffect {
    fn apply(self, draft: &mut AssistantMessage, payload: &StreamEventPayload) {
        match self {
            Self::Untouched => {}
            Self::StartStage(slot) => draft.start_stage(slot),
            Self::CompleteStage(slot) => {
                draft.complete_stage(slot, payload.data.clone(), payload.metadata.clone())
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settlement {
    Open,
    Completed,
    Errored,
}

/// Table row: what one event kind does to the draft and the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct EventRule {
    effect: DraftEffect,
    follow_up: FollowUp,
    settlement: Settlement,
}

impl EventRule {
    const fn draft(effect: DraftEffect) -> Self {
        Self {
            effect,
            follow_up: FollowUp::NONE,
            settlement: Settlement::Open,
        }
    }

    fn for_kind(kind: &StreamEventKind) -> Option<Self> {
        let rule = match kind {
            StreamEventKind::StageStart(slot) => Self::draft(DraftEffect::StartStage(*slot)),
            StreamEventKind::StageComplete(slot) => {
                Self::draft(DraftEffect::CompleteStage(*slot))
            }
            StreamEventKind::TitleComplete => Self {
                effect: DraftEffect::Untouched,
                follow_up: FollowUp::RELOAD_INDEX,
                settlement: Settlement::Open,
            },
            StreamEventKind::Complete => Self {
                effect: DraftEffect::Untouched,
                follow_up: FollowUp::RELOAD_ALL,
                settlement: Settlement::Completed,
            },
            StreamEventKind::Error => Self {
                effect: DraftEffect::Untouched,
                follow_up: FollowUp::NONE,
                settlement: Settlement::Errored,
            },
            StreamEventKind::Unknown(_) => return None,
        };
        Some(rule)
    }
}

/// Applies the staged events of one in-flight turn to a [`TranscriptStore`].
///
/// Holds at most one live session. Every event is checked against the live
/// conversation epoch before it may touch the transcript; a session whose epoch
/// is behind becomes `Superseded` and never writes again.
#[derive(Debug)]
pub struct StreamReconciler {
    session: Option<StreamSession>,
    next_session_id: u64,
}

impl Default for StreamReconciler {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamReconciler {
    pub fn new() -> Self {
        Self {
            session: None,
            next_session_id: 1,
        }
    }

    /// Busy signal for the presentation layer: true while `Sending`/`Streaming`.
    pub fn busy(&self) -> bool {
        self.session
            .as_ref()
            .is_some_and(|session| session.phase.is_live())
    }

    pub fn phase(&self) -> SessionPhase {
        self.session
            .as_ref()
            .map(|session| session.phase.clone())
            .unwrap_or_default()
    }

    pub fn active_target(&self) -> Option<&SessionTarget> {
        self.live_session().map(|session| &session.target)
    }

    /// Accepts a user turn: appends the optimistic user message and the draft,
    /// then enters `Sending`.
    pub fn begin(
        &mut self,
        store: &mut TranscriptStore,
        conversation_id: ConversationId,
        epoch: ConversationEpoch,
        content: &str,
    ) -> Result<SessionTarget, ReconcileRejection> {
        if let Some(active) = self.live_session() {
            return Err(ReconcileRejection::AlreadyStreaming {
                active: active.target.clone(),
            });
        }
        match store.conversation_id() {
            None => return Err(ReconcileRejection::NoConversation),
            Some(loaded) if *loaded != conversation_id => {
                return Err(ReconcileRejection::ConversationMismatch {
                    expected: conversation_id,
                });
            }
            Some(_) => {}
        }

        store.append_user(content).map_err(|rejection| match rejection {
            TranscriptRejection::EmptyContent => ReconcileRejection::EmptyContent,
            TranscriptRejection::NoConversation | TranscriptRejection::DraftMismatch { .. } => {
                ReconcileRejection::NoConversation
            }
        })?;
        let draft = store
            .append_assistant_draft()
            .map_err(|_| ReconcileRejection::NoConversation)?;

        let target = SessionTarget::new(conversation_id, epoch, self.alloc_session_id());
        tracing::debug!(
            conversation_id = %target.conversation_id,
            session_id = target.session_id.0,
            epoch = target.epoch.0,
            "stream session sending"
        );
        self.session = Some(StreamSession {
            target: target.clone(),
            draft,
            phase: SessionPhase::Sending,
        });
        Ok(target)
    }

    /// Marks the live session `Superseded` if `live_epoch` moved past it and
    /// removes its draft, so no placeholder outlives the session that owned it.
    ///
    /// Returns true when this call superseded the session.
    pub fn observe_epoch(
        &mut self,
        store: &mut TranscriptStore,
        live_epoch: ConversationEpoch,
    ) -> bool {
        let Some(session) = self.live_session_mut() else {
            return false;
        };
        if session.target.epoch == live_epoch {
            return false;
        }
        tracing::info!(
            conversation_id = %session.target.conversation_id,
            session_id = session.target.session_id.0,
            session_epoch = session.target.epoch.0,
            live_epoch = live_epoch.0,
            "active conversation changed; stream session superseded"
        );
        session.phase = SessionPhase::Superseded;
        if let Err(rejection) = store.drop_draft(session.draft) {
            tracing::debug!(?rejection, "superseded draft already gone");
        }
        true
    }

    /// Applies one event in arrival order.
    pub fn apply(
        &mut self,
        store: &mut TranscriptStore,
        target: &SessionTarget,
        live_epoch: ConversationEpoch,
        event: StreamEvent,
    ) -> Result<EventOutcome, ReconcileRejection> {
        self.guard_live(store, target, live_epoch)?;
        let Some(session) = self.live_session_mut() else {
            return Err(ReconcileRejection::NoActiveSession);
        };
        if session.phase == SessionPhase::Sending {
            session.phase = SessionPhase::Streaming;
        }

        let Some(rule) = EventRule::for_kind(&event.kind) else {
            tracing::warn!(
                session_id = session.target.session_id.0,
                kind = %event.kind.name(),
                "ignoring unrecognized stream event"
            );
            return Ok(EventOutcome::Ignored { kind: event.kind });
        };

        let draft = session.draft;
        let session_id = session.target.session_id;
        if rule.effect != DraftEffect::Untouched
            && let Err(rejection) =
                store.mutate_draft(draft, |message| rule.effect.apply(message, &event.payload))
        {
            tracing::warn!(
                session_id = session_id.0,
                kind = %event.kind.name(),
                ?rejection,
                "draft is no longer the trailing message; event not applied"
            );
        }

        match rule.settlement {
            Settlement::Open => Ok(EventOutcome::Applied {
                kind: event.kind,
                follow_up: rule.follow_up,
            }),
            Settlement::Completed => {
                self.settle(SessionPhase::Completed);
                Ok(EventOutcome::Completed {
                    follow_up: rule.follow_up,
                })
            }
            Settlement::Errored => {
                let message = event
                    .payload
                    .message
                    .filter(|message| !message.trim().is_empty())
                    .unwrap_or_else(|| DEFAULT_STREAM_ERROR.to_string());
                Ok(self.fail(store, message))
            }
        }
    }

    /// Rolls back a turn whose stream could not be opened.
    ///
    /// Only valid while `Sending`: the draft goes, the user's text stays.
    pub fn fail_open(
        &mut self,
        store: &mut TranscriptStore,
        target: &SessionTarget,
        live_epoch: ConversationEpoch,
        message: impl Into<String>,
    ) -> Result<EventOutcome, ReconcileRejection> {
        self.guard_live(store, target, live_epoch)?;
        let Some(session) = self.live_session() else {
            return Err(ReconcileRejection::NoActiveSession);
        };
        if session.phase != SessionPhase::Sending {
            return Err(ReconcileRejection::NotSending);
        }
        store.drop_last_assistant_and_user();
        let message = message.into();
        self.settle(SessionPhase::Errored {
            message: message.clone(),
        });
        Ok(EventOutcome::Errored { message })
    }

    /// Handles the transport ending. A session still live at this point never
    /// saw a terminal event and is rolled back like a mid-stream error.
    pub fn stream_closed(
        &mut self,
        store: &mut TranscriptStore,
        target: &SessionTarget,
        live_epoch: ConversationEpoch,
    ) -> Result<EventOutcome, ReconcileRejection> {
        self.guard_live(store, target, live_epoch)?;
        if self.live_session().is_none() {
            return Err(ReconcileRejection::NoActiveSession);
        }
        Ok(self.fail(store, STREAM_ENDED_EARLY.to_string()))
    }

    fn fail(&mut self, store: &mut TranscriptStore, message: String) -> EventOutcome {
        store.drop_last_assistant_if_present();
        self.settle(SessionPhase::Errored {
            message: message.clone(),
        });
        EventOutcome::Errored { message }
    }

    // Staleness guard: runs before anything may touch the transcript.
    fn guard_live(
        &mut self,
        store: &TranscriptStore,
        target: &SessionTarget,
        live_epoch: ConversationEpoch,
    ) -> Result<(), ReconcileRejection> {
        let Some(session) = self.live_session_mut() else {
            return Err(ReconcileRejection::NoActiveSession);
        };
        if session.target != *target {
            // Output of an older turn must not reach the draft of a newer one.
            return Err(ReconcileRejection::SessionMismatch {
                active: session.target.clone(),
                attempted: target.clone(),
            });
        }
        let same_transcript = store.conversation_id() == Some(&session.target.conversation_id);
        if session.target.epoch == live_epoch && same_transcript {
            return Ok(());
        }
        let target = session.target.clone();
        session.phase = SessionPhase::Superseded;
        tracing::debug!(
            conversation_id = %target.conversation_id,
            session_id = target.session_id.0,
            session_epoch = target.epoch.0,
            live_epoch = live_epoch.0,
            "discarding stale stream event"
        );
        Err(ReconcileRejection::Stale { target, live_epoch })
    }

    fn settle(&mut self, phase: SessionPhase) {
        if let Some(session) = self.session.as_mut() {
            tracing::debug!(
                conversation_id = %session.target.conversation_id,
                session_id = session.target.session_id.0,
                ?phase,
                "stream session settled"
            );
            session.phase = phase;
        }
    }

    fn live_session(&self) -> Option<&StreamSession> {
        self.session
            .as_ref()
            .filter(|session| session.phase.is_live())
    }

    fn live_session_mut(&mut self) -> Option<&mut StreamSession> {
        self.session
            .as_mut()
            .filter(|session| session.phase.is_live())
    }

    fn alloc_session_id(&mut self) -> StreamSessionId {
        let id = StreamSessionId::new(self.next_session_id);
        self.next_session_id = self.next_session_id.saturating_add(1);
        id
    }
}
