/// Staged event contracts and follow-up flags.
pub mod events;
/// Domain entities: conversations, messages, stage slots, session routing keys.
pub mod message;
/// Stream session state machine applying staged events to the transcript.
pub mod reconciler;
pub mod transcript;

pub use events::{FollowUp, StreamEvent, StreamEventKind, StreamEventPayload};
pub use message::{
    AssistantMessage, Conversation, ConversationEpoch, ConversationId, ConversationSummary,
    DEFAULT_CONVERSATION_TITLE, Message, MessageBody, MessageId, Role, SessionTarget, StageLoading,
    StageSlot, StreamSessionId, UserMessage,
};
pub use reconciler::{
    EventOutcome, ReconcileRejection, STREAM_ENDED_EARLY, SessionPhase, StreamReconciler,
};
pub use transcript::{DraftHandle, TranscriptRejection, TranscriptSnapshot, TranscriptStore};
