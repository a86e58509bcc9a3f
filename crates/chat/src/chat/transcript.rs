use std::sync::Arc;

use chrono::Utc;

use crate::chat::message::{AssistantMessage, Conversation, ConversationId, Message, MessageId, Role};

/// Read model handed to the renderer after every mutation.
///
/// `None` until a conversation has been loaded.
pub type TranscriptSnapshot = Option<Arc<Conversation>>;

/// Explicit address of the draft created by [`TranscriptStore::append_assistant_draft`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DraftHandle {
    pub index: usize,
    pub message_id: MessageId,
}

/// Rejection reason for transcript mutations that did not happen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranscriptRejection {
    NoConversation,
    EmptyContent,
    DraftMismatch { handle: DraftHandle },
}

/// Normalized transcript of the one open conversation.
///
/// Snapshots are shared copy-on-write, so handing one to the renderer never
/// blocks the next mutation.
#[derive(Debug, Default)]
pub struct TranscriptStore {
    conversation: Option<Arc<Conversation>>,
    next_message_id: u64,
}

impl TranscriptStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> TranscriptSnapshot {
        self.conversation.clone()
    }

    pub fn conversation_id(&self) -> Option<&ConversationId> {
        self.conversation
            .as_ref()
            .map(|conversation| &conversation.id)
    }

    pub fn messages(&self) -> &[Message] {
        self.conversation
            .as_ref()
            .map(|conversation| conversation.messages.as_slice())
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.messages().is_empty()
    }

    /// Replaces the whole transcript with a server snapshot.
    ///
    /// Nothing local survives, optimistic messages included.
    pub fn load(&mut self, mut conversation: Conversation) -> TranscriptSnapshot {
        for message in &mut conversation.messages {
            message.id = self.alloc_message_id();
        }
        tracing::debug!(
            conversation_id = %conversation.id,
            message_count = conversation.messages.len(),
            "loaded transcript snapshot"
        );
        self.conversation = Some(Arc::new(conversation));
        self.snapshot()
    }

    /// Appends an immutable user message; blank content is rejected untouched.
    pub fn append_user(&mut self, content: &str) -> Result<TranscriptSnapshot, TranscriptRejection> {
        if content.trim().is_empty() {
            return Err(TranscriptRejection::EmptyContent);
        }
        let id = self.alloc_message_id();
        let conversation = self.conversation_mut()?;
        conversation
            .messages
            .push(Message::user(id, content, Utc::now()));
        Ok(self.snapshot())
    }

    /// Appends an empty assistant draft and returns its handle.
    pub fn append_assistant_draft(&mut self) -> Result<DraftHandle, TranscriptRejection> {
        let message_id = self.alloc_message_id();
        let conversation = self.conversation_mut()?;
        conversation
            .messages
            .push(Message::assistant_draft(message_id, Utc::now()));
        Ok(DraftHandle {
            index: conversation.messages.len() - 1,
            message_id,
        })
    }

    /// Applies `mutate` to the last message iff it is an assistant message.
    pub fn mutate_last_assistant<F>(&mut self, mutate: F) -> TranscriptSnapshot
    where
        F: FnOnce(&mut AssistantMessage),
    {
        // Role check first so a no-op never forces a copy-on-write clone.
        if self.last_role() == Some(Role::Assistant)
            && let Some(draft) = self.last_assistant_mut()
        {
            mutate(draft);
        }
        self.snapshot()
    }

    /// Applies `mutate` to the draft only while it is still the trailing message.
    pub fn mutate_draft<F>(
        &mut self,
        handle: DraftHandle,
        mutate: F,
    ) -> Result<TranscriptSnapshot, TranscriptRejection>
    where
        F: FnOnce(&mut AssistantMessage),
    {
        if !self.draft_is_last(handle) {
            return Err(TranscriptRejection::DraftMismatch { handle });
        }
        Ok(self.mutate_last_assistant(mutate))
    }

    /// Removes the draft only while it is still the trailing message.
    pub fn drop_draft(
        &mut self,
        handle: DraftHandle,
    ) -> Result<TranscriptSnapshot, TranscriptRejection> {
        if !self.draft_is_last(handle) {
            return Err(TranscriptRejection::DraftMismatch { handle });
        }
        Ok(self.drop_last_assistant_if_present())
    }

    /// Removes the trailing message iff it is an assistant message.
    pub fn drop_last_assistant_if_present(&mut self) -> TranscriptSnapshot {
        if self.last_role() == Some(Role::Assistant)
            && let Ok(conversation) = self.conversation_mut()
        {
            conversation.messages.pop();
        }
        self.snapshot()
    }

    /// Removes the trailing assistant message only when nothing was ever recorded on it.
    pub fn drop_last_assistant_if_blank(&mut self) -> TranscriptSnapshot {
        let blank = self
            .messages()
            .last()
            .and_then(Message::as_assistant)
            .is_some_and(AssistantMessage::is_blank);
        if blank {
            return self.drop_last_assistant_if_present();
        }
        self.snapshot()
    }

    /// Removes every non-user message among the trailing two.
    ///
    /// Used when a turn could not be dispatched at all: the placeholder goes,
    /// the submitted text stays visible.
    pub fn drop_last_assistant_and_user(&mut self) -> TranscriptSnapshot {
        if let Ok(conversation) = self.conversation_mut() {
            let keep_before = conversation.messages.len().saturating_sub(2);
            let mut index = 0;
            conversation.messages.retain(|message| {
                let keep = index < keep_before || message.role() == Role::User;
                index += 1;
                keep
            });
        }
        self.snapshot()
    }

    fn draft_is_last(&self, handle: DraftHandle) -> bool {
        let messages = self.messages();
        messages.len() == handle.index + 1
            && messages.last().is_some_and(|message| {
                message.id == handle.message_id && message.role() == Role::Assistant
            })
    }

    fn last_role(&self) -> Option<Role> {
        self.messages().last().map(Message::role)
    }

    fn last_assistant_mut(&mut self) -> Option<&mut AssistantMessage> {
        self.conversation_mut()
            .ok()?
            .messages
            .last_mut()?
            .as_assistant_mut()
    }

    fn conversation_mut(&mut self) -> Result<&mut Conversation, TranscriptRejection> {
        self.conversation
            .as_mut()
            .map(Arc::make_mut)
            .ok_or(TranscriptRejection::NoConversation)
    }

    fn alloc_message_id(&mut self) -> MessageId {
        self.next_message_id = self.next_message_id.saturating_add(1);
        MessageId::new(self.next_message_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::message::{ConversationId, StageSlot};
    use serde_json::json;

    fn conversation_with(id: &str, messages: Vec<Message>) -> Conversation {
        let mut conversation = Conversation::new(ConversationId::new(id));
        conversation.messages = messages;
        conversation
    }

    fn loaded_store() -> TranscriptStore {
        let mut store = TranscriptStore::new();
        store.load(conversation_with("c-1", Vec::new()));
        store
    }

    fn roles(store: &TranscriptStore) -> Vec<Role> {
        store.messages().iter().map(Message::role).collect()
    }

    #[test]
    fn loading_same_snapshot_twice_is_idempotent() {
        let snapshot = conversation_with(
            "c-1",
            vec![
                Message::user(MessageId::default(), "Hi", Utc::now()),
                Message::assistant_draft(MessageId::default(), Utc::now()),
            ],
        );
        let mut store = TranscriptStore::new();

        let first = store.load(snapshot.clone()).expect("loaded");
        let first_bodies = first
            .messages
            .iter()
            .map(|message| message.body.clone())
            .collect::<Vec<_>>();
        let second = store.load(snapshot).expect("loaded");
        let second_bodies = second
            .messages
            .iter()
            .map(|message| message.body.clone())
            .collect::<Vec<_>>();

        assert_eq!(first.id, second.id);
        assert_eq!(first.title, second.title);
        assert_eq!(first_bodies, second_bodies);
    }

    #[test]
    fn load_discards_optimistic_messages() {
        let mut store = loaded_store();
        store.append_user("Hi").expect("appended");
        store.append_assistant_draft().expect("appended");

        store.load(conversation_with("c-1", Vec::new()));

        assert!(store.is_empty());
    }

    #[test]
    fn blank_user_content_is_rejected_without_mutation() {
        let mut store = loaded_store();

        assert_eq!(store.append_user(""), Err(TranscriptRejection::EmptyContent));
        assert_eq!(
            store.append_user(" \n\t "),
            Err(TranscriptRejection::EmptyContent)
        );
        assert!(store.is_empty());
    }

    #[test]
    fn mutations_without_conversation_are_rejected() {
        let mut store = TranscriptStore::new();

        assert_eq!(
            store.append_user("Hi"),
            Err(TranscriptRejection::NoConversation)
        );
        assert_eq!(
            store.append_assistant_draft(),
            Err(TranscriptRejection::NoConversation)
        );
        assert!(store.drop_last_assistant_if_present().is_none());
    }

    #[test]
    fn draft_handle_addresses_trailing_message() {
        let mut store = loaded_store();
        store.append_user("Hi").expect("appended");
        let handle = store.append_assistant_draft().expect("appended");

        assert_eq!(handle.index, 1);
        store
            .mutate_draft(handle, |draft| draft.start_stage(StageSlot::Stage1))
            .expect("draft is last");

        let draft = store.messages()[1].as_assistant().expect("assistant");
        assert!(draft.loading.stage1);
    }

    #[test]
    fn drop_draft_only_removes_the_addressed_draft() {
        let mut store = loaded_store();
        store.append_user("Hi").expect("appended");
        let handle = store.append_assistant_draft().expect("appended");
        store.append_user("later").expect("appended");

        assert!(store.drop_draft(handle).is_err());
        assert_eq!(store.messages().len(), 3);

        let mut store = loaded_store();
        store.append_user("Hi").expect("appended");
        let handle = store.append_assistant_draft().expect("appended");
        store.drop_draft(handle).expect("draft is last");
        assert_eq!(store.messages().len(), 1);
    }

    #[test]
    fn stale_draft_handle_is_rejected() {
        let mut store = loaded_store();
        let handle = store.append_assistant_draft().expect("appended");
        store.append_user("later").expect("appended");

        let result = store.mutate_draft(handle, |draft| draft.start_stage(StageSlot::Stage1));

        assert_eq!(result, Err(TranscriptRejection::DraftMismatch { handle }));

        // A reloaded snapshot reassigns ids, so the old handle no longer matches either.
        let mut store = loaded_store();
        let handle = store.append_assistant_draft().expect("appended");
        store.load(conversation_with(
            "c-1",
            vec![Message::assistant_draft(MessageId::default(), Utc::now())],
        ));
        assert!(store.mutate_draft(handle, |_| {}).is_err());
    }

    #[test]
    fn mutate_last_assistant_ignores_trailing_user_message() {
        let mut store = loaded_store();
        store.append_user("Hi").expect("appended");
        let before = store.snapshot();

        let after = store.mutate_last_assistant(|draft| {
            draft.complete_stage(StageSlot::Stage1, Some(json!("x")), None)
        });

        assert_eq!(before, after);
    }

    #[test]
    fn drop_last_assistant_is_role_checked() {
        let mut store = loaded_store();
        store.append_user("Hi").expect("appended");

        store.drop_last_assistant_if_present();
        assert_eq!(roles(&store), vec![Role::User]);

        store.append_assistant_draft().expect("appended");
        store.drop_last_assistant_if_present();
        assert_eq!(roles(&store), vec![Role::User]);
    }

    #[test]
    fn dispatch_rollback_keeps_user_text() {
        let mut store = loaded_store();
        store.append_user("earlier").expect("appended");
        store.append_assistant_draft().expect("appended");
        store.append_user("Hi").expect("appended");
        store.append_assistant_draft().expect("appended");

        store.drop_last_assistant_and_user();

        assert_eq!(roles(&store), vec![Role::User, Role::Assistant, Role::User]);
    }

    #[test]
    fn blank_drop_keeps_drafts_with_progress() {
        let mut store = loaded_store();
        store.append_assistant_draft().expect("appended");
        store.mutate_last_assistant(|draft| {
            draft.complete_stage(StageSlot::Stage1, Some(json!("x")), None)
        });

        store.drop_last_assistant_if_blank();
        assert_eq!(roles(&store), vec![Role::Assistant]);

        store.append_assistant_draft().expect("appended");
        store.drop_last_assistant_if_blank();
        assert_eq!(roles(&store), vec![Role::Assistant]);
    }

    #[test]
    fn snapshots_are_not_affected_by_later_mutations() {
        let mut store = loaded_store();
        let before = store.snapshot().expect("loaded");

        store.append_user("Hi").expect("appended");

        assert!(before.messages.is_empty());
        assert_eq!(store.messages().len(), 1);
    }
}
