use council_chat::ChatViewState;
use council_chat::chat::{
    AssistantMessage, Conversation, ConversationId, ConversationSummary, Message, MessageBody,
    MessageId, StageSlot,
};
use serde_json::Value;

const EXCERPT_CHARS: usize = 160;

pub fn stage_label(slot: StageSlot) -> &'static str {
    match slot {
        StageSlot::Stage1 => "individual responses",
        StageSlot::Stage2 => "peer rankings",
        StageSlot::Stage3 => "final synthesis",
    }
}

pub fn render_conversation_list(
    conversations: &[ConversationSummary],
    active: Option<&ConversationId>,
) -> String {
    if conversations.is_empty() {
        return "no conversations yet; /new starts one".to_string();
    }
    conversations
        .iter()
        .enumerate()
        .map(|(index, summary)| {
            let marker = if active == Some(&summary.id) { '*' } else { ' ' };
            format!(
                "{marker}{:>3}. {} ({} messages) [{}]",
                index + 1,
                summary.title,
                summary.message_count,
                summary.id
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn render_transcript(conversation: &Conversation) -> String {
    let mut out = format!("== {} ==", conversation.title);
    for message in &conversation.messages {
        out.push('\n');
        out.push_str(&render_message(message));
    }
    out
}

pub fn render_message(message: &Message) -> String {
    match &message.body {
        MessageBody::User(user) => format!("you> {}", user.content),
        MessageBody::Assistant(assistant) => render_assistant(assistant),
    }
}

pub fn render_assistant(assistant: &AssistantMessage) -> String {
    let mut lines = Vec::new();
    if let Some(entries) = assistant.stage(StageSlot::Stage1).and_then(Value::as_array) {
        lines.push(format!("  [{}]", stage_label(StageSlot::Stage1)));
        lines.extend(entries.iter().map(|entry| member_line(entry, "response")));
    }
    if let Some(entries) = assistant.stage(StageSlot::Stage2).and_then(Value::as_array) {
        lines.push(format!("  [{}]", stage_label(StageSlot::Stage2)));
        lines.extend(entries.iter().map(|entry| member_line(entry, "ranking")));
        if let Some(aggregate) = assistant
            .metadata
            .as_ref()
            .and_then(|metadata| metadata.get("aggregate_rankings"))
            .and_then(Value::as_array)
        {
            lines.extend(aggregate.iter().enumerate().map(|(place, entry)| {
                let model = entry.get("model").and_then(Value::as_str).unwrap_or("?");
                format!("    #{} {model}", place + 1)
            }));
        }
    }
    match assistant.stage(StageSlot::Stage3) {
        Some(chair) => {
            let model = chair.get("model").and_then(Value::as_str).unwrap_or("chair");
            let text = chair
                .get("response")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| chair.to_string());
            lines.push(format!("council ({model})> {text}"));
        }
        None if lines.is_empty() => lines.push("council> (no answer)".to_string()),
        None => {}
    }
    lines.join("\n")
}

fn member_line(entry: &Value, field: &str) -> String {
    let model = entry.get("model").and_then(Value::as_str).unwrap_or("?");
    let text = entry
        .get(field)
        .and_then(Value::as_str)
        .map(excerpt)
        .unwrap_or_else(|| excerpt(&entry.to_string()));
    format!("    {model}: {text}")
}

fn excerpt(text: &str) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= EXCERPT_CHARS {
        return flat;
    }
    let mut cut = flat.chars().take(EXCERPT_CHARS).collect::<String>();
    cut.push_str("...");
    cut
}

/// Turns successive view states into one-line progress notes for the live draft.
#[derive(Debug, Default)]
pub struct ProgressTracker {
    draft: Option<MessageId>,
    started: [bool; 3],
    completed: [bool; 3],
    notice: Option<String>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, view: &ChatViewState) -> Vec<String> {
        let mut lines = Vec::new();
        if view.notice != self.notice {
            if let Some(notice) = &view.notice {
                lines.push(format!("! {notice}"));
            }
            self.notice = view.notice.clone();
        }
        if !view.busy {
            return lines;
        }

        let Some(last) = view
            .transcript
            .as_ref()
            .and_then(|conversation| conversation.messages.last())
        else {
            return lines;
        };
        let Some(draft) = last.as_assistant() else {
            return lines;
        };
        if self.draft != Some(last.id) {
            self.draft = Some(last.id);
            self.started = [false; 3];
            self.completed = [false; 3];
        }

        for (index, slot) in StageSlot::ALL.into_iter().enumerate() {
            if draft.loading.get(slot) && !self.started[index] {
                self.started[index] = true;
                lines.push(format!(
                    "  stage {}: {}...",
                    slot.number(),
                    stage_label(slot)
                ));
            }
            if draft.stage(slot).is_some() && !self.completed[index] {
                self.completed[index] = true;
                lines.push(format!("  stage {}: done", slot.number()));
            }
        }
        lines
    }
}
