use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::chat::message::StageSlot;

/// Kind tag of one staged event, as carried in the wire `type` field.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum StreamEventKind {
    StageStart(StageSlot),
    StageComplete(StageSlot),
    TitleComplete,
    Complete,
    Error,
    /// Anything the client does not recognize; kept verbatim for logging.
    Unknown(String),
}

impl StreamEventKind {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "title_complete" => Self::TitleComplete,
            "complete" => Self::Complete,
            "error" => Self::Error,
            _ => Self::parse_stage(raw).unwrap_or_else(|| Self::Unknown(raw.to_string())),
        }
    }

    fn parse_stage(raw: &str) -> Option<Self> {
        let rest = raw.strip_prefix("stage")?;
        let (number, phase) = rest.split_once('_')?;
        let slot = match number {
            "1" => StageSlot::Stage1,
            "2" => StageSlot::Stage2,
            "3" => StageSlot::Stage3,
            _ => return None,
        };
        match phase {
            "start" => Some(Self::StageStart(slot)),
            "complete" => Some(Self::StageComplete(slot)),
            _ => None,
        }
    }

    pub fn name(&self) -> String {
        match self {
            Self::StageStart(slot) => format!("stage{}_start", slot.number()),
            Self::StageComplete(slot) => format!("stage{}_complete", slot.number()),
            Self::TitleComplete => "title_complete".to_string(),
            Self::Complete => "complete".to_string(),
            Self::Error => "error".to_string(),
            Self::Unknown(raw) => raw.clone(),
        }
    }

    /// Returns true for the kinds that end a turn.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Error)
    }
}

impl From<String> for StreamEventKind {
    fn from(value: String) -> Self {
        Self::parse(&value)
    }
}

impl From<StreamEventKind> for String {
    fn from(value: StreamEventKind) -> Self {
        value.name()
    }
}

/// Opaque event body. Which fields are present depends on the kind.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamEventPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// One staged event of an in-flight turn, in the shape of a single SSE frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    #[serde(rename = "type")]
    pub kind: StreamEventKind,
    #[serde(flatten)]
    pub payload: StreamEventPayload,
}

impl StreamEvent {
    pub fn new(kind: StreamEventKind, payload: StreamEventPayload) -> Self {
        Self { kind, payload }
    }

    pub fn from_json(raw: &str) -> serde_json::Result<Self> {
        serde_json::from_str(raw)
    }

    pub fn stage_start(slot: StageSlot) -> Self {
        Self::new(StreamEventKind::StageStart(slot), StreamEventPayload::default())
    }

    pub fn stage_complete(slot: StageSlot, data: Value) -> Self {
        Self::new(
            StreamEventKind::StageComplete(slot),
            StreamEventPayload {
                data: Some(data),
                ..StreamEventPayload::default()
            },
        )
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.payload.metadata = Some(metadata);
        self
    }

    pub fn title_complete(data: Value) -> Self {
        Self::new(
            StreamEventKind::TitleComplete,
            StreamEventPayload {
                data: Some(data),
                ..StreamEventPayload::default()
            },
        )
    }

    pub fn complete() -> Self {
        Self::new(StreamEventKind::Complete, StreamEventPayload::default())
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(
            StreamEventKind::Error,
            StreamEventPayload {
                message: Some(message.into()),
                ..StreamEventPayload::default()
            },
        )
    }
}

/// Out-of-band work an applied event asks the controller to perform.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct FollowUp {
    pub reload_index: bool,
    pub reload_conversation: bool,
}

impl FollowUp {
    pub const NONE: Self = Self {
        reload_index: false,
        reload_conversation: false,
    };
    pub const RELOAD_INDEX: Self = Self {
        reload_index: true,
        reload_conversation: false,
    };
    pub const RELOAD_ALL: Self = Self {
        reload_index: true,
        reload_conversation: true,
    };

    pub fn is_none(&self) -> bool {
        !self.reload_index && !self.reload_conversation
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn every_wire_kind_parses_and_prints_back() {
        let names = [
            "stage1_start",
            "stage1_complete",
            "stage2_start",
            "stage2_complete",
            "stage3_start",
            "stage3_complete",
            "title_complete",
            "complete",
            "error",
        ];

        for name in names {
            let kind = StreamEventKind::parse(name);
            assert!(
                !matches!(kind, StreamEventKind::Unknown(_)),
                "{name} should be recognized"
            );
            assert_eq!(kind.name(), name);
        }
    }

    #[test]
    fn unrecognized_kinds_are_kept_verbatim() {
        for name in [
            "stage4_start",
            "stage1_progress",
            "stage_start",
            "stage01_start",
            "stage+1_start",
            "stage 1_complete",
            "ping",
            "",
        ] {
            assert_eq!(
                StreamEventKind::parse(name),
                StreamEventKind::Unknown(name.to_string())
            );
        }
    }

    #[test]
    fn sse_frame_decodes_into_event() {
        let event = StreamEvent::from_json(
            r#"{"type":"stage2_complete","data":[{"model":"phi3"}],"metadata":{"aggregate_rankings":[]}}"#,
        )
        .expect("frame should decode");

        assert_eq!(event.kind, StreamEventKind::StageComplete(StageSlot::Stage2));
        assert_eq!(event.payload.data, Some(json!([{ "model": "phi3" }])));
        assert_eq!(
            event.payload.metadata,
            Some(json!({ "aggregate_rankings": [] }))
        );

        let error = StreamEvent::from_json(r#"{"type":"error","message":"boom"}"#)
            .expect("error frame should decode");
        assert!(error.kind.is_terminal());
        assert_eq!(error.payload.message.as_deref(), Some("boom"));
    }

    #[test]
    fn follow_up_constants_describe_reload_work() {
        assert!(FollowUp::NONE.is_none());
        assert!(FollowUp::RELOAD_INDEX.reload_index);
        assert!(!FollowUp::RELOAD_INDEX.reload_conversation);
        assert!(FollowUp::RELOAD_ALL.reload_conversation);
    }
}
