use snafu::Snafu;

use crate::backend::BackendError;
use crate::chat::ConversationId;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ChatError {
    #[snafu(display("failed to fetch {entity} on `{stage}`: {source}"))]
    FetchFailed {
        stage: &'static str,
        entity: &'static str,
        source: BackendError,
    },
    #[snafu(display(
        "failed to open turn stream for conversation {conversation_id} on `{stage}`: {source}"
    ))]
    StreamOpenFailed {
        stage: &'static str,
        conversation_id: ConversationId,
        source: BackendError,
    },
    #[snafu(display("turn stream for conversation {conversation_id} failed: {message}"))]
    StreamError {
        stage: &'static str,
        conversation_id: ConversationId,
        message: String,
    },
}

pub type ChatResult<T> = Result<T, ChatError>;
