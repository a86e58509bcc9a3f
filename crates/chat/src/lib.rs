#![deny(unsafe_code)]

/// Client-side core of the council chat.
///
/// The transcript store and stream reconciler keep one open conversation in sync
/// with a staged, streamed council reply; the controller wires them to a
/// [`CouncilBackend`] and publishes a read model for whatever renders it.
pub mod backend;
/// Chat domain contracts shared across the workspace.
pub mod chat;
pub mod controller;
pub mod error;

pub use backend::{
    BackendError, BackendResult, BoxFuture, CouncilBackend, TurnEventStream, TurnStreamHandle,
    TurnWorker, make_turn_stream,
};
pub use controller::{ChatController, ChatViewState, TurnOutcome};
pub use error::{ChatError, ChatResult};
