#![deny(unsafe_code)]

/// HTTP implementation of the council backend.
pub mod error;
pub mod http;
/// Line decoder for the turn event stream.
pub mod sse;

pub use error::{ClientError, ClientResult};
pub use http::{ClientConfig, DEFAULT_BASE_URL, HttpCouncilBackend, normalize_base_url};
pub use sse::SseDecoder;
