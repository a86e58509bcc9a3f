#![deny(unsafe_code)]

/// Terminal shell input parsing.
pub mod command;
pub mod render;
/// Persisted client settings.
pub mod settings;
