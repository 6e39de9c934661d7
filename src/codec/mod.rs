//! The wire envelope and its encryption/signature layer.

mod envelope;
mod wire;

pub use envelope::{open, seal, EnvelopeError};
pub use wire::{MessageType, WireMessage};
