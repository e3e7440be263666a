//! shuttle-core — wire format, token addressing, checksums and configuration.
//! The other Shuttle crates depend on this one.

pub mod checksum;
pub mod config;
pub mod token;
pub mod wire;

pub use token::{parse_token_id, token_id, Token};
pub use wire::{ConfirmResult, Confirmation, FileChunk, Message, RequestFile, Verb, WireError};
