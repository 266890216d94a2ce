//! Minimal MIME model used by the relay.
//!
//! Parsing never normalizes: whatever the transform engine does not touch is
//! written back out byte-for-byte.

pub mod encoding;
pub mod header;
pub mod part;

pub use encoding::TransferEncoding;
pub use header::{Header, Headers, LineEnding, MimeField};
pub use part::{Body, Part};
