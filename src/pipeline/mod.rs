//! Message pipeline.
//!
//! Every message listed in the source mailbox goes through:
//! 1. `Classifier::classify()`: cursor check, bounce, allowlist, test probe
//! 2. One of: bounce processing, a test-probe reply, or a broadcast through
//!    `TransformEngine` and the throttled outbound transport
//! 3. `RelayStore::commit_message()`: cursor and roster changes in one
//!    transaction
//!
//! `Relay::run_pass()` drives a whole mailbox through these steps once.

pub mod bounce;
pub mod classifier;
pub mod images;
pub mod relay;
pub mod throttle;
pub mod transform;
pub mod types;

pub use classifier::Classifier;
pub use relay::Relay;
pub use throttle::Throttler;
pub use transform::TransformEngine;
pub use types::{Classification, InboundMessage, MessageOutcome, PassReport};
