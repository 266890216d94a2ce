//! mail-relay: relays a broadcast mailbox to a ranked, revocable subscriber
//! list with per-recipient unsubscribe links.

pub mod channels;
pub mod config;
pub mod error;
pub mod logging;
pub mod mime;
pub mod pipeline;
pub mod signing;
pub mod store;
pub mod web;
