//! Codex event sources.
//!
//! Implements the [`pipeline::EventSource`] trait with two backends:
//!
//! - [`NdjsonEventSource`] reads one delivery envelope per line from any
//!   async reader: a replay file, stdin, or a pipe from a webhook relay.
//! - [`ChannelEventSource`] receives deliveries from an in-process
//!   [`DeliverySender`]; used by embedders and tests.
//!
//! ## Envelope format
//!
//! ```json
//! {"delivery_id": "abc-1", "event": "pull_request", "payload": {...}}
//! ```
//!
//! `received_at` (RFC 3339) is optional and defaults to the time the line
//! was read.
//!
//! ## Architectural Layer
//!
//! **Infrastructure.** Framing and transport details live here. The
//! [`pipeline`] crate sees only [`pipeline::EventSource`] and
//! [`pipeline::Delivery`].

mod channel;
mod ndjson;

pub use channel::{channel, ChannelEventSource, DeliverySender};
pub use ndjson::NdjsonEventSource;
