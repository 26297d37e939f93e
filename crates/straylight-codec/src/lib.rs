//! # straylight-codec
//!
//! The first two transformation stages of the straylight pipeline:
//!
//! - [`dialect`] - bijective translation between the message-oriented
//!   client dialect and the OpenAI-family chat-completion shape, with
//!   lenient tool-argument parsing on the response path;
//! - [`detect`] - a pure structural classifier so the runner can dispatch
//!   unlabeled payloads;
//! - [`protocol`] - stream/non-stream conversion, structural validation,
//!   and chunk aggregation.
//!
//! All work here is computational; nothing in this crate suspends or
//! touches the network.

pub mod detect;
pub mod dialect;
pub mod protocol;

pub use detect::{PayloadFormat, classify};
pub use dialect::{map_finish_reason, request_to_chat, response_to_messages};
pub use protocol::ProtocolController;
