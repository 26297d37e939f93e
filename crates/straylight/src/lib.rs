//! # straylight
//!
//! A protocol-translating reverse proxy core for AI chat providers.
//!
//! Requests arrive in a message-oriented client dialect, are routed to a
//! concrete upstream, and pass through a sealed four-stage pipeline
//! (validator -> dialect codec -> protocol controller -> server-compat
//! adapter -> upstream client); the upstream's reply traverses the same
//! stages in reverse. Requests within one conversation are strictly
//! serial; conversations run in parallel up to a configured worker bound.
//!
//! ```no_run
//! use straylight::{CancelSignal, ProxyCore};
//! use straylight_common::CoreConfig;
//! use straylight_common::messages::{ClientMessage, ClientRole, MessagesRequest};
//!
//! # async fn example(config: CoreConfig) -> Result<(), Box<dyn std::error::Error>> {
//! let core = ProxyCore::assemble(config)?;
//! core.start().await?;
//!
//! let request = MessagesRequest::builder()
//!     .model("claude-3-5-sonnet".to_string())
//!     .messages(vec![ClientMessage::text(ClientRole::User, "Hello")])
//!     .build();
//!
//! let reply = core
//!     .handle(request, "session-1", "conversation-1", CancelSignal::never(), None)
//!     .await;
//! # let _ = reply;
//! # Ok(())
//! # }
//! ```

pub mod core;
pub mod flow;
pub mod management;

pub use crate::core::ProxyCore;
pub use crate::flow::{CancelHandle, CancelSignal, FlowController, cancel_pair};
pub use crate::management::{PipelineHealth, PipelineStatsView, PipelineStatusView};
