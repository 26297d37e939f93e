//! # straylight-compat
//!
//! Server-compatibility adapters: the stage between the protocol
//! controller and the upstream client that absorbs per-provider quirks.
//!
//! One [`CompatAdapter`] per provider family, built once from its provider
//! record and sealed. Each adapter owns three concerns:
//!
//! - **request policy** - parameter clamping, tool-format normalization,
//!   model-label resolution ([`generic`], [`deepseek`], [`lmstudio`],
//!   [`ollama`], [`vllm`], [`iflow`], [`gemini`]);
//! - **response repair** - deterministic completion of missing response
//!   fields into the canonical chat-completion shape ([`repair`]);
//! - **error normalization** - mapping upstream failures onto the shared
//!   taxonomy with clear phrasings ([`errors`]).
//!
//! Every lossy or defaulting rewrite is appended to the pipeline
//! context's transformations log so misbehaving providers can be
//! identified after the fact.

pub mod adapter;
pub mod deepseek;
pub mod errors;
pub mod gemini;
pub mod generic;
pub mod iflow;
pub mod lmstudio;
pub mod ollama;
pub mod policy;
pub mod repair;
pub mod vllm;

pub use adapter::CompatAdapter;
pub use errors::{kind_for_status, normalize};
pub use policy::CompatPolicy;
