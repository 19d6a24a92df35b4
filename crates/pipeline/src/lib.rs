//! Patchloop pipeline
//!
//! Request/response path layers: [`ProxyHotpatcher`] corrects raw and JSON
//! payloads and terminates streams, [`ServerHotpatch`] runs declarative JSON
//! hooks with an optional response cache.

pub mod proxy;
pub mod server;
pub mod validation;

pub use proxy::{ProxyHotpatcher, ProxyRule, ProxyRuleKind, ProxyStats, Substitution};
pub use server::{
    cache_key, ChunkTransform, HotpatchPoint, ServerHotpatch, ServerRule, ServerStats,
    ServerTransform,
};
pub use validation::{AgentMode, CustomValidator, ValidationOutcome, ValidationRule};
