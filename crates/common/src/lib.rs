//! Patchloop common library
//!
//! This crate contains shared code used across the Patchloop hotpatch layers:
//! errors, structured outcomes, configuration, metrics, the event surface,
//! checksums and byte pattern search.

pub mod checksum;
pub mod config;
pub mod error;
pub mod events;
pub mod metrics;
pub mod outcome;
pub mod search;

// Re-export commonly used types
pub use checksum::{crc32, fnv1a_64, HashAlgorithm};
pub use config::HotpatchConfig;
pub use error::{check_range, ErrorKind, HotpatchError, ProtectionPhase, Result};
pub use events::{EventBus, HotpatchContext, HotpatchEvent};
pub use metrics::{MetricsRegistry, METRICS};
pub use outcome::{PatchLayer, PatchOutcome};
