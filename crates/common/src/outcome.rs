//! Structured results for hotpatch operations

use crate::error::HotpatchError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};

/// Layer an operation originated from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatchLayer {
    Memory,
    Byte,
    Server,
    Proxy,
    System,
}

impl fmt::Display for PatchLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PatchLayer::Memory => "memory",
            PatchLayer::Byte => "byte",
            PatchLayer::Server => "server",
            PatchLayer::Proxy => "proxy",
            PatchLayer::System => "system",
        };
        f.write_str(name)
    }
}

/// Successful outcome of a layer operation
///
/// `secondary` holds a failure that happened after the primary effect was
/// already committed, such as a protection restore failing after a write.
/// The primary effect is not rolled back in that case.
#[derive(Debug)]
pub struct PatchOutcome {
    pub detail: String,
    pub elapsed: Duration,
    pub secondary: Option<HotpatchError>,
}

impl PatchOutcome {
    pub fn new(detail: impl Into<String>) -> Self {
        Self {
            detail: detail.into(),
            elapsed: Duration::ZERO,
            secondary: None,
        }
    }

    /// Stamp the elapsed time since `start`
    pub fn timed(mut self, start: Instant) -> Self {
        self.elapsed = start.elapsed();
        self
    }

    pub fn with_secondary(mut self, err: Option<HotpatchError>) -> Self {
        self.secondary = err;
        self
    }

    /// True when no secondary failure was recorded
    pub fn is_clean(&self) -> bool {
        self.secondary.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_secondary() {
        let outcome = PatchOutcome::new("ok");
        assert!(outcome.is_clean());

        let outcome = PatchOutcome::new("written").with_secondary(Some(HotpatchError::Protection {
            phase: crate::error::ProtectionPhase::Restore,
            addr: 0,
            len: 1,
            os_code: 1,
        }));
        assert!(!outcome.is_clean());
        assert_eq!(PatchLayer::Memory.to_string(), "memory");
    }
}
