//! Patch descriptors shared by the memory and byte layers

use crate::tensor::TensorDType;
use chrono::{DateTime, Utc};
use half::{bf16, f16};
use patchloop_common::{HotpatchError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Range;
use std::sync::Arc;

/// What a memory patch changes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PatchKind {
    WeightModification,
    QuantizationChange,
    LayerBypass,
    AttentionScale,
    BiasAdjustment,
    GraphRedirection,
    VocabularyPatch,
    Custom,
}

impl PatchKind {
    /// Kinds that are meaningful without an explicit payload
    pub fn is_structural(&self) -> bool {
        matches!(self, PatchKind::LayerBypass | PatchKind::GraphRedirection)
    }
}

/// Floating-point element layout a transform operates on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ElementType {
    #[default]
    F32,
    F16,
    BF16,
}

impl ElementType {
    pub fn size(&self) -> usize {
        match self {
            ElementType::F32 => 4,
            ElementType::F16 | ElementType::BF16 => 2,
        }
    }

    /// Transformable element type for a tensor dtype
    pub fn from_dtype(dtype: &TensorDType) -> Option<Self> {
        match dtype {
            TensorDType::F32 => Some(ElementType::F32),
            TensorDType::F16 => Some(ElementType::F16),
            TensorDType::BF16 => Some(ElementType::BF16),
            _ => None,
        }
    }
}

/// Element-wise weight transform
#[derive(Clone)]
pub enum WeightTransform {
    Scale(f32),
    Clamp { min: f32, max: f32 },
    Offset(f32),
    Custom(Arc<dyn Fn(f32) -> f32 + Send + Sync>),
}

impl fmt::Debug for WeightTransform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WeightTransform::Scale(s) => f.debug_tuple("Scale").field(s).finish(),
            WeightTransform::Clamp { min, max } => f
                .debug_struct("Clamp")
                .field("min", min)
                .field("max", max)
                .finish(),
            WeightTransform::Offset(o) => f.debug_tuple("Offset").field(o).finish(),
            WeightTransform::Custom(_) => f.write_str("Custom(<fn>)"),
        }
    }
}

impl WeightTransform {
    pub fn apply(&self, x: f32) -> f32 {
        match self {
            WeightTransform::Scale(s) => x * s,
            WeightTransform::Clamp { min, max } => x.clamp(*min, *max),
            WeightTransform::Offset(o) => x + o,
            WeightTransform::Custom(f) => f(x),
        }
    }

    /// Transform little-endian elements, producing the new bytes
    pub fn apply_to_bytes(&self, bytes: &[u8], elem: ElementType) -> Result<Vec<u8>> {
        let width = elem.size();
        if bytes.len() % width != 0 {
            return Err(HotpatchError::invalid_input(format!(
                "{} bytes is not a whole number of {:?} elements",
                bytes.len(),
                elem
            )));
        }

        let mut out = Vec::with_capacity(bytes.len());
        for chunk in bytes.chunks_exact(width) {
            match elem {
                ElementType::F32 => {
                    let v = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                    out.extend_from_slice(&self.apply(v).to_le_bytes());
                }
                ElementType::F16 => {
                    let v = f16::from_le_bytes([chunk[0], chunk[1]]).to_f32();
                    out.extend_from_slice(&f16::from_f32(self.apply(v)).to_le_bytes());
                }
                ElementType::BF16 => {
                    let v = bf16::from_le_bytes([chunk[0], chunk[1]]).to_f32();
                    out.extend_from_slice(&bf16::from_f32(self.apply(v)).to_le_bytes());
                }
            }
        }
        Ok(out)
    }
}

/// Named mutation of a byte range in the attached region
#[derive(Debug, Clone)]
pub struct MemoryPatch {
    pub name: String,
    pub kind: PatchKind,
    pub enabled: bool,
    pub offset: usize,
    pub size: usize,
    pub patch_bytes: Vec<u8>,
    /// Captured on first apply
    pub original_bytes: Option<Vec<u8>>,
    pub transform: Option<WeightTransform>,
    pub element_type: ElementType,
    pub verify_checksum: bool,
    /// Expected FNV-1a of the target range before applying; 0 disables the gate
    pub checksum_before: u64,
    pub checksum_after: u64,
    pub priority: i32,
    pub times_applied: u32,
    pub last_applied: Option<DateTime<Utc>>,
    pub description: String,
}

impl MemoryPatch {
    /// Patch writing `bytes` at `offset`
    pub fn new(name: impl Into<String>, kind: PatchKind, offset: usize, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            kind,
            enabled: true,
            offset,
            size: bytes.len(),
            patch_bytes: bytes,
            original_bytes: None,
            transform: None,
            element_type: ElementType::F32,
            verify_checksum: false,
            checksum_before: 0,
            checksum_after: 0,
            priority: 0,
            times_applied: 0,
            last_applied: None,
            description: String::new(),
        }
    }

    /// Patch whose payload is computed from the current contents at apply time
    pub fn with_transform(
        name: impl Into<String>,
        kind: PatchKind,
        offset: usize,
        size: usize,
        transform: WeightTransform,
        element_type: ElementType,
    ) -> Self {
        let mut patch = Self::new(name, kind, offset, Vec::new());
        patch.size = size;
        patch.transform = Some(transform);
        patch.element_type = element_type;
        patch
    }

    /// Payload-free structural patch over `size` bytes
    pub fn structural(name: impl Into<String>, kind: PatchKind, offset: usize, size: usize) -> Self {
        let mut patch = Self::new(name, kind, offset, Vec::new());
        patch.size = size;
        patch
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Gate applies on the target range hashing to `checksum`
    pub fn verified(mut self, checksum: u64) -> Self {
        self.verify_checksum = true;
        self.checksum_before = checksum;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn description(mut self, text: impl Into<String>) -> Self {
        self.description = text.into();
        self
    }
}

/// Overlapping registration rejected by priority
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchConflict {
    pub existing: String,
    pub incoming: String,
    pub reason: String,
}

impl fmt::Display for PatchConflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} vs {}: {}", self.incoming, self.existing, self.reason)
    }
}

/// Range and priority view used for conflict detection
pub trait PatchSpan {
    fn name(&self) -> &str;
    fn span(&self) -> Range<usize>;
    fn priority(&self) -> i32;
}

impl PatchSpan for MemoryPatch {
    fn name(&self) -> &str {
        &self.name
    }

    fn span(&self) -> Range<usize> {
        self.offset..self.offset + self.size
    }

    fn priority(&self) -> i32 {
        self.priority
    }
}

/// Per-patch results of an apply-all or revert-all pass
#[derive(Debug, Default)]
pub struct BatchReport {
    pub succeeded: Vec<String>,
    pub failed: Vec<(String, HotpatchError)>,
}

impl BatchReport {
    pub fn all_succeeded(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn summary(&self) -> String {
        format!(
            "{} succeeded, {} failed",
            self.succeeded.len(),
            self.failed.len()
        )
    }
}

fn overlaps(a: &Range<usize>, b: &Range<usize>) -> bool {
    a.start < b.end && b.start < a.end
}

/// First registered patch that `incoming` may not overlap
///
/// An overlap is allowed only when the incoming patch has strictly higher
/// priority than the existing one. Kinds are not considered.
pub fn find_conflict<'a, P, I>(incoming: &P, existing: I) -> Option<PatchConflict>
where
    P: PatchSpan + 'a,
    I: IntoIterator<Item = &'a P>,
{
    let span = incoming.span();
    existing
        .into_iter()
        .filter(|p| p.name() != incoming.name())
        .find(|p| overlaps(&p.span(), &span) && incoming.priority() <= p.priority())
        .map(|p| PatchConflict {
            existing: p.name().to_string(),
            incoming: incoming.name().to_string(),
            reason: format!(
                "Memory overlap detected. Incoming priority ({}) <= existing priority ({}).",
                incoming.priority(),
                p.priority()
            ),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_requires_strictly_higher_priority() {
        let a = MemoryPatch::new("a", PatchKind::Custom, 0, vec![0; 16]).priority(1);
        let same = MemoryPatch::new("b", PatchKind::Custom, 8, vec![0; 16]).priority(1);
        let higher = MemoryPatch::new("c", PatchKind::Custom, 8, vec![0; 16]).priority(2);
        let disjoint = MemoryPatch::new("d", PatchKind::Custom, 16, vec![0; 4]);

        let existing = vec![a];
        let conflict = find_conflict(&same, &existing).unwrap();
        assert_eq!(conflict.existing, "a");
        assert!(conflict.reason.contains("Incoming priority (1) <= existing priority (1)"));
        assert!(find_conflict(&higher, &existing).is_none());
        assert!(find_conflict(&disjoint, &existing).is_none());
    }

    #[test]
    fn test_transform_f32_bytes() {
        let bytes: Vec<u8> = [1.0f32, -2.0, 30.0]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect();

        let scaled = WeightTransform::Scale(2.0)
            .apply_to_bytes(&bytes, ElementType::F32)
            .unwrap();
        assert_eq!(&scaled[4..8], &(-4.0f32).to_le_bytes());

        let clamped = WeightTransform::Clamp { min: -1.0, max: 10.0 }
            .apply_to_bytes(&bytes, ElementType::F32)
            .unwrap();
        assert_eq!(&clamped[8..12], &10.0f32.to_le_bytes());

        assert!(WeightTransform::Offset(1.0)
            .apply_to_bytes(&bytes[..5], ElementType::F32)
            .is_err());
    }

    #[test]
    fn test_transform_f16_bytes() {
        let bytes: Vec<u8> = [f16::from_f32(1.5), f16::from_f32(-0.5)]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect();
        let custom = WeightTransform::Custom(Arc::new(|x| x * 4.0));
        let out = custom.apply_to_bytes(&bytes, ElementType::F16).unwrap();
        assert_eq!(f16::from_le_bytes([out[0], out[1]]).to_f32(), 6.0);
        assert_eq!(f16::from_le_bytes([out[2], out[3]]).to_f32(), -2.0);
    }
}
