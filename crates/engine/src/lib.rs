//! Patchloop engine
//!
//! The two layers that touch model bytes directly: [`MemoryPatchEngine`]
//! patches a live region in place under page-protection windows, and
//! [`ByteLevelHotpatcher`] patches an owned copy of a model file.

pub mod byte_level;
pub mod memory;
pub mod patch;
pub mod protect;
pub mod tensor;

pub use byte_level::{BytePatch, ByteLevelHotpatcher, ByteOperation, ByteStats};
pub use memory::{MemoryPatchEngine, MemoryStats};
pub use patch::{
    BatchReport, ElementType, MemoryPatch, PatchConflict, PatchKind, PatchSpan, WeightTransform,
};
pub use protect::{PageProtector, Protection, WritableWindow};
pub use tensor::{SafeTensorsParser, TensorDType, TensorInfo, TensorMap, TensorMetadataParser};
