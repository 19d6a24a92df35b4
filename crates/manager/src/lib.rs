//! Patchloop manager
//!
//! Coordinates the memory, byte, server and proxy hotpatch layers behind one
//! facade and persists named presets of the layer enable flags.

pub mod manager;
pub mod presets;

pub use manager::{Lifecycle, UnifiedHotpatchManager, UnifiedResult, UnifiedStats};
pub use presets::{LayerFlags, Preset, PresetDocument, PresetStore, PRESET_FORMAT_VERSION};
