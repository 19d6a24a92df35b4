//! Named snapshots of the layer enable flags
//!
//! Persisted as `{"version": "1.0", "presets": [{name, timestamp,
//! memoryEnabled, byteEnabled, serverEnabled}]}`.

use chrono::Utc;
use patchloop_common::{HotpatchError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{info, warn};

/// Preset document format version
pub const PRESET_FORMAT_VERSION: &str = "1.0";

/// Enable flags of the memory, byte and server layers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerFlags {
    pub memory: bool,
    pub byte: bool,
    pub server: bool,
}

impl Default for LayerFlags {
    fn default() -> Self {
        Self {
            memory: true,
            byte: true,
            server: true,
        }
    }
}

/// One saved preset
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Preset {
    pub name: String,
    /// RFC 3339 save time
    #[serde(default)]
    pub timestamp: String,
    pub memory_enabled: bool,
    pub byte_enabled: bool,
    pub server_enabled: bool,
}

impl Preset {
    pub fn new(name: impl Into<String>, flags: LayerFlags) -> Self {
        Self {
            name: name.into(),
            timestamp: Utc::now().to_rfc3339(),
            memory_enabled: flags.memory,
            byte_enabled: flags.byte,
            server_enabled: flags.server,
        }
    }

    pub fn flags(&self) -> LayerFlags {
        LayerFlags {
            memory: self.memory_enabled,
            byte: self.byte_enabled,
            server: self.server_enabled,
        }
    }
}

/// Exported preset set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresetDocument {
    pub version: String,
    #[serde(default)]
    pub presets: Vec<Preset>,
}

/// Presets keyed by name
#[derive(Debug, Default, Clone)]
pub struct PresetStore {
    presets: BTreeMap<String, Preset>,
}

impl PresetStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Save or overwrite a preset
    pub fn save(&mut self, name: &str, flags: LayerFlags) -> Result<&Preset> {
        if name.is_empty() {
            return Err(HotpatchError::invalid_input("preset name must not be empty"));
        }
        let preset = Preset::new(name, flags);
        self.presets.insert(name.to_string(), preset);
        Ok(&self.presets[name])
    }

    pub fn get(&self, name: &str) -> Option<&Preset> {
        self.presets.get(name)
    }

    pub fn remove(&mut self, name: &str) -> Result<Preset> {
        self.presets
            .remove(name)
            .ok_or_else(|| HotpatchError::not_found(format!("preset {}", name)))
    }

    /// Names in sorted order
    pub fn names(&self) -> Vec<String> {
        self.presets.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.presets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.presets.is_empty()
    }

    pub fn to_document(&self) -> PresetDocument {
        PresetDocument {
            version: PRESET_FORMAT_VERSION.to_string(),
            presets: self.presets.values().cloned().collect(),
        }
    }

    /// Add every preset of `document`, replacing same-named ones
    pub fn merge(&mut self, document: PresetDocument) -> usize {
        if document.version != PRESET_FORMAT_VERSION {
            warn!(
                "Importing preset document version {} (expected {})",
                document.version, PRESET_FORMAT_VERSION
            );
        }
        let mut imported = 0;
        for preset in document.presets {
            if preset.name.is_empty() {
                warn!("Skipping unnamed preset");
                continue;
            }
            self.presets.insert(preset.name.clone(), preset);
            imported += 1;
        }
        imported
    }

    pub fn export<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let json = serde_json::to_string_pretty(&self.to_document())?;
        std::fs::write(path, json)?;
        info!("Exported {} presets to {}", self.presets.len(), path.display());
        Ok(())
    }

    /// Merge presets from a file; returns how many were imported
    pub fn import<P: AsRef<Path>>(&mut self, path: P) -> Result<usize> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let document: PresetDocument = serde_json::from_str(&content)?;
        let imported = self.merge(document);
        info!("Imported {} presets from {}", imported, path.display());
        Ok(imported)
    }
}
