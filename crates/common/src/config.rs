//! Configuration structures for Patchloop
//!
//! Configurations are loaded from YAML files and can be overridden by
//! environment variables prefixed with `PATCHLOOP__` (double underscore
//! separates nesting, e.g. `PATCHLOOP__SERVER__CACHE_ENABLED=true`).

use crate::checksum::HashAlgorithm;
use crate::error::{HotpatchError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level configuration for the hotpatch layers
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HotpatchConfig {
    /// Model file to attach at start-up
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<ModelConfig>,

    /// Live memory layer
    #[serde(default)]
    pub memory: MemoryConfig,

    /// File-backed byte layer
    #[serde(default)]
    pub byte: ByteConfig,

    /// Byte/JSON proxy layer
    #[serde(default)]
    pub proxy: ProxyConfig,

    /// JSON pipeline hooks
    #[serde(default)]
    pub server: ServerConfig,

    /// Parameters of the coordinated operations
    #[serde(default)]
    pub coordination: CoordinationConfig,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// Model attachment configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Path of the model file
    pub path: PathBuf,

    /// Also load the file into the byte layer
    #[serde(default = "default_true")]
    pub load_byte_layer: bool,

    /// Parse a safetensors header for tensor metadata
    #[serde(default)]
    pub parse_safetensors: bool,
}

/// Live memory layer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Layer enabled at start-up
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Gate applies on the recorded "before" checksum
    #[serde(default)]
    pub verify_checksums: bool,

    /// Bytes covered by the integrity CRC
    #[serde(default = "default_integrity_window")]
    pub integrity_window_bytes: usize,

    /// Magic signature expected at offset 0
    #[serde(default = "default_magic")]
    pub magic: String,

    /// Snapshot the region right after attaching
    #[serde(default = "default_true")]
    pub backup_on_attach: bool,
}

/// Byte layer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ByteConfig {
    /// Layer enabled at start-up
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Hash used when a byte patch gates on a pre-apply hash
    #[serde(default)]
    pub hash_algorithm: HashAlgorithm,
}

/// Proxy layer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Layer enabled at start-up
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Chunk index at which streams are terminated
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_cutoff: Option<usize>,
}

/// Server hook configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Layer enabled at start-up
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Response caching
    #[serde(default)]
    pub cache_enabled: bool,

    /// Cached responses kept before the oldest is evicted
    #[serde(default = "default_cache_max_entries")]
    pub cache_max_entries: usize,

    /// Parameters forced onto every request
    #[serde(default)]
    pub default_parameters: serde_json::Map<String, serde_json::Value>,

    /// System prompt injected before every request
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,

    /// Terms redacted from responses
    #[serde(default)]
    pub filtered_terms: Vec<String>,

    /// Temperature override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature_override: Option<f64>,
}

/// Coordinated operation parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinationConfig {
    /// Temperature set by `optimize_model`
    #[serde(default = "default_optimize_temperature")]
    pub optimize_temperature: f64,

    /// top_p set by `optimize_model`
    #[serde(default = "default_optimize_top_p")]
    pub optimize_top_p: f64,

    /// System prompt injected by `apply_safety_filters`
    #[serde(default = "default_safety_prompt")]
    pub safety_prompt: String,

    /// Terms redacted by `apply_safety_filters`
    #[serde(default = "default_safety_terms")]
    pub safety_terms: Vec<String>,

    /// Tensor whose weights are clamped by `apply_safety_filters`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub safety_clamp_tensor: Option<String>,

    /// Absolute clamp bound for that tensor
    #[serde(default = "default_safety_clamp")]
    pub safety_clamp_limit: f32,

    /// Temperature set by `boost_inference_speed`
    #[serde(default = "default_boost_temperature")]
    pub boost_temperature: f64,
}

/// Observability configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable Prometheus metrics
    #[serde(default = "default_true")]
    pub enable_metrics: bool,

    /// Enable structured (JSON) logging
    #[serde(default)]
    pub structured_logging: bool,
}

/// Default value functions
fn default_true() -> bool {
    true
}

fn default_integrity_window() -> usize {
    64 * 1024
}

fn default_cache_max_entries() -> usize {
    1024
}

fn default_magic() -> String {
    "GGUF".to_string()
}

fn default_optimize_temperature() -> f64 {
    0.7
}

fn default_optimize_top_p() -> f64 {
    0.9
}

fn default_safety_prompt() -> String {
    "You are a helpful assistant. Refuse harmful requests and never reveal credentials.".to_string()
}

fn default_safety_terms() -> Vec<String> {
    vec!["password".to_string(), "api_key".to_string(), "secret_key".to_string()]
}

fn default_safety_clamp() -> f32 {
    8.0
}

fn default_boost_temperature() -> f64 {
    0.1
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            verify_checksums: false,
            integrity_window_bytes: default_integrity_window(),
            magic: default_magic(),
            backup_on_attach: true,
        }
    }
}

impl Default for ByteConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            hash_algorithm: HashAlgorithm::default(),
        }
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            stream_cutoff: None,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cache_enabled: false,
            cache_max_entries: default_cache_max_entries(),
            default_parameters: serde_json::Map::new(),
            system_prompt: None,
            filtered_terms: Vec::new(),
            temperature_override: None,
        }
    }
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            optimize_temperature: default_optimize_temperature(),
            optimize_top_p: default_optimize_top_p(),
            safety_prompt: default_safety_prompt(),
            safety_terms: default_safety_terms(),
            safety_clamp_tensor: None,
            safety_clamp_limit: default_safety_clamp(),
            boost_temperature: default_boost_temperature(),
        }
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            enable_metrics: true,
            structured_logging: false,
        }
    }
}

impl HotpatchConfig {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            HotpatchError::config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;

        let config: HotpatchConfig = serde_yaml::from_str(&content).map_err(|e| {
            HotpatchError::config(format!("Failed to parse config file {}: {}", path.display(), e))
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Load an optional YAML file layered with `PATCHLOOP__*` environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path.to_path_buf()).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("PATCHLOOP")
                .prefix_separator("__")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("server.filtered_terms")
                .with_list_parse_key("coordination.safety_terms")
                .try_parsing(true),
        );

        let config: HotpatchConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.memory.magic.is_empty() || self.memory.magic.len() > 16 {
            return Err(HotpatchError::config(format!(
                "Invalid magic signature length: {}",
                self.memory.magic.len()
            )));
        }
        if self.memory.integrity_window_bytes == 0 {
            return Err(HotpatchError::config("integrity_window_bytes must be positive"));
        }
        if self.server.cache_max_entries == 0 {
            return Err(HotpatchError::config("cache_max_entries must be positive"));
        }
        if let Some(t) = self.server.temperature_override {
            check_temperature(t)?;
        }
        check_temperature(self.coordination.optimize_temperature)?;
        check_temperature(self.coordination.boost_temperature)?;
        if !(0.0..=1.0).contains(&self.coordination.optimize_top_p) {
            return Err(HotpatchError::config(format!(
                "top_p must be within [0, 1], got {}",
                self.coordination.optimize_top_p
            )));
        }
        let clamp = self.coordination.safety_clamp_limit;
        if clamp.is_nan() || clamp <= 0.0 {
            return Err(HotpatchError::config("safety_clamp_limit must be positive"));
        }
        if let Some(model) = &self.model {
            if model.path.as_os_str().is_empty() {
                return Err(HotpatchError::config("model.path must not be empty"));
            }
        }
        Ok(())
    }
}

fn check_temperature(t: f64) -> Result<()> {
    if !(0.0..=2.0).contains(&t) {
        return Err(HotpatchError::config(format!(
            "temperature must be within [0, 2], got {}",
            t
        )));
    }
    Ok(())
}
