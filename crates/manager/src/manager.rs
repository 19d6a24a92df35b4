//! Composition root for the hotpatch layers
//!
//! [`UnifiedHotpatchManager`] owns one instance of each layer, gates them with
//! per-layer enable flags and turns every layer result into a layer-tagged
//! [`UnifiedResult`].

use crate::presets::{LayerFlags, PresetStore};
use chrono::{DateTime, Utc};
use crossbeam::channel::Receiver;
use parking_lot::Mutex;
use patchloop_common::{
    HotpatchConfig, HotpatchContext, HotpatchError, HotpatchEvent, PatchLayer, PatchOutcome,
    Result,
};
use patchloop_engine::{
    ByteLevelHotpatcher, BytePatch, ByteStats, MemoryPatch, MemoryPatchEngine, MemoryStats,
    SafeTensorsParser,
};
use patchloop_pipeline::{ProxyHotpatcher, ProxyStats, ServerHotpatch, ServerRule, ServerStats};
use serde::Serialize;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

const SYSTEM_PROMPT_RULE: &str = "system_prompt_injection";
const SAFETY_FILTER_RULE: &str = "safety_filter";

/// Layer-tagged result of a manager operation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnifiedResult {
    pub success: bool,
    pub layer: PatchLayer,
    pub operation: String,
    pub detail: String,
    /// 0 on a clean success
    pub error_code: i32,
    pub timestamp: DateTime<Utc>,
}

impl UnifiedResult {
    pub fn ok(operation: impl Into<String>, layer: PatchLayer, detail: impl Into<String>) -> Self {
        Self {
            success: true,
            layer,
            operation: operation.into(),
            detail: detail.into(),
            error_code: 0,
            timestamp: Utc::now(),
        }
    }

    pub fn failure(operation: impl Into<String>, layer: PatchLayer, err: &HotpatchError) -> Self {
        Self {
            success: false,
            layer,
            operation: operation.into(),
            detail: err.to_string(),
            error_code: err.code(),
            timestamp: Utc::now(),
        }
    }

    /// Successes with a secondary error keep `success` and carry its code
    pub fn from_outcome(
        operation: impl Into<String>,
        layer: PatchLayer,
        result: Result<PatchOutcome>,
    ) -> Self {
        let operation = operation.into();
        match result {
            Ok(outcome) => match outcome.secondary {
                Some(secondary) => {
                    error!("{} succeeded with secondary error: {}", operation, secondary);
                    Self {
                        error_code: secondary.code(),
                        ..Self::ok(
                            operation,
                            layer,
                            format!("{} (secondary: {})", outcome.detail, secondary),
                        )
                    }
                }
                None => Self::ok(operation, layer, outcome.detail),
            },
            Err(e) => Self::failure(operation, layer, &e),
        }
    }

    fn from_unit(operation: &str, layer: PatchLayer, result: Result<()>, detail: String) -> Self {
        match result {
            Ok(()) => Self::ok(operation, layer, detail),
            Err(e) => Self::failure(operation, layer, &e),
        }
    }
}

/// Manager lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Lifecycle {
    Uninitialized,
    Initialized,
    Attached,
    Detached,
}

/// Unified statistics snapshot
#[derive(Debug, Clone, Serialize)]
pub struct UnifiedStats {
    pub session_id: Uuid,
    pub session_started: DateTime<Utc>,
    pub total_patches_applied: u64,
    pub total_bytes_modified: u64,
    pub operations_succeeded: u64,
    pub operations_failed: u64,
    pub coordinated_actions_completed: u64,
    pub last_coordinated_action: Option<DateTime<Utc>>,
    pub memory: Option<MemoryStats>,
    pub byte: Option<ByteStats>,
    pub server: Option<ServerStats>,
    pub proxy: Option<ProxyStats>,
}

#[derive(Debug, Clone, Default)]
struct Counters {
    total_patches_applied: u64,
    total_bytes_modified: u64,
    operations_succeeded: u64,
    operations_failed: u64,
    coordinated_actions_completed: u64,
    last_coordinated_action: Option<DateTime<Utc>>,
}

struct Layers {
    memory: Arc<MemoryPatchEngine>,
    byte: Arc<ByteLevelHotpatcher>,
    server: Arc<ServerHotpatch>,
    proxy: Arc<ProxyHotpatcher>,
}

struct ManagerState {
    lifecycle: Lifecycle,
    layers: Option<Arc<Layers>>,
    flags: LayerFlags,
    presets: PresetStore,
    counters: Counters,
    model_path: Option<PathBuf>,
}

/// Owns and coordinates the memory, byte, server and proxy layers
pub struct UnifiedHotpatchManager {
    ctx: HotpatchContext,
    config: HotpatchConfig,
    session_id: Uuid,
    session_started: DateTime<Utc>,
    state: Mutex<ManagerState>,
}

impl UnifiedHotpatchManager {
    pub fn new(config: HotpatchConfig) -> Self {
        Self::with_context(HotpatchContext::default(), config)
    }

    pub fn with_context(ctx: HotpatchContext, config: HotpatchConfig) -> Self {
        let flags = LayerFlags {
            memory: config.memory.enabled,
            byte: config.byte.enabled,
            server: config.server.enabled,
        };
        Self {
            ctx,
            config,
            session_id: Uuid::new_v4(),
            session_started: Utc::now(),
            state: Mutex::new(ManagerState {
                lifecycle: Lifecycle::Uninitialized,
                layers: None,
                flags,
                presets: PresetStore::new(),
                counters: Counters::default(),
                model_path: None,
            }),
        }
    }

    /// Construct the layers; one-shot
    pub fn initialize(&self) -> UnifiedResult {
        let mut state = self.state.lock();
        if state.lifecycle != Lifecycle::Uninitialized {
            let err = HotpatchError::invalid_state("manager already initialized");
            return self.count(&mut state, UnifiedResult::failure("initialize", PatchLayer::System, &err));
        }

        let memory = MemoryPatchEngine::new(self.ctx.clone(), self.config.memory.clone());
        if self
            .config
            .model
            .as_ref()
            .is_some_and(|m| m.parse_safetensors)
        {
            memory.set_metadata_parser(Box::new(SafeTensorsParser));
        }
        let layers = Layers {
            memory: Arc::new(memory),
            byte: Arc::new(ByteLevelHotpatcher::new(
                self.ctx.clone(),
                self.config.byte.clone(),
            )),
            server: Arc::new(ServerHotpatch::new(self.ctx.clone(), &self.config.server)),
            proxy: Arc::new(ProxyHotpatcher::new(self.ctx.clone(), &self.config.proxy)),
        };
        layers.server.set_enabled(state.flags.server);

        state.layers = Some(Arc::new(layers));
        state.lifecycle = Lifecycle::Initialized;
        info!("Hotpatch manager initialized (session {})", self.session_id);
        self.count(
            &mut state,
            UnifiedResult::ok("initialize", PatchLayer::System, "layers constructed"),
        )
    }

    pub fn is_initialized(&self) -> bool {
        self.state.lock().lifecycle != Lifecycle::Uninitialized
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.state.lock().lifecycle
    }

    pub fn context(&self) -> &HotpatchContext {
        &self.ctx
    }

    /// Receive every event emitted by any layer
    pub fn subscribe(&self) -> Receiver<HotpatchEvent> {
        self.ctx.events.subscribe()
    }

    pub fn memory(&self) -> Result<Arc<MemoryPatchEngine>> {
        Ok(self.layers()?.memory.clone())
    }

    pub fn byte(&self) -> Result<Arc<ByteLevelHotpatcher>> {
        Ok(self.layers()?.byte.clone())
    }

    pub fn server(&self) -> Result<Arc<ServerHotpatch>> {
        Ok(self.layers()?.server.clone())
    }

    pub fn proxy(&self) -> Result<Arc<ProxyHotpatcher>> {
        Ok(self.layers()?.proxy.clone())
    }

    /// Attach the memory layer and optionally load `path` into the byte layer
    ///
    /// # Safety
    ///
    /// `ptr` must point to `len` bytes that stay valid, and are not freed or
    /// remapped, until [`detach_all`](Self::detach_all) returns.
    pub unsafe fn attach_to_model(&self, ptr: *mut u8, len: usize, path: Option<&Path>) -> UnifiedResult {
        let mut state = self.state.lock();
        let layers = match state.lifecycle {
            Lifecycle::Initialized | Lifecycle::Detached => state.layers.clone(),
            Lifecycle::Uninitialized => None,
            Lifecycle::Attached => {
                let err = HotpatchError::AlreadyAttached("detach before attaching again".to_string());
                return self.count(&mut state, UnifiedResult::failure("attach_to_model", PatchLayer::System, &err));
            }
        };
        let Some(layers) = layers else {
            let err = HotpatchError::not_initialized("initialize the manager before attaching");
            return self.count(&mut state, UnifiedResult::failure("attach_to_model", PatchLayer::System, &err));
        };

        if let Err(e) = layers.memory.attach(ptr, len) {
            return self.count(&mut state, UnifiedResult::failure("attach_to_model", PatchLayer::Memory, &e));
        }

        if let Some(path) = path {
            if let Err(e) = layers.byte.load_model(path) {
                warn!("Byte layer could not load {}: {}", path.display(), e);
            }
        }

        state.lifecycle = Lifecycle::Attached;
        state.model_path = path.map(Path::to_path_buf);
        info!("Attached to model ({} bytes)", len);
        self.count(
            &mut state,
            UnifiedResult::ok("attach_to_model", PatchLayer::System, format!("attached {} bytes", len)),
        )
    }

    /// Detach the memory layer; a no-op when nothing is attached
    pub fn detach_all(&self) -> UnifiedResult {
        let mut state = self.state.lock();
        if state.lifecycle != Lifecycle::Attached {
            return UnifiedResult::ok("detach_all", PatchLayer::System, "nothing attached");
        }
        let Some(layers) = state.layers.clone() else {
            return UnifiedResult::ok("detach_all", PatchLayer::System, "nothing attached");
        };

        let result = layers.memory.detach();
        state.lifecycle = Lifecycle::Detached;
        state.model_path = None;
        let result = UnifiedResult::from_outcome("detach_all", PatchLayer::Memory, result);
        self.count(&mut state, result)
    }

    pub fn model_path(&self) -> Option<PathBuf> {
        self.state.lock().model_path.clone()
    }

    /// Register and apply a memory patch; the registration is dropped if the apply fails
    pub fn apply_memory_patch(&self, patch: MemoryPatch) -> UnifiedResult {
        let op = "apply_memory_patch";
        let memory = match self.layer_gate(op, PatchLayer::Memory, |f| f.memory) {
            Ok(layers) => layers.memory.clone(),
            Err(result) => return result,
        };
        let name = patch.name.clone();
        let size = patch.size as u64;
        if let Err(e) = memory.add_patch(patch) {
            return self.finish(UnifiedResult::failure(op, PatchLayer::Memory, &e));
        }
        let result = memory.apply_patch(&name);
        if result.is_err() {
            if let Err(e) = memory.remove_patch(&name) {
                warn!("Could not drop failed memory patch {}: {}", name, e);
            }
        } else {
            self.bump_patches(1, size);
        }
        self.finish(UnifiedResult::from_outcome(op, PatchLayer::Memory, result))
    }

    pub fn scale_weights(&self, tensor: &str, factor: f32) -> UnifiedResult {
        let op = "scale_weights";
        let memory = match self.layer_gate(op, PatchLayer::Memory, |f| f.memory) {
            Ok(layers) => layers.memory.clone(),
            Err(result) => return result,
        };
        if !factor.is_finite() {
            let err = HotpatchError::invalid_input(format!("scale factor {} is not finite", factor));
            return self.finish(UnifiedResult::failure(op, PatchLayer::Memory, &err));
        }
        let size = memory.find_tensor(tensor).map(|t| t.size as u64).unwrap_or(0);
        let result = memory.scale_tensor_weights(tensor, factor);
        if result.is_ok() {
            self.bump_patches(0, size);
        }
        self.finish(UnifiedResult::from_outcome(op, PatchLayer::Memory, result))
    }

    pub fn bypass_layer(&self, index: usize) -> UnifiedResult {
        let op = "bypass_layer";
        let memory = match self.layer_gate(op, PatchLayer::Memory, |f| f.memory) {
            Ok(layers) => layers.memory.clone(),
            Err(result) => return result,
        };
        let result = memory.bypass_layer(index);
        if result.is_ok() {
            self.bump_patches(1, 0);
        }
        self.finish(UnifiedResult::from_outcome(op, PatchLayer::Memory, result))
    }

    /// Register and apply a byte patch; the registration is dropped if the apply fails
    pub fn apply_byte_patch(&self, patch: BytePatch) -> UnifiedResult {
        let op = "apply_byte_patch";
        let byte = match self.layer_gate(op, PatchLayer::Byte, |f| f.byte) {
            Ok(layers) => layers.byte.clone(),
            Err(result) => return result,
        };
        let name = patch.name.clone();
        let size = patch.length as u64;
        if let Err(e) = byte.add_patch(patch) {
            return self.finish(UnifiedResult::failure(op, PatchLayer::Byte, &e));
        }
        let result = byte.apply_patch(&name);
        if result.is_err() {
            if let Err(e) = byte.remove_patch(&name) {
                warn!("Could not drop failed byte patch {}: {}", name, e);
            }
        } else {
            self.bump_patches(1, size);
        }
        self.finish(UnifiedResult::from_outcome(op, PatchLayer::Byte, result))
    }

    pub fn save_patched_model<P: AsRef<Path>>(&self, path: P) -> UnifiedResult {
        let op = "save_patched_model";
        let byte = match self.layer_gate(op, PatchLayer::Byte, |f| f.byte) {
            Ok(layers) => layers.byte.clone(),
            Err(result) => return result,
        };
        let result = byte.save_model(path);
        self.finish(UnifiedResult::from_outcome(op, PatchLayer::Byte, result))
    }

    pub fn add_server_hotpatch(&self, rule: ServerRule) -> UnifiedResult {
        let op = "add_server_hotpatch";
        let server = match self.layer_gate(op, PatchLayer::Server, |f| f.server) {
            Ok(layers) => layers.server.clone(),
            Err(result) => return result,
        };
        let name = rule.name.clone();
        let result = server.add_hotpatch(rule);
        self.finish(UnifiedResult::from_unit(
            op,
            PatchLayer::Server,
            result,
            format!("added server hotpatch {}", name),
        ))
    }

    /// Install or replace the manager's system prompt rule
    pub fn enable_system_prompt_injection(&self, prompt: &str) -> UnifiedResult {
        let op = "enable_system_prompt_injection";
        let server = match self.layer_gate(op, PatchLayer::Server, |f| f.server) {
            Ok(layers) => layers.server.clone(),
            Err(result) => return result,
        };
        if prompt.trim().is_empty() {
            let err = HotpatchError::invalid_input("system prompt must not be empty");
            return self.finish(UnifiedResult::failure(op, PatchLayer::Server, &err));
        }
        let result = replace_rule(&server, ServerRule::system_prompt(SYSTEM_PROMPT_RULE, prompt));
        self.finish(UnifiedResult::from_unit(
            op,
            PatchLayer::Server,
            result,
            format!("system prompt injection enabled ({} chars)", prompt.chars().count()),
        ))
    }

    pub fn set_temperature_override(&self, temperature: f64) -> UnifiedResult {
        self.set_sampling_default("set_temperature_override", "temperature", temperature, 2.0)
    }

    pub fn set_top_p_override(&self, top_p: f64) -> UnifiedResult {
        self.set_sampling_default("set_top_p_override", "top_p", top_p, 1.0)
    }

    pub fn enable_response_caching(&self, enabled: bool) -> UnifiedResult {
        let op = "enable_response_caching";
        let server = match self.layer_gate(op, PatchLayer::Server, |f| f.server) {
            Ok(layers) => layers.server.clone(),
            Err(result) => return result,
        };
        server.set_caching_enabled(enabled);
        self.finish(UnifiedResult::ok(
            op,
            PatchLayer::Server,
            if enabled { "response caching enabled" } else { "response caching disabled" },
        ))
    }

    /// Backup, integrity check, then sampling defaults
    pub fn optimize_model(&self) -> Vec<UnifiedResult> {
        let coordination = &self.config.coordination;
        let mut results = Vec::new();

        let memory = self.memory();
        results.push(self.finish(match &memory {
            Ok(m) => UnifiedResult::from_outcome("optimize:backup", PatchLayer::Memory, m.create_backup()),
            Err(e) => UnifiedResult::failure("optimize:backup", PatchLayer::Memory, e),
        }));
        results.push(self.finish(match &memory {
            Ok(m) => UnifiedResult::from_outcome(
                "optimize:integrity",
                PatchLayer::Memory,
                m.verify_model_integrity(),
            ),
            Err(e) => UnifiedResult::failure("optimize:integrity", PatchLayer::Memory, e),
        }));
        results.push(self.set_temperature_override(coordination.optimize_temperature));
        results.push(self.set_top_p_override(coordination.optimize_top_p));

        self.complete_coordinated("optimize_model", results)
    }

    /// Safety prompt, response redaction and optional weight clamping
    pub fn apply_safety_filters(&self) -> Vec<UnifiedResult> {
        let coordination = &self.config.coordination;
        let mut results = vec![self.enable_system_prompt_injection(&coordination.safety_prompt)];

        results.push(match self.layer_gate("safety:filter", PatchLayer::Server, |f| f.server) {
            Ok(layers) => {
                let rule = ServerRule::filter(SAFETY_FILTER_RULE, coordination.safety_terms.clone());
                self.finish(UnifiedResult::from_unit(
                    "safety:filter",
                    PatchLayer::Server,
                    replace_rule(&layers.server, rule),
                    format!("redacting {} terms", coordination.safety_terms.len()),
                ))
            }
            Err(result) => result,
        });

        if let Some(tensor) = &coordination.safety_clamp_tensor {
            let limit = coordination.safety_clamp_limit;
            results.push(match self.layer_gate("safety:weight_clamping", PatchLayer::Memory, |f| f.memory) {
                Ok(layers) => self.finish(UnifiedResult::from_outcome(
                    "safety:weight_clamping",
                    PatchLayer::Memory,
                    layers.memory.clamp_tensor_weights(tensor, -limit, limit),
                )),
                Err(result) => result,
            });
        }

        self.complete_coordinated("apply_safety_filters", results)
    }

    /// Low temperature and response caching
    pub fn boost_inference_speed(&self) -> Vec<UnifiedResult> {
        let results = vec![
            self.set_temperature_override(self.config.coordination.boost_temperature),
            self.enable_response_caching(true),
        ];
        self.complete_coordinated("boost_inference_speed", results)
    }

    pub fn statistics(&self) -> UnifiedStats {
        let state = self.state.lock();
        let layers = state.layers.clone();
        let counters = state.counters.clone();
        drop(state);

        UnifiedStats {
            session_id: self.session_id,
            session_started: self.session_started,
            total_patches_applied: counters.total_patches_applied,
            total_bytes_modified: counters.total_bytes_modified,
            operations_succeeded: counters.operations_succeeded,
            operations_failed: counters.operations_failed,
            coordinated_actions_completed: counters.coordinated_actions_completed,
            last_coordinated_action: counters.last_coordinated_action,
            memory: layers.as_ref().map(|l| l.memory.statistics()),
            byte: layers.as_ref().map(|l| l.byte.statistics()),
            server: layers.as_ref().map(|l| l.server.statistics()),
            proxy: layers.as_ref().map(|l| l.proxy.statistics()),
        }
    }

    /// Reset unified and per-layer statistics
    pub fn reset_statistics(&self) {
        let layers = {
            let mut state = self.state.lock();
            state.counters = Counters::default();
            state.layers.clone()
        };
        if let Some(layers) = layers {
            layers.memory.reset_statistics();
            layers.byte.reset_statistics();
            layers.server.reset_statistics();
            layers.proxy.reset_statistics();
        }
        info!("Unified statistics reset");
    }

    pub fn set_memory_enabled(&self, enabled: bool) {
        self.state.lock().flags.memory = enabled;
        info!("Memory hotpatching {}", if enabled { "enabled" } else { "disabled" });
    }

    pub fn set_byte_enabled(&self, enabled: bool) {
        self.state.lock().flags.byte = enabled;
        info!("Byte hotpatching {}", if enabled { "enabled" } else { "disabled" });
    }

    pub fn set_server_enabled(&self, enabled: bool) {
        let layers = {
            let mut state = self.state.lock();
            state.flags.server = enabled;
            state.layers.clone()
        };
        if let Some(layers) = layers {
            layers.server.set_enabled(enabled);
        }
        info!("Server hotpatching {}", if enabled { "enabled" } else { "disabled" });
    }

    pub fn set_layer_flags(&self, flags: LayerFlags) {
        self.set_memory_enabled(flags.memory);
        self.set_byte_enabled(flags.byte);
        self.set_server_enabled(flags.server);
    }

    pub fn layer_flags(&self) -> LayerFlags {
        self.state.lock().flags
    }

    pub fn enable_all_layers(&self) {
        self.set_layer_flags(LayerFlags::default());
    }

    pub fn disable_all_layers(&self) {
        self.set_layer_flags(LayerFlags {
            memory: false,
            byte: false,
            server: false,
        });
    }

    /// Revert every applied memory and byte patch, then reset statistics
    pub fn reset_all_layers(&self) -> UnifiedResult {
        let op = "reset_all_layers";
        let layers = match self.layers() {
            Ok(layers) => layers,
            Err(e) => return self.finish(UnifiedResult::failure(op, PatchLayer::System, &e)),
        };
        let memory = layers.memory.revert_all_patches();
        let byte = layers.byte.revert_all_patches();
        for (name, e) in memory.failed.iter().chain(byte.failed.iter()) {
            warn!("Reset could not revert {}: {}", name, e);
        }
        let clean = memory.all_succeeded() && byte.all_succeeded();
        self.reset_statistics();

        let detail = format!("memory: {}; byte: {}", memory.summary(), byte.summary());
        if clean {
            UnifiedResult::ok(op, PatchLayer::System, detail)
        } else {
            let err = HotpatchError::invalid_state(detail);
            UnifiedResult::failure(op, PatchLayer::System, &err)
        }
    }

    /// Snapshot the current layer flags under `name`
    pub fn save_preset(&self, name: &str) -> UnifiedResult {
        let mut state = self.state.lock();
        let flags = state.flags;
        let result = state.presets.save(name, flags).map(|_| ());
        if result.is_ok() {
            self.ctx.emit(HotpatchEvent::PresetSaved {
                name: name.to_string(),
            });
        }
        let result = UnifiedResult::from_unit(
            "save_preset",
            PatchLayer::System,
            result,
            format!("preset '{}' saved", name),
        );
        self.count(&mut state, result)
    }

    /// Restore the layer flags saved under `name`
    pub fn load_preset(&self, name: &str) -> UnifiedResult {
        let flags = {
            let mut state = self.state.lock();
            match state.presets.get(name).map(|p| p.flags()) {
                Some(flags) => flags,
                None => {
                    let err = HotpatchError::not_found(format!("preset {}", name));
                    return self.count(&mut state, UnifiedResult::failure("load_preset", PatchLayer::System, &err));
                }
            }
        };
        self.set_layer_flags(flags);
        self.ctx.emit(HotpatchEvent::PresetLoaded {
            name: name.to_string(),
        });
        self.finish(UnifiedResult::ok(
            "load_preset",
            PatchLayer::System,
            format!("preset '{}' loaded", name),
        ))
    }

    pub fn delete_preset(&self, name: &str) -> UnifiedResult {
        let mut state = self.state.lock();
        let result = state.presets.remove(name).map(|_| ());
        let result = UnifiedResult::from_unit(
            "delete_preset",
            PatchLayer::System,
            result,
            format!("preset '{}' deleted", name),
        );
        self.count(&mut state, result)
    }

    pub fn list_presets(&self) -> Vec<String> {
        self.state.lock().presets.names()
    }

    /// Current flags of a saved preset
    pub fn preset_flags(&self, name: &str) -> Option<LayerFlags> {
        self.state.lock().presets.get(name).map(|p| p.flags())
    }

    /// Write every preset to `path`
    pub fn export_configuration<P: AsRef<Path>>(&self, path: P) -> UnifiedResult {
        let path = path.as_ref();
        let mut state = self.state.lock();
        let result = state.presets.export(path);
        let result = UnifiedResult::from_unit(
            "export_configuration",
            PatchLayer::System,
            result,
            format!("exported to {}", path.display()),
        );
        self.count(&mut state, result)
    }

    /// Merge the presets stored at `path`
    pub fn import_configuration<P: AsRef<Path>>(&self, path: P) -> UnifiedResult {
        let path = path.as_ref();
        let mut state = self.state.lock();
        let result = match state.presets.import(path) {
            Ok(count) => UnifiedResult::ok(
                "import_configuration",
                PatchLayer::System,
                format!("imported {} presets from {}", count, path.display()),
            ),
            Err(e) => UnifiedResult::failure("import_configuration", PatchLayer::System, &e),
        };
        self.count(&mut state, result)
    }

    fn layers(&self) -> Result<Arc<Layers>> {
        self.state
            .lock()
            .layers
            .clone()
            .ok_or_else(|| HotpatchError::not_initialized("hotpatch manager not initialized"))
    }

    /// Layers if initialized and the layer selected by `flag` is enabled
    fn layer_gate<F>(&self, op: &str, layer: PatchLayer, flag: F) -> std::result::Result<Arc<Layers>, UnifiedResult>
    where
        F: Fn(&LayerFlags) -> bool,
    {
        let mut state = self.state.lock();
        let err = match &state.layers {
            None => HotpatchError::not_initialized("hotpatch manager not initialized"),
            Some(_) if !flag(&state.flags) => {
                HotpatchError::invalid_state(format!("{} hotpatching disabled", layer))
            }
            Some(layers) => return Ok(layers.clone()),
        };
        Err(self.count(&mut state, UnifiedResult::failure(op, layer, &err)))
    }

    fn set_sampling_default(&self, op: &str, parameter: &str, value: f64, max: f64) -> UnifiedResult {
        let server = match self.layer_gate(op, PatchLayer::Server, |f| f.server) {
            Ok(layers) => layers.server.clone(),
            Err(result) => return result,
        };
        if !(0.0..=max).contains(&value) {
            let err = HotpatchError::invalid_input(format!(
                "{} {} outside [0, {}]",
                parameter, value, max
            ));
            return self.finish(UnifiedResult::failure(op, PatchLayer::Server, &err));
        }
        server.set_default_parameter(parameter, json!(value));
        self.finish(UnifiedResult::ok(
            op,
            PatchLayer::Server,
            format!("{} set to {}", parameter, value),
        ))
    }

    fn bump_patches(&self, patches: u64, bytes: u64) {
        let mut state = self.state.lock();
        state.counters.total_patches_applied += patches;
        state.counters.total_bytes_modified += bytes;
    }

    fn complete_coordinated(&self, operation: &str, results: Vec<UnifiedResult>) -> Vec<UnifiedResult> {
        let succeeded = results.iter().filter(|r| r.success).count();
        for failed in results.iter().filter(|r| !r.success) {
            warn!("{}: step {} failed: {}", operation, failed.operation, failed.detail);
        }
        {
            let mut state = self.state.lock();
            state.counters.coordinated_actions_completed += 1;
            state.counters.last_coordinated_action = Some(Utc::now());
        }
        info!("{} finished: {}/{} steps succeeded", operation, succeeded, results.len());
        self.ctx.emit(HotpatchEvent::OptimizationComplete {
            operation: operation.to_string(),
            succeeded,
            total: results.len(),
        });
        results
    }

    fn finish(&self, result: UnifiedResult) -> UnifiedResult {
        let mut state = self.state.lock();
        self.count(&mut state, result)
    }

    fn count(&self, state: &mut ManagerState, result: UnifiedResult) -> UnifiedResult {
        if result.success {
            state.counters.operations_succeeded += 1;
        } else {
            state.counters.operations_failed += 1;
            warn!("{} failed ({}): {}", result.operation, result.error_code, result.detail);
            self.ctx.emit(HotpatchEvent::Error {
                layer: result.layer,
                code: result.error_code,
                message: result.detail.clone(),
            });
        }
        result
    }
}

impl Drop for UnifiedHotpatchManager {
    fn drop(&mut self) {
        let attached = self.state.lock().lifecycle == Lifecycle::Attached;
        if attached {
            let result = self.detach_all();
            if !result.success {
                error!("Detach on drop failed: {}", result.detail);
            }
        }
    }
}

/// Remove a same-named rule, then add
fn replace_rule(server: &ServerHotpatch, rule: ServerRule) -> Result<()> {
    if server.has_hotpatch(&rule.name) {
        server.remove_hotpatch(&rule.name)?;
    }
    server.add_hotpatch(rule)
}

#[cfg(test)]
mod tests {
    use super::*;
    use patchloop_common::ErrorKind;
    use patchloop_engine::PatchKind;

    fn manager() -> UnifiedHotpatchManager {
        let manager = UnifiedHotpatchManager::with_context(
            HotpatchContext::isolated(),
            HotpatchConfig::default(),
        );
        assert!(manager.initialize().success);
        manager
    }

    #[test]
    fn test_lifecycle() {
        let manager = UnifiedHotpatchManager::with_context(
            HotpatchContext::isolated(),
            HotpatchConfig::default(),
        );
        assert!(!manager.set_temperature_override(0.5).success);
        let mut buf = vec![0u8; 64];
        let early = unsafe { manager.attach_to_model(buf.as_mut_ptr(), buf.len(), None) };
        assert_eq!(early.error_code, HotpatchError::not_initialized("").code());

        assert!(manager.initialize().success);
        assert!(!manager.initialize().success);

        let attached = unsafe { manager.attach_to_model(buf.as_mut_ptr(), buf.len(), None) };
        assert!(attached.success, "{}", attached.detail);
        assert_eq!(manager.lifecycle(), Lifecycle::Attached);
        let again = unsafe { manager.attach_to_model(buf.as_mut_ptr(), buf.len(), None) };
        assert!(!again.success);

        assert!(manager.detach_all().success);
        assert!(manager.detach_all().success);
        assert_eq!(manager.lifecycle(), Lifecycle::Detached);

        let reattached = unsafe { manager.attach_to_model(buf.as_mut_ptr(), buf.len(), None) };
        assert!(reattached.success);
        assert!(manager.detach_all().success);
    }

    #[test]
    fn test_memory_patch_and_disabled_layer() {
        let manager = manager();
        let mut buf = vec![0u8; 256];
        unsafe { manager.attach_to_model(buf.as_mut_ptr(), buf.len(), None) };

        let result = manager.apply_memory_patch(MemoryPatch::new("p", PatchKind::Custom, 8, vec![7; 4]));
        assert!(result.success, "{}", result.detail);
        assert_eq!(result.layer, PatchLayer::Memory);
        assert_eq!(manager.memory().unwrap().read_memory(8, 4).unwrap(), vec![7; 4]);

        let out_of_range = manager.apply_memory_patch(MemoryPatch::new("q", PatchKind::Custom, 254, vec![1; 4]));
        assert!(!out_of_range.success);
        assert!(manager.memory().unwrap().patch("q").is_none());

        manager.set_memory_enabled(false);
        let disabled = manager.bypass_layer(0);
        assert!(!disabled.success);
        assert_eq!(disabled.error_code, HotpatchError::invalid_state("").code());

        let stats = manager.statistics();
        assert_eq!(stats.total_patches_applied, 1);
        assert_eq!(stats.total_bytes_modified, 4);
        assert!(stats.operations_failed >= 2);

        manager.detach_all();
        assert_eq!(buf, vec![0u8; 256]);
    }

    #[test]
    fn test_failed_apply_drops_registration() {
        let manager = manager();
        let mut buf = vec![0u8; 256];
        unsafe { manager.attach_to_model(buf.as_mut_ptr(), buf.len(), None) };

        let gated = MemoryPatch::new("gated", PatchKind::Custom, 16, vec![1; 4]).verified(0x1234);
        let result = manager.apply_memory_patch(gated);
        assert!(!result.success);
        assert_eq!(result.error_code, HotpatchError::integrity("").code());
        assert!(manager.memory().unwrap().patch("gated").is_none());
        assert_eq!(buf[16..20], [0u8; 4]);

        manager.byte().unwrap().load_bytes(vec![0u8; 64]).unwrap();
        let expecting = BytePatch::replace("expecting", 8, vec![2; 4]).expect_before(vec![9; 4]);
        let result = manager.apply_byte_patch(expecting);
        assert!(!result.success);
        assert!(manager.byte().unwrap().patch("expecting").is_none());

        // Same names register cleanly after the rollback
        assert!(manager
            .apply_memory_patch(MemoryPatch::new("gated", PatchKind::Custom, 16, vec![1; 4]))
            .success);
        manager.detach_all();
    }

    #[test]
    fn test_server_operations() {
        let manager = manager();
        assert!(manager.enable_system_prompt_injection("be safe").success);
        assert!(manager.enable_system_prompt_injection("be safer").success);
        assert!(!manager.enable_system_prompt_injection("  ").success);
        assert!(manager.set_temperature_override(0.4).success);
        assert!(!manager.set_temperature_override(3.0).success);

        let server = manager.server().unwrap();
        let out = server.process_request(json!({"prompt": "hi"}));
        assert_eq!(out["prompt"], "be safer\n\nhi");
        assert_eq!(out["temperature"], json!(0.4));

        assert!(manager.enable_response_caching(true).success);
        assert!(server.is_caching_enabled());

        manager.set_server_enabled(false);
        assert!(!server.is_enabled());
        assert!(!manager.add_server_hotpatch(ServerRule::filter("f", ["x"])).success);
    }

    #[test]
    fn test_coordinated_operations_are_not_transactional() {
        let manager = manager();
        // Nothing attached: backup and integrity fail, sampling steps still run
        let results = manager.optimize_model();
        assert_eq!(results.len(), 4);
        assert!(!results[0].success);
        assert!(!results[1].success);
        assert!(results[2].success && results[3].success);

        let server = manager.server().unwrap();
        let defaults = server.default_parameters();
        assert_eq!(defaults["temperature"], json!(0.7));
        assert_eq!(defaults["top_p"], json!(0.9));

        let safety = manager.apply_safety_filters();
        assert!(safety.iter().all(|r| r.success));
        let resp = server.process_response(json!({"content": "my PASSWORD is"}));
        assert_eq!(resp["content"], "my ******** is");

        let boost = manager.boost_inference_speed();
        assert!(boost.iter().all(|r| r.success));
        assert!(server.is_caching_enabled());

        let stats = manager.statistics();
        assert_eq!(stats.coordinated_actions_completed, 3);
        assert!(stats.last_coordinated_action.is_some());
    }

    #[test]
    fn test_optimize_with_attached_model() {
        let manager = manager();
        let mut buf = b"GGUF".to_vec();
        buf.resize(4096, 0);
        unsafe { manager.attach_to_model(buf.as_mut_ptr(), buf.len(), None) };
        let results = manager.optimize_model();
        assert!(results.iter().all(|r| r.success), "{:?}", results);
        manager.detach_all();
    }

    #[test]
    fn test_presets_and_reset() {
        let manager = manager();
        manager.set_byte_enabled(false);
        assert!(manager.save_preset("no-byte").success);
        manager.enable_all_layers();
        assert!(manager.load_preset("no-byte").success);
        assert!(!manager.layer_flags().byte);
        assert!(!manager.load_preset("missing").success);
        assert!(manager.delete_preset("no-byte").success);
        assert!(manager.list_presets().is_empty());

        let reset = manager.reset_all_layers();
        assert!(reset.success);
        let stats = manager.statistics();
        assert_eq!(stats.operations_succeeded, 0);
        assert_eq!(stats.memory.unwrap().applied_patches, 0);
    }

    #[test]
    fn test_error_kind_codes_are_carried() {
        let manager = manager();
        let result = manager.save_patched_model("/tmp/none.bin");
        assert!(!result.success);
        assert_eq!(
            result.error_code,
            HotpatchError::not_attached("").code()
        );
        assert_eq!(HotpatchError::not_attached("").kind(), ErrorKind::NotAttached);
    }
}
