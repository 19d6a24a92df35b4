//! Live memory patching
//!
//! [`MemoryPatchEngine`] mutates an externally owned memory region, typically a
//! loaded model, in place. Every write goes through a [`WritableWindow`] so
//! read-only mappings can be patched without permanently loosening their
//! protection.

use crate::patch::{
    find_conflict, BatchReport, ElementType, MemoryPatch, PatchConflict, PatchKind,
    WeightTransform,
};
use crate::protect::{platform_protector, protection_error, PageProtector, Protection, WritableWindow};
use crate::tensor::{residual_projections, NoTensorMetadata, TensorInfo, TensorMap, TensorMetadataParser};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use patchloop_common::config::MemoryConfig;
use patchloop_common::search;
use patchloop_common::{
    check_range, crc32, fnv1a_64, HotpatchContext, HotpatchError, HotpatchEvent, PatchLayer,
    PatchOutcome, ProtectionPhase, Result,
};
use serde::Serialize;
use std::collections::HashMap;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Memory layer statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct MemoryStats {
    pub total_patches: usize,
    pub applied_patches: u64,
    pub reverted_patches: u64,
    pub failed_patches: u64,
    pub bytes_modified: u64,
    pub conflicts_detected: u64,
    pub integrity_checks: u64,
    pub direct_writes: u64,
    pub model_size: usize,
    pub last_patch_time: Option<DateTime<Utc>>,
}

/// Attached region; valid for reads and windowed writes while attached
#[derive(Debug, Clone, Copy)]
struct Region {
    base: usize,
    len: usize,
}

impl Region {
    /// # Safety
    /// Only valid while the region is attached and no write is in flight.
    unsafe fn slice(&self) -> &[u8] {
        std::slice::from_raw_parts(self.base as *const u8, self.len)
    }

    fn read(&self, offset: usize, len: usize) -> Vec<u8> {
        // SAFETY: callers bounds-check against `self.len` under the engine lock
        unsafe { self.slice()[offset..offset + len].to_vec() }
    }
}

struct EngineState {
    region: Option<Region>,
    patches: HashMap<String, MemoryPatch>,
    tensors: TensorMap,
    parser: Box<dyn TensorMetadataParser>,
    backup: Option<Vec<u8>>,
    baseline_crc: Option<u32>,
    stats: MemoryStats,
}

impl EngineState {
    fn region(&self) -> Result<Region> {
        self.region
            .ok_or_else(|| HotpatchError::not_attached("no model region attached"))
    }

    fn any_applied(&self) -> bool {
        self.patches.values().any(|p| p.times_applied > 0)
    }
}

/// Patches a live memory region using OS page protection
pub struct MemoryPatchEngine {
    ctx: HotpatchContext,
    config: MemoryConfig,
    protector: Box<dyn PageProtector>,
    state: Mutex<EngineState>,
}

impl MemoryPatchEngine {
    /// Create an engine using the platform protection backend
    pub fn new(ctx: HotpatchContext, config: MemoryConfig) -> Self {
        Self::with_protector(ctx, config, platform_protector())
    }

    pub fn with_protector(
        ctx: HotpatchContext,
        config: MemoryConfig,
        protector: Box<dyn PageProtector>,
    ) -> Self {
        Self {
            ctx,
            config,
            protector,
            state: Mutex::new(EngineState {
                region: None,
                patches: HashMap::new(),
                tensors: TensorMap::new(),
                parser: Box::new(NoTensorMetadata),
                backup: None,
                baseline_crc: None,
                stats: MemoryStats::default(),
            }),
        }
    }

    /// Collaborator consulted on the next attach
    pub fn set_metadata_parser(&self, parser: Box<dyn TensorMetadataParser>) {
        self.state.lock().parser = parser;
    }

    /// Attach to `len` bytes at `ptr`
    ///
    /// # Safety
    /// `ptr` must point to `len` bytes mapped into this process that stay
    /// valid, and are not freed or remapped, until [`detach`](Self::detach)
    /// returns. The engine never allocates or frees the region.
    pub unsafe fn attach(&self, ptr: *mut u8, len: usize) -> Result<PatchOutcome> {
        let start = Instant::now();
        let mut state = self.state.lock();

        if state.region.is_some() {
            return Err(HotpatchError::AlreadyAttached(
                "detach before attaching a new region".to_string(),
            ));
        }
        if ptr.is_null() || len == 0 {
            return Err(HotpatchError::invalid_input(
                "attach requires a non-null pointer and non-zero size",
            ));
        }

        let region = Region {
            base: ptr as usize,
            len,
        };
        let tensors = state.parser.parse(region.slice())?;
        for info in tensors.values() {
            check_range(info.offset, info.size, len).map_err(|_| {
                HotpatchError::Metadata(format!("tensor {} lies outside the region", info.name))
            })?;
        }

        info!(
            "Attached to model region {:#x} ({} bytes, {} tensors)",
            region.base,
            len,
            tensors.len()
        );

        state.region = Some(region);
        state.tensors = tensors;
        state.stats.model_size = len;
        if self.config.backup_on_attach {
            state.backup = Some(region.read(0, len));
        }

        self.ctx.metrics.hotpatch.attached_bytes.set(len as i64);
        self.ctx.emit(HotpatchEvent::ModelAttached {
            layer: PatchLayer::Memory,
            size: len,
        });

        Ok(PatchOutcome::new(format!("attached {} bytes", len)).timed(start))
    }

    /// Detach, restoring the backup first if any patch is still applied
    ///
    /// A failed restore is reported as a secondary error; detaching proceeds.
    /// Detaching an unattached engine is a no-op.
    pub fn detach(&self) -> Result<PatchOutcome> {
        let start = Instant::now();
        let mut state = self.state.lock();

        let Some(region) = state.region else {
            return Ok(PatchOutcome::new("not attached"));
        };

        let mut secondary = None;
        if state.any_applied() {
            match state.backup.take() {
                Some(backup) => match self.restore_locked(&mut state, region, &backup) {
                    Ok(restore_secondary) => secondary = restore_secondary,
                    Err(e) => {
                        error!("CRITICAL: failed to restore backup on detach: {}", e);
                        secondary = Some(e);
                    }
                },
                None => warn!("Detaching with applied patches and no backup to restore"),
            }
        }

        state.region = None;
        state.patches.clear();
        state.tensors.clear();
        state.backup = None;
        state.baseline_crc = None;
        state.stats.model_size = 0;

        self.ctx.metrics.hotpatch.attached_bytes.set(0);
        self.ctx.emit(HotpatchEvent::ModelDetached {
            layer: PatchLayer::Memory,
        });
        info!("Detached from model region {:#x}", region.base);

        Ok(PatchOutcome::new("detached")
            .with_secondary(secondary)
            .timed(start))
    }

    pub fn is_attached(&self) -> bool {
        self.state.lock().region.is_some()
    }

    pub fn model_size(&self) -> usize {
        self.state.lock().region.map_or(0, |r| r.len)
    }

    /// Register a patch after bounds and conflict checks
    pub fn add_patch(&self, mut patch: MemoryPatch) -> Result<()> {
        let mut state = self.state.lock();
        let region = state.region()?;

        if patch.name.is_empty() {
            return Err(HotpatchError::invalid_input("patch name must not be empty"));
        }
        if state.patches.contains_key(&patch.name) {
            return Err(HotpatchError::Duplicate(patch.name));
        }
        check_range(patch.offset, patch.size, region.len)?;
        if !patch.patch_bytes.is_empty() && patch.patch_bytes.len() != patch.size {
            return Err(HotpatchError::invalid_input(format!(
                "patch {} payload is {} bytes but size is {}",
                patch.name,
                patch.patch_bytes.len(),
                patch.size
            )));
        }

        if let Some(conflict) = find_conflict(&patch, state.patches.values()) {
            state.stats.conflicts_detected += 1;
            self.ctx.metrics.hotpatch.conflicts_detected.inc();
            warn!("Rejected patch {}: {}", patch.name, conflict.reason);
            self.ctx.emit(HotpatchEvent::PatchConflict {
                existing: conflict.existing.clone(),
                incoming: conflict.incoming.clone(),
                reason: conflict.reason.clone(),
            });
            return Err(HotpatchError::Conflict(conflict.to_string()));
        }

        if self.config.verify_checksums {
            patch.verify_checksum = true;
        }
        if patch.verify_checksum && patch.checksum_before == 0 {
            patch.checksum_before = fnv1a_64(&region.read(patch.offset, patch.size));
        }

        debug!(
            "Registered patch {} ({:?}) at {}+{} priority {}",
            patch.name, patch.kind, patch.offset, patch.size, patch.priority
        );
        state.patches.insert(patch.name.clone(), patch);
        state.stats.total_patches = state.patches.len();
        Ok(())
    }

    /// Conflict `patch` would raise if registered now
    pub fn check_patch_conflict(&self, patch: &MemoryPatch) -> Option<PatchConflict> {
        let state = self.state.lock();
        find_conflict(patch, state.patches.values())
    }

    /// Unregister a patch; applied patches must be reverted first
    pub fn remove_patch(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock();
        let patch = state
            .patches
            .get(name)
            .ok_or_else(|| HotpatchError::not_found(format!("patch {}", name)))?;
        if patch.times_applied > 0 {
            return Err(HotpatchError::invalid_state(format!(
                "patch {} is applied; revert it before removing",
                name
            )));
        }
        state.patches.remove(name);
        state.stats.total_patches = state.patches.len();
        Ok(())
    }

    pub fn set_patch_enabled(&self, name: &str, enabled: bool) -> Result<()> {
        let mut state = self.state.lock();
        let patch = state
            .patches
            .get_mut(name)
            .ok_or_else(|| HotpatchError::not_found(format!("patch {}", name)))?;
        patch.enabled = enabled;
        Ok(())
    }

    pub fn patch(&self, name: &str) -> Option<MemoryPatch> {
        self.state.lock().patches.get(name).cloned()
    }

    /// Registered patch names, sorted
    pub fn patch_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.lock().patches.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn apply_patch(&self, name: &str) -> Result<PatchOutcome> {
        let start = Instant::now();
        let mut state = self.state.lock();
        let result = self.apply_locked(&mut state, name);
        self.record(&mut state, &result, start);
        result.map(|o| o.timed(start))
    }

    pub fn revert_patch(&self, name: &str) -> Result<PatchOutcome> {
        let start = Instant::now();
        let mut state = self.state.lock();
        let result = self.revert_locked(&mut state, name);
        self.record(&mut state, &result, start);
        result.map(|o| o.timed(start))
    }

    /// Apply every enabled patch in offset order, continuing past failures
    pub fn apply_all_patches(&self) -> BatchReport {
        let mut state = self.state.lock();
        let mut order: Vec<(usize, String)> = state
            .patches
            .values()
            .filter(|p| p.enabled)
            .map(|p| (p.offset, p.name.clone()))
            .collect();
        order.sort();

        let mut report = BatchReport::default();
        for (_, name) in order {
            let start = Instant::now();
            let result = self.apply_locked(&mut state, &name);
            self.record(&mut state, &result, start);
            match result {
                Ok(_) => report.succeeded.push(name),
                Err(e) => {
                    warn!("Failed to apply patch {}: {}", name, e);
                    report.failed.push((name, e));
                }
            }
        }
        info!("Apply all patches: {}", report.summary());
        report
    }

    /// Revert every applied patch, highest offset first
    pub fn revert_all_patches(&self) -> BatchReport {
        let mut state = self.state.lock();
        let mut order: Vec<(usize, String)> = state
            .patches
            .values()
            .filter(|p| p.enabled && p.times_applied > 0)
            .map(|p| (p.offset, p.name.clone()))
            .collect();
        order.sort_by(|a, b| b.cmp(a));

        let mut report = BatchReport::default();
        for (_, name) in order {
            let start = Instant::now();
            let result = self.revert_locked(&mut state, &name);
            self.record(&mut state, &result, start);
            match result {
                Ok(_) => report.succeeded.push(name),
                Err(e) => {
                    warn!("Failed to revert patch {}: {}", name, e);
                    report.failed.push((name, e));
                }
            }
        }
        info!("Revert all patches: {}", report.summary());
        report
    }

    /// Snapshot the whole region
    pub fn create_backup(&self) -> Result<PatchOutcome> {
        let mut state = self.state.lock();
        let region = state.region()?;
        state.backup = Some(region.read(0, region.len));
        info!("Created backup of {} bytes", region.len);
        Ok(PatchOutcome::new(format!("backed up {} bytes", region.len)))
    }

    pub fn has_backup(&self) -> bool {
        self.state.lock().backup.is_some()
    }

    /// Write the snapshot back and reset apply/revert/byte counters
    pub fn restore_backup(&self) -> Result<PatchOutcome> {
        let start = Instant::now();
        let mut state = self.state.lock();
        let region = state.region()?;
        let backup = state
            .backup
            .take()
            .ok_or_else(|| HotpatchError::invalid_state("no backup to restore"))?;

        let result = self.restore_locked(&mut state, region, &backup);
        state.backup = Some(backup);
        let secondary = result?;
        Ok(PatchOutcome::new(format!("restored {} bytes", region.len))
            .with_secondary(secondary)
            .timed(start))
    }

    /// Copy of `size` bytes at `offset`
    pub fn read_memory(&self, offset: usize, size: usize) -> Result<Vec<u8>> {
        let state = self.state.lock();
        let region = state.region()?;
        check_range(offset, size, region.len)?;
        Ok(region.read(offset, size))
    }

    /// Write `data` at `offset` through a writable window
    pub fn write_memory(&self, offset: usize, data: &[u8]) -> Result<PatchOutcome> {
        let start = Instant::now();
        let mut state = self.state.lock();
        let region = state.region()?;
        check_range(offset, data.len(), region.len)?;
        let secondary = self.write_region(region, offset, data)?;
        self.count_direct(&mut state, data.len());
        Ok(PatchOutcome::new(format!("wrote {} bytes at {}", data.len(), offset))
            .with_secondary(secondary)
            .timed(start))
    }

    /// Validate every write, then perform them in order
    pub fn write_batch(&self, writes: &[(usize, Vec<u8>)]) -> Result<PatchOutcome> {
        let start = Instant::now();
        let mut state = self.state.lock();
        let region = state.region()?;
        for (offset, data) in writes {
            check_range(*offset, data.len(), region.len)?;
        }

        let mut secondary = None;
        let mut total = 0;
        for (offset, data) in writes {
            if let Some(e) = self.write_region(region, *offset, data)? {
                secondary.get_or_insert(e);
            }
            total += data.len();
        }
        self.count_direct(&mut state, total);
        Ok(
            PatchOutcome::new(format!("wrote {} ranges, {} bytes", writes.len(), total))
                .with_secondary(secondary)
                .timed(start),
        )
    }

    pub fn fill(&self, offset: usize, size: usize, value: u8) -> Result<PatchOutcome> {
        self.write_memory(offset, &vec![value; size])
    }

    /// Copy `size` bytes from `src` to `dst`; ranges may overlap
    pub fn copy_within(&self, src: usize, dst: usize, size: usize) -> Result<PatchOutcome> {
        let start = Instant::now();
        let mut state = self.state.lock();
        let region = state.region()?;
        check_range(src, size, region.len)?;
        check_range(dst, size, region.len)?;
        let data = region.read(src, size);
        let secondary = self.write_region(region, dst, &data)?;
        self.count_direct(&mut state, size);
        Ok(PatchOutcome::new(format!("copied {} bytes {} -> {}", size, src, dst))
            .with_secondary(secondary)
            .timed(start))
    }

    /// True when the bytes at `offset` equal `expected`
    pub fn compare(&self, offset: usize, expected: &[u8]) -> Result<bool> {
        let state = self.state.lock();
        let region = state.region()?;
        check_range(offset, expected.len(), region.len)?;
        // SAFETY: bounds checked above; no write is in flight under the lock
        Ok(unsafe { &region.slice()[offset..offset + expected.len()] } == expected)
    }

    /// Offset of the first occurrence of `pattern` at or after `from`
    pub fn search(&self, pattern: &[u8], from: usize) -> Result<Option<usize>> {
        let state = self.state.lock();
        let region = state.region()?;
        // SAFETY: the attach contract keeps the region readable
        Ok(search::find_from(unsafe { region.slice() }, pattern, from))
    }

    /// Exchange two non-overlapping ranges under a single window
    pub fn atomic_swap(&self, a: usize, b: usize, size: usize) -> Result<PatchOutcome> {
        let start = Instant::now();
        let mut state = self.state.lock();
        let region = state.region()?;
        check_range(a, size, region.len)?;
        check_range(b, size, region.len)?;
        if a < b + size && b < a + size && size > 0 {
            return Err(HotpatchError::invalid_input(format!(
                "swap ranges {}+{} and {}+{} overlap",
                a, size, b, size
            )));
        }

        let first = region.read(a, size);
        let second = region.read(b, size);
        let lo = a.min(b);
        let hi = a.max(b) + size;
        let secondary = self.with_window(region, lo, hi - lo, |base| {
            // SAFETY: both ranges lie inside the open window
            unsafe {
                std::ptr::copy_nonoverlapping(second.as_ptr(), base.add(a - lo), size);
                std::ptr::copy_nonoverlapping(first.as_ptr(), base.add(b - lo), size);
            }
        })?;
        self.count_direct(&mut state, size * 2);
        Ok(PatchOutcome::new(format!("swapped {} bytes", size))
            .with_secondary(secondary)
            .timed(start))
    }

    /// Change the protection of the pages covering a range, returning the previous one
    pub fn set_memory_protection(
        &self,
        offset: usize,
        size: usize,
        protection: Protection,
    ) -> Result<Protection> {
        let state = self.state.lock();
        let region = state.region()?;
        check_range(offset, size, region.len)?;
        let (start, len) = crate::protect::aligned_window(
            region.base + offset,
            size,
            self.protector.page_size(),
        );
        // SAFETY: the window covers pages of the attached region
        unsafe { self.protector.protect(start, len, protection) }.map_err(|e| {
            self.ctx.metrics.hotpatch.protection_failures.inc();
            protection_error(e, ProtectionPhase::Change, start, len)
        })
    }

    /// Check the magic signature and the CRC of the header window
    ///
    /// The first successful call records the CRC baseline.
    pub fn verify_model_integrity(&self) -> Result<PatchOutcome> {
        let start = Instant::now();
        let mut state = self.state.lock();
        let region = state.region()?;
        state.stats.integrity_checks += 1;

        let magic = self.config.magic.as_bytes();
        let window = region.len.min(self.config.integrity_window_bytes);
        // SAFETY: the attach contract keeps the region readable
        let (magic_ok, crc) = unsafe {
            let bytes = region.slice();
            (bytes.starts_with(magic), crc32(&bytes[..window]))
        };

        if !magic_ok {
            return Err(self.integrity_failure(format!(
                "missing {} signature at offset 0",
                self.config.magic
            )));
        }

        match state.baseline_crc {
            None => {
                state.baseline_crc = Some(crc);
                info!("Recorded integrity baseline {:#010x} over {} bytes", crc, window);
                Ok(PatchOutcome::new(format!("baseline {:#010x} recorded", crc)).timed(start))
            }
            Some(baseline) if baseline == crc => {
                Ok(PatchOutcome::new(format!("integrity verified ({:#010x})", crc)).timed(start))
            }
            Some(baseline) => Err(self.integrity_failure(format!(
                "header CRC {:#010x} differs from baseline {:#010x}",
                crc, baseline
            ))),
        }
    }

    pub fn find_tensor(&self, name: &str) -> Option<TensorInfo> {
        self.state.lock().tensors.get(name).cloned()
    }

    /// Tensor names, sorted
    pub fn tensor_names(&self) -> Vec<String> {
        self.state.lock().tensors.keys().cloned().collect()
    }

    pub fn scale_tensor_weights(&self, tensor: &str, factor: f32) -> Result<PatchOutcome> {
        if !factor.is_finite() {
            return Err(HotpatchError::invalid_input(format!(
                "scale factor {} is not finite",
                factor
            )));
        }
        self.transform_tensor(tensor, &WeightTransform::Scale(factor))
    }

    pub fn clamp_tensor_weights(&self, tensor: &str, min: f32, max: f32) -> Result<PatchOutcome> {
        if min.is_nan() || max.is_nan() || min > max {
            return Err(HotpatchError::invalid_input(format!(
                "invalid clamp range [{}, {}]",
                min, max
            )));
        }
        self.transform_tensor(tensor, &WeightTransform::Clamp { min, max })
    }

    /// Zero a block's residual projections so the block passes its input through
    ///
    /// Registers one revertible `LayerBypass` patch per projection tensor.
    pub fn bypass_layer(&self, index: usize) -> Result<PatchOutcome> {
        let start = Instant::now();
        let targets: Vec<TensorInfo> = residual_projections(index)
            .iter()
            .filter_map(|name| self.find_tensor(name))
            .collect();
        if targets.is_empty() {
            return Err(HotpatchError::not_found(format!(
                "no residual projections for layer {}",
                index
            )));
        }

        let mut secondary = None;
        for info in &targets {
            let name = format!("bypass.{}", info.name);
            if self.patch(&name).is_none() {
                self.add_patch(
                    MemoryPatch::structural(&name, PatchKind::LayerBypass, info.offset, info.size)
                        .description(format!("bypass layer {}", index)),
                )?;
            }
            let outcome = self.apply_patch(&name)?;
            if secondary.is_none() {
                secondary = outcome.secondary;
            }
        }

        Ok(PatchOutcome::new(format!(
            "bypassed layer {} ({} tensors)",
            index,
            targets.len()
        ))
        .with_secondary(secondary)
        .timed(start))
    }

    pub fn statistics(&self) -> MemoryStats {
        self.state.lock().stats.clone()
    }

    pub fn reset_statistics(&self) {
        let mut state = self.state.lock();
        let model_size = state.stats.model_size;
        let total_patches = state.patches.len();
        state.stats = MemoryStats {
            model_size,
            total_patches,
            ..MemoryStats::default()
        };
    }

    fn apply_locked(&self, state: &mut EngineState, name: &str) -> Result<PatchOutcome> {
        let region = state.region()?;
        let patch = state
            .patches
            .get(name)
            .ok_or_else(|| HotpatchError::not_found(format!("patch {}", name)))?;

        if !patch.enabled {
            debug!("Patch {} is disabled, skipping", name);
            return Ok(PatchOutcome::new(format!("patch {} disabled, skipped", name)));
        }

        check_range(patch.offset, patch.size, region.len)?;
        let current = region.read(patch.offset, patch.size);

        if patch.verify_checksum && patch.checksum_before != 0 {
            let actual = fnv1a_64(&current);
            if actual != patch.checksum_before {
                return Err(self.integrity_failure(format!(
                    "patch {}: checksum {:#018x} != expected {:#018x}",
                    name, actual, patch.checksum_before
                )));
            }
        }

        let payload = if !patch.patch_bytes.is_empty() {
            Some(patch.patch_bytes.clone())
        } else if let Some(transform) = &patch.transform {
            Some(transform.apply_to_bytes(&current, patch.element_type)?)
        } else {
            match patch.kind {
                PatchKind::LayerBypass => Some(vec![0u8; patch.size]),
                PatchKind::GraphRedirection => None,
                kind => {
                    return Err(HotpatchError::invalid_input(format!(
                        "patch {} ({:?}) has no payload",
                        name, kind
                    )))
                }
            }
        };

        let offset = patch.offset;
        let size = patch.size;
        let secondary = match &payload {
            Some(bytes) => self.write_region(region, offset, bytes)?,
            None => None,
        };

        let verify = patch.verify_checksum;
        let now = Utc::now();
        if let Some(patch) = state.patches.get_mut(name) {
            // Stacked re-applies keep the first snapshot
            if patch.times_applied == 0 || patch.original_bytes.is_none() {
                patch.original_bytes = Some(current);
            }
            patch.times_applied += 1;
            patch.last_applied = Some(now);
            if verify {
                patch.checksum_after = fnv1a_64(payload.as_deref().unwrap_or(&[]));
            }
        }

        state.stats.applied_patches += 1;
        state.stats.bytes_modified += size as u64;
        state.stats.last_patch_time = Some(now);
        self.ctx.metrics.hotpatch.patches_applied.inc();
        self.ctx.metrics.hotpatch.bytes_modified.inc_by(size as u64);
        self.ctx.emit(HotpatchEvent::PatchApplied {
            layer: PatchLayer::Memory,
            name: name.to_string(),
        });
        info!("Applied patch {} ({} bytes at {})", name, size, offset);

        Ok(PatchOutcome::new(format!("applied {} ({} bytes)", name, size)).with_secondary(secondary))
    }

    fn revert_locked(&self, state: &mut EngineState, name: &str) -> Result<PatchOutcome> {
        let region = state.region()?;
        let patch = state
            .patches
            .get(name)
            .ok_or_else(|| HotpatchError::not_found(format!("patch {}", name)))?;

        let original = match (&patch.original_bytes, patch.times_applied) {
            (Some(original), n) if n > 0 => original.clone(),
            _ => {
                return Err(HotpatchError::invalid_state(format!(
                    "patch {} is not applied",
                    name
                )))
            }
        };
        check_range(patch.offset, original.len(), region.len)?;

        let secondary = if patch.kind == PatchKind::GraphRedirection && patch.patch_bytes.is_empty() {
            None
        } else {
            self.write_region(region, patch.offset, &original)?
        };

        if let Some(patch) = state.patches.get_mut(name) {
            patch.times_applied = 0;
        }
        state.stats.reverted_patches += 1;
        state.stats.last_patch_time = Some(Utc::now());
        self.ctx.metrics.hotpatch.patches_reverted.inc();
        self.ctx.emit(HotpatchEvent::PatchReverted {
            layer: PatchLayer::Memory,
            name: name.to_string(),
        });
        info!("Reverted patch {}", name);

        Ok(PatchOutcome::new(format!("reverted {}", name)).with_secondary(secondary))
    }

    fn restore_locked(
        &self,
        state: &mut EngineState,
        region: Region,
        backup: &[u8],
    ) -> Result<Option<HotpatchError>> {
        if backup.len() != region.len {
            return Err(HotpatchError::integrity(format!(
                "backup is {} bytes but region is {}",
                backup.len(),
                region.len
            )));
        }

        let secondary = self.write_region(region, 0, backup)?;
        for patch in state.patches.values_mut() {
            patch.times_applied = 0;
        }
        state.stats.applied_patches = 0;
        state.stats.reverted_patches = 0;
        state.stats.bytes_modified = 0;
        self.ctx.emit(HotpatchEvent::BackupRestored {
            layer: PatchLayer::Memory,
        });
        info!("Restored backup of {} bytes", backup.len());
        Ok(secondary)
    }

    /// Copy `data` to `offset`; returns the secondary restore error, if any
    fn write_region(&self, region: Region, offset: usize, data: &[u8]) -> Result<Option<HotpatchError>> {
        if data.is_empty() {
            return Ok(None);
        }
        self.with_window(region, offset, data.len(), |dst| {
            // SAFETY: `dst` addresses `data.len()` writable bytes inside the window
            unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), dst, data.len()) }
        })
    }

    fn with_window<F>(&self, region: Region, offset: usize, len: usize, write: F) -> Result<Option<HotpatchError>>
    where
        F: FnOnce(*mut u8),
    {
        check_range(offset, len, region.len)?;
        let addr = region.base + offset;

        // SAFETY: the range lies inside the attached region
        let window = unsafe { WritableWindow::open(&*self.protector, addr, len) }.map_err(|e| {
            self.ctx.metrics.hotpatch.protection_failures.inc();
            error!("Failed to make {:#x}+{} writable: {}", addr, len, e);
            e
        })?;

        write(addr as *mut u8);

        match window.close() {
            Ok(()) => Ok(None),
            Err(e) => {
                self.ctx.metrics.hotpatch.protection_failures.inc();
                error!(
                    "CRITICAL: write at {:#x}+{} succeeded but protection restore failed: {}",
                    addr, len, e
                );
                self.ctx.emit(HotpatchEvent::Error {
                    layer: PatchLayer::Memory,
                    code: e.code(),
                    message: e.to_string(),
                });
                Ok(Some(e))
            }
        }
    }

    fn transform_tensor(&self, tensor: &str, transform: &WeightTransform) -> Result<PatchOutcome> {
        let start = Instant::now();
        let mut state = self.state.lock();
        let region = state.region()?;
        let info = state
            .tensors
            .get(tensor)
            .cloned()
            .ok_or_else(|| HotpatchError::not_found(format!("tensor {}", tensor)))?;
        let elem = ElementType::from_dtype(&info.dtype).ok_or_else(|| {
            HotpatchError::not_supported(format!(
                "tensor {} has non-float element type {}",
                tensor,
                info.dtype.as_str()
            ))
        })?;

        let current = region.read(info.offset, info.size);
        let updated = transform.apply_to_bytes(&current, elem)?;
        let secondary = self.write_region(region, info.offset, &updated)?;
        self.count_direct(&mut state, info.size);
        info!("Transformed tensor {} with {:?}", tensor, transform);
        Ok(
            PatchOutcome::new(format!("transformed {} ({} bytes)", tensor, info.size))
                .with_secondary(secondary)
                .timed(start),
        )
    }

    fn count_direct(&self, state: &mut EngineState, bytes: usize) {
        state.stats.direct_writes += 1;
        state.stats.bytes_modified += bytes as u64;
        state.stats.last_patch_time = Some(Utc::now());
        self.ctx.metrics.hotpatch.bytes_modified.inc_by(bytes as u64);
    }

    fn integrity_failure(&self, detail: String) -> HotpatchError {
        self.ctx.metrics.hotpatch.integrity_failures.inc();
        warn!("Integrity check failed: {}", detail);
        self.ctx.emit(HotpatchEvent::IntegrityCheckFailed {
            layer: PatchLayer::Memory,
            detail: detail.clone(),
        });
        HotpatchError::integrity(detail)
    }

    fn record(&self, state: &mut EngineState, result: &Result<PatchOutcome>, start: Instant) {
        match result {
            Ok(_) => self
                .ctx
                .metrics
                .hotpatch
                .apply_duration
                .observe(start.elapsed().as_secs_f64()),
            Err(e) => {
                state.stats.failed_patches += 1;
                self.ctx.metrics.hotpatch.patches_failed.inc();
                self.ctx.emit(HotpatchEvent::Error {
                    layer: PatchLayer::Memory,
                    code: e.code(),
                    message: e.to_string(),
                });
            }
        }
    }
}

impl Drop for MemoryPatchEngine {
    fn drop(&mut self) {
        if self.state.get_mut().region.is_some() {
            if let Err(e) = self.detach() {
                error!("Failed to detach on drop: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::safetensors::build_safetensors;
    use crate::tensor::SafeTensorsParser;
    use patchloop_common::ErrorKind;

    fn engine() -> MemoryPatchEngine {
        MemoryPatchEngine::new(HotpatchContext::isolated(), MemoryConfig::default())
    }

    fn attached(buf: &mut [u8]) -> MemoryPatchEngine {
        let engine = engine();
        unsafe { engine.attach(buf.as_mut_ptr(), buf.len()) }.unwrap();
        engine
    }

    #[test]
    fn test_attach_rules() {
        let mut buf = vec![0u8; 4096];
        let engine = engine();
        assert!(unsafe { engine.attach(std::ptr::null_mut(), 16) }.is_err());
        unsafe { engine.attach(buf.as_mut_ptr(), buf.len()) }.unwrap();
        let err = unsafe { engine.attach(buf.as_mut_ptr(), buf.len()) }.unwrap_err();
        assert!(matches!(err, HotpatchError::AlreadyAttached(_)));
        engine.detach().unwrap();
        engine.detach().unwrap();
        assert!(!engine.is_attached());
    }

    #[test]
    fn test_parser_failure_aborts_attach() {
        let mut buf = vec![0u8; 64];
        let engine = engine();
        engine.set_metadata_parser(Box::new(SafeTensorsParser));
        assert!(unsafe { engine.attach(buf.as_mut_ptr(), buf.len()) }.is_err());
        assert!(!engine.is_attached());
    }

    #[test]
    fn test_apply_then_revert_restores_bytes() {
        let mut buf: Vec<u8> = (0..=255u8).cycle().take(8192).collect();
        let before = buf.clone();
        let engine = attached(&mut buf);

        engine
            .add_patch(MemoryPatch::new("p", PatchKind::WeightModification, 4000, vec![0xAA; 200]))
            .unwrap();
        let outcome = engine.apply_patch("p").unwrap();
        assert!(outcome.is_clean());
        assert_eq!(engine.read_memory(4000, 2).unwrap(), vec![0xAA, 0xAA]);

        engine.revert_patch("p").unwrap();
        engine.detach().unwrap();
        assert_eq!(buf, before);
    }

    #[test]
    fn test_reapply_after_revert_restores_intervening_write() {
        let mut buf = vec![0u8; 4096];
        let engine = attached(&mut buf);
        engine
            .add_patch(MemoryPatch::new("p", PatchKind::WeightModification, 100, vec![0xAA; 8]))
            .unwrap();
        engine.apply_patch("p").unwrap();
        engine.revert_patch("p").unwrap();

        engine.write_memory(100, &[0x11; 8]).unwrap();
        engine.apply_patch("p").unwrap();
        assert_eq!(engine.read_memory(100, 8).unwrap(), vec![0xAA; 8]);
        engine.revert_patch("p").unwrap();
        assert_eq!(engine.read_memory(100, 8).unwrap(), vec![0x11; 8]);
        engine.detach().unwrap();
    }

    #[test]
    fn test_out_of_bounds_rejected_before_mutation() {
        let mut buf = vec![0u8; 128];
        let engine = attached(&mut buf);
        let err = engine
            .add_patch(MemoryPatch::new("oob", PatchKind::Custom, 120, vec![1; 16]))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OutOfBounds);
        assert!(engine.write_memory(127, &[1, 2]).is_err());
        assert!(engine.patch_names().is_empty());
        engine.detach().unwrap();
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_conflict_leaves_state_unchanged() {
        let mut buf = vec![0u8; 256];
        let engine = attached(&mut buf);
        let events = engine.ctx.events.subscribe();

        engine
            .add_patch(MemoryPatch::new("a", PatchKind::Custom, 0, vec![1; 32]).priority(5))
            .unwrap();
        let err = engine
            .add_patch(MemoryPatch::new("b", PatchKind::Custom, 16, vec![2; 32]).priority(5))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert_eq!(engine.patch_names(), vec!["a".to_string()]);
        assert_eq!(engine.statistics().conflicts_detected, 1);
        assert!(events
            .try_iter()
            .any(|e| matches!(e, HotpatchEvent::PatchConflict { .. })));

        engine
            .add_patch(MemoryPatch::new("c", PatchKind::Custom, 16, vec![3; 32]).priority(6))
            .unwrap();
        assert_eq!(engine.patch_names().len(), 2);
    }

    #[test]
    fn test_checksum_gate_blocks_mutation() {
        let mut buf = vec![7u8; 256];
        let engine = attached(&mut buf);
        engine
            .add_patch(MemoryPatch::new("g", PatchKind::Custom, 8, vec![9; 8]).verified(0xDEAD_BEEF))
            .unwrap();
        let err = engine.apply_patch("g").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IntegrityMismatch);
        assert_eq!(engine.read_memory(8, 8).unwrap(), vec![7; 8]);
        assert_eq!(engine.statistics().failed_patches, 1);
    }

    #[test]
    fn test_checksum_recorded_at_registration() {
        let mut buf = vec![7u8; 256];
        let engine = attached(&mut buf);
        engine
            .add_patch(MemoryPatch::new("g", PatchKind::Custom, 8, vec![9; 8]).verified(0))
            .unwrap();
        assert_eq!(engine.patch("g").unwrap().checksum_before, fnv1a_64(&[7u8; 8]));

        engine.write_memory(8, &[1]).unwrap();
        assert!(engine.apply_patch("g").is_err());
        engine.write_memory(8, &[7]).unwrap();
        engine.apply_patch("g").unwrap();
    }

    #[test]
    fn test_remove_requires_revert() {
        let mut buf = vec![0u8; 64];
        let engine = attached(&mut buf);
        engine
            .add_patch(MemoryPatch::new("p", PatchKind::Custom, 0, vec![1; 4]))
            .unwrap();
        assert!(engine.revert_patch("p").is_err());
        engine.apply_patch("p").unwrap();
        assert_eq!(engine.remove_patch("p").unwrap_err().kind(), ErrorKind::InvalidState);
        engine.revert_patch("p").unwrap();
        engine.remove_patch("p").unwrap();
        assert!(engine.patch("p").is_none());
    }

    #[test]
    fn test_disabled_and_empty_payload() {
        let mut buf = vec![0u8; 64];
        let engine = attached(&mut buf);
        engine
            .add_patch(MemoryPatch::new("off", PatchKind::Custom, 0, vec![1; 4]).disabled())
            .unwrap();
        engine.apply_patch("off").unwrap();
        assert_eq!(engine.read_memory(0, 4).unwrap(), vec![0; 4]);

        engine
            .add_patch(MemoryPatch::structural("empty", PatchKind::VocabularyPatch, 8, 4))
            .unwrap();
        assert_eq!(engine.apply_patch("empty").unwrap_err().kind(), ErrorKind::InvalidInput);

        engine
            .add_patch(MemoryPatch::structural("redirect", PatchKind::GraphRedirection, 16, 0))
            .unwrap();
        engine.apply_patch("redirect").unwrap();
    }

    #[test]
    fn test_apply_all_and_revert_all_with_overlap() {
        let mut buf = vec![0u8; 64];
        let engine = attached(&mut buf);
        engine
            .add_patch(MemoryPatch::new("low", PatchKind::Custom, 0, vec![1; 8]).priority(1))
            .unwrap();
        engine
            .add_patch(MemoryPatch::new("high", PatchKind::Custom, 4, vec![2; 8]).priority(2))
            .unwrap();

        let report = engine.apply_all_patches();
        assert!(report.all_succeeded());
        assert_eq!(report.succeeded, vec!["low".to_string(), "high".to_string()]);
        assert_eq!(engine.read_memory(0, 12).unwrap(), [vec![1; 4], vec![2; 8]].concat());

        let report = engine.revert_all_patches();
        assert!(report.all_succeeded());
        assert_eq!(engine.read_memory(0, 12).unwrap(), vec![0; 12]);
    }

    #[test]
    fn test_backup_restore_resets_counters() {
        let mut buf = vec![5u8; 128];
        let engine = attached(&mut buf);
        engine
            .add_patch(MemoryPatch::new("p", PatchKind::Custom, 0, vec![1; 16]))
            .unwrap();
        engine.apply_patch("p").unwrap();
        assert_eq!(engine.statistics().bytes_modified, 16);

        engine.restore_backup().unwrap();
        let stats = engine.statistics();
        assert_eq!(stats.applied_patches, 0);
        assert_eq!(stats.bytes_modified, 0);
        assert_eq!(engine.read_memory(0, 16).unwrap(), vec![5; 16]);
        engine.remove_patch("p").unwrap();
    }

    #[test]
    fn test_detach_restores_applied_patches() {
        let mut buf = vec![3u8; 128];
        {
            let engine = attached(&mut buf);
            engine
                .add_patch(MemoryPatch::new("p", PatchKind::Custom, 10, vec![9; 10]))
                .unwrap();
            engine.apply_patch("p").unwrap();
            engine.detach().unwrap();
        }
        assert!(buf.iter().all(|&b| b == 3));
    }

    #[test]
    fn test_direct_operations() {
        let mut buf: Vec<u8> = (0..64u8).collect();
        let engine = attached(&mut buf);

        engine.fill(0, 4, 0xFF).unwrap();
        assert!(engine.compare(0, &[0xFF; 4]).unwrap());

        engine.copy_within(8, 12, 4).unwrap();
        assert_eq!(engine.read_memory(12, 4).unwrap(), vec![8, 9, 10, 11]);

        engine.atomic_swap(16, 32, 4).unwrap();
        assert_eq!(engine.read_memory(16, 4).unwrap(), vec![32, 33, 34, 35]);
        assert_eq!(engine.read_memory(32, 4).unwrap(), vec![16, 17, 18, 19]);
        assert!(engine.atomic_swap(16, 18, 4).is_err());

        assert_eq!(engine.search(&[40, 41, 42, 43, 44], 0).unwrap(), Some(40));
        assert_eq!(engine.search(&[200], 0).unwrap(), None);

        let err = engine.write_batch(&[(0, vec![1]), (63, vec![1, 2])]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OutOfBounds);
        assert_eq!(engine.read_memory(0, 1).unwrap(), vec![0xFF]);
        engine.write_batch(&[(0, vec![1]), (63, vec![2])]).unwrap();
        assert_eq!(engine.read_memory(63, 1).unwrap(), vec![2]);
    }

    #[test]
    fn test_integrity_baseline() {
        let mut buf = vec![0u8; 1024];
        buf[..4].copy_from_slice(b"GGUF");
        let engine = attached(&mut buf);

        assert!(engine.verify_model_integrity().unwrap().detail.contains("baseline"));
        engine.verify_model_integrity().unwrap();
        engine.write_memory(100, &[1]).unwrap();
        assert_eq!(
            engine.verify_model_integrity().unwrap_err().kind(),
            ErrorKind::IntegrityMismatch
        );

        engine.write_memory(0, b"XXXX").unwrap();
        assert!(engine.verify_model_integrity().is_err());
    }

    #[test]
    fn test_tensor_operations() {
        let weights: Vec<u8> = [1.0f32, -4.0, 20.0, 0.5]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect();
        let mut image = build_safetensors(&[
            ("blk.0.attn_output.weight", "F32", vec![4], weights.clone()),
            ("blk.0.ffn_down.weight", "F32", vec![4], weights.clone()),
            ("token_embd.weight", "Q4_0", vec![4], vec![1, 2, 3]),
        ]);

        let engine = engine();
        engine.set_metadata_parser(Box::new(SafeTensorsParser));
        unsafe { engine.attach(image.as_mut_ptr(), image.len()) }.unwrap();
        assert_eq!(engine.tensor_names().len(), 3);

        let attn = engine.find_tensor("blk.0.attn_output.weight").unwrap();
        engine.scale_tensor_weights(&attn.name, 2.0).unwrap();
        let scaled = engine.read_memory(attn.offset, 4).unwrap();
        assert_eq!(scaled, 2.0f32.to_le_bytes());

        engine.clamp_tensor_weights(&attn.name, -1.0, 1.0).unwrap();
        let clamped = engine.read_memory(attn.offset + 8, 4).unwrap();
        assert_eq!(clamped, 1.0f32.to_le_bytes());

        assert_eq!(
            engine.scale_tensor_weights("token_embd.weight", 2.0).unwrap_err().kind(),
            ErrorKind::NotSupported
        );

        engine.bypass_layer(0).unwrap();
        let ffn = engine.find_tensor("blk.0.ffn_down.weight").unwrap();
        assert_eq!(engine.read_memory(ffn.offset, ffn.size).unwrap(), vec![0; 16]);
        engine.revert_patch("bypass.blk.0.ffn_down.weight").unwrap();
        assert_eq!(engine.read_memory(ffn.offset, ffn.size).unwrap(), weights);
        assert!(engine.bypass_layer(7).is_err());
    }

    #[test]
    fn test_transform_patch_computes_payload() {
        let mut buf: Vec<u8> = [2.0f32, 3.0].iter().flat_map(|v| v.to_le_bytes()).collect();
        let engine = attached(&mut buf);
        engine
            .add_patch(MemoryPatch::with_transform(
                "scale",
                PatchKind::AttentionScale,
                0,
                8,
                WeightTransform::Scale(0.5),
                ElementType::F32,
            ))
            .unwrap();
        engine.apply_patch("scale").unwrap();
        assert_eq!(engine.read_memory(4, 4).unwrap(), 1.5f32.to_le_bytes());
        engine.revert_patch("scale").unwrap();
        assert_eq!(engine.read_memory(4, 4).unwrap(), 3.0f32.to_le_bytes());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_patch_read_only_mapping() {
        let page = crate::protect::platform_protector().page_size();
        let mut map = memmap2::MmapMut::map_anon(page * 2).unwrap();
        map[page + 10] = 1;
        let map = map.make_read_only().unwrap();

        let engine = engine();
        unsafe { engine.attach(map.as_ptr() as *mut u8, map.len()) }.unwrap();
        engine
            .add_patch(MemoryPatch::new("ro", PatchKind::Custom, page + 8, vec![0x42; 4]))
            .unwrap();
        let outcome = engine.apply_patch("ro").unwrap();
        assert!(outcome.is_clean());
        assert_eq!(map[page + 10], 0x42);

        engine.revert_patch("ro").unwrap();
        assert_eq!(map[page + 10], 1);
        engine.detach().unwrap();
    }
}
