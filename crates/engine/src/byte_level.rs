//! Byte-level patching of an owned model image
//!
//! [`ByteLevelHotpatcher`] loads a model file into memory and patches the
//! copy. The file on disk is untouched until [`ByteLevelHotpatcher::save_model`].

use crate::patch::{find_conflict, BatchReport, PatchConflict, PatchSpan};
use chrono::{DateTime, Utc};
use memmap2::Mmap;
use parking_lot::Mutex;
use patchloop_common::config::ByteConfig;
use patchloop_common::search;
use patchloop_common::{
    check_range, crc32, fnv1a_64, HashAlgorithm, HotpatchContext, HotpatchError, HotpatchEvent,
    PatchLayer, PatchOutcome, Result,
};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt::{self, Write as _};
use std::fs::File;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Per-byte operation of a byte patch
#[derive(Clone)]
pub enum ByteOperation {
    /// Overwrite with the operand; operand length must equal the patch length
    Replace,
    BitFlip,
    BitSet,
    BitClear,
    And,
    Or,
    Xor,
    /// Wrapping add
    Add,
    Rotate { left: bool },
    /// `f(byte, index_in_patch)`
    Custom(Arc<dyn Fn(u8, usize) -> u8 + Send + Sync>),
}

impl ByteOperation {
    pub fn label(&self) -> &'static str {
        match self {
            ByteOperation::Replace => "replace",
            ByteOperation::BitFlip => "bit_flip",
            ByteOperation::BitSet => "bit_set",
            ByteOperation::BitClear => "bit_clear",
            ByteOperation::And => "and",
            ByteOperation::Or => "or",
            ByteOperation::Xor => "xor",
            ByteOperation::Add => "add",
            ByteOperation::Rotate { .. } => "rotate",
            ByteOperation::Custom(_) => "custom",
        }
    }
}

impl fmt::Debug for ByteOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ByteOperation::Rotate { left } => f.debug_struct("Rotate").field("left", left).finish(),
            other => f.write_str(other.label()),
        }
    }
}

/// Named byte-range mutation of the loaded image
#[derive(Debug, Clone)]
pub struct BytePatch {
    pub name: String,
    pub description: String,
    pub category: String,
    pub enabled: bool,
    pub offset: usize,
    pub length: usize,
    pub operation: ByteOperation,
    /// Replacement bytes, or the repeating key for And/Or/Xor/Add
    pub operand: Vec<u8>,
    /// Mask for the bit operations; And/Or/Xor/Add fall back to it without an operand
    pub bit_mask: u8,
    pub bit_shift: u32,
    /// Bytes that must be present before applying
    pub expected_before: Option<Vec<u8>>,
    /// Hash the target range must have before applying
    pub integrity_hash: Option<u64>,
    /// Hash used for `integrity_hash`; the layer default when unset
    pub hash_algorithm: Option<HashAlgorithm>,
    pub original_bytes: Option<Vec<u8>>,
    pub priority: i32,
    pub times_applied: u32,
    pub created: DateTime<Utc>,
}

impl BytePatch {
    pub fn new(name: impl Into<String>, offset: usize, length: usize, operation: ByteOperation) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            category: String::new(),
            enabled: true,
            offset,
            length,
            operation,
            operand: Vec::new(),
            bit_mask: 0xFF,
            bit_shift: 0,
            expected_before: None,
            integrity_hash: None,
            hash_algorithm: None,
            original_bytes: None,
            priority: 0,
            times_applied: 0,
            created: Utc::now(),
        }
    }

    /// Replace `bytes.len()` bytes at `offset`
    pub fn replace(name: impl Into<String>, offset: usize, bytes: Vec<u8>) -> Self {
        let mut patch = Self::new(name, offset, bytes.len(), ByteOperation::Replace);
        patch.operand = bytes;
        patch
    }

    pub fn operand(mut self, operand: Vec<u8>) -> Self {
        self.operand = operand;
        self
    }

    pub fn mask(mut self, mask: u8) -> Self {
        self.bit_mask = mask;
        self
    }

    pub fn shift(mut self, shift: u32) -> Self {
        self.bit_shift = shift;
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn expect_before(mut self, bytes: Vec<u8>) -> Self {
        self.expected_before = Some(bytes);
        self
    }

    pub fn integrity(mut self, hash: u64, algorithm: HashAlgorithm) -> Self {
        self.integrity_hash = Some(hash);
        self.hash_algorithm = Some(algorithm);
        self
    }

    /// New contents of the target range
    pub fn transform(&self, current: &[u8]) -> Result<Vec<u8>> {
        let operand_at = |i: usize| {
            if self.operand.is_empty() {
                self.bit_mask
            } else {
                self.operand[i % self.operand.len()]
            }
        };

        let out = match &self.operation {
            ByteOperation::Replace => {
                if self.operand.len() != self.length {
                    return Err(HotpatchError::invalid_input(format!(
                        "replace operand is {} bytes but patch length is {}",
                        self.operand.len(),
                        self.length
                    )));
                }
                self.operand.clone()
            }
            ByteOperation::BitFlip => current.iter().map(|b| b ^ self.bit_mask).collect(),
            ByteOperation::BitSet => current.iter().map(|b| b | self.bit_mask).collect(),
            ByteOperation::BitClear => current.iter().map(|b| b & !self.bit_mask).collect(),
            ByteOperation::And => current.iter().enumerate().map(|(i, b)| b & operand_at(i)).collect(),
            ByteOperation::Or => current.iter().enumerate().map(|(i, b)| b | operand_at(i)).collect(),
            ByteOperation::Xor => current.iter().enumerate().map(|(i, b)| b ^ operand_at(i)).collect(),
            ByteOperation::Add => current
                .iter()
                .enumerate()
                .map(|(i, b)| b.wrapping_add(operand_at(i)))
                .collect(),
            ByteOperation::Rotate { left } => {
                let shift = self.bit_shift % 8;
                current
                    .iter()
                    .map(|b| if *left { b.rotate_left(shift) } else { b.rotate_right(shift) })
                    .collect()
            }
            ByteOperation::Custom(f) => current.iter().enumerate().map(|(i, b)| f(*b, i)).collect(),
        };
        Ok(out)
    }
}

impl PatchSpan for BytePatch {
    fn name(&self) -> &str {
        &self.name
    }

    fn span(&self) -> Range<usize> {
        self.offset..self.offset + self.length
    }

    fn priority(&self) -> i32 {
        self.priority
    }
}

/// Byte layer statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct ByteStats {
    pub total_patches: usize,
    pub patches_applied: u64,
    pub patches_reverted: u64,
    pub bytes_patched: u64,
    pub model_size: usize,
    pub operation_counts: BTreeMap<String, u64>,
}

struct ByteState {
    data: Vec<u8>,
    path: Option<PathBuf>,
    patches: HashMap<String, BytePatch>,
    stats: ByteStats,
}

impl ByteState {
    fn require_loaded(&self) -> Result<()> {
        if self.data.is_empty() {
            return Err(HotpatchError::not_attached("no model loaded"));
        }
        Ok(())
    }

    fn count(&mut self, op: &str, bytes: usize) {
        *self.stats.operation_counts.entry(op.to_string()).or_insert(0) += 1;
        self.stats.bytes_patched += bytes as u64;
    }
}

/// Patches an owned in-memory copy of a model file
pub struct ByteLevelHotpatcher {
    ctx: HotpatchContext,
    config: ByteConfig,
    state: Mutex<ByteState>,
}

impl ByteLevelHotpatcher {
    pub fn new(ctx: HotpatchContext, config: ByteConfig) -> Self {
        Self {
            ctx,
            config,
            state: Mutex::new(ByteState {
                data: Vec::new(),
                path: None,
                patches: HashMap::new(),
                stats: ByteStats::default(),
            }),
        }
    }

    /// Read the whole file into memory, replacing any loaded image
    pub fn load_model<P: AsRef<Path>>(&self, path: P) -> Result<PatchOutcome> {
        let start = Instant::now();
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| {
            HotpatchError::Io(std::io::Error::new(
                e.kind(),
                format!("failed to open {}: {}", path.display(), e),
            ))
        })?;
        if file.metadata()?.len() == 0 {
            return Err(HotpatchError::invalid_input(format!(
                "model file {} is empty",
                path.display()
            )));
        }

        // SAFETY: the mapping is only read while copying and dropped right after
        let mmap = unsafe { Mmap::map(&file)? };
        let data = mmap.to_vec();
        drop(mmap);

        let size = data.len();
        self.install(data, Some(path.to_path_buf()));
        info!("Loaded {} ({} bytes) into byte layer", path.display(), size);
        self.ctx.emit(HotpatchEvent::ModelLoaded {
            path: path.to_path_buf(),
            size,
        });
        Ok(PatchOutcome::new(format!("loaded {} bytes", size)).timed(start))
    }

    /// Use an in-memory image
    pub fn load_bytes(&self, data: Vec<u8>) -> Result<()> {
        if data.is_empty() {
            return Err(HotpatchError::invalid_input("model image is empty"));
        }
        self.install(data, None);
        Ok(())
    }

    fn install(&self, data: Vec<u8>, path: Option<PathBuf>) {
        let mut state = self.state.lock();
        state.stats = ByteStats {
            model_size: data.len(),
            ..ByteStats::default()
        };
        state.data = data;
        state.path = path;
        state.patches.clear();
    }

    /// Write the patched image to `path`
    pub fn save_model<P: AsRef<Path>>(&self, path: P) -> Result<PatchOutcome> {
        let path = path.as_ref();
        let state = self.state.lock();
        state.require_loaded()?;
        std::fs::write(path, &state.data)?;
        info!("Saved byte layer image to {}", path.display());
        self.ctx.emit(HotpatchEvent::ModelSaved {
            path: path.to_path_buf(),
        });
        Ok(PatchOutcome::new(format!(
            "saved {} bytes to {}",
            state.data.len(),
            path.display()
        )))
    }

    pub fn is_loaded(&self) -> bool {
        !self.state.lock().data.is_empty()
    }

    pub fn model_path(&self) -> Option<PathBuf> {
        self.state.lock().path.clone()
    }

    /// Copy of the current image
    pub fn model_data(&self) -> Vec<u8> {
        self.state.lock().data.clone()
    }

    pub fn add_patch(&self, patch: BytePatch) -> Result<()> {
        let mut state = self.state.lock();
        state.require_loaded()?;
        if patch.name.is_empty() {
            return Err(HotpatchError::invalid_input("patch name must not be empty"));
        }
        if state.patches.contains_key(&patch.name) {
            return Err(HotpatchError::Duplicate(patch.name));
        }
        check_range(patch.offset, patch.length, state.data.len())?;
        if matches!(patch.operation, ByteOperation::Replace) && patch.operand.len() != patch.length {
            return Err(HotpatchError::invalid_input(format!(
                "replace patch {} operand is {} bytes, length is {}",
                patch.name,
                patch.operand.len(),
                patch.length
            )));
        }

        if let Some(conflict) = find_conflict(&patch, state.patches.values()) {
            self.ctx.metrics.hotpatch.conflicts_detected.inc();
            self.ctx.emit(HotpatchEvent::PatchConflict {
                existing: conflict.existing.clone(),
                incoming: conflict.incoming.clone(),
                reason: conflict.reason.clone(),
            });
            return Err(HotpatchError::Conflict(conflict.to_string()));
        }

        debug!(
            "Registered byte patch {} ({:?}) at {}+{}",
            patch.name, patch.operation, patch.offset, patch.length
        );
        state.patches.insert(patch.name.clone(), patch);
        state.stats.total_patches = state.patches.len();
        Ok(())
    }

    pub fn check_patch_conflict(&self, patch: &BytePatch) -> Option<PatchConflict> {
        let state = self.state.lock();
        find_conflict(patch, state.patches.values())
    }

    pub fn remove_patch(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock();
        let patch = state
            .patches
            .get(name)
            .ok_or_else(|| HotpatchError::not_found(format!("byte patch {}", name)))?;
        if patch.times_applied > 0 {
            return Err(HotpatchError::invalid_state(format!(
                "byte patch {} is applied; revert it before removing",
                name
            )));
        }
        state.patches.remove(name);
        state.stats.total_patches = state.patches.len();
        Ok(())
    }

    pub fn patch(&self, name: &str) -> Option<BytePatch> {
        self.state.lock().patches.get(name).cloned()
    }

    pub fn patch_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.lock().patches.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn apply_patch(&self, name: &str) -> Result<PatchOutcome> {
        let start = Instant::now();
        let mut state = self.state.lock();
        let result = self.apply_locked(&mut state, name);
        self.record(&result);
        result.map(|o| o.timed(start))
    }

    pub fn revert_patch(&self, name: &str) -> Result<PatchOutcome> {
        let start = Instant::now();
        let mut state = self.state.lock();
        let result = self.revert_locked(&mut state, name);
        self.record(&result);
        result.map(|o| o.timed(start))
    }

    /// Apply every enabled patch in offset order
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
            let result = self.apply_locked(&mut state, &name);
            self.record(&result);
            match result {
                Ok(_) => report.succeeded.push(name),
                Err(e) => {
                    warn!("Failed to apply byte patch {}: {}", name, e);
                    report.failed.push((name, e));
                }
            }
        }
        report
    }

    /// Revert every applied patch, highest offset first
    pub fn revert_all_patches(&self) -> BatchReport {
        let mut state = self.state.lock();
        let mut order: Vec<(usize, String)> = state
            .patches
            .values()
            .filter(|p| p.times_applied > 0)
            .map(|p| (p.offset, p.name.clone()))
            .collect();
        order.sort_by(|a, b| b.cmp(a));

        let mut report = BatchReport::default();
        for (_, name) in order {
            let result = self.revert_locked(&mut state, &name);
            self.record(&result);
            match result {
                Ok(_) => report.succeeded.push(name),
                Err(e) => {
                    warn!("Failed to revert byte patch {}: {}", name, e);
                    report.failed.push((name, e));
                }
            }
        }
        report
    }

    /// Replace one byte if it currently holds `old`
    pub fn replace_byte(&self, offset: usize, old: u8, new: u8) -> Result<PatchOutcome> {
        self.replace_bytes(offset, &[old], &[new])
    }

    /// Replace `old` with `new` at `offset` if `old` is currently there
    pub fn replace_bytes(&self, offset: usize, old: &[u8], new: &[u8]) -> Result<PatchOutcome> {
        if old.len() != new.len() {
            return Err(HotpatchError::invalid_input(format!(
                "old ({}) and new ({}) lengths differ",
                old.len(),
                new.len()
            )));
        }
        let mut state = self.state.lock();
        state.require_loaded()?;
        check_range(offset, old.len(), state.data.len())?;
        let target = &mut state.data[offset..offset + old.len()];
        if target != old {
            return Err(HotpatchError::integrity(format!(
                "bytes at {} do not match the expected value",
                offset
            )));
        }
        target.copy_from_slice(new);
        state.count("replace", new.len());
        Ok(PatchOutcome::new(format!("replaced {} bytes at {}", new.len(), offset)))
    }

    pub fn flip_bits(&self, offset: usize, mask: u8) -> Result<PatchOutcome> {
        self.bit_operation(offset, 1, &ByteOperation::BitFlip, mask)
    }

    /// Offsets of every non-overlapping occurrence
    pub fn find_pattern(&self, pattern: &[u8]) -> Vec<usize> {
        search::find_all(&self.state.lock().data, pattern)
    }

    /// Substitute an equal-length replacement in place, optionally capped
    pub fn replace_pattern(
        &self,
        pattern: &[u8],
        replacement: &[u8],
        max_occurrences: Option<usize>,
    ) -> Result<usize> {
        let mut state = self.state.lock();
        state.require_loaded()?;
        let count = search::replace_in_place(&mut state.data, pattern, replacement, max_occurrences)?;
        if count > 0 {
            state.count("replace_pattern", count * replacement.len());
        }
        debug!("Replaced {} occurrences of a {}-byte pattern", count, pattern.len());
        Ok(count)
    }

    pub fn crc32_range(&self, offset: usize, len: usize) -> Result<u32> {
        let state = self.state.lock();
        check_range(offset, len, state.data.len())?;
        Ok(crc32(&state.data[offset..offset + len]))
    }

    pub fn fnv1a_range(&self, offset: usize, len: usize) -> Result<u64> {
        let state = self.state.lock();
        check_range(offset, len, state.data.len())?;
        Ok(fnv1a_64(&state.data[offset..offset + len]))
    }

    /// `offset: xx xx ...` lines of `bytes_per_line` bytes
    pub fn hex_dump(&self, offset: usize, len: usize, bytes_per_line: usize) -> Result<String> {
        let state = self.state.lock();
        check_range(offset, len, state.data.len())?;
        let per_line = bytes_per_line.max(1);
        let mut out = String::new();
        for (line, chunk) in state.data[offset..offset + len].chunks(per_line).enumerate() {
            let _ = write!(out, "{:08x}:", offset + line * per_line);
            for byte in chunk {
                let _ = write!(out, " {:02x}", byte);
            }
            out.push('\n');
        }
        Ok(out)
    }

    pub fn read(&self, offset: usize, size: usize) -> Result<Vec<u8>> {
        let state = self.state.lock();
        check_range(offset, size, state.data.len())?;
        Ok(state.data[offset..offset + size].to_vec())
    }

    pub fn write(&self, offset: usize, data: &[u8]) -> Result<PatchOutcome> {
        let mut state = self.state.lock();
        state.require_loaded()?;
        check_range(offset, data.len(), state.data.len())?;
        state.data[offset..offset + data.len()].copy_from_slice(data);
        state.count("write", data.len());
        Ok(PatchOutcome::new(format!("wrote {} bytes at {}", data.len(), offset)))
    }

    /// Validate every write, then perform them in order
    pub fn write_batch(&self, writes: &[(usize, Vec<u8>)]) -> Result<PatchOutcome> {
        let mut state = self.state.lock();
        state.require_loaded()?;
        for (offset, data) in writes {
            check_range(*offset, data.len(), state.data.len())?;
        }
        let mut total = 0;
        for (offset, data) in writes {
            state.data[*offset..*offset + data.len()].copy_from_slice(data);
            total += data.len();
        }
        state.count("write_batch", total);
        Ok(PatchOutcome::new(format!("wrote {} ranges", writes.len())))
    }

    pub fn fill(&self, offset: usize, size: usize, value: u8) -> Result<PatchOutcome> {
        let mut state = self.state.lock();
        state.require_loaded()?;
        check_range(offset, size, state.data.len())?;
        state.data[offset..offset + size].fill(value);
        state.count("fill", size);
        Ok(PatchOutcome::new(format!("filled {} bytes", size)))
    }

    /// Copy `size` bytes from `src` to `dst`; ranges may overlap
    pub fn copy_within(&self, src: usize, dst: usize, size: usize) -> Result<PatchOutcome> {
        let mut state = self.state.lock();
        state.require_loaded()?;
        check_range(src, size, state.data.len())?;
        check_range(dst, size, state.data.len())?;
        state.data.copy_within(src..src + size, dst);
        state.count("copy", size);
        Ok(PatchOutcome::new(format!("copied {} bytes", size)))
    }

    pub fn compare(&self, offset: usize, expected: &[u8]) -> Result<bool> {
        let state = self.state.lock();
        check_range(offset, expected.len(), state.data.len())?;
        Ok(&state.data[offset..offset + expected.len()] == expected)
    }

    /// XOR a range with a repeating key, returning the new bytes
    pub fn xor(&self, offset: usize, size: usize, key: &[u8]) -> Result<Vec<u8>> {
        if key.is_empty() {
            return Err(HotpatchError::invalid_input("xor key must not be empty"));
        }
        let mut state = self.state.lock();
        state.require_loaded()?;
        check_range(offset, size, state.data.len())?;
        for (i, byte) in state.data[offset..offset + size].iter_mut().enumerate() {
            *byte ^= key[i % key.len()];
        }
        state.count("xor", size);
        Ok(state.data[offset..offset + size].to_vec())
    }

    /// Apply a single-operand bitwise or arithmetic operation to a range
    pub fn bit_operation(
        &self,
        offset: usize,
        size: usize,
        operation: &ByteOperation,
        operand: u8,
    ) -> Result<PatchOutcome> {
        let op: fn(u8, u8) -> u8 = match operation {
            ByteOperation::BitFlip | ByteOperation::Xor => |b, x| b ^ x,
            ByteOperation::BitSet | ByteOperation::Or => |b, x| b | x,
            ByteOperation::BitClear => |b, x| b & !x,
            ByteOperation::And => |b, x| b & x,
            ByteOperation::Add => |b, x| b.wrapping_add(x),
            other => {
                return Err(HotpatchError::invalid_input(format!(
                    "{} is not a single-operand bit operation",
                    other.label()
                )))
            }
        };
        let mut state = self.state.lock();
        state.require_loaded()?;
        check_range(offset, size, state.data.len())?;
        for byte in &mut state.data[offset..offset + size] {
            *byte = op(*byte, operand);
        }
        state.count(operation.label(), size);
        Ok(PatchOutcome::new(format!("{} over {} bytes", operation.label(), size)))
    }

    pub fn rotate(&self, offset: usize, size: usize, shift: u32, left: bool) -> Result<PatchOutcome> {
        let mut state = self.state.lock();
        state.require_loaded()?;
        check_range(offset, size, state.data.len())?;
        let shift = shift % 8;
        for byte in &mut state.data[offset..offset + size] {
            *byte = if left {
                byte.rotate_left(shift)
            } else {
                byte.rotate_right(shift)
            };
        }
        state.count("rotate", size);
        Ok(PatchOutcome::new(format!("rotated {} bytes by {}", size, shift)))
    }

    pub fn reverse(&self, offset: usize, size: usize) -> Result<PatchOutcome> {
        let mut state = self.state.lock();
        state.require_loaded()?;
        check_range(offset, size, state.data.len())?;
        state.data[offset..offset + size].reverse();
        state.count("reverse", size);
        Ok(PatchOutcome::new(format!("reversed {} bytes", size)))
    }

    pub fn search(&self, pattern: &[u8], from: usize) -> Option<usize> {
        search::find_from(&self.state.lock().data, pattern, from)
    }

    /// Exchange two non-overlapping ranges
    pub fn atomic_swap(&self, a: usize, b: usize, size: usize) -> Result<PatchOutcome> {
        let mut state = self.state.lock();
        state.require_loaded()?;
        check_range(a, size, state.data.len())?;
        check_range(b, size, state.data.len())?;
        if size > 0 && a < b + size && b < a + size {
            return Err(HotpatchError::invalid_input("swap ranges overlap"));
        }
        let (lo, hi) = (a.min(b), a.max(b));
        let (head, tail) = state.data.split_at_mut(hi);
        head[lo..lo + size].swap_with_slice(&mut tail[..size]);
        state.count("swap", size * 2);
        Ok(PatchOutcome::new(format!("swapped {} bytes", size)))
    }

    pub fn statistics(&self) -> ByteStats {
        self.state.lock().stats.clone()
    }

    pub fn reset_statistics(&self) {
        let mut state = self.state.lock();
        state.stats = ByteStats {
            model_size: state.data.len(),
            total_patches: state.patches.len(),
            ..ByteStats::default()
        };
    }

    fn apply_locked(&self, state: &mut ByteState, name: &str) -> Result<PatchOutcome> {
        state.require_loaded()?;
        let data_len = state.data.len();
        let patch = state
            .patches
            .get(name)
            .ok_or_else(|| HotpatchError::not_found(format!("byte patch {}", name)))?;
        if !patch.enabled {
            return Ok(PatchOutcome::new(format!("byte patch {} disabled, skipped", name)));
        }
        check_range(patch.offset, patch.length, data_len)?;

        let range = patch.offset..patch.offset + patch.length;
        let current = &state.data[range.clone()];
        if let Some(expected) = &patch.expected_before {
            if expected.as_slice() != current {
                return Err(self.integrity_failure(format!(
                    "byte patch {}: contents differ from expected bytes",
                    name
                )));
            }
        }
        if let Some(hash) = patch.integrity_hash {
            let algorithm = patch.hash_algorithm.unwrap_or(self.config.hash_algorithm);
            let actual = algorithm.digest(current);
            if actual != hash {
                return Err(self.integrity_failure(format!(
                    "byte patch {}: {:?} hash {:#x} != expected {:#x}",
                    name, algorithm, actual, hash
                )));
            }
        }

        let updated = patch.transform(current)?;
        let original = current.to_vec();
        let label = patch.operation.label();
        state.data[range.clone()].copy_from_slice(&updated);

        if let Some(patch) = state.patches.get_mut(name) {
            // Stacked re-applies keep the first snapshot
            if patch.times_applied == 0 || patch.original_bytes.is_none() {
                patch.original_bytes = Some(original);
            }
            patch.times_applied += 1;
        }
        state.stats.patches_applied += 1;
        state.count(label, range.len());
        self.ctx.metrics.hotpatch.patches_applied.inc();
        self.ctx.metrics.hotpatch.bytes_modified.inc_by(range.len() as u64);
        self.ctx.emit(HotpatchEvent::PatchApplied {
            layer: PatchLayer::Byte,
            name: name.to_string(),
        });
        info!("Applied byte patch {} ({} at {}+{})", name, label, range.start, range.len());
        Ok(PatchOutcome::new(format!("applied {}", name)))
    }

    fn revert_locked(&self, state: &mut ByteState, name: &str) -> Result<PatchOutcome> {
        let patch = state
            .patches
            .get(name)
            .ok_or_else(|| HotpatchError::not_found(format!("byte patch {}", name)))?;
        let original = match (&patch.original_bytes, patch.times_applied) {
            (Some(original), n) if n > 0 => original.clone(),
            _ => {
                return Err(HotpatchError::invalid_state(format!(
                    "byte patch {} is not applied",
                    name
                )))
            }
        };
        let offset = patch.offset;
        check_range(offset, original.len(), state.data.len())?;
        state.data[offset..offset + original.len()].copy_from_slice(&original);

        if let Some(patch) = state.patches.get_mut(name) {
            patch.times_applied = 0;
        }
        state.stats.patches_reverted += 1;
        self.ctx.metrics.hotpatch.patches_reverted.inc();
        self.ctx.emit(HotpatchEvent::PatchReverted {
            layer: PatchLayer::Byte,
            name: name.to_string(),
        });
        info!("Reverted byte patch {}", name);
        Ok(PatchOutcome::new(format!("reverted {}", name)))
    }

    fn integrity_failure(&self, detail: String) -> HotpatchError {
        self.ctx.metrics.hotpatch.integrity_failures.inc();
        warn!("Integrity check failed: {}", detail);
        self.ctx.emit(HotpatchEvent::IntegrityCheckFailed {
            layer: PatchLayer::Byte,
            detail: detail.clone(),
        });
        HotpatchError::integrity(detail)
    }

    fn record(&self, result: &Result<PatchOutcome>) {
        if let Err(e) = result {
            self.ctx.metrics.hotpatch.patches_failed.inc();
            self.ctx.emit(HotpatchEvent::Error {
                layer: PatchLayer::Byte,
                code: e.code(),
                message: e.to_string(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use patchloop_common::ErrorKind;
    use std::io::Write;

    fn patcher_with(data: Vec<u8>) -> ByteLevelHotpatcher {
        let patcher = ByteLevelHotpatcher::new(HotpatchContext::isolated(), ByteConfig::default());
        patcher.load_bytes(data).unwrap();
        patcher
    }

    #[test]
    fn test_load_and_save_round_trip() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"GGUF model bytes").unwrap();

        let patcher = ByteLevelHotpatcher::new(HotpatchContext::isolated(), ByteConfig::default());
        patcher.load_model(file.path()).unwrap();
        assert_eq!(patcher.statistics().model_size, 16);
        patcher.replace_bytes(5, b"model", b"MODEL").unwrap();

        // Source file untouched until saved
        assert_eq!(std::fs::read(file.path()).unwrap(), b"GGUF model bytes");

        let out = tempfile::NamedTempFile::new().unwrap();
        patcher.save_model(out.path()).unwrap();
        assert_eq!(std::fs::read(out.path()).unwrap(), b"GGUF MODEL bytes");
    }

    #[test]
    fn test_load_rejects_missing_and_empty() {
        let patcher = ByteLevelHotpatcher::new(HotpatchContext::isolated(), ByteConfig::default());
        assert!(patcher.load_model("/nonexistent/model.gguf").is_err());
        let empty = tempfile::NamedTempFile::new().unwrap();
        assert!(patcher.load_model(empty.path()).is_err());
        assert!(!patcher.is_loaded());
    }

    #[test]
    fn test_replace_patch_requires_matching_length() {
        let patcher = patcher_with(vec![0; 32]);
        let mut bad = BytePatch::replace("bad", 0, vec![1, 2, 3]);
        bad.length = 4;
        assert_eq!(patcher.add_patch(bad).unwrap_err().kind(), ErrorKind::InvalidInput);
    }

    #[test]
    fn test_apply_revert_operations() {
        let patcher = patcher_with(vec![0b1010_0000; 16]);
        patcher
            .add_patch(BytePatch::new("flip", 0, 2, ByteOperation::BitFlip).mask(0x0F))
            .unwrap();
        patcher
            .add_patch(BytePatch::new("rot", 4, 1, ByteOperation::Rotate { left: true }).shift(1))
            .unwrap();
        patcher
            .add_patch(BytePatch::new("add", 8, 2, ByteOperation::Add).operand(vec![1, 2]))
            .unwrap();
        patcher
            .add_patch(BytePatch::new("custom", 12, 1, ByteOperation::Custom(Arc::new(|b, _| !b))))
            .unwrap();

        let report = patcher.apply_all_patches();
        assert!(report.all_succeeded());
        assert_eq!(patcher.read(0, 2).unwrap(), vec![0b1010_1111; 2]);
        assert_eq!(patcher.read(4, 1).unwrap(), vec![0b0100_0001]);
        assert_eq!(patcher.read(8, 2).unwrap(), vec![0b1010_0001, 0b1010_0010]);
        assert_eq!(patcher.read(12, 1).unwrap(), vec![0b0101_1111]);

        let report = patcher.revert_all_patches();
        assert!(report.all_succeeded());
        assert_eq!(patcher.model_data(), vec![0b1010_0000; 16]);
        assert_eq!(patcher.statistics().patches_reverted, 4);
    }

    #[test]
    fn test_reapply_after_revert_snapshots_current_bytes() {
        let patcher = patcher_with(vec![0; 64]);
        patcher
            .add_patch(BytePatch::replace("p", 10, vec![0xAA; 8]))
            .unwrap();
        patcher.apply_patch("p").unwrap();
        patcher.revert_patch("p").unwrap();

        patcher.write(10, &[0x11; 8]).unwrap();
        patcher.apply_patch("p").unwrap();
        assert_eq!(patcher.read(10, 8).unwrap(), vec![0xAA; 8]);
        patcher.revert_patch("p").unwrap();
        assert_eq!(patcher.read(10, 8).unwrap(), vec![0x11; 8]);
    }

    #[test]
    fn test_expected_before_and_hash_gate() {
        let patcher = patcher_with(b"abcdefgh".to_vec());
        patcher
            .add_patch(BytePatch::replace("p", 0, b"XY".to_vec()).expect_before(b"zz".to_vec()))
            .unwrap();
        assert_eq!(
            patcher.apply_patch("p").unwrap_err().kind(),
            ErrorKind::IntegrityMismatch
        );

        let hash = HashAlgorithm::Crc32.digest(b"ef");
        patcher
            .add_patch(BytePatch::replace("q", 4, b"EF".to_vec()).integrity(hash, HashAlgorithm::Crc32))
            .unwrap();
        patcher.apply_patch("q").unwrap();
        assert_eq!(patcher.model_data(), b"abcdEFgh");
    }

    #[test]
    fn test_conflicts_by_priority() {
        let patcher = patcher_with(vec![0; 32]);
        patcher.add_patch(BytePatch::replace("a", 0, vec![1; 8]).priority(2)).unwrap();
        assert!(patcher.add_patch(BytePatch::replace("b", 4, vec![1; 8]).priority(2)).is_err());
        assert!(patcher.add_patch(BytePatch::replace("c", 4, vec![1; 8]).priority(3)).is_ok());
        assert!(patcher
            .check_patch_conflict(&BytePatch::replace("d", 7, vec![1]).priority(1))
            .is_some());
    }

    #[test]
    fn test_replace_pattern_preserves_layout() {
        let patcher = patcher_with(b"tok_a..tok_b..tok_c".to_vec());
        assert_eq!(patcher.find_pattern(b"tok_"), vec![0, 7, 14]);

        let count = patcher.replace_pattern(b"tok_", b"TOK_", Some(2)).unwrap();
        assert_eq!(count, 2);
        assert_eq!(patcher.model_data(), b"TOK_a..TOK_b..tok_c");
        assert!(patcher.replace_pattern(b"tok_", b"longer", None).is_err());
        assert_eq!(patcher.model_data().len(), 19);
    }

    #[test]
    fn test_direct_operations() {
        let patcher = patcher_with((0..32u8).collect());
        patcher.fill(0, 2, 0xEE).unwrap();
        assert!(patcher.compare(0, &[0xEE, 0xEE]).unwrap());

        patcher.reverse(4, 4).unwrap();
        assert_eq!(patcher.read(4, 4).unwrap(), vec![7, 6, 5, 4]);

        patcher.atomic_swap(8, 16, 2).unwrap();
        assert_eq!(patcher.read(8, 2).unwrap(), vec![16, 17]);
        assert_eq!(patcher.read(16, 2).unwrap(), vec![8, 9]);
        assert!(patcher.atomic_swap(8, 9, 2).is_err());

        assert_eq!(patcher.xor(20, 2, &[0xFF]).unwrap(), vec![!20u8, !21u8]);
        patcher.rotate(24, 1, 9, false).unwrap();
        assert_eq!(patcher.read(24, 1).unwrap(), vec![24u8.rotate_right(1)]);

        patcher.flip_bits(25, 0x01).unwrap();
        assert_eq!(patcher.read(25, 1).unwrap(), vec![24]);
        assert!(patcher.replace_byte(26, 0, 1).is_err());
        patcher.replace_byte(26, 26, 1).unwrap();

        assert!(patcher
            .bit_operation(0, 1, &ByteOperation::Replace, 0)
            .is_err());
        assert_eq!(patcher.search(&[28, 29, 30, 31], 0), Some(28));

        assert!(patcher.write_batch(&[(0, vec![1]), (31, vec![1, 2])]).is_err());
        assert_eq!(patcher.read(0, 1).unwrap(), vec![0xEE]);

        let stats = patcher.statistics();
        assert_eq!(stats.operation_counts["fill"], 1);
        assert_eq!(stats.operation_counts["bit_flip"], 1);
    }

    #[test]
    fn test_hex_dump_and_hashes() {
        let patcher = patcher_with((0..20u8).collect());
        let dump = patcher.hex_dump(0, 20, 16).unwrap();
        let lines: Vec<&str> = dump.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("00000000: 00 01 02"));
        assert_eq!(lines[1], "00000010: 10 11 12 13");
        assert!(patcher.hex_dump(10, 20, 16).is_err());

        assert_eq!(patcher.crc32_range(0, 4).unwrap(), crc32(&[0, 1, 2, 3]));
        assert_eq!(patcher.fnv1a_range(0, 4).unwrap(), fnv1a_64(&[0, 1, 2, 3]));
    }
}
