//! Byte and JSON level request/response correction
//!
//! Rules run in registration order. Substitutions with an equal-length
//! replacement are patched in place; anything else is copied and grown.

use crate::validation::{self, ValidationOutcome, ValidationRule};
use parking_lot::Mutex;
use patchloop_common::config::ProxyConfig;
use patchloop_common::search;
use patchloop_common::{
    check_range, HotpatchContext, HotpatchError, HotpatchEvent, PatchLayer, PatchOutcome, Result,
};
use serde::Serialize;
use serde_json::Value;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Byte substitution carried by a rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Substitution {
    pub pattern: Vec<u8>,
    pub replacement: Vec<u8>,
}

impl Substitution {
    pub fn new(pattern: impl Into<Vec<u8>>, replacement: impl Into<Vec<u8>>) -> Self {
        Self {
            pattern: pattern.into(),
            replacement: replacement.into(),
        }
    }

    /// Apply to `data`, returning the new bytes and the number of matches
    pub fn apply(&self, mut data: Vec<u8>) -> (Vec<u8>, usize) {
        if self.pattern.is_empty() || data.is_empty() {
            return (data, 0);
        }
        if self.pattern.len() == self.replacement.len() {
            let count = search::replace_in_place(&mut data, &self.pattern, &self.replacement, None)
                .unwrap_or(0);
            return (data, count);
        }
        search::replace_all(&data, &self.pattern, &self.replacement)
    }
}

/// What a proxy rule does
#[derive(Debug, Clone)]
pub enum ProxyRuleKind {
    /// Request rewrite at byte level, JSON level, or both
    ParameterOverride {
        substitution: Option<Substitution>,
        parameter: Option<(String, Value)>,
    },
    ResponseCorrection(Substitution),
    /// Terminate streams from this chunk index on
    StreamTermination { after_chunks: usize },
    AgentValidation(ValidationRule),
    /// Request bytes injected through a substitution
    MemoryInjection(Substitution),
    /// Additive bias per token id
    TokenLogitBias(Vec<(usize, f32)>),
}

impl ProxyRuleKind {
    pub fn label(&self) -> &'static str {
        match self {
            ProxyRuleKind::ParameterOverride { .. } => "ParameterOverride",
            ProxyRuleKind::ResponseCorrection(_) => "ResponseCorrection",
            ProxyRuleKind::StreamTermination { .. } => "StreamTermination",
            ProxyRuleKind::AgentValidation(_) => "AgentValidation",
            ProxyRuleKind::MemoryInjection(_) => "MemoryInjection",
            ProxyRuleKind::TokenLogitBias(_) => "TokenLogitBias",
        }
    }
}

/// Named proxy rule
#[derive(Debug, Clone)]
pub struct ProxyRule {
    pub name: String,
    pub enabled: bool,
    pub kind: ProxyRuleKind,
}

impl ProxyRule {
    pub fn new(name: impl Into<String>, kind: ProxyRuleKind) -> Self {
        Self {
            name: name.into(),
            enabled: true,
            kind,
        }
    }

    pub fn byte_override(
        name: impl Into<String>,
        pattern: impl Into<Vec<u8>>,
        replacement: impl Into<Vec<u8>>,
    ) -> Self {
        Self::new(
            name,
            ProxyRuleKind::ParameterOverride {
                substitution: Some(Substitution::new(pattern, replacement)),
                parameter: None,
            },
        )
    }

    pub fn json_override(name: impl Into<String>, parameter: impl Into<String>, value: Value) -> Self {
        Self::new(
            name,
            ProxyRuleKind::ParameterOverride {
                substitution: None,
                parameter: Some((parameter.into(), value)),
            },
        )
    }

    pub fn correction(
        name: impl Into<String>,
        pattern: impl Into<Vec<u8>>,
        replacement: impl Into<Vec<u8>>,
    ) -> Self {
        Self::new(
            name,
            ProxyRuleKind::ResponseCorrection(Substitution::new(pattern, replacement)),
        )
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// Proxy statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProxyStats {
    pub requests_processed: u64,
    pub responses_processed: u64,
    pub chunks_processed: u64,
    pub bytes_patched: u64,
    pub patches_applied: u64,
    pub validation_failures: u64,
    pub corrections_applied: u64,
    pub streams_terminated: u64,
    pub buffer_operations: u64,
    pub avg_processing_time_ms: f64,
}

impl ProxyStats {
    fn record_time(&mut self, start: Instant) {
        let n = (self.requests_processed + self.responses_processed) as f64;
        if n > 0.0 {
            let elapsed = start.elapsed().as_secs_f64() * 1000.0;
            self.avg_processing_time_ms = (self.avg_processing_time_ms * (n - 1.0) + elapsed) / n;
        }
    }
}

struct ProxyState {
    rules: Vec<ProxyRule>,
    stats: ProxyStats,
    enabled: bool,
    stream_cutoff: Option<usize>,
    stream_terminated: bool,
}

impl ProxyState {
    fn rule_mut(&mut self, name: &str) -> Result<&mut ProxyRule> {
        self.rules
            .iter_mut()
            .find(|r| r.name == name)
            .ok_or_else(|| HotpatchError::not_found(format!("proxy rule {}", name)))
    }

    /// Lowest cutoff among the explicit point and enabled termination rules
    fn effective_cutoff(&self) -> Option<usize> {
        self.rules
            .iter()
            .filter(|r| r.enabled)
            .filter_map(|r| match r.kind {
                ProxyRuleKind::StreamTermination { after_chunks } => Some(after_chunks),
                _ => None,
            })
            .chain(self.stream_cutoff)
            .min()
    }
}

/// Request/response correction proxy
pub struct ProxyHotpatcher {
    ctx: HotpatchContext,
    state: Mutex<ProxyState>,
}

impl ProxyHotpatcher {
    pub fn new(ctx: HotpatchContext, config: &ProxyConfig) -> Self {
        Self {
            ctx,
            state: Mutex::new(ProxyState {
                rules: Vec::new(),
                stats: ProxyStats::default(),
                enabled: config.enabled,
                stream_cutoff: config.stream_cutoff,
                stream_terminated: false,
            }),
        }
    }

    pub fn add_rule(&self, rule: ProxyRule) -> Result<()> {
        if rule.name.is_empty() {
            return Err(HotpatchError::invalid_input("rule name must not be empty"));
        }
        let mut state = self.state.lock();
        if state.rules.iter().any(|r| r.name == rule.name) {
            return Err(HotpatchError::Duplicate(rule.name));
        }
        info!("Added proxy rule {} ({})", rule.name, rule.kind.label());
        state.rules.push(rule);
        Ok(())
    }

    pub fn remove_rule(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock();
        let before = state.rules.len();
        state.rules.retain(|r| r.name != name);
        if state.rules.len() == before {
            return Err(HotpatchError::not_found(format!("proxy rule {}", name)));
        }
        info!("Removed proxy rule {}", name);
        Ok(())
    }

    pub fn set_rule_enabled(&self, name: &str, enabled: bool) -> Result<()> {
        let mut state = self.state.lock();
        state.rule_mut(name)?.enabled = enabled;
        debug!("Proxy rule {} {}", name, if enabled { "enabled" } else { "disabled" });
        Ok(())
    }

    pub fn has_rule(&self, name: &str) -> bool {
        self.state.lock().rules.iter().any(|r| r.name == name)
    }

    pub fn rule(&self, name: &str) -> Option<ProxyRule> {
        self.state.lock().rules.iter().find(|r| r.name == name).cloned()
    }

    /// Rule names in registration order
    pub fn rule_names(&self) -> Vec<String> {
        self.state.lock().rules.iter().map(|r| r.name.clone()).collect()
    }

    pub fn clear_rules(&self) {
        self.state.lock().rules.clear();
        info!("All proxy rules cleared");
    }

    /// Apply request-side byte rules
    pub fn process_request(&self, request: &[u8]) -> Vec<u8> {
        let mut state = self.state.lock();
        if !state.enabled || request.is_empty() {
            return request.to_vec();
        }
        let start = Instant::now();

        let mut data = request.to_vec();
        let mut applied = Vec::new();
        for rule in state.rules.iter().filter(|r| r.enabled) {
            let substitution = match &rule.kind {
                ProxyRuleKind::ParameterOverride {
                    substitution: Some(s),
                    ..
                } => s,
                ProxyRuleKind::MemoryInjection(s) => s,
                _ => continue,
            };
            let (next, count) = substitution.apply(data);
            data = next;
            if count > 0 {
                applied.push((rule.name.clone(), count * substitution.replacement.len()));
            }
        }

        self.record_applied(&mut state.stats, applied);
        self.finish_request(&mut state.stats, start);
        data
    }

    /// Apply JSON parameter overrides to an object request
    pub fn process_request_json(&self, request: Value) -> Value {
        let mut state = self.state.lock();
        if !state.enabled {
            return request;
        }
        let mut object = match request {
            Value::Object(object) => object,
            other => return other,
        };
        let start = Instant::now();

        let mut applied = Vec::new();
        for rule in state.rules.iter().filter(|r| r.enabled) {
            if let ProxyRuleKind::ParameterOverride {
                parameter: Some((name, value)),
                ..
            } = &rule.kind
            {
                object.insert(name.clone(), value.clone());
                applied.push((rule.name.clone(), 0));
            }
        }
        self.record_applied(&mut state.stats, applied);
        self.finish_request(&mut state.stats, start);
        Value::Object(object)
    }

    /// Validate and correct response bytes
    pub fn process_response(&self, response: &[u8]) -> Vec<u8> {
        let mut state = self.state.lock();
        if !state.enabled || response.is_empty() {
            return response.to_vec();
        }
        let start = Instant::now();

        let mut data = response.to_vec();
        let mut applied = Vec::new();
        let mut failures = Vec::new();
        for rule in state.rules.iter().filter(|r| r.enabled) {
            match &rule.kind {
                ProxyRuleKind::AgentValidation(check) => {
                    let outcome = check.check(&data);
                    if !outcome.valid {
                        let corrected = outcome.corrected.is_some();
                        if let Some(fixed) = outcome.corrected.clone() {
                            data = fixed.into_bytes();
                        }
                        failures.push((rule.name.clone(), outcome, corrected));
                    }
                }
                ProxyRuleKind::ResponseCorrection(s) => {
                    let (next, count) = s.apply(data);
                    data = next;
                    if count > 0 {
                        applied.push((rule.name.clone(), count * s.replacement.len()));
                    }
                }
                _ => {}
            }
        }

        for (rule, outcome, corrected) in failures {
            self.record_validation_failure(&mut state.stats, &rule, &outcome);
            if corrected {
                state.stats.corrections_applied += 1;
            }
        }
        self.record_applied(&mut state.stats, applied);
        self.finish_response(&mut state.stats, start);
        data
    }

    /// Validate the `content` or `text` field of a response object
    pub fn process_response_json(&self, response: Value) -> Value {
        let mut state = self.state.lock();
        if !state.enabled {
            return response;
        }
        let mut object = match response {
            Value::Object(object) => object,
            other => return other,
        };
        let start = Instant::now();
        let field = ["content", "text"]
            .into_iter()
            .find(|f| object.get(*f).and_then(Value::as_str).is_some_and(|s| !s.is_empty()));
        let Some(field) = field else {
            self.finish_response(&mut state.stats, start);
            return Value::Object(object);
        };
        let text = object
            .get(field)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let outcome = Self::validate_locked(&state.rules, text.as_bytes());
        if let Some((rule, outcome)) = outcome {
            self.record_validation_failure(&mut state.stats, &rule, &outcome);
            if let Some(corrected) = outcome.corrected {
                object.insert(field.to_string(), Value::String(corrected));
                state.stats.corrections_applied += 1;
            }
        }
        self.finish_response(&mut state.stats, start);
        Value::Object(object)
    }

    pub fn process_stream_chunk(&self, chunk: &[u8], index: usize) -> Vec<u8> {
        self.process_stream_chunk_with(chunk, index, |c| c)
    }

    /// Process one chunk, then run `transform` over the corrected bytes
    ///
    /// Returns an empty buffer from the cutoff index on; the caller closes the
    /// stream. Chunk 0 starts a new stream.
    pub fn process_stream_chunk_with<F>(&self, chunk: &[u8], index: usize, transform: F) -> Vec<u8>
    where
        F: FnOnce(Vec<u8>) -> Vec<u8>,
    {
        let mut state = self.state.lock();
        if !state.enabled {
            return chunk.to_vec();
        }
        if index == 0 {
            state.stream_terminated = false;
        }

        if state.effective_cutoff().is_some_and(|cutoff| index >= cutoff) {
            if !state.stream_terminated {
                state.stream_terminated = true;
                state.stats.streams_terminated += 1;
                self.ctx.metrics.pipeline.streams_terminated.inc();
                self.ctx.emit(HotpatchEvent::StreamTerminated {
                    layer: PatchLayer::Proxy,
                    chunk_index: index,
                });
                info!("Stream terminated at chunk {}", index);
            }
            return Vec::new();
        }

        let mut data = chunk.to_vec();
        let mut applied = Vec::new();
        for rule in state.rules.iter().filter(|r| r.enabled) {
            if let ProxyRuleKind::ResponseCorrection(s) = &rule.kind {
                let (next, count) = s.apply(data);
                data = next;
                if count > 0 {
                    applied.push((rule.name.clone(), count * s.replacement.len()));
                }
            }
        }
        let data = transform(data);

        state.stats.chunks_processed += 1;
        self.record_applied(&mut state.stats, applied);
        self.ctx.metrics.pipeline.chunks_processed.inc();
        data
    }

    /// Start a new stream regardless of chunk numbering
    pub fn begin_stream(&self) {
        self.state.lock().stream_terminated = false;
    }

    pub fn set_stream_termination_point(&self, chunk: usize) {
        self.state.lock().stream_cutoff = Some(chunk);
        info!("Stream termination set at chunk {}", chunk);
    }

    pub fn clear_stream_termination(&self) {
        self.state.lock().stream_cutoff = None;
    }

    /// Cutoff currently in force
    pub fn stream_termination_point(&self) -> Option<usize> {
        self.state.lock().effective_cutoff()
    }

    pub fn should_terminate_stream(&self, index: usize) -> bool {
        self.stream_termination_point()
            .is_some_and(|cutoff| index >= cutoff)
    }

    /// Run every enabled agent validation rule; first failure wins
    pub fn validate_agent_output(&self, output: &[u8]) -> ValidationOutcome {
        let state = self.state.lock();
        match Self::validate_locked(&state.rules, output) {
            Some((_, outcome)) => outcome,
            None => ValidationOutcome::valid(),
        }
    }

    pub fn validate_plan_mode(&self, output: &[u8]) -> ValidationOutcome {
        validation::validate_plan_mode(output)
    }

    pub fn validate_agent_mode(&self, output: &[u8]) -> ValidationOutcome {
        validation::validate_agent_mode(output)
    }

    pub fn validate_ask_mode(&self, output: &[u8]) -> ValidationOutcome {
        validation::validate_ask_mode(output)
    }

    /// Substitute `pattern` in a copy of `data`
    pub fn byte_patch(&self, data: &[u8], pattern: &[u8], replacement: &[u8]) -> Vec<u8> {
        let (out, count) = Substitution::new(pattern, replacement).apply(data.to_vec());
        self.state.lock().stats.bytes_patched += (count * replacement.len()) as u64;
        out
    }

    pub fn find_pattern(&self, data: &[u8], pattern: &[u8], start: usize) -> Option<usize> {
        search::find_from(data, pattern, start)
    }

    /// Add the biases of enabled logit-bias rules; returns entries applied
    pub fn apply_logit_bias(&self, logits: &mut [f32]) -> usize {
        let mut state = self.state.lock();
        if !state.enabled {
            return 0;
        }
        let mut count = 0;
        for rule in state.rules.iter().filter(|r| r.enabled) {
            if let ProxyRuleKind::TokenLogitBias(biases) = &rule.kind {
                for (token, bias) in biases {
                    match logits.get_mut(*token) {
                        Some(logit) => {
                            *logit += bias;
                            count += 1;
                        }
                        None => warn!(
                            "Rule {} biases token {} beyond vocabulary of {}",
                            rule.name,
                            token,
                            logits.len()
                        ),
                    }
                }
            }
        }
        state.stats.patches_applied += count as u64;
        count
    }

    /// Set logits by token id; every id is checked before any write
    pub fn modify_logits(&self, logits: &mut [f32], modifications: &[(usize, f32)]) -> Result<PatchOutcome> {
        if let Some((token, _)) = modifications.iter().find(|(t, _)| *t >= logits.len()) {
            return Err(HotpatchError::out_of_bounds(*token, 1, logits.len()));
        }
        for (token, value) in modifications {
            logits[*token] = *value;
        }
        self.count_buffer_op(0, modifications.len() as u64);
        Ok(PatchOutcome::new(format!("modified {} logits", modifications.len())))
    }

    /// Overwrite bytes of a caller buffer
    pub fn inject(&self, buffer: &mut [u8], offset: usize, data: &[u8]) -> Result<PatchOutcome> {
        check_range(offset, data.len(), buffer.len())?;
        buffer[offset..offset + data.len()].copy_from_slice(data);
        self.count_buffer_op(data.len(), 1);
        debug!("Injected {} bytes at {}", data.len(), offset);
        Ok(PatchOutcome::new(format!("injected {} bytes at {}", data.len(), offset)))
    }

    /// Validate every injection, then perform them in order
    pub fn inject_batch(&self, buffer: &mut [u8], injections: &[(usize, Vec<u8>)]) -> Result<PatchOutcome> {
        for (offset, data) in injections {
            check_range(*offset, data.len(), buffer.len())?;
        }
        let mut total = 0;
        for (offset, data) in injections {
            buffer[*offset..*offset + data.len()].copy_from_slice(data);
            total += data.len();
        }
        self.count_buffer_op(total, injections.len() as u64);
        Ok(PatchOutcome::new(format!(
            "injected {} entries, {} bytes",
            injections.len(),
            total
        )))
    }

    pub fn extract(&self, buffer: &[u8], offset: usize, len: usize) -> Result<Vec<u8>> {
        check_range(offset, len, buffer.len())?;
        Ok(buffer[offset..offset + len].to_vec())
    }

    /// Substitute in a caller buffer; returns the number of matches
    pub fn replace_in_buffer(&self, buffer: &mut Vec<u8>, pattern: &[u8], replacement: &[u8]) -> usize {
        let (out, count) = Substitution::new(pattern, replacement).apply(std::mem::take(buffer));
        *buffer = out;
        self.count_buffer_op(count * replacement.len(), 1);
        count
    }

    /// Insert bytes into a stream chunk at `offset`
    pub fn inject_into_stream(&self, chunk: &mut Vec<u8>, offset: usize, injection: &[u8]) -> Result<PatchOutcome> {
        if offset > chunk.len() {
            return Err(HotpatchError::out_of_bounds(offset, 0, chunk.len()));
        }
        chunk.splice(offset..offset, injection.iter().copied());
        self.count_buffer_op(injection.len(), 1);
        Ok(PatchOutcome::new(format!("inserted {} bytes", injection.len())))
    }

    pub fn search_buffer(&self, buffer: &[u8], pattern: &[u8]) -> Option<usize> {
        search::find(buffer, pattern)
    }

    /// Exchange two non-overlapping regions of a caller buffer
    pub fn swap_regions(&self, buffer: &mut [u8], a: usize, b: usize, size: usize) -> Result<PatchOutcome> {
        check_range(a, size, buffer.len())?;
        check_range(b, size, buffer.len())?;
        if size > 0 && a < b + size && b < a + size {
            return Err(HotpatchError::invalid_input("swap regions overlap"));
        }
        let (lo, hi) = (a.min(b), a.max(b));
        let (head, tail) = buffer.split_at_mut(hi);
        head[lo..lo + size].swap_with_slice(&mut tail[..size]);
        self.count_buffer_op(size * 2, 1);
        Ok(PatchOutcome::new(format!("swapped {} bytes", size)))
    }

    /// Copy a region of a caller buffer over another; regions may overlap
    pub fn clone_region(&self, buffer: &mut [u8], src: usize, dst: usize, size: usize) -> Result<PatchOutcome> {
        check_range(src, size, buffer.len())?;
        check_range(dst, size, buffer.len())?;
        buffer.copy_within(src..src + size, dst);
        self.count_buffer_op(size, 1);
        Ok(PatchOutcome::new(format!("cloned {} bytes", size)))
    }

    /// Replace the whole token buffer
    pub fn overwrite_token_buffer(&self, buffer: &mut Vec<u8>, tokens: &[u8]) -> PatchOutcome {
        buffer.clear();
        buffer.extend_from_slice(tokens);
        self.count_buffer_op(tokens.len(), 1);
        PatchOutcome::new(format!("token buffer overwritten with {} bytes", tokens.len()))
    }

    pub fn statistics(&self) -> ProxyStats {
        self.state.lock().stats.clone()
    }

    pub fn reset_statistics(&self) {
        self.state.lock().stats = ProxyStats::default();
        info!("Proxy statistics reset");
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.state.lock().enabled = enabled;
        info!("Proxy layer {}", if enabled { "enabled" } else { "disabled" });
    }

    pub fn is_enabled(&self) -> bool {
        self.state.lock().enabled
    }

    fn validate_locked(rules: &[ProxyRule], output: &[u8]) -> Option<(String, ValidationOutcome)> {
        rules
            .iter()
            .filter(|r| r.enabled)
            .filter_map(|r| match &r.kind {
                ProxyRuleKind::AgentValidation(check) => Some((r.name.as_str(), check)),
                _ => None,
            })
            .map(|(name, check)| (name.to_string(), check.check(output)))
            .find(|(_, outcome)| !outcome.valid)
    }

    fn finish_request(&self, stats: &mut ProxyStats, start: Instant) {
        stats.requests_processed += 1;
        stats.record_time(start);
        self.ctx.metrics.pipeline.requests_processed.inc();
        self.ctx
            .metrics
            .pipeline
            .processing_duration
            .observe(start.elapsed().as_secs_f64());
    }

    fn finish_response(&self, stats: &mut ProxyStats, start: Instant) {
        stats.responses_processed += 1;
        stats.record_time(start);
        self.ctx.metrics.pipeline.responses_processed.inc();
        self.ctx
            .metrics
            .pipeline
            .processing_duration
            .observe(start.elapsed().as_secs_f64());
    }

    fn record_applied(&self, stats: &mut ProxyStats, applied: Vec<(String, usize)>) {
        for (rule, bytes) in applied {
            stats.patches_applied += 1;
            stats.bytes_patched += bytes as u64;
            self.ctx.emit(HotpatchEvent::RuleApplied {
                layer: PatchLayer::Proxy,
                rule,
            });
        }
    }

    fn record_validation_failure(&self, stats: &mut ProxyStats, rule: &str, outcome: &ValidationOutcome) {
        stats.validation_failures += 1;
        self.ctx.metrics.pipeline.validation_failures.inc();
        let reason = outcome.error.clone().unwrap_or_default();
        warn!("Validation rule {} failed: {}", rule, reason);
        self.ctx.emit(HotpatchEvent::ValidationFailed {
            rule: rule.to_string(),
            reason,
        });
    }

    fn count_buffer_op(&self, bytes: usize, patches: u64) {
        let mut state = self.state.lock();
        state.stats.buffer_operations += 1;
        state.stats.bytes_patched += bytes as u64;
        state.stats.patches_applied += patches;
    }
}
