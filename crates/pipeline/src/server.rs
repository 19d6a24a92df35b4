//! Declarative JSON pipeline hooks
//!
//! [`ServerHotpatch`] rewrites requests and responses around model invocation.
//! Rules are bound to a [`HotpatchPoint`] and run in registration order.

use parking_lot::Mutex;
use patchloop_common::config::ServerConfig;
use patchloop_common::{HotpatchContext, HotpatchError, HotpatchEvent, PatchLayer, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, trace};

/// Where in the pipeline a rule runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HotpatchPoint {
    PreRequest,
    PostRequest,
    PreResponse,
    PostResponse,
    StreamChunk,
}

/// Byte transform run over stream chunks
pub type ChunkTransform = Arc<dyn Fn(Vec<u8>) -> Vec<u8> + Send + Sync>;

/// What a server rule does
#[derive(Debug, Clone, PartialEq)]
pub enum ServerTransform {
    InjectSystemPrompt(String),
    ModifyParameter { name: String, value: Value },
    /// Case-insensitive redaction with equal-length `*` runs
    FilterResponse(Vec<String>),
    /// Terminate streams from this chunk index on
    TerminateStream { after_chunks: usize },
    /// Enables response caching while the rule is enabled
    CacheResponse,
    /// Merged into the request `logit_bias` object
    ModifyTokenLogits(Vec<(u32, f32)>),
}

impl ServerTransform {
    pub fn label(&self) -> &'static str {
        match self {
            ServerTransform::InjectSystemPrompt(_) => "InjectSystemPrompt",
            ServerTransform::ModifyParameter { .. } => "ModifyParameter",
            ServerTransform::FilterResponse(_) => "FilterResponse",
            ServerTransform::TerminateStream { .. } => "TerminateStream",
            ServerTransform::CacheResponse => "CacheResponse",
            ServerTransform::ModifyTokenLogits(_) => "ModifyTokenLogits",
        }
    }
}

/// Named pipeline rule
#[derive(Clone)]
pub struct ServerRule {
    pub name: String,
    pub point: HotpatchPoint,
    pub enabled: bool,
    pub transform: ServerTransform,
    /// Extra transform for `StreamChunk` rules
    pub chunk_transform: Option<ChunkTransform>,
}

impl fmt::Debug for ServerRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerRule")
            .field("name", &self.name)
            .field("point", &self.point)
            .field("enabled", &self.enabled)
            .field("transform", &self.transform)
            .field("chunk_transform", &self.chunk_transform.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

impl ServerRule {
    pub fn new(name: impl Into<String>, point: HotpatchPoint, transform: ServerTransform) -> Self {
        Self {
            name: name.into(),
            point,
            enabled: true,
            transform,
            chunk_transform: None,
        }
    }

    pub fn system_prompt(name: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self::new(
            name,
            HotpatchPoint::PreRequest,
            ServerTransform::InjectSystemPrompt(prompt.into()),
        )
    }

    pub fn parameter(name: impl Into<String>, parameter: impl Into<String>, value: Value) -> Self {
        Self::new(
            name,
            HotpatchPoint::PreRequest,
            ServerTransform::ModifyParameter {
                name: parameter.into(),
                value,
            },
        )
    }

    pub fn filter<I, S>(name: impl Into<String>, terms: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(
            name,
            HotpatchPoint::PreResponse,
            ServerTransform::FilterResponse(terms.into_iter().map(Into::into).collect()),
        )
    }

    pub fn with_chunk_transform<F>(mut self, transform: F) -> Self
    where
        F: Fn(Vec<u8>) -> Vec<u8> + Send + Sync + 'static,
    {
        self.chunk_transform = Some(Arc::new(transform));
        self
    }
}

/// Server layer statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct ServerStats {
    pub requests_processed: u64,
    pub responses_processed: u64,
    pub chunks_processed: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub bytes_patched: u64,
    pub patches_applied: u64,
    pub streams_terminated: u64,
    pub avg_processing_time_ms: f64,
}

impl ServerStats {
    fn record_time(&mut self, start: Instant) {
        let n = (self.requests_processed + self.responses_processed) as f64;
        if n > 0.0 {
            let elapsed = start.elapsed().as_secs_f64() * 1000.0;
            self.avg_processing_time_ms = (self.avg_processing_time_ms * (n - 1.0) + elapsed) / n;
        }
    }
}

/// Response cache bounded by entry count, evicting the oldest insertion
#[derive(Debug)]
struct ResponseCache {
    entries: HashMap<String, Value>,
    order: VecDeque<String>,
    capacity: usize,
}

impl ResponseCache {
    fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Insert or refresh `key`; returns the evicted key, if any
    fn insert(&mut self, key: String, value: Value) -> Option<String> {
        if let Some(existing) = self.entries.get_mut(&key) {
            *existing = value;
            return None;
        }
        let mut evicted = None;
        if self.entries.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
                evicted = Some(oldest);
            }
        }
        self.order.push_back(key.clone());
        self.entries.insert(key, value);
        evicted
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

struct ServerState {
    rules: Vec<ServerRule>,
    defaults: Map<String, Value>,
    cache: ResponseCache,
    caching_enabled: bool,
    enabled: bool,
    stream_terminated: bool,
    stats: ServerStats,
}

impl ServerState {
    /// Request rewrite without statistics or events
    fn transform_request(&self, request: Value) -> (Value, Vec<String>) {
        if !self.enabled {
            return (request, Vec::new());
        }
        match request {
            Value::Object(mut object) => {
                for (key, value) in &self.defaults {
                    object.insert(key.clone(), value.clone());
                }
                let mut applied = Vec::new();
                for point in [HotpatchPoint::PreRequest, HotpatchPoint::PostRequest] {
                    for rule in self.rules.iter().filter(|r| r.enabled && r.point == point) {
                        if apply_request_transform(&mut object, &rule.transform) {
                            applied.push(rule.name.clone());
                        }
                    }
                }
                (Value::Object(object), applied)
            }
            other => (other, Vec::new()),
        }
    }

    fn caching_active(&self) -> bool {
        self.caching_enabled
            || self
                .rules
                .iter()
                .any(|r| r.enabled && r.transform == ServerTransform::CacheResponse)
    }
}

/// JSON request/response hook pipeline
pub struct ServerHotpatch {
    ctx: HotpatchContext,
    state: Mutex<ServerState>,
}

impl ServerHotpatch {
    pub fn new(ctx: HotpatchContext, config: &ServerConfig) -> Self {
        let mut defaults = config.default_parameters.clone();
        if let Some(t) = config.temperature_override {
            defaults.insert("temperature".to_string(), json!(t));
        }

        let mut rules = Vec::new();
        if let Some(prompt) = &config.system_prompt {
            rules.push(ServerRule::system_prompt("config.system_prompt", prompt.clone()));
        }
        if !config.filtered_terms.is_empty() {
            rules.push(ServerRule::filter("config.filter", config.filtered_terms.clone()));
        }

        Self {
            ctx,
            state: Mutex::new(ServerState {
                rules,
                defaults,
                cache: ResponseCache::new(config.cache_max_entries),
                caching_enabled: config.cache_enabled,
                enabled: config.enabled,
                stream_terminated: false,
                stats: ServerStats::default(),
            }),
        }
    }

    pub fn add_hotpatch(&self, rule: ServerRule) -> Result<()> {
        if rule.name.is_empty() {
            return Err(HotpatchError::invalid_input("hotpatch name must not be empty"));
        }
        let mut state = self.state.lock();
        if state.rules.iter().any(|r| r.name == rule.name) {
            return Err(HotpatchError::Duplicate(rule.name));
        }
        info!(
            "Added server hotpatch {} ({} at {:?})",
            rule.name,
            rule.transform.label(),
            rule.point
        );
        state.rules.push(rule);
        Ok(())
    }

    pub fn remove_hotpatch(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock();
        let before = state.rules.len();
        state.rules.retain(|r| r.name != name);
        if state.rules.len() == before {
            return Err(HotpatchError::not_found(format!("server hotpatch {}", name)));
        }
        info!("Removed server hotpatch {}", name);
        Ok(())
    }

    pub fn set_hotpatch_enabled(&self, name: &str, enabled: bool) -> Result<()> {
        let mut state = self.state.lock();
        let rule = state
            .rules
            .iter_mut()
            .find(|r| r.name == name)
            .ok_or_else(|| HotpatchError::not_found(format!("server hotpatch {}", name)))?;
        rule.enabled = enabled;
        Ok(())
    }

    pub fn has_hotpatch(&self, name: &str) -> bool {
        self.state.lock().rules.iter().any(|r| r.name == name)
    }

    pub fn hotpatch(&self, name: &str) -> Option<ServerRule> {
        self.state.lock().rules.iter().find(|r| r.name == name).cloned()
    }

    pub fn hotpatch_names(&self) -> Vec<String> {
        self.state.lock().rules.iter().map(|r| r.name.clone()).collect()
    }

    pub fn clear_hotpatches(&self) {
        self.state.lock().rules.clear();
        info!("All server hotpatches cleared");
    }

    /// Default parameters, then PreRequest rules, then PostRequest rules
    pub fn process_request(&self, request: Value) -> Value {
        let mut state = self.state.lock();
        if !state.enabled {
            return request;
        }
        let start = Instant::now();

        let (out, applied) = state.transform_request(request);
        self.record_applied(&mut state.stats, applied);

        state.stats.requests_processed += 1;
        state.stats.record_time(start);
        self.ctx.metrics.pipeline.requests_processed.inc();
        out
    }

    /// PreResponse then PostResponse filter rules
    pub fn process_response(&self, response: Value) -> Value {
        let mut state = self.state.lock();
        if !state.enabled {
            return response;
        }
        let start = Instant::now();

        let mut response = response;
        let mut applied = Vec::new();
        for point in [HotpatchPoint::PreResponse, HotpatchPoint::PostResponse] {
            for rule in state.rules.iter().filter(|r| r.enabled && r.point == point) {
                if let ServerTransform::FilterResponse(terms) = &rule.transform {
                    filter_response(&mut response, terms);
                    applied.push(rule.name.clone());
                }
            }
        }
        self.record_applied(&mut state.stats, applied);

        state.stats.responses_processed += 1;
        state.stats.record_time(start);
        self.ctx.metrics.pipeline.responses_processed.inc();
        self.ctx
            .metrics
            .pipeline
            .processing_duration
            .observe(start.elapsed().as_secs_f64());
        response
    }

    /// Run StreamChunk rules over one chunk
    ///
    /// Returns an empty buffer from a termination rule's cutoff on. Chunk 0
    /// starts a new stream.
    pub fn process_stream_chunk(&self, chunk: &[u8], index: usize) -> Vec<u8> {
        let mut state = self.state.lock();
        if !state.enabled {
            return chunk.to_vec();
        }
        if index == 0 {
            state.stream_terminated = false;
        }

        let cutoff = state
            .rules
            .iter()
            .filter(|r| r.enabled && r.point == HotpatchPoint::StreamChunk)
            .filter_map(|r| match r.transform {
                ServerTransform::TerminateStream { after_chunks } => Some(after_chunks),
                _ => None,
            })
            .min();
        if cutoff.is_some_and(|c| index >= c) {
            if !state.stream_terminated {
                state.stream_terminated = true;
                state.stats.streams_terminated += 1;
                self.ctx.metrics.pipeline.streams_terminated.inc();
                self.ctx.emit(HotpatchEvent::StreamTerminated {
                    layer: PatchLayer::Server,
                    chunk_index: index,
                });
                info!("Server stream terminated at chunk {}", index);
            }
            return Vec::new();
        }

        let mut data = chunk.to_vec();
        let mut applied = Vec::new();
        let mut patched = 0;
        for rule in state
            .rules
            .iter()
            .filter(|r| r.enabled && r.point == HotpatchPoint::StreamChunk)
        {
            let mut touched = 0;
            if let ServerTransform::FilterResponse(terms) = &rule.transform {
                touched += redact_bytes(&mut data, terms);
            }
            if let Some(transform) = &rule.chunk_transform {
                let before = data.clone();
                data = transform(data);
                touched += changed_bytes(&before, &data);
            }
            if touched > 0 {
                patched += touched;
                applied.push(rule.name.clone());
            }
        }
        self.record_applied(&mut state.stats, applied);

        state.stats.chunks_processed += 1;
        state.stats.bytes_patched += patched as u64;
        self.ctx.metrics.pipeline.chunks_processed.inc();
        data
    }

    /// Byte-level redaction with every enabled filter rule
    pub fn patch_response_bytes(&self, response: &[u8]) -> Vec<u8> {
        let mut state = self.state.lock();
        let mut data = response.to_vec();
        if !state.enabled {
            return data;
        }
        let mut redacted = 0;
        for rule in state.rules.iter().filter(|r| r.enabled) {
            if let ServerTransform::FilterResponse(terms) = &rule.transform {
                redacted += redact_bytes(&mut data, terms);
            }
        }
        state.stats.bytes_patched += redacted as u64;
        data
    }

    pub fn set_default_parameter(&self, name: impl Into<String>, value: Value) {
        let name = name.into();
        debug!("Default parameter {} = {}", name, value);
        self.state.lock().defaults.insert(name, value);
    }

    pub fn clear_default_parameter(&self, name: &str) {
        self.state.lock().defaults.remove(name);
    }

    pub fn default_parameters(&self) -> Map<String, Value> {
        self.state.lock().defaults.clone()
    }

    pub fn set_caching_enabled(&self, enabled: bool) {
        self.state.lock().caching_enabled = enabled;
        info!("Response caching {}", if enabled { "enabled" } else { "disabled" });
    }

    /// Caching flag or an enabled `CacheResponse` rule
    pub fn is_caching_enabled(&self) -> bool {
        self.state.lock().caching_active()
    }

    pub fn clear_cache(&self) {
        self.state.lock().cache.clear();
        info!("Response cache cleared");
    }

    /// Hex SHA-256 of the compact request JSON
    pub fn cache_key(&self, request: &Value) -> String {
        cache_key(request)
    }

    pub fn has_cached_response(&self, key: &str) -> bool {
        self.state.lock().cache.contains(key)
    }

    pub fn cached_entries(&self) -> usize {
        self.state.lock().cache.len()
    }

    /// Look up a response, counting the hit or miss
    pub fn cached_response(&self, key: &str) -> Option<Value> {
        let mut state = self.state.lock();
        self.lookup_locked(&mut state, key)
    }

    /// Store a response when caching is active
    pub fn cache_response(&self, key: impl Into<String>, response: Value) {
        let mut state = self.state.lock();
        if state.caching_active() {
            if let Some(evicted) = state.cache.insert(key.into(), response) {
                trace!("Evicted cached response {}", evicted);
            }
        }
    }

    /// Cached response for a request as `process_request` would rewrite it
    ///
    /// Only the cache hit/miss counters move; request statistics and events do not.
    pub fn lookup(&self, request: &Value) -> Option<Value> {
        let mut state = self.state.lock();
        if !state.caching_active() {
            return None;
        }
        let (processed, _) = state.transform_request(request.clone());
        let key = cache_key(&processed);
        self.lookup_locked(&mut state, &key)
    }

    /// Process a request, serve it from cache or `generate`, then process the response
    ///
    /// The lock is not held while `generate` runs.
    pub fn process_exchange<F>(&self, request: Value, generate: F) -> Result<Value>
    where
        F: FnOnce(&Value) -> Result<Value>,
    {
        let processed = self.process_request(request);
        let key = {
            let mut state = self.state.lock();
            if state.caching_active() {
                let key = cache_key(&processed);
                if let Some(hit) = self.lookup_locked(&mut state, &key) {
                    return Ok(hit);
                }
                Some(key)
            } else {
                None
            }
        };

        let response = self.process_response(generate(&processed)?);
        if let Some(key) = key {
            self.cache_response(key, response.clone());
        }
        Ok(response)
    }

    pub fn statistics(&self) -> ServerStats {
        self.state.lock().stats.clone()
    }

    pub fn reset_statistics(&self) {
        self.state.lock().stats = ServerStats::default();
        info!("Server statistics reset");
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.state.lock().enabled = enabled;
        info!("Server layer {}", if enabled { "enabled" } else { "disabled" });
    }

    pub fn is_enabled(&self) -> bool {
        self.state.lock().enabled
    }

    fn lookup_locked(&self, state: &mut ServerState, key: &str) -> Option<Value> {
        match state.cache.get(key).cloned() {
            Some(hit) => {
                state.stats.cache_hits += 1;
                self.ctx.metrics.pipeline.cache_hits.inc();
                self.ctx.emit(HotpatchEvent::CacheHit {
                    key: key.to_string(),
                });
                Some(hit)
            }
            None => {
                state.stats.cache_misses += 1;
                self.ctx.metrics.pipeline.cache_misses.inc();
                None
            }
        }
    }

    fn record_applied(&self, stats: &mut ServerStats, applied: Vec<String>) {
        for rule in applied {
            stats.patches_applied += 1;
            self.ctx.emit(HotpatchEvent::RuleApplied {
                layer: PatchLayer::Server,
                rule,
            });
        }
    }
}

/// Hex SHA-256 of the compact serialization of `request`
pub fn cache_key(request: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(request.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

fn apply_request_transform(object: &mut Map<String, Value>, transform: &ServerTransform) -> bool {
    match transform {
        ServerTransform::InjectSystemPrompt(prompt) => inject_system_prompt(object, prompt),
        ServerTransform::ModifyParameter { name, value } => {
            object.insert(name.clone(), value.clone());
            true
        }
        ServerTransform::ModifyTokenLogits(biases) => {
            if biases.is_empty() {
                return false;
            }
            let entry = object
                .entry("logit_bias")
                .or_insert_with(|| Value::Object(Map::new()));
            if !entry.is_object() {
                *entry = Value::Object(Map::new());
            }
            if let Value::Object(map) = entry {
                for (token, bias) in biases {
                    map.insert(token.to_string(), json!(bias));
                }
            }
            true
        }
        ServerTransform::FilterResponse(_)
        | ServerTransform::TerminateStream { .. }
        | ServerTransform::CacheResponse => false,
    }
}

/// Prepend a system message, or prefix the `prompt` string
fn inject_system_prompt(object: &mut Map<String, Value>, prompt: &str) -> bool {
    if prompt.is_empty() {
        return false;
    }
    if let Some(Value::Array(messages)) = object.get_mut("messages") {
        messages.insert(0, json!({"role": "system", "content": prompt}));
        return true;
    }
    let existing = object.get("prompt").and_then(Value::as_str).unwrap_or_default();
    let prefixed = format!("{}\n\n{}", prompt, existing);
    object.insert("prompt".to_string(), Value::String(prefixed));
    true
}

/// Redact `terms` in `content` and `choices[].message.content`
pub fn filter_response(response: &mut Value, terms: &[String]) {
    if terms.is_empty() {
        return;
    }
    if let Some(Value::String(content)) = response.get_mut("content") {
        *content = redact_text(content, terms);
    }
    if let Some(Value::Array(choices)) = response.get_mut("choices") {
        for choice in choices {
            if let Some(Value::String(content)) = choice.pointer_mut("/message/content") {
                *content = redact_text(content, terms);
            }
        }
    }
}

fn chars_eq_ci(a: char, b: char) -> bool {
    a == b || a.to_lowercase().eq(b.to_lowercase())
}

/// One left-to-right pass; returns whether anything changed
fn redact_pass(chars: &mut [char], pattern: &[char]) -> bool {
    let m = pattern.len();
    let mut changed = false;
    let mut i = 0;
    while i + m <= chars.len() {
        if chars[i..i + m]
            .iter()
            .zip(pattern)
            .all(|(a, b)| chars_eq_ci(*a, *b))
        {
            if chars[i..i + m].iter().any(|c| *c != '*') {
                changed = true;
            }
            chars[i..i + m].fill('*');
            i += m;
        } else {
            i += 1;
        }
    }
    changed
}

/// Replace each case-insensitive hit with as many `*` as it has characters
///
/// Repeats until no pass changes the text, so redacting twice is a no-op.
pub fn redact_text(text: &str, terms: &[String]) -> String {
    let mut chars: Vec<char> = text.chars().collect();
    let patterns: Vec<Vec<char>> = terms
        .iter()
        .filter(|t| !t.is_empty())
        .map(|t| t.chars().collect())
        .collect();
    loop {
        let mut changed = false;
        for pattern in &patterns {
            changed |= redact_pass(&mut chars, pattern);
        }
        if !changed {
            break;
        }
    }
    chars.into_iter().collect()
}

/// Positions that differ, plus any change in length
fn changed_bytes(before: &[u8], after: &[u8]) -> usize {
    let differing = before.iter().zip(after).filter(|(a, b)| a != b).count();
    differing + before.len().abs_diff(after.len())
}

/// ASCII case-insensitive byte redaction; returns bytes redacted
pub fn redact_bytes(data: &mut [u8], terms: &[String]) -> usize {
    let mut redacted = 0;
    for term in terms.iter().map(String::as_bytes).filter(|t| !t.is_empty()) {
        let m = term.len();
        let mut i = 0;
        while i + m <= data.len() {
            if data[i..i + m].eq_ignore_ascii_case(term) {
                data[i..i + m].fill(b'*');
                redacted += m;
                i += m;
            } else {
                i += 1;
            }
        }
    }
    redacted
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server() -> ServerHotpatch {
        ServerHotpatch::new(HotpatchContext::isolated(), &ServerConfig::default())
    }

    #[test]
    fn test_redact_and_parameter_override() {
        let server = server();
        server.add_hotpatch(ServerRule::filter("r1", ["secret"])).unwrap();
        server
            .add_hotpatch(ServerRule::parameter("r2", "temperature", json!(0.2)))
            .unwrap();

        assert_eq!(
            server.process_request(json!({"temperature": 0.9})),
            json!({"temperature": 0.2})
        );
        assert_eq!(
            server.process_response(json!({"content": "the secret is X"})),
            json!({"content": "the ****** is X"})
        );
    }

    #[test]
    fn test_filter_is_case_insensitive_and_idempotent() {
        let terms = vec!["Secret".to_string(), "a*".to_string()];
        let once = redact_text("SECRET and secret: aa*", &terms);
        assert_eq!(once.chars().count(), "SECRET and secret: aa*".chars().count());
        assert!(once.starts_with("****** and ******"));
        assert_eq!(redact_text(&once, &terms), once);

        let mut response = json!({"choices": [{"message": {"content": "my SeCrEt"}}, {"delta": {}}]});
        filter_response(&mut response, &terms[..1]);
        assert_eq!(response["choices"][0]["message"]["content"], "my ******");
        assert_eq!(response["choices"][1], json!({"delta": {}}));
    }

    #[test]
    fn test_system_prompt_injection() {
        let server = server();
        server.add_hotpatch(ServerRule::system_prompt("sys", "Be terse.")).unwrap();

        let chat = server.process_request(json!({"messages": [{"role": "user", "content": "hi"}]}));
        assert_eq!(chat["messages"][0], json!({"role": "system", "content": "Be terse."}));
        assert_eq!(chat["messages"][1]["role"], "user");

        let completion = server.process_request(json!({"prompt": "hi"}));
        assert_eq!(completion["prompt"], "Be terse.\n\nhi");
    }

    #[test]
    fn test_defaults_then_pre_then_post_request() {
        let server = server();
        server.set_default_parameter("top_p", json!(0.5));
        server.set_default_parameter("temperature", json!(1.0));
        server
            .add_hotpatch(ServerRule::new(
                "post",
                HotpatchPoint::PostRequest,
                ServerTransform::ModifyParameter {
                    name: "temperature".into(),
                    value: json!(0.1),
                },
            ))
            .unwrap();
        server
            .add_hotpatch(ServerRule::parameter("pre", "temperature", json!(0.7)))
            .unwrap();
        server
            .add_hotpatch(ServerRule::new(
                "bias",
                HotpatchPoint::PreRequest,
                ServerTransform::ModifyTokenLogits(vec![(42, -100.0)]),
            ))
            .unwrap();

        let out = server.process_request(json!({"temperature": 2.0, "extra": [1]}));
        assert_eq!(out["temperature"], json!(0.1));
        assert_eq!(out["top_p"], json!(0.5));
        assert_eq!(out["extra"], json!([1]));
        assert_eq!(out["logit_bias"]["42"], json!(-100.0));
    }

    #[test]
    fn test_stream_termination_and_chunk_transform() {
        let ctx = HotpatchContext::isolated();
        let events = ctx.events.subscribe();
        let server = ServerHotpatch::new(ctx, &ServerConfig::default());
        server
            .add_hotpatch(
                ServerRule::new(
                    "upper",
                    HotpatchPoint::StreamChunk,
                    ServerTransform::FilterResponse(vec!["bad".into()]),
                )
                .with_chunk_transform(|c| c.to_ascii_uppercase()),
            )
            .unwrap();
        server
            .add_hotpatch(ServerRule::new(
                "rst",
                HotpatchPoint::StreamChunk,
                ServerTransform::TerminateStream { after_chunks: 2 },
            ))
            .unwrap();

        assert_eq!(server.process_stream_chunk(b"a bad b", 0), b"A *** B");
        // 3 redacted, then 'a' and 'b' uppercased
        assert_eq!(server.statistics().bytes_patched, 5);
        assert_eq!(server.process_stream_chunk(b"OK", 1), b"OK");
        assert_eq!(server.statistics().bytes_patched, 5);
        assert!(server.process_stream_chunk(b"ok", 2).is_empty());
        assert!(server.process_stream_chunk(b"ok", 3).is_empty());

        let terminated = events
            .try_iter()
            .filter(|e| matches!(e, HotpatchEvent::StreamTerminated { .. }))
            .count();
        assert_eq!(terminated, 1);
    }

    #[test]
    fn test_patch_response_bytes() {
        let server = server();
        server.add_hotpatch(ServerRule::filter("f", ["Key"])).unwrap();
        let out = server.patch_response_bytes(br#"{"content":"api key here"}"#);
        assert_eq!(out, br#"{"content":"api *** here"}"#);
    }

    #[test]
    fn test_cache_exchange() {
        let server = server();
        let request = json!({"prompt": "hello", "temperature": 0.2});
        let calls = std::cell::Cell::new(0);
        let generate = |_: &Value| -> Result<Value> {
            calls.set(calls.get() + 1);
            Ok(json!({"content": "world"}))
        };

        // Caching off: every exchange generates
        server.process_exchange(request.clone(), generate).unwrap();
        server.process_exchange(request.clone(), generate).unwrap();
        assert_eq!(calls.get(), 2);

        server
            .add_hotpatch(ServerRule::new("cache", HotpatchPoint::PreResponse, ServerTransform::CacheResponse))
            .unwrap();
        assert!(server.is_caching_enabled());
        let first = server.process_exchange(request.clone(), generate).unwrap();
        let second = server.process_exchange(request.clone(), generate).unwrap();
        assert_eq!(calls.get(), 3);
        assert_eq!(first, second);

        let stats = server.statistics();
        assert_eq!(stats.cache_hits, 1);
        assert_eq!(stats.cache_misses, 1);
        assert!(server.lookup(&request).is_some());

        server.clear_cache();
        assert!(server.lookup(&request).is_none());
    }

    #[test]
    fn test_lookup_does_not_count_requests() {
        let ctx = HotpatchContext::isolated();
        let events = ctx.events.subscribe();
        let server = ServerHotpatch::new(ctx, &ServerConfig::default());
        server.set_caching_enabled(true);
        server
            .add_hotpatch(ServerRule::parameter("temp", "temperature", json!(0.2)))
            .unwrap();

        let request = json!({"prompt": "hi"});
        let processed = server.process_request(request.clone());
        server.cache_response(cache_key(&processed), json!({"content": "cached"}));
        let before = server.statistics();
        let applied_before = events
            .try_iter()
            .filter(|e| matches!(e, HotpatchEvent::RuleApplied { .. }))
            .count();
        assert_eq!(applied_before, 1);

        assert_eq!(server.lookup(&request), Some(json!({"content": "cached"})));
        assert!(server.lookup(&json!({"prompt": "other"})).is_none());

        let after = server.statistics();
        assert_eq!(after.requests_processed, before.requests_processed);
        assert_eq!(after.patches_applied, before.patches_applied);
        assert_eq!(after.cache_hits, 1);
        assert_eq!(after.cache_misses, 1);
        assert_eq!(events.try_iter().count(), 1);
    }

    #[test]
    fn test_cache_evicts_oldest_when_full() {
        let config = ServerConfig {
            cache_enabled: true,
            cache_max_entries: 2,
            ..ServerConfig::default()
        };
        let server = ServerHotpatch::new(HotpatchContext::isolated(), &config);
        server.cache_response("a", json!(1));
        server.cache_response("b", json!(2));
        server.cache_response("a", json!(10));
        assert_eq!(server.cached_entries(), 2);

        server.cache_response("c", json!(3));
        assert_eq!(server.cached_entries(), 2);
        assert!(!server.has_cached_response("a"));
        assert_eq!(server.cached_response("b"), Some(json!(2)));
        assert_eq!(server.cached_response("c"), Some(json!(3)));

        server.clear_cache();
        assert_eq!(server.cached_entries(), 0);
        server.cache_response("d", json!(4));
        assert!(server.has_cached_response("d"));
    }

    #[test]
    fn test_cache_key_is_sha256_hex() {
        let key = cache_key(&json!({"b": 1, "a": 2}));
        assert_eq!(key.len(), 64);
        assert_eq!(key, cache_key(&json!({"a": 2, "b": 1})));
        assert_ne!(key, cache_key(&json!({"a": 2})));
    }

    #[test]
    fn test_running_mean_and_config_rules() {
        let config = ServerConfig {
            system_prompt: Some("sys".into()),
            filtered_terms: vec!["pw".into()],
            temperature_override: Some(0.3),
            ..ServerConfig::default()
        };
        let server = ServerHotpatch::new(HotpatchContext::isolated(), &config);
        let out = server.process_request(json!({"prompt": "x"}));
        assert_eq!(out["temperature"], json!(0.3));
        assert_eq!(out["prompt"], "sys\n\nx");
        let resp = server.process_response(json!({"content": "PW=1"}));
        assert_eq!(resp["content"], "**=1");

        let stats = server.statistics();
        assert_eq!(stats.requests_processed, 1);
        assert_eq!(stats.responses_processed, 1);
        assert!(stats.avg_processing_time_ms >= 0.0);
    }
}
