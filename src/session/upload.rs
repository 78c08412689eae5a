//! File uploads.
//!
//! Upload traffic has three parts:
//!
//! ```text
//! allow_upload {ref, entries}   ──► validate constraints, reply {config, entries: {ref: token}}
//! phx_join on "lvu:<n>" {token} ──► open an upload keyed by that channel's join ref
//! binary frames                 ──► append chunk bytes to the open upload
//! progress {ref, entry_ref, progress}
//! ```
//!
//! Binary frames use the Phoenix push layout: one kind byte, four length
//! bytes (join ref, ref, topic, event), the four strings, then the payload.

use std::collections::BTreeMap;
use std::fmt;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum UploadError {
    #[error("binary frame is truncated ({0})")]
    Truncated(&'static str),

    #[error("binary frame field `{0}` is not valid utf-8")]
    NotUtf8(&'static str),

    #[error("no upload config with ref `{0}`")]
    UnknownConfig(String),

    #[error("no open upload for join ref `{0}`")]
    UnknownUpload(String),

    #[error("malformed upload message: {0}")]
    Malformed(String),
}

// ============================================================================
// Binary frames
// ============================================================================

/// A decoded binary websocket frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryFrame {
    pub kind: u8,
    pub join_ref: String,
    pub msg_ref: String,
    pub topic: String,
    pub event: String,
    pub payload: Vec<u8>,
}

impl BinaryFrame {
    pub fn decode(data: &[u8]) -> Result<Self, UploadError> {
        let [kind, join_len, ref_len, topic_len, event_len, rest @ ..] = data else {
            return Err(UploadError::Truncated("header"));
        };
        let (join_ref, rest) = take_str(rest, *join_len, "join_ref")?;
        let (msg_ref, rest) = take_str(rest, *ref_len, "ref")?;
        let (topic, rest) = take_str(rest, *topic_len, "topic")?;
        let (event, rest) = take_str(rest, *event_len, "event")?;
        Ok(Self {
            kind: *kind,
            join_ref,
            msg_ref,
            topic,
            event,
            payload: rest.to_vec(),
        })
    }
}

fn take_str<'a>(
    data: &'a [u8],
    len: u8,
    field: &'static str,
) -> Result<(String, &'a [u8]), UploadError> {
    let len = usize::from(len);
    if data.len() < len {
        return Err(UploadError::Truncated(field));
    }
    let (head, rest) = data.split_at(len);
    let s = std::str::from_utf8(head).map_err(|_| UploadError::NotUtf8(field))?;
    Ok((s.to_string(), rest))
}

// ============================================================================
// Constraints and entries
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadConstraints {
    pub max_file_size: u64,
    pub max_files: usize,
    pub accept: Vec<String>,
    pub chunk_size: u64,
}

impl Default for UploadConstraints {
    fn default() -> Self {
        Self {
            max_file_size: 10 * 1024 * 1024,
            max_files: 10,
            accept: vec!["image/*".to_string()],
            chunk_size: 64 * 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationCode {
    TooLarge,
    TooManyFiles,
    UploadFailed,
    NotFound,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConstraintViolation {
    #[serde(rename = "ref")]
    pub reference: String,
    pub code: ViolationCode,
}

impl ConstraintViolation {
    fn new(reference: &str, code: ViolationCode) -> Self {
        Self {
            reference: reference.to_string(),
            code,
        }
    }
}

/// One file the client proposed to upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadEntry {
    #[serde(rename = "ref")]
    pub reference: String,
    pub name: String,
    pub size: u64,
    #[serde(rename = "type", default)]
    pub content_type: String,
    #[serde(default)]
    pub progress: u8,
    #[serde(default)]
    pub done: bool,
    #[serde(default = "valid_by_default")]
    pub valid: bool,
}

fn valid_by_default() -> bool {
    true
}

/// One `allow_upload` declaration of a view.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadConfig {
    pub name: String,
    pub reference: String,
    pub constraints: UploadConstraints,
    entries: BTreeMap<String, UploadEntry>,
    errors: Vec<ConstraintViolation>,
}

impl UploadConfig {
    fn new(name: String, constraints: UploadConstraints) -> Self {
        Self {
            name,
            reference: uuid::Uuid::new_v4().to_string(),
            constraints,
            entries: BTreeMap::new(),
            errors: Vec::new(),
        }
    }

    pub fn entries(&self) -> impl Iterator<Item = &UploadEntry> {
        self.entries.values()
    }

    pub fn entry(&self, reference: &str) -> Option<&UploadEntry> {
        self.entries.get(reference)
    }

    pub fn errors(&self) -> &[ConstraintViolation] {
        &self.errors
    }

    /// Violations `proposed` would cause, without recording anything.
    pub fn validate(&self, proposed: &[UploadEntry]) -> Vec<ConstraintViolation> {
        let mut errors: Vec<_> = proposed
            .iter()
            .filter(|e| e.size > self.constraints.max_file_size)
            .map(|e| ConstraintViolation::new(&e.reference, ViolationCode::TooLarge))
            .collect();
        if proposed.len() > self.constraints.max_files {
            errors.push(ConstraintViolation::new(
                &self.reference,
                ViolationCode::TooManyFiles,
            ));
        }
        errors
    }

    /// Record entries, marking each one over the size limit invalid.
    pub fn add_entries(&mut self, proposed: Vec<UploadEntry>) {
        for mut entry in proposed {
            if entry.size > self.constraints.max_file_size {
                entry.valid = false;
                self.errors.push(ConstraintViolation::new(
                    &entry.reference,
                    ViolationCode::TooLarge,
                ));
            }
            self.entries.insert(entry.reference.clone(), entry);
        }
        self.check_count();
    }

    pub fn cancel_entry(&mut self, reference: &str) {
        self.entries.remove(reference);
        self.errors.clear();
        self.check_count();
    }

    fn check_count(&mut self) {
        if self.entries.len() > self.constraints.max_files {
            self.errors.push(ConstraintViolation::new(
                &self.reference,
                ViolationCode::TooManyFiles,
            ));
        }
    }

    /// The token the client joins the upload channel with.
    fn token(&self, entry: &UploadEntry) -> Value {
        let mut token = serde_json::to_value(entry).unwrap_or(Value::Null);
        if let Value::Object(map) = &mut token {
            map.insert("path".into(), Value::String(self.name.clone()));
        }
        token
    }
}

// ============================================================================
// Storage
// ============================================================================

/// Where received chunk bytes go.
pub trait UploadStore: Send {
    fn open(&mut self, join_ref: &str);

    /// Append a chunk; returns the bytes received so far.
    fn append(&mut self, join_ref: &str, chunk: &[u8]) -> Result<u64, UploadError>;

    fn take(&mut self, join_ref: &str) -> Option<Vec<u8>>;

    fn discard_all(&mut self);
}

#[derive(Debug, Default)]
pub struct MemoryUploadStore {
    files: FxHashMap<String, Vec<u8>>,
}

impl UploadStore for MemoryUploadStore {
    fn open(&mut self, join_ref: &str) {
        self.files.insert(join_ref.to_string(), Vec::new());
    }

    fn append(&mut self, join_ref: &str, chunk: &[u8]) -> Result<u64, UploadError> {
        let file = self
            .files
            .get_mut(join_ref)
            .ok_or_else(|| UploadError::UnknownUpload(join_ref.to_string()))?;
        file.extend_from_slice(chunk);
        Ok(file.len() as u64)
    }

    fn take(&mut self, join_ref: &str) -> Option<Vec<u8>> {
        self.files.remove(join_ref)
    }

    fn discard_all(&mut self) {
        self.files.clear();
    }
}

/// A finished upload handed to the view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedUpload {
    pub entry: UploadEntry,
    pub data: Vec<u8>,
}

struct OpenUpload {
    config: String,
    entry: UploadEntry,
    received: u64,
}

// ============================================================================
// Manager
// ============================================================================

/// All upload state of one session.
pub struct UploadManager {
    configs: BTreeMap<String, UploadConfig>,
    open: FxHashMap<String, OpenUpload>,
    store: Box<dyn UploadStore>,
}

impl Default for UploadManager {
    fn default() -> Self {
        Self::with_store(Box::new(MemoryUploadStore::default()))
    }
}

impl fmt::Debug for UploadManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadManager")
            .field("configs", &self.configs.keys().collect::<Vec<_>>())
            .field("open", &self.open.len())
            .finish()
    }
}

impl UploadManager {
    pub fn with_store(store: Box<dyn UploadStore>) -> Self {
        Self {
            configs: BTreeMap::new(),
            open: FxHashMap::default(),
            store,
        }
    }

    /// Declare (or redeclare) the upload named `name`.
    pub fn allow(&mut self, name: impl Into<String>, constraints: UploadConstraints) -> &UploadConfig {
        let name = name.into();
        let config = UploadConfig::new(name.clone(), constraints);
        self.configs.insert(name.clone(), config);
        &self.configs[&name]
    }

    pub fn config(&self, name: &str) -> Option<&UploadConfig> {
        self.configs.get(name)
    }

    fn config_for_ref_mut(&mut self, reference: &str) -> Option<&mut UploadConfig> {
        self.configs.values_mut().find(|c| c.reference == reference)
    }

    /// Handle `allow_upload`: validate the proposed entries and hand out tokens.
    ///
    /// Constraint failures are part of the reply, not errors.
    pub fn process_allow(&mut self, payload: &Value) -> Result<Value, UploadError> {
        let reference = payload
            .get("ref")
            .and_then(Value::as_str)
            .ok_or_else(|| UploadError::Malformed("allow_upload without `ref`".into()))?;
        let proposed: Vec<UploadEntry> =
            serde_json::from_value(payload.get("entries").cloned().unwrap_or(json!([])))
                .map_err(|e| UploadError::Malformed(e.to_string()))?;

        let Some(config) = self.config_for_ref_mut(reference) else {
            crate::warn!("upload"; "allow_upload for unknown ref {}", reference);
            return Ok(json!({ "error": [[reference, ViolationCode::NotFound]] }));
        };

        let violations = config.validate(&proposed);
        if !violations.is_empty() {
            let pairs: Vec<Value> = violations
                .iter()
                .map(|v| json!([v.reference, v.code]))
                .collect();
            return Ok(json!({ "error": pairs }));
        }

        config.add_entries(proposed);
        let entries: serde_json::Map<String, Value> = config
            .entries()
            .map(|e| (e.reference.clone(), config.token(e)))
            .collect();
        Ok(json!({ "config": config.constraints, "entries": entries }))
    }

    /// Record entries announced in a form event's `uploads` field.
    pub fn register_entries(&mut self, uploads: &Value) {
        let Some(uploads) = uploads.as_object() else {
            return;
        };
        for config in self.configs.values_mut() {
            let Some(proposed) = uploads.get(&config.reference) else {
                continue;
            };
            match serde_json::from_value::<Vec<UploadEntry>>(proposed.clone()) {
                Ok(entries) => config.add_entries(entries),
                Err(e) => crate::warn!("upload"; "ignoring entries for {}: {}", config.name, e),
            }
        }
    }

    /// Open the upload an `lvu:` channel join refers to.
    pub fn join(&mut self, join_ref: &str, payload: &Value) -> Result<(), UploadError> {
        let token = payload
            .get("token")
            .ok_or_else(|| UploadError::Malformed("upload join without `token`".into()))?;
        let config = token
            .get("path")
            .and_then(Value::as_str)
            .ok_or_else(|| UploadError::Malformed("upload token without `path`".into()))?;
        if !self.configs.contains_key(config) {
            return Err(UploadError::UnknownConfig(config.to_string()));
        }
        let entry: UploadEntry = serde_json::from_value(token.clone())
            .map_err(|e| UploadError::Malformed(e.to_string()))?;

        self.store.open(join_ref);
        self.open.insert(
            join_ref.to_string(),
            OpenUpload {
                config: config.to_string(),
                entry,
                received: 0,
            },
        );
        crate::debug!("upload"; "opened {} for {}", join_ref, config);
        Ok(())
    }

    /// Append one binary chunk; returns the bytes received for that upload.
    pub fn add_chunk(&mut self, join_ref: &str, chunk: &[u8]) -> Result<u64, UploadError> {
        let upload = self
            .open
            .get_mut(join_ref)
            .ok_or_else(|| UploadError::UnknownUpload(join_ref.to_string()))?;
        upload.received = self.store.append(join_ref, chunk)?;
        Ok(upload.received)
    }

    /// Handle a `progress` message: a percentage, `{complete: true}` or `{error}`.
    pub fn update_progress(&mut self, payload: &Value) -> Result<(), UploadError> {
        let field = |name: &str| {
            payload
                .get(name)
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| UploadError::Malformed(format!("progress without `{name}`")))
        };
        let reference = field("ref")?;
        let entry_ref = field("entry_ref")?;
        let progress = payload.get("progress").cloned().unwrap_or(Value::Null);

        let config = self
            .config_for_ref_mut(&reference)
            .ok_or(UploadError::UnknownConfig(reference))?;
        let Some(entry) = config.entries.get_mut(&entry_ref) else {
            crate::warn!("upload"; "progress for unknown entry {}", entry_ref);
            return Ok(());
        };

        match progress {
            Value::Number(n) => {
                let pct = n.as_u64().unwrap_or(0).min(100) as u8;
                entry.progress = pct;
                entry.done = pct == 100;
            }
            Value::Object(map) if map.get("complete").is_some_and(|v| v == &json!(true)) => {
                entry.progress = 100;
                entry.done = true;
            }
            Value::Object(map) => {
                let reason = map.get("error").and_then(Value::as_str).unwrap_or("upload failed");
                crate::warn!("upload"; "entry {} failed: {}", entry_ref, reason);
                entry.valid = false;
                entry.done = true;
                config
                    .errors
                    .push(ConstraintViolation::new(&entry_ref, ViolationCode::UploadFailed));
            }
            other => {
                return Err(UploadError::Malformed(format!("progress value {other}")));
            }
        }
        Ok(())
    }

    /// Take every finished upload of `name`, clearing its entries.
    pub fn consume(&mut self, name: &str) -> Vec<CompletedUpload> {
        let Some(config) = self.configs.get_mut(name) else {
            return Vec::new();
        };
        let join_refs: Vec<String> = self
            .open
            .iter()
            .filter(|(_, u)| u.config == name)
            .map(|(join_ref, _)| join_ref.clone())
            .collect();

        let mut done = Vec::new();
        for join_ref in join_refs {
            let Some(upload) = self.open.remove(&join_ref) else {
                continue;
            };
            let data = self.store.take(&join_ref).unwrap_or_default();
            let entry = config
                .entries
                .remove(&upload.entry.reference)
                .unwrap_or(upload.entry);
            done.push(CompletedUpload { entry, data });
        }
        config.entries.clear();
        config.errors.clear();
        done.sort_by(|a, b| a.entry.name.cmp(&b.entry.name));
        done
    }

    /// Drop every config and every received byte.
    pub fn close(&mut self) {
        self.configs.clear();
        self.open.clear();
        self.store.discard_all();
    }
}

// ============================================================================
// Tests
// ============================================================================
