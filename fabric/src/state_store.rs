//! Durable key/value document storage addressed by `(kind, key, slot)`.
//!
//! Entity state is written as whole JSON documents: a writer serializes its
//! full in-memory state and replaces the slot in one operation. Single-writer
//! discipline is the caller's responsibility (the catalog's single-activation
//! guarantee provides it for grain state).
//!
//! Two implementations are provided:
//!
//! - [`MemoryStateStore`]: process-local, for localhost clustering and tests.
//! - [`FileStateStore`]: one JSON file per slot under a root directory, with
//!   temp-file-and-rename replacement so a crashed write never corrupts the
//!   previous document.

use crate::FabricError;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::RwLock;

/// Contract for durable entity-state slots.
///
/// `read` returns the last successfully written document, or `None` when the
/// slot has never been written (callers fall back to an empty default).
/// `write` is a total replacement of the slot.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Read the document stored at `(kind, key, slot)`, if any.
    async fn read(&self, kind: &str, key: &str, slot: &str) -> Result<Option<Value>, FabricError>;

    /// Replace the document stored at `(kind, key, slot)`.
    async fn write(&self, kind: &str, key: &str, slot: &str, state: &Value) -> Result<(), FabricError>;

    /// Remove the document stored at `(kind, key, slot)`. Removing a slot
    /// that does not exist is a no-op.
    async fn clear(&self, kind: &str, key: &str, slot: &str) -> Result<(), FabricError>;

    /// List every key that has at least one slot under `kind`.
    async fn list_keys(&self, kind: &str) -> Result<Vec<String>, FabricError>;
}

/// Volatile in-memory store for localhost clustering and tests.
#[derive(Default)]
pub struct MemoryStateStore {
    slots: RwLock<HashMap<(String, String, String), Value>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn read(&self, kind: &str, key: &str, slot: &str) -> Result<Option<Value>, FabricError> {
        let slots = self.slots.read().await;
        Ok(slots
            .get(&(kind.to_string(), key.to_string(), slot.to_string()))
            .cloned())
    }

    async fn write(&self, kind: &str, key: &str, slot: &str, state: &Value) -> Result<(), FabricError> {
        let mut slots = self.slots.write().await;
        slots.insert(
            (kind.to_string(), key.to_string(), slot.to_string()),
            state.clone(),
        );
        Ok(())
    }

    async fn clear(&self, kind: &str, key: &str, slot: &str) -> Result<(), FabricError> {
        let mut slots = self.slots.write().await;
        slots.remove(&(kind.to_string(), key.to_string(), slot.to_string()));
        Ok(())
    }

    async fn list_keys(&self, kind: &str) -> Result<Vec<String>, FabricError> {
        let slots = self.slots.read().await;
        let mut keys: Vec<String> = slots
            .keys()
            .filter(|(k, _, _)| k == kind)
            .map(|(_, key, _)| key.clone())
            .collect();
        keys.sort();
        keys.dedup();
        Ok(keys)
    }
}

/// Durable on-disk store: `root/<kind>/<encoded key>/<encoded slot>.json`.
///
/// Path components are escaped so arbitrary entity keys (including
/// owner-qualified handles like `u1:bot`) map to filesystem-safe, reversible
/// directory names.
pub struct FileStateStore {
    root: PathBuf,
}

impl FileStateStore {
    /// Create a store rooted at `root`. The directory is created lazily on
    /// first write.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn slot_path(&self, kind: &str, key: &str, slot: &str) -> PathBuf {
        self.root
            .join(encode_component(kind))
            .join(encode_component(key))
            .join(format!("{}.json", encode_component(slot)))
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn read(&self, kind: &str, key: &str, slot: &str) -> Result<Option<Value>, FabricError> {
        let path = self.slot_path(kind, key, slot);
        match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| FabricError::Persistence(format!("{}: {}", path.display(), e))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(FabricError::Persistence(format!(
                "{}: {}",
                path.display(),
                e
            ))),
        }
    }

    async fn write(&self, kind: &str, key: &str, slot: &str, state: &Value) -> Result<(), FabricError> {
        let path = self.slot_path(kind, key, slot);
        let parent = path
            .parent()
            .ok_or_else(|| FabricError::Persistence(format!("no parent dir: {}", path.display())))?;
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| FabricError::Persistence(format!("{}: {}", parent.display(), e)))?;

        let bytes = serde_json::to_vec(state)
            .map_err(|e| FabricError::Persistence(format!("serialize {}: {}", slot, e)))?;

        // Replace via temp file + rename so a crash mid-write leaves the
        // previous document intact.
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|e| FabricError::Persistence(format!("{}: {}", tmp.display(), e)))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| FabricError::Persistence(format!("{}: {}", path.display(), e)))
    }

    async fn clear(&self, kind: &str, key: &str, slot: &str) -> Result<(), FabricError> {
        let path = self.slot_path(kind, key, slot);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(FabricError::Persistence(format!(
                "{}: {}",
                path.display(),
                e
            ))),
        }
    }

    async fn list_keys(&self, kind: &str) -> Result<Vec<String>, FabricError> {
        let dir = self.root.join(encode_component(kind));
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(FabricError::Persistence(format!(
                    "{}: {}",
                    dir.display(),
                    e
                )))
            }
        };

        let mut keys = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| FabricError::Persistence(format!("{}: {}", dir.display(), e)))?
        {
            if let Some(name) = entry.file_name().to_str() {
                if let Some(key) = decode_component(name) {
                    keys.push(key);
                }
            }
        }
        keys.sort();
        Ok(keys)
    }
}

/// Escape a path component: `[A-Za-z0-9._-]` pass through, everything else
/// becomes `%XX`. Reversible via [`decode_component`].
pub(crate) fn encode_component(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'.' | b'_' | b'-' => {
                out.push(byte as char);
            }
            other => {
                out.push('%');
                out.push_str(&format!("{:02X}", other));
            }
        }
    }
    out
}

/// Inverse of [`encode_component`]. Returns `None` for malformed escapes.
pub(crate) fn decode_component(encoded: &str) -> Option<String> {
    let bytes = encoded.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = encoded.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}
