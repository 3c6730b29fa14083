use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::Mutex;

use crate::{
    errors::Error,
    ports::StateStore,
    Result,
};

/// File-backed key-value store: one JSON object document on disk.
///
/// Writes go through a temp file + rename so a crash mid-save never leaves a
/// truncated document behind. A missing file is an empty store; an unreadable
/// or corrupt file is `StorageUnavailable` — the caller must not treat it as
/// a fresh zero-state.
pub struct JsonFileStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_doc(&self) -> Result<Map<String, Value>> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Map::new()),
            Err(e) => {
                return Err(Error::StorageUnavailable(format!(
                    "cannot read {}: {e}",
                    self.path.display()
                )))
            }
        };

        let doc: Value = serde_json::from_str(&raw).map_err(|e| {
            Error::StorageUnavailable(format!("corrupt store {}: {e}", self.path.display()))
        })?;

        match doc {
            Value::Object(map) => Ok(map),
            _ => Err(Error::StorageUnavailable(format!(
                "store {} is not a JSON object",
                self.path.display()
            ))),
        }
    }

    async fn write_doc(&self, doc: &Map<String, Value>) -> Result<()> {
        let raw = serde_json::to_string_pretty(&Value::Object(doc.clone()))?;

        let tmp = self.path.with_extension("json.tmp");
        let map_err = |e: std::io::Error| {
            Error::StorageUnavailable(format!("cannot write {}: {e}", self.path.display()))
        };

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.map_err(map_err)?;
            }
        }
        tokio::fs::write(&tmp, raw).await.map_err(map_err)?;
        tokio::fs::rename(&tmp, &self.path).await.map_err(map_err)?;
        Ok(())
    }
}

#[async_trait]
impl StateStore for JsonFileStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let doc = self.read_doc().await?;
        match doc.get(key) {
            Some(Value::String(s)) => Ok(Some(s.clone())),
            Some(other) => Ok(Some(other.to_string())),
            None => Ok(None),
        }
    }

    async fn put(&self, key: &str, value: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut doc = self.read_doc().await?;
        doc.insert(key.to_string(), Value::String(value.to_string()));
        self.write_doc(&doc).await
    }
}
