//! Object stores for language function documents.
//!
//! A store maps a slash-separated path to a document. [`FileStore`] keeps
//! each document as `<root>/<path>.yaml`.

use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::error::{LmError, Result};
use crate::function::{Format, LanguageFunction};

/// Pull and push serialized documents by path.
pub trait ObjectStore: Send + Sync {
    /// Fetch the document at `path` as a mapping.
    fn pull(&self, path: &str) -> Result<Value>;

    /// Store `blob`, a serialized document, at `path`.
    fn push(&self, path: &str, blob: &str) -> Result<()>;
}

/// A store backed by YAML files under a root directory.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn file_for(&self, path: &str) -> Result<PathBuf> {
        let relative = path.trim_matches('/');
        let escapes = relative
            .split('/')
            .any(|part| part.is_empty() || part == "." || part == "..");
        if escapes {
            return Err(LmError::Other(format!("invalid store path '{path}'")));
        }
        Ok(self.root.join(format!("{relative}.yaml")))
    }
}

impl ObjectStore for FileStore {
    fn pull(&self, path: &str) -> Result<Value> {
        let file = self.file_for(path)?;
        let text = std::fs::read_to_string(&file)?;
        Ok(serde_yaml::from_str(&text)?)
    }

    fn push(&self, path: &str, blob: &str) -> Result<()> {
        let file = self.file_for(path)?;
        if let Some(parent) = file.parent() {
            std::fs::create_dir_all(parent)?;
        }
        tracing::debug!(path = %file.display(), "writing document");
        std::fs::write(file, blob)?;
        Ok(())
    }
}

impl LanguageFunction {
    pub fn from_store(store: &dyn ObjectStore, path: &str) -> Result<Self> {
        Ok(serde_json::from_value(store.pull(path)?)?)
    }

    /// Serialize as YAML and store at `path`.
    pub fn push(&self, store: &dyn ObjectStore, path: &str) -> Result<()> {
        store.push(path, &self.dumps(Format::Yaml)?)
    }

    /// Merge the document at `path` over the current fields.
    pub fn pull(&mut self, store: &dyn ObjectStore, path: &str) -> Result<()> {
        self.load(store.pull(path)?)
    }
}
