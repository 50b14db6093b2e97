use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{AppError, AppResult};

use super::types::Lorebook;

/// Resolves the lorebook names a request refers to. Storage lives with the caller.
pub trait LorebookSource: Send + Sync {
    fn load(&self, name: &str) -> AppResult<Lorebook>;
}

/// Lorebooks stored as `<dir>/<name>.json`.
pub struct JsonDirLorebookSource {
    dir: PathBuf,
}

impl JsonDirLorebookSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, name: &str) -> AppResult<PathBuf> {
        let trimmed = name.trim();
        if trimmed.is_empty()
            || trimmed.contains('/')
            || trimmed.contains('\\')
            || trimmed.contains("..")
        {
            return Err(AppError::Other(format!("Invalid lorebook name: {}", name)));
        }
        let file = if trimmed.to_ascii_lowercase().ends_with(".json") {
            trimmed.to_string()
        } else {
            format!("{}.json", trimmed)
        };
        Ok(self.dir.join(file))
    }
}

impl LorebookSource for JsonDirLorebookSource {
    fn load(&self, name: &str) -> AppResult<Lorebook> {
        let path = self.path_for(name)?;
        let raw = fs::read_to_string(&path)?;
        let mut book: Lorebook = serde_json::from_str(&raw)?;
        if book.name.is_empty() {
            book.name = path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or(name)
                .to_string();
        }
        tracing::debug!(
            path = %path.display(),
            entries = book.entries.len(),
            "loaded lorebook"
        );
        Ok(book)
    }
}

/// Lorebooks held in memory, keyed by the name requests use.
#[derive(Default)]
pub struct InMemoryLorebookSource {
    books: HashMap<String, Lorebook>,
}

impl InMemoryLorebookSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, book: Lorebook) {
        self.books.insert(name.into(), book);
    }
}

impl LorebookSource for InMemoryLorebookSource {
    fn load(&self, name: &str) -> AppResult<Lorebook> {
        self.books
            .get(name)
            .cloned()
            .ok_or_else(|| AppError::Other(format!("Lorebook not found: {}", name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_with_or_without_extension() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("world.json"),
            r#"{"entries": [{"name": "d", "keys": ["dragon"], "content": "D"}]}"#,
        )
        .unwrap();
        let source = JsonDirLorebookSource::new(dir.path());
        let book = source.load("world").unwrap();
        assert_eq!(book.name, "world");
        assert_eq!(book.entries.len(), 1);
        assert_eq!(source.load("world.json").unwrap().entries.len(), 1);
    }

    #[test]
    fn rejects_missing_and_escaping_names() {
        let dir = tempfile::tempdir().unwrap();
        let source = JsonDirLorebookSource::new(dir.path());
        assert!(matches!(source.load("absent"), Err(AppError::Io(_))));
        assert!(source.load("../secrets").is_err());
        assert!(source.load(" ").is_err());
    }

    #[test]
    fn in_memory_lookup() {
        let mut source = InMemoryLorebookSource::new();
        source.insert("w", Lorebook::default());
        assert!(source.load("w").is_ok());
        assert!(source.load("x").is_err());
    }
}
