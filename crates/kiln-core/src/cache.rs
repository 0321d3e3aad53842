use crate::routine::Routine;
use serde::Serialize;
use std::collections::HashMap;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::rc::Rc;
use std::time::SystemTime;

const ROUTINE_VERSION: &str = "kiln-routine-v1";

/// Stable content hash of a template source.
pub fn content_hash(source: &str) -> String {
    let mut hasher = DefaultHasher::new();
    ROUTINE_VERSION.hash(&mut hasher);
    source.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

/// A compiled template. Never mutated; a recompilation replaces it.
#[derive(Debug)]
pub struct CompiledUnit {
    /// Logical path or cache key the unit was compiled under.
    pub name: Option<String>,
    pub source_hash: String,
    pub source: Rc<str>,
    pub code: String,
    pub routine: Routine,
    pub created_at: SystemTime,
}

impl CompiledUnit {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("<inline>")
    }
}

#[derive(Debug, Default)]
pub struct UnitCache {
    by_key: HashMap<String, Rc<CompiledUnit>>,
    by_hash: HashMap<String, Rc<CompiledUnit>>,
}

impl UnitCache {
    pub fn by_key(&self, key: &str) -> Option<Rc<CompiledUnit>> {
        self.by_key.get(key).cloned()
    }

    pub fn by_hash(&self, hash: &str) -> Option<Rc<CompiledUnit>> {
        self.by_hash.get(hash).cloned()
    }

    /// Keyed units are only reachable through their key; anonymous units are
    /// content addressed.
    pub fn insert(&mut self, key: Option<&str>, unit: Rc<CompiledUnit>) {
        match key {
            Some(key) => {
                self.by_key.insert(key.to_string(), unit);
            }
            None => {
                self.by_hash.insert(unit.source_hash.clone(), unit);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.by_key.len() + self.by_hash.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty() && self.by_hash.is_empty()
    }

    pub fn clear(&mut self) {
        self.by_key.clear();
        self.by_hash.clear();
    }
}

#[derive(Debug, Clone)]
pub struct FileEntry {
    /// Concrete path the content was read from.
    pub path: String,
    pub content_hash: String,
    pub unit: Rc<CompiledUnit>,
}

/// Resolved-file cache keyed by logical view path.
#[derive(Debug, Default)]
pub struct FileCache {
    entries: HashMap<String, FileEntry>,
}

impl FileCache {
    pub fn get(&self, logical: &str) -> Option<FileEntry> {
        self.entries.get(logical).cloned()
    }

    pub fn insert(&mut self, logical: &str, entry: FileEntry) {
        self.entries.insert(logical.to_string(), entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Full parse + generate + routine compilations.
    pub compilations: usize,
    pub hits: usize,
    /// Resolver reads.
    pub reads: usize,
}
