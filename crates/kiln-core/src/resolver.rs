//! Template source collaborators.
//!
//! The engine never touches storage itself: a [`Resolver`] turns concrete
//! paths into source text and lists paths matching a glob pattern.

use crate::error::ResolutionError;
use async_trait::async_trait;
use regex::Regex;
use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

#[async_trait(?Send)]
pub trait Resolver {
    async fn read(&self, path: &str) -> Result<String, ResolutionError>;

    async fn readdir(&self, pattern: &str) -> Result<Vec<String>, ResolutionError> {
        let _ = pattern;
        Ok(Vec::new())
    }
}

/// Compile a `*`, `**`, `?` glob into an anchored regex over `/` paths.
pub(crate) fn glob_regex(pattern: &str) -> Result<Regex, ResolutionError> {
    let mut re = String::from("^");
    let mut rest = pattern;
    while let Some(c) = rest.chars().next() {
        if let Some(after) = rest.strip_prefix("**/") {
            re.push_str("(?:.*/)?");
            rest = after;
        } else if let Some(after) = rest.strip_prefix("**") {
            re.push_str(".*");
            rest = after;
        } else {
            match c {
                '*' => re.push_str("[^/]*"),
                '?' => re.push_str("[^/]"),
                other => re.push_str(&regex::escape(&other.to_string())),
            }
            rest = &rest[c.len_utf8()..];
        }
    }
    re.push('$');
    Regex::new(&re).map_err(|e| ResolutionError::Io {
        path: pattern.to_string(),
        reason: e.to_string(),
    })
}

/// Longest leading directory of `pattern` without wildcards.
fn glob_base(pattern: &str) -> PathBuf {
    let mut base = PathBuf::new();
    for part in Path::new(pattern).components() {
        let text = part.as_os_str().to_string_lossy();
        if text.contains(['*', '?']) {
            break;
        }
        base.push(part);
    }
    base
}

#[derive(Debug, Clone, Default)]
pub struct FsResolver;

impl FsResolver {
    pub fn new() -> Self {
        Self
    }
}

fn io_error(path: &str, err: io::Error) -> ResolutionError {
    if err.kind() == io::ErrorKind::NotFound {
        ResolutionError::NotFound {
            path: path.to_string(),
        }
    } else {
        ResolutionError::Io {
            path: path.to_string(),
            reason: err.to_string(),
        }
    }
}

async fn walk(base: PathBuf) -> io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut pending = vec![base];
    while let Some(dir) = pending.pop() {
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) if e.kind() == io::ErrorKind::NotADirectory => {
                files.push(dir);
                continue;
            }
            Err(e) => return Err(e),
        };
        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                pending.push(entry.path());
            } else if file_type.is_file() {
                files.push(entry.path());
            }
        }
    }
    Ok(files)
}

#[async_trait(?Send)]
impl Resolver for FsResolver {
    async fn read(&self, path: &str) -> Result<String, ResolutionError> {
        tokio::fs::read_to_string(path)
            .await
            .map_err(|e| io_error(path, e))
    }

    async fn readdir(&self, pattern: &str) -> Result<Vec<String>, ResolutionError> {
        let matcher = glob_regex(pattern)?;
        let files = walk(glob_base(pattern))
            .await
            .map_err(|e| io_error(pattern, e))?;
        let mut out: Vec<String> = files
            .into_iter()
            .map(|p| p.to_string_lossy().replace('\\', "/"))
            .filter(|p| matcher.is_match(p))
            .collect();
        out.sort();
        Ok(out)
    }
}

/// In-memory sources, counting reads.
#[derive(Debug, Default)]
pub struct MemoryResolver {
    files: RefCell<BTreeMap<String, String>>,
    reads: Cell<usize>,
}

impl MemoryResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, path: &str, source: &str) -> Self {
        self.insert(path, source);
        self
    }

    pub fn insert(&self, path: &str, source: &str) {
        self.files
            .borrow_mut()
            .insert(path.to_string(), source.to_string());
    }

    pub fn remove(&self, path: &str) -> Option<String> {
        self.files.borrow_mut().remove(path)
    }

    pub fn reads(&self) -> usize {
        self.reads.get()
    }
}

#[async_trait(?Send)]
impl Resolver for MemoryResolver {
    async fn read(&self, path: &str) -> Result<String, ResolutionError> {
        self.reads.set(self.reads.get() + 1);
        self.files
            .borrow()
            .get(path)
            .cloned()
            .ok_or_else(|| ResolutionError::NotFound {
                path: path.to_string(),
            })
    }

    async fn readdir(&self, pattern: &str) -> Result<Vec<String>, ResolutionError> {
        let matcher = glob_regex(pattern)?;
        Ok(self
            .files
            .borrow()
            .keys()
            .filter(|p| matcher.is_match(p))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_patterns() {
        let re = glob_regex("/views/**/*.kiln").expect("glob");
        assert!(re.is_match("/views/a.kiln"));
        assert!(re.is_match("/views/x/y/b.kiln"));
        assert!(!re.is_match("/views/a.html"));

        let single = glob_regex("/views/*.kiln").expect("glob");
        assert!(!single.is_match("/views/x/b.kiln"));
        assert_eq!(glob_base("/views/**/*.kiln"), PathBuf::from("/views"));
    }

    #[tokio::test]
    async fn memory_resolver_counts_reads() {
        let resolver = MemoryResolver::new().with("/v/a.kiln", "A");
        assert_eq!(resolver.read("/v/a.kiln").await.expect("read"), "A");
        assert!(matches!(
            resolver.read("/v/missing.kiln").await,
            Err(ResolutionError::NotFound { .. })
        ));
        assert_eq!(resolver.reads(), 2);
        assert_eq!(
            resolver.readdir("/v/*.kiln").await.expect("readdir"),
            vec!["/v/a.kiln".to_string()]
        );
    }

    #[tokio::test]
    async fn fs_resolver_reads_and_globs() {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path();
        std::fs::create_dir_all(root.join("partials")).expect("mkdir");
        std::fs::write(root.join("home.kiln"), "home").expect("write");
        std::fs::write(root.join("partials/nav.kiln"), "nav").expect("write");
        std::fs::write(root.join("notes.txt"), "skip").expect("write");

        let resolver = FsResolver::new();
        let home = root.join("home.kiln");
        assert_eq!(
            resolver
                .read(&home.to_string_lossy())
                .await
                .expect("read"),
            "home"
        );

        let base = root.to_string_lossy().replace('\\', "/");
        let found = resolver
            .readdir(&format!("{base}/**/*.kiln"))
            .await
            .expect("readdir");
        assert_eq!(found.len(), 2);
        assert!(found.iter().all(|p| p.ends_with(".kiln")));

        let missing = root.join("missing.kiln");
        assert!(matches!(
            resolver.read(&missing.to_string_lossy()).await,
            Err(ResolutionError::NotFound { .. })
        ));
    }
}
