//! Logical view paths to concrete locations.
//!
//! A reference is `<alias><sep><rest>` where the separator is `/` or `.`,
//! and the longest registered alias wins. Without a matching alias the
//! default `~` mapping applies to the whole reference.

use crate::error::ResolutionError;
use std::collections::BTreeMap;

pub const DEFAULT_ALIAS: &str = "~";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamespaceMapping {
    pub alias: String,
    pub root: String,
}

#[derive(Debug, Clone, Default)]
pub struct Namespaces {
    mappings: BTreeMap<String, String>,
}

fn join(root: &str, rest: &str) -> String {
    let root = root.trim_end_matches('/');
    let rest = rest.trim_start_matches('/');
    if rest.is_empty() {
        root.to_string()
    } else {
        format!("{root}/{rest}")
    }
}

fn with_extension(path: &str, ext: &str) -> String {
    let ext = ext.trim_start_matches('.');
    if ext.is_empty() || path.ends_with(&format!(".{ext}")) {
        path.to_string()
    } else {
        format!("{path}.{ext}")
    }
}

/// Dotted segments become path separators; a trailing `.ext` is kept.
fn dotted_to_path(rest: &str, ext: &str) -> String {
    let ext = ext.trim_start_matches('.');
    let (stem, keep) = match rest.strip_suffix(&format!(".{ext}")) {
        Some(stem) if !ext.is_empty() => (stem, true),
        _ => (rest, false),
    };
    let mut path = stem.replace('.', "/");
    if keep {
        path.push('.');
        path.push_str(ext);
    }
    path
}

/// `..` segments would let a view reference reach outside its root.
fn reject_parent_segments(path: &str) -> Result<(), ResolutionError> {
    if path.split(['/', '\\']).any(|segment| segment == "..") {
        return Err(ResolutionError::ParentSegment {
            path: path.to_string(),
        });
    }
    Ok(())
}

impl Namespaces {
    pub fn register(&mut self, alias: &str, root: &str) {
        self.mappings.insert(alias.to_string(), root.to_string());
    }

    pub fn mappings(&self) -> impl Iterator<Item = NamespaceMapping> + '_ {
        self.mappings.iter().map(|(alias, root)| NamespaceMapping {
            alias: alias.clone(),
            root: root.clone(),
        })
    }

    /// Mapping whose alias prefixes `path` at a separator boundary: the alias,
    /// its root and the rest of the path.
    fn split<'p>(&self, path: &'p str) -> Option<(&str, &str, &'p str)> {
        let mut best: Option<(&str, &str, &'p str)> = None;
        for (alias, root) in &self.mappings {
            let Some(rest) = path.strip_prefix(alias.as_str()) else {
                continue;
            };
            let at_boundary = rest.is_empty() || rest.starts_with(['/', '.']);
            if !at_boundary {
                continue;
            }
            if best.is_none_or(|(b, _, _)| alias.len() > b.len()) {
                best = Some((alias.as_str(), root.as_str(), rest));
            }
        }
        best.map(|(alias, root, rest)| (alias, root, rest.trim_start_matches(['/', '.'])))
    }

    pub fn resolve(&self, logical: &str, ext: &str) -> Result<String, ResolutionError> {
        reject_parent_segments(logical)?;
        if logical.starts_with('/') {
            return Ok(with_extension(logical, ext));
        }
        let (root, rest) = match self.split(logical) {
            Some((_, root, rest)) => (root, rest),
            None => {
                if let Some(root) = self.mappings.get(DEFAULT_ALIAS) {
                    let rest = dotted_to_path(logical, ext);
                    return Ok(with_extension(&join(root, &rest), ext));
                }
                let alias = logical
                    .split(['/', '.'])
                    .next()
                    .unwrap_or(logical)
                    .to_string();
                return Err(ResolutionError::UnknownNamespace {
                    alias,
                    path: logical.to_string(),
                });
            }
        };
        let rest = dotted_to_path(rest, ext);
        Ok(with_extension(&join(root, &rest), ext))
    }

    /// Like [`Namespaces::resolve`] but leaves the remainder untouched, for
    /// glob patterns.
    pub fn resolve_pattern(&self, pattern: &str) -> Result<String, ResolutionError> {
        reject_parent_segments(pattern)?;
        if pattern.starts_with('/') {
            return Ok(pattern.to_string());
        }
        match self.split(pattern) {
            Some((_, root, rest)) => Ok(join(root, rest)),
            None => match self.mappings.get(DEFAULT_ALIAS) {
                Some(root) => Ok(join(root, pattern)),
                None => Err(ResolutionError::UnknownNamespace {
                    alias: pattern.split('/').next().unwrap_or(pattern).to_string(),
                    path: pattern.to_string(),
                }),
            },
        }
    }
}
