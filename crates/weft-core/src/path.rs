use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Handle to a path interned in a [`PathTable`].
///
/// Handles are only meaningful relative to the table that produced them. Anything that
/// must be stable across processes (fingerprints, cache entries) uses the expanded
/// string instead of the raw index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AbsolutePath(u32);

impl AbsolutePath {
    pub fn to_raw(self) -> u32 {
        self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PathError {
    #[error("path `{0}` is not absolute")]
    NotAbsolute(String),
    #[error("path `{0}` escapes its root")]
    EscapesRoot(String),
    #[error("path `{0}` is empty")]
    Empty(String),
}

#[derive(Debug)]
struct PathEntry {
    text: Arc<str>,
    parent: Option<AbsolutePath>,
}

#[derive(Debug, Default)]
struct Inner {
    by_key: HashMap<String, AbsolutePath>,
    entries: Vec<PathEntry>,
}

/// Append-only, case-insensitive path interner.
///
/// The first spelling of a path wins: interning `/Src/A.txt` and later `/src/a.txt`
/// returns the same handle, and [`PathTable::expand`] reports `/Src/A.txt`.
#[derive(Debug, Default)]
pub struct PathTable {
    inner: RwLock<Inner>,
}

static GLOBAL: OnceLock<Arc<PathTable>> = OnceLock::new();

impl PathTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Initialize the process-wide table. Calling this more than once returns the same table.
    pub fn init_global() -> Arc<PathTable> {
        GLOBAL.get_or_init(|| Arc::new(PathTable::new())).clone()
    }

    /// The process-wide table, if [`PathTable::init_global`] has run.
    pub fn global() -> Option<Arc<PathTable>> {
        GLOBAL.get().cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Intern an absolute path, returning the existing handle for case-insensitive equals.
    pub fn intern(&self, raw: &str) -> Result<AbsolutePath, PathError> {
        let prefixes = normalize(raw)?;
        let Some(full) = prefixes.last() else {
            return Err(PathError::Empty(raw.to_string()));
        };
        let key = case_key(full);

        if let Some(&existing) = self.inner.read().by_key.get(&key) {
            return Ok(existing);
        }

        let mut inner = self.inner.write();
        // Another thread may have won the race between the read and write locks.
        if let Some(&existing) = inner.by_key.get(&key) {
            return Ok(existing);
        }

        let mut parent = None;
        for prefix in &prefixes {
            let prefix_key = case_key(prefix);
            let id = match inner.by_key.get(&prefix_key) {
                Some(&id) => id,
                None => {
                    let id = AbsolutePath(inner.entries.len() as u32);
                    inner.entries.push(PathEntry {
                        text: Arc::from(prefix.as_str()),
                        parent,
                    });
                    inner.by_key.insert(prefix_key, id);
                    id
                }
            };
            parent = Some(id);
        }

        parent.ok_or_else(|| PathError::Empty(raw.to_string()))
    }

    /// Look up a path without interning it.
    pub fn try_get(&self, raw: &str) -> Option<AbsolutePath> {
        let prefixes = normalize(raw).ok()?;
        let key = case_key(prefixes.last()?);
        self.inner.read().by_key.get(&key).copied()
    }

    /// Expanded string form of `path` as first interned.
    pub fn expand(&self, path: AbsolutePath) -> Arc<str> {
        self.inner.read().entries[path.0 as usize].text.clone()
    }

    /// Case-folded string form; used as the canonical ordering key for fingerprints.
    pub fn canonical_key(&self, path: AbsolutePath) -> String {
        case_key(&self.expand(path))
    }

    pub fn parent(&self, path: AbsolutePath) -> Option<AbsolutePath> {
        self.inner.read().entries[path.0 as usize].parent
    }

    /// Final path component.
    pub fn file_name(&self, path: AbsolutePath) -> String {
        let text = self.expand(path);
        text.rsplit('/').next().unwrap_or_default().to_string()
    }

    /// Join a relative child name onto `parent`.
    pub fn child(&self, parent: AbsolutePath, name: &str) -> Result<AbsolutePath, PathError> {
        let text = self.expand(parent);
        self.intern(&format!("{}/{name}", text.trim_end_matches('/')))
    }

    /// Strict ancestors of `path`, innermost first.
    pub fn ancestors(&self, path: AbsolutePath) -> Vec<AbsolutePath> {
        let inner = self.inner.read();
        let mut out = Vec::new();
        let mut current = inner.entries[path.0 as usize].parent;
        while let Some(id) = current {
            out.push(id);
            current = inner.entries[id.0 as usize].parent;
        }
        out
    }

    /// Returns true when `path` equals `root` or lies beneath it.
    pub fn is_within(&self, path: AbsolutePath, root: AbsolutePath) -> bool {
        if path == root {
            return true;
        }
        let inner = self.inner.read();
        let mut current = inner.entries[path.0 as usize].parent;
        while let Some(id) = current {
            if id == root {
                return true;
            }
            current = inner.entries[id.0 as usize].parent;
        }
        false
    }

    /// Immutable copy of every interned path, indexed by raw id.
    pub fn snapshot(&self) -> PathTableSnapshot {
        let inner = self.inner.read();
        PathTableSnapshot {
            paths: inner.entries.iter().map(|entry| entry.text.clone()).collect(),
        }
    }

    /// Display adapter for log fields.
    pub fn display(&self, path: AbsolutePath) -> PathDisplay {
        PathDisplay(self.expand(path))
    }
}

/// Frozen view of a [`PathTable`] for reporting.
#[derive(Debug, Clone)]
pub struct PathTableSnapshot {
    paths: Vec<Arc<str>>,
}

impl PathTableSnapshot {
    pub fn get(&self, path: AbsolutePath) -> Option<&str> {
        self.paths.get(path.0 as usize).map(|text| &**text)
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

pub struct PathDisplay(Arc<str>);

impl fmt::Display for PathDisplay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn is_drive(segment: &str) -> bool {
    let bytes = segment.as_bytes();
    bytes.len() == 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

fn case_key(text: &str) -> String {
    text.to_lowercase()
}

/// Normalize an absolute path into the chain of its prefixes, root first.
///
/// `/repo/src` yields `["/", "/repo", "/repo/src"]`; `c:\\tools` yields `["C:", "C:/tools"]`.
fn normalize(raw: &str) -> Result<Vec<String>, PathError> {
    let unified = raw.replace('\\', "/");
    if unified.trim().is_empty() {
        return Err(PathError::Empty(raw.to_string()));
    }

    let mut parts = unified.split('/').peekable();
    let root = match parts.peek().copied() {
        Some(first) if is_drive(first) => {
            parts.next();
            first.to_ascii_uppercase()
        }
        _ if unified.starts_with('/') => String::new(),
        _ => return Err(PathError::NotAbsolute(raw.to_string())),
    };

    let mut segments: Vec<&str> = Vec::new();
    for part in parts {
        match part {
            "" | "." => {}
            ".." => {
                if segments.pop().is_none() {
                    return Err(PathError::EscapesRoot(raw.to_string()));
                }
            }
            other => segments.push(other),
        }
    }

    let mut prefixes = Vec::with_capacity(segments.len() + 1);
    let mut current = root;
    prefixes.push(if current.is_empty() {
        "/".to_string()
    } else {
        current.clone()
    });
    for segment in segments {
        current.push('/');
        current.push_str(segment);
        prefixes.push(current.clone());
    }
    Ok(prefixes)
}
