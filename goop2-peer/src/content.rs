//! Content store (C2): a path-safe file tree rooted at the peer's `site/`
//! directory, with ETag-conditional writes. Used by the `site/1.0` protocol
//! and by the local HTTP surface's editor endpoints.

use std::path::{Component, Path, PathBuf};

use goop2_proto::{GoopError, GoopResult};
use sha2::{Digest, Sha256};

/// Subtrees that no external protocol may ever serve or write to.
const FORBIDDEN_PREFIXES: &[&str] = &["lua", ".state"];

#[derive(Debug, Clone)]
pub struct ContentItem {
    pub path: String,
    pub bytes: Vec<u8>,
    pub modified_ms: i64,
    pub etag: String,
}

#[derive(Debug, Clone)]
pub struct ContentEntry {
    pub path: String,
    pub is_dir: bool,
    pub size: u64,
    pub modified_ms: i64,
}

pub struct ContentStore {
    root: PathBuf,
}

impl ContentStore {
    pub fn new(root: impl Into<PathBuf>) -> GoopResult<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Clean and resolve `rel` against the root. Rejects `..` components and
    /// any result that would escape the rooted absolute path. Applied
    /// *after* cleaning, so `site/./lua/x` is still caught by the forbidden
    /// prefix check.
    pub fn normalize_dir(&self, raw: &str) -> GoopResult<PathBuf> {
        let cleaned = clean_relative(raw)?;
        let full = self.root.join(&cleaned);
        if let Ok(canonical) = full.canonicalize() {
            if !canonical.starts_with(&self.root) {
                return Err(GoopError::BadRequest(format!("path escapes root: {raw}")));
            }
        }
        Ok(cleaned)
    }

    fn resolve(&self, rel: &str) -> GoopResult<PathBuf> {
        let cleaned = clean_relative(rel)?;
        if is_forbidden(&cleaned) {
            return Err(GoopError::Forbidden(format!("path under forbidden subtree: {rel}")));
        }
        Ok(self.root.join(cleaned))
    }

    pub fn read(&self, rel: &str) -> GoopResult<ContentItem> {
        let full = self.resolve(rel)?;
        let bytes = std::fs::read(&full).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => GoopError::NotFound(format!("no such file: {rel}")),
            _ => GoopError::Internal(e.to_string()),
        })?;
        let meta = std::fs::metadata(&full)?;
        let modified_ms = modified_ms(&meta);
        Ok(ContentItem { path: rel.to_string(), etag: etag_of(&bytes), bytes, modified_ms })
    }

    /// `if_match` is `"none"` for create-if-absent, or an expected etag for
    /// a conditional update. Mismatch (including "none" when the file
    /// already exists) fails with `Conflict`.
    pub fn write(&self, rel: &str, bytes: &[u8], if_match: &str) -> GoopResult<String> {
        let full = self.resolve(rel)?;
        let existing = std::fs::read(&full).ok();
        match (&existing, if_match) {
            (None, "none") => {}
            (Some(cur), etag) if etag != "none" && etag_of(cur) == etag => {}
            (None, etag) if etag != "none" => {
                return Err(GoopError::Conflict(format!("expected etag {etag} but file does not exist")));
            }
            (Some(_), "none") => {
                return Err(GoopError::Conflict("file already exists".to_string()));
            }
            _ => return Err(GoopError::Conflict(format!("etag mismatch on {rel}"))),
        }
        if let Some(parent) = full.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&full, bytes)?;
        Ok(etag_of(bytes))
    }

    pub fn list(&self, dir: &str) -> GoopResult<Vec<ContentEntry>> {
        let full = self.resolve(dir)?;
        let mut out = Vec::new();
        let rd = std::fs::read_dir(&full).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => GoopError::NotFound(format!("no such directory: {dir}")),
            _ => GoopError::Internal(e.to_string()),
        })?;
        for entry in rd {
            let entry = entry?;
            let meta = entry.metadata()?;
            let name = entry.file_name().to_string_lossy().to_string();
            if is_forbidden(Path::new(&name)) && dir.is_empty() {
                continue;
            }
            let rel_path = if dir.is_empty() { name.clone() } else { format!("{dir}/{name}") };
            out.push(ContentEntry {
                path: rel_path,
                is_dir: meta.is_dir(),
                size: meta.len(),
                modified_ms: modified_ms(&meta),
            });
        }
        out.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(out)
    }

    /// Flat recursive listing of the whole tree, excluding forbidden subtrees.
    pub fn list_tree(&self) -> GoopResult<Vec<ContentEntry>> {
        let mut out = Vec::new();
        self.walk(&self.root, "", &mut out)?;
        out.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(out)
    }

    fn walk(&self, dir: &Path, rel_prefix: &str, out: &mut Vec<ContentEntry>) -> GoopResult<()> {
        let rd = match std::fs::read_dir(dir) {
            Ok(rd) => rd,
            Err(_) => return Ok(()),
        };
        for entry in rd {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            let rel = if rel_prefix.is_empty() { name.clone() } else { format!("{rel_prefix}/{name}") };
            if rel_prefix.is_empty() && is_forbidden(Path::new(&name)) {
                continue;
            }
            let meta = entry.metadata()?;
            if meta.is_dir() {
                self.walk(&entry.path(), &rel, out)?;
            } else {
                out.push(ContentEntry { path: rel, is_dir: false, size: meta.len(), modified_ms: modified_ms(&meta) });
            }
        }
        Ok(())
    }

    pub fn delete(&self, rel: &str, recursive: bool) -> GoopResult<()> {
        let full = self.resolve(rel)?;
        let meta = std::fs::metadata(&full)?;
        if meta.is_dir() {
            if recursive {
                std::fs::remove_dir_all(&full)?;
            } else {
                std::fs::remove_dir(&full)?;
            }
        } else {
            std::fs::remove_file(&full)?;
        }
        Ok(())
    }

    pub fn rename(&self, from: &str, to: &str) -> GoopResult<()> {
        let from_full = self.resolve(from)?;
        let to_full = self.resolve(to)?;
        if let Some(parent) = to_full.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::rename(&from_full, &to_full)?;
        Ok(())
    }

    pub fn mkdir_under(&self, dir: &str, name: &str) -> GoopResult<()> {
        if name.contains('/') || name.contains('\\') || name == ".." {
            return Err(GoopError::BadRequest(format!("bad directory name: {name}")));
        }
        let full = self.resolve(dir)?.join(name);
        std::fs::create_dir_all(full)?;
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

fn is_forbidden(rel: &Path) -> bool {
    if let Some(Component::Normal(first)) = rel.components().next() {
        if let Some(first) = first.to_str() {
            return FORBIDDEN_PREFIXES.contains(&first);
        }
    }
    false
}

/// Clean a raw relative path: reject any `..` or absolute-root component,
/// normalize `.`  components away. Returns a path with no leading slash.
fn clean_relative(raw: &str) -> GoopResult<PathBuf> {
    let mut out = PathBuf::new();
    for component in Path::new(raw).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(GoopError::BadRequest(format!("bad path: {raw}")));
            }
        }
    }
    Ok(out)
}

pub fn etag_of(bytes: &[u8]) -> String {
    let hash = Sha256::digest(bytes);
    hex::encode(&hash[..16])
}

fn modified_ms(meta: &std::fs::Metadata) -> i64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> ContentStore {
        let dir = std::env::temp_dir().join(format!("goop2-content-test-{}", goop2_proto::msgid::generate()));
        ContentStore::new(dir).unwrap()
    }

    #[test]
    fn conditional_write_round_trip() {
        let store = store();
        let e1 = store.write("a.html", b"hello", "none").unwrap();
        let read = store.read("a.html").unwrap();
        assert_eq!(read.bytes, b"hello");
        assert_eq!(read.etag, e1);

        let e2 = store.write("a.html", b"world", &e1).unwrap();
        assert_ne!(e1, e2);

        let err = store.write("a.html", b"stale", &e1).unwrap_err();
        assert!(matches!(err, GoopError::Conflict(_)));

        let read = store.read("a.html").unwrap();
        assert_eq!(read.bytes, b"world");
    }

    #[test]
    fn create_if_absent_requires_absence() {
        let store = store();
        store.write("x.txt", b"one", "none").unwrap();
        let err = store.write("x.txt", b"two", "none").unwrap_err();
        assert!(matches!(err, GoopError::Conflict(_)));
    }

    #[test]
    fn traversal_is_rejected() {
        let store = store();
        let err = store.write("../escape.txt", b"x", "none").unwrap_err();
        assert!(matches!(err, GoopError::BadRequest(_)));
    }

    #[test]
    fn lua_subtree_is_forbidden() {
        let store = store();
        let err = store.read("lua/secret.lua").unwrap_err();
        assert!(matches!(err, GoopError::Forbidden(_)));
        // Forbidden check runs *after* cleaning, so a `.` component hiding
        // the traversal doesn't let `lua/` slip through.
        let err = store.read("./lua/x").unwrap_err();
        assert!(matches!(err, GoopError::Forbidden(_)));
    }
}
