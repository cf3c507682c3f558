//! Posts persisted as one JSON array on disk.

use std::path::{Path, PathBuf};

use anyhow::Context;
use cnc_core::{MemoryPostStore, Post, PostStore};
use tracing::{debug, error};

/// [`PostStore`] that rewrites its file after every change.
pub struct JsonPostStore {
    path: PathBuf,
    posts: MemoryPostStore,
}

impl JsonPostStore {
    /// Open `path`, starting empty when the file does not exist yet.
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let posts = match std::fs::read(path) {
            Ok(bytes) => {
                let list: Vec<Post> = serde_json::from_slice(&bytes)
                    .with_context(|| format!("parsing {}", path.display()))?;
                debug!(event = "posts_loaded", path = %path.display(), count = list.len());
                MemoryPostStore::from_posts(list)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => MemoryPostStore::new(),
            Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
        };
        Ok(Self {
            path: path.to_path_buf(),
            posts,
        })
    }

    fn persist(&self) {
        let bytes = match serde_json::to_vec_pretty(&self.posts.all()) {
            Ok(b) => b,
            Err(e) => {
                error!(event = "posts_encode_failure", error = %e);
                return;
            }
        };
        // Failures are logged in atomic_write; the in-memory copy stays authoritative.
        let _ = atomic_write(&self.path, &bytes);
    }
}

impl PostStore for JsonPostStore {
    fn get(&self, id: &str) -> Option<Post> {
        self.posts.get(id)
    }

    fn put(&mut self, post: Post) {
        self.posts.put(post);
        self.persist();
    }

    fn delete(&mut self, id: &str) -> bool {
        let removed = self.posts.delete(id);
        if removed {
            self.persist();
        }
        removed
    }

    fn all(&self) -> Vec<Post> {
        self.posts.all()
    }
}

/// Write to a sibling temp file, then rename over `path`.
fn atomic_write(path: &Path, content: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, content).map_err(|e| {
        error!(
            event = "atomic_write_failure",
            path = %tmp_path.display(),
            error = %e,
            "Failed to write temp file"
        );
        e
    })?;
    std::fs::rename(&tmp_path, path).map_err(|e| {
        error!(
            event = "atomic_rename_failure",
            from = %tmp_path.display(),
            to = %path.display(),
            error = %e,
            "Failed to rename temp file"
        );
        let _ = std::fs::remove_file(&tmp_path);
        e
    })
}
