use std::path::{Path, PathBuf};
use vfs_lib::VfsResult;

/// Per-node data files for materialized leaf content.
#[derive(Clone)]
pub struct LocalBlobs {
    root: PathBuf,
}

impl LocalBlobs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn ensure_root(&self) -> VfsResult<()> {
        std::fs::create_dir_all(&self.root)?;
        Ok(())
    }

    pub fn data_path(&self, id: i64) -> PathBuf {
        self.root.join(format!("node_{}.bin", id))
    }

    /// Remove a node's data file if present; missing files are fine.
    pub fn remove(&self, id: i64) {
        let _ = std::fs::remove_file(self.data_path(id));
    }
}
