use async_recursion::async_recursion;
use log::warn;
use std::sync::Arc;
use tree_meta::{unix_millis, NewNode, TreeStore};
use vfs_lib::{
    check_mime_type, split_name, ContentStore, PeerKey, VfsError, VfsResult, DIR_MIME_TYPE,
};

/// Keeps the relational mirror and the immutable directory DAG in step.
/// Every structural mutation flows through here: a change to a node
/// rewrites its parent directory object, stores the new parent id, and
/// repeats up to the root, where the local name record is updated instead
/// of a parent row.
pub struct TreeSynchronizer {
    store: TreeStore,
    content: Arc<dyn ContentStore>,
    local: PeerKey,
}

impl TreeSynchronizer {
    pub fn new(store: TreeStore, content: Arc<dyn ContentStore>, local: PeerKey) -> Self {
        Self {
            store,
            content,
            local,
        }
    }

    /// First free variant of `name` under `parent`: `"a.txt"`,
    /// `"a (1).txt"`, `"a (2).txt"`, ...
    pub fn unique_name(&self, name: &str, parent: i64) -> VfsResult<String> {
        let mut index = 0u32;
        loop {
            let candidate = if index == 0 {
                name.to_string()
            } else {
                match split_name(name) {
                    (base, Some(ext)) => format!("{} ({}).{}", base, index, ext),
                    (_, None) => format!("{} ({})", name, index),
                }
            };
            // tombstoned rows no longer occupy their name
            if self
                .store
                .nodes_by_name_and_parent(&candidate, parent)?
                .iter()
                .all(|n| n.deleting)
            {
                return Ok(candidate);
            }
            index += 1;
        }
    }

    /// Insert a node row under `parent` with a collision-free name. Does
    /// not touch the DAG; callers attach the node once its content exists.
    #[allow(clippy::too_many_arguments)]
    pub fn create_document(
        &self,
        parent: i64,
        mime_type: Option<&str>,
        content: Option<vfs_lib::ContentId>,
        source_uri: Option<String>,
        display_name: &str,
        size: i64,
        seeding: bool,
        init: bool,
    ) -> VfsResult<i64> {
        let name = self.unique_name(display_name, parent)?;
        self.store.create_node(&NewNode {
            parent,
            name,
            mime_type: check_mime_type(mime_type, display_name),
            content,
            size,
            source_uri,
            init,
            seeding,
        })
    }

    /// Rename a node and swap the link in its parent directory. Renaming
    /// to the current name is a no-op.
    pub async fn rename(&self, id: i64, display_name: &str) -> VfsResult<()> {
        let node = self
            .store
            .node(id)?
            .ok_or_else(|| VfsError::InvalidState(format!("node {} not found", id)))?;
        if node.name == display_name {
            return Ok(());
        }
        let name = self.unique_name(display_name, node.parent)?;
        self.store.set_name(id, &name)?;
        self.update_parent(id, Some(&node.name)).await
    }

    /// Link a node into its parent directory, replacing any same-named
    /// link.
    pub async fn attach_link(&self, id: i64) -> VfsResult<()> {
        self.update_parent(id, None).await
    }

    /// Attach plus ancestor size refresh; the completion step of every
    /// create/update.
    pub async fn finish_document(&self, id: i64) -> VfsResult<()> {
        self.attach_link(id).await?;
        self.update_ancestor_sizes(id)
    }

    /// Rewrite the parent directory so it links `id`'s name to `id`'s
    /// content, removing `old_name` first when the node was renamed, and
    /// ripple the new parent ids up to the root. At the root the local
    /// name record takes the place of a parent row.
    #[async_recursion]
    pub async fn update_parent(&self, id: i64, old_name: Option<&str>) -> VfsResult<()> {
        let node = self
            .store
            .node(id)?
            .ok_or_else(|| VfsError::InvalidState(format!("node {} not found", id)))?;
        let child = node
            .content
            .ok_or_else(|| VfsError::InvalidState(format!("node {} has no content", id)))?;

        if node.parent > 0 {
            let mut dir = self.store.content_of(node.parent)?.ok_or_else(|| {
                VfsError::InvalidState(format!("parent {} has no content", node.parent))
            })?;
            if let Some(old_name) = old_name {
                if let Some(pruned) = self.content.remove_link(&dir, old_name).await? {
                    dir = pruned;
                }
            }
            let dir = self.content.add_link(&dir, &node.name, &child).await?;
            self.store.set_content(node.parent, &dir)?;
            self.store.set_last_modified(node.parent, unix_millis())?;
            self.update_parent(node.parent, None).await
        } else {
            let record = self.store.ensure_name_record(&self.local)?;
            let mut dir = match record.content {
                Some(dir) => dir,
                None => self.content.create_empty_directory().await?,
            };
            if let Some(old_name) = old_name {
                if let Some(pruned) = self.content.remove_link(&dir, old_name).await? {
                    dir = pruned;
                }
            }
            let dir = self.content.add_link(&dir, &node.name, &child).await?;
            self.store.set_record_content(&self.local, &dir)
        }
    }

    /// Remove the link for `id` from its parent directory (or from the
    /// published root) and ripple the rewritten parent upward.
    pub async fn detach_link(&self, id: i64) -> VfsResult<()> {
        let node = self
            .store
            .node(id)?
            .ok_or_else(|| VfsError::InvalidState(format!("node {} not found", id)))?;

        if node.parent > 0 {
            let dir = self.store.content_of(node.parent)?.ok_or_else(|| {
                VfsError::InvalidState(format!("parent {} has no content", node.parent))
            })?;
            if let Some(pruned) = self.content.remove_link(&dir, &node.name).await? {
                self.store.set_content(node.parent, &pruned)?;
                self.store.set_last_modified(node.parent, unix_millis())?;
                self.update_parent(node.parent, None).await?;
            }
            Ok(())
        } else {
            let record = self.store.ensure_name_record(&self.local)?;
            if let Some(dir) = record.content {
                if let Some(pruned) = self.content.remove_link(&dir, &node.name).await? {
                    self.store.set_record_content(&self.local, &pruned)?;
                }
            }
            Ok(())
        }
    }

    /// Tombstone `id` and everything below it, children first, unhooking
    /// each subtree root from the DAG. Rows stay behind for the deferred
    /// reclamation pass. Detach failures are logged and do not block the
    /// tombstone; cancellation does.
    #[async_recursion]
    pub async fn mark_deleting(&self, id: i64) -> VfsResult<()> {
        for child in self.store.children(id)? {
            self.mark_deleting(child.id).await?;
        }
        if let Err(err) = self.detach_link(id).await {
            if err.is_closed() {
                return Err(err);
            }
            warn!("detach link failed for node {}: {}", id, err);
        }
        self.store.set_deleting(id)?;
        if let Err(err) = self.update_ancestor_sizes(id) {
            warn!("ancestor size update failed for node {}: {}", id, err);
        }
        Ok(())
    }

    /// Recompute every ancestor directory size as the sum of its visible
    /// children.
    pub fn update_ancestor_sizes(&self, id: i64) -> VfsResult<()> {
        let mut parent = self.store.parent_of(id)?;
        while parent > 0 {
            let size = self.store.children_total_size(parent)?;
            self.store.set_size(parent, size)?;
            parent = self.store.parent_of(parent)?;
        }
        Ok(())
    }

    pub fn local_key(&self) -> &PeerKey {
        &self.local
    }

    /// Create a directory node with a fresh empty DAG object and link it
    /// into the tree.
    pub async fn create_folder(&self, parent: i64, display_name: &str) -> VfsResult<i64> {
        let dir = self.content.create_empty_directory().await?;
        let id = self.create_document(
            parent,
            Some(DIR_MIME_TYPE),
            Some(dir),
            None,
            display_name,
            0,
            true,
            false,
        )?;
        self.finish_document(id).await?;
        Ok(id)
    }
}
