use crate::{folder_key, materialize_key, publish_key, LocalBlobs, TreeSynchronizer};
use async_recursion::async_recursion;
use log::{debug, warn};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tree_meta::{TreeNode, TreeStore};
use vfs_lib::{
    check_mime_type, ByteStream, ContentId, ContentStore, EventSink, Link, Progress, VfsError,
    VfsResult, DIR_MIME_TYPE, OCTET_MIME_TYPE,
};

/// Byte origin for an upload into the content store.
pub enum ByteSource {
    Stream(ByteStream),
    File(PathBuf),
    Url(String),
}

/// Position reporting for folder uploads: each entry announces its index
/// within the directory listing before its bytes move.
pub trait FolderProgress: Send + Sync {
    fn entry(&self, name: &str, index: usize, total: usize);
}

pub struct NoFolderProgress;

impl FolderProgress for NoFolderProgress {
    fn entry(&self, _name: &str, _index: usize, _total: usize) {}
}

/// Persists percent progress on the node row while forwarding to the
/// caller's sink.
struct NodeProgress<'a> {
    store: &'a TreeStore,
    id: i64,
    inner: &'a dyn Progress,
}

impl Progress for NodeProgress<'_> {
    fn report(&self, percent: u8) {
        if let Err(err) = self.store.set_progress(self.id, percent as i64) {
            debug!("progress update failed for node {}: {}", self.id, err);
        }
        self.inner.report(percent);
    }

    fn should_throttle(&self) -> bool {
        self.inner.should_throttle()
    }

    fn is_cancelled(&self) -> bool {
        self.inner.is_cancelled()
    }
}

/// Moves bytes between the content store and the local tree, in both
/// directions. Downloads ("materialize") walk a remote DAG into node rows
/// and local data files; uploads ("publish") push local bytes into the
/// store and link the resulting ids into the tree. All loops poll the
/// progress capability at chunk and child boundaries.
pub struct TransferPipeline {
    store: TreeStore,
    content: Arc<dyn ContentStore>,
    sync: Arc<TreeSynchronizer>,
    blobs: LocalBlobs,
    events: Arc<dyn EventSink>,
    http: reqwest::Client,
}

impl TransferPipeline {
    pub fn new(
        store: TreeStore,
        content: Arc<dyn ContentStore>,
        sync: Arc<TreeSynchronizer>,
        blobs: LocalBlobs,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            store,
            content,
            sync,
            blobs,
            events,
            http: reqwest::Client::new(),
        }
    }

    /// Move a node into the leaching state and stamp the job handle.
    /// Fails when the node was tombstoned underneath us.
    fn claim(&self, id: i64, job: &str) -> VfsResult<()> {
        self.store.set_leaching(id)?;
        if !self.store.is_leaching(id)? {
            return Err(VfsError::InvalidState(format!("node {} is tombstoned", id)));
        }
        if self.store.is_init(id)? {
            self.store.reset_init(id)?;
        }
        self.store.set_job(id, job)
    }

    // ---------- materialize (store -> tree) ----------

    /// Walk the DAG under `id`'s content into the tree, fetching leaf
    /// bytes into local data files. Idempotent: already-seeding children
    /// are skipped, so re-running resumes a partial transfer.
    pub async fn materialize(&self, id: i64, progress: &dyn Progress) -> VfsResult<()> {
        self.claim(id, &materialize_key(id))?;
        let parent = self.store.parent_of(id)?;
        let result = self.materialize_node(id, progress).await;
        if result.is_ok() {
            self.check_parent_seeding(parent).await;
        }
        // a run that did not reach seeding releases its claim, whether it
        // errored or completed with failed children
        match self.store.node(id)? {
            Some(node) if node.leaching && !node.seeding => {
                if let Err(err) = self.store.reset_leaching(id) {
                    warn!("leaching reset failed for node {}: {}", id, err);
                }
            }
            _ => {}
        }
        self.store.reset_job(id)?;
        result
    }

    #[async_recursion]
    async fn materialize_node(&self, id: i64, progress: &dyn Progress) -> VfsResult<()> {
        if progress.is_cancelled() {
            return Err(VfsError::Closed);
        }
        let node = self
            .store
            .node(id)?
            .ok_or_else(|| VfsError::InvalidState(format!("node {} not found", id)))?;
        if node.deleting {
            return Ok(());
        }
        let cid = node
            .content
            .clone()
            .ok_or_else(|| VfsError::InvalidState(format!("node {} has no content", id)))?;

        let links = self.content.list_links(&cid, false).await?;
        if links.is_empty() {
            if self.content.is_directory(&cid).await? {
                if progress.is_cancelled() {
                    return Err(VfsError::Closed);
                }
                self.store.set_mime_type(id, DIR_MIME_TYPE)?;
                self.store.set_size(id, 0)?;
                self.store.set_done(id, None)?;
                self.sync.finish_document(id).await
            } else {
                self.materialize_leaf(&node, progress).await
            }
        } else {
            if !node.is_dir() {
                self.store.set_mime_type(id, DIR_MIME_TYPE)?;
            }
            let pending = self.eval_links(&node, &links).await?;
            let mut failed = false;
            for child in pending {
                if progress.is_cancelled() {
                    return Err(VfsError::Closed);
                }
                match self.materialize_node(child, progress).await {
                    Ok(()) => {}
                    Err(err) if err.is_closed() => return Err(err),
                    Err(err) => {
                        failed = true;
                        warn!("child transfer failed under node {}: {}", id, err);
                    }
                }
            }
            // a failed entry keeps the directory out of the seeding
            // state; a later run picks up where this one stopped
            if !failed {
                let children = self.store.visible_children(id)?;
                if !children.is_empty() && children.iter().all(|c| c.seeding) {
                    self.complete_directory(id).await?;
                }
            }
            Ok(())
        }
    }

    /// Mirror directory links as child rows, reusing any live row that
    /// already carries the same content under the same parent.
    async fn eval_links(&self, node: &TreeNode, links: &[Link]) -> VfsResult<Vec<i64>> {
        let mut pending = Vec::new();
        for link in links {
            let existing = self
                .store
                .nodes_by_content_and_parent(&link.id, node.id)?;
            if let Some(child) = existing.iter().find(|c| !c.deleting) {
                if !child.seeding {
                    pending.push(child.id);
                }
                continue;
            }
            let mime = if link.directory {
                Some(DIR_MIME_TYPE)
            } else {
                None
            };
            let child = self.sync.create_document(
                node.id,
                mime,
                Some(link.id.clone()),
                None,
                &link.name,
                link.size as i64,
                false,
                false,
            )?;
            pending.push(child);
        }
        Ok(pending)
    }

    async fn materialize_leaf(&self, node: &TreeNode, progress: &dyn Progress) -> VfsResult<()> {
        self.store.set_leaching(node.id)?;
        let cid = node
            .content
            .clone()
            .ok_or_else(|| VfsError::InvalidState(format!("node {} has no content", node.id)))?;
        let path = self.blobs.data_path(node.id);

        match self.stream_to_blob(node, &cid, &path, progress).await {
            Ok(written) => {
                self.store.set_size(node.id, written as i64)?;
                if node.mime_type.is_empty() || node.mime_type == OCTET_MIME_TYPE {
                    self.store
                        .set_mime_type(node.id, &check_mime_type(None, &node.name))?;
                }
                self.store
                    .set_source_uri(node.id, &format!("file://{}", path.display()))?;
                self.store.set_done(node.id, None)?;
                self.sync.finish_document(node.id).await
            }
            Err(err) => {
                // no partial artifacts survive a failed or cancelled fetch
                let _ = tokio::fs::remove_file(&path).await;
                self.store.reset_leaching(node.id)?;
                if err.is_closed() {
                    return Err(err);
                }
                self.store.set_deleting(node.id)?;
                self.events
                    .error(&format!("transfer failed for {}", node.name));
                Err(err)
            }
        }
    }

    async fn stream_to_blob(
        &self,
        node: &TreeNode,
        cid: &ContentId,
        path: &Path,
        progress: &dyn Progress,
    ) -> VfsResult<u64> {
        self.blobs.ensure_root()?;
        let mut reader = self.content.open_read_stream(cid).await?;
        let mut file = tokio::fs::File::create(path).await?;
        let mut buf = vec![0u8; 64 * 1024];
        let mut written = 0u64;
        let expected = node.size.max(0) as u64;
        loop {
            if progress.is_cancelled() {
                return Err(VfsError::Closed);
            }
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            file.write_all(&buf[..n]).await?;
            written += n as u64;
            if expected > 0 && !progress.should_throttle() {
                let percent = ((written * 100) / expected).min(100) as u8;
                progress.report(percent);
                if let Err(err) = self.store.set_progress(node.id, percent as i64) {
                    debug!("progress update failed for node {}: {}", node.id, err);
                }
            }
        }
        file.flush().await?;
        Ok(written)
    }

    async fn complete_directory(&self, id: i64) -> VfsResult<()> {
        self.store
            .set_size(id, self.store.children_total_size(id)?)?;
        self.store.set_done(id, None)?;
        self.sync.finish_document(id).await
    }

    /// Walk up from `parent`, completing every directory whose visible
    /// children are all seeding. Errors are logged; completion is retried
    /// by the next transfer that touches the chain.
    #[async_recursion]
    pub async fn check_parent_seeding(&self, parent: i64) {
        if parent <= 0 {
            return;
        }
        let done = match self.store.visible_children(parent) {
            Ok(children) => !children.is_empty() && children.iter().all(|c| c.seeding),
            Err(err) => {
                warn!("seeding check failed for node {}: {}", parent, err);
                return;
            }
        };
        if !done {
            return;
        }
        if let Err(err) = self.complete_directory(parent).await {
            warn!("directory completion failed for node {}: {}", parent, err);
            return;
        }
        let next = self.store.parent_of(parent).unwrap_or(0);
        self.check_parent_seeding(next).await;
    }

    // ---------- publish (local bytes -> store) ----------

    /// Push a byte source into the content store and bind the resulting
    /// id to node `id`. On failure the node is tombstoned and the error
    /// surfaced; on cancellation the node merely drops out of leaching.
    pub async fn publish_source(
        &self,
        id: i64,
        source: ByteSource,
        progress: &dyn Progress,
    ) -> VfsResult<ContentId> {
        self.claim(id, &publish_key(id))?;
        let result = self.store_source(id, source, progress).await;
        self.store.reset_job(id)?;
        match result {
            Ok(cid) => {
                self.store.set_done(id, Some(&cid))?;
                self.sync.finish_document(id).await?;
                Ok(cid)
            }
            Err(err) => {
                self.store.reset_leaching(id)?;
                if err.is_closed() {
                    return Err(err);
                }
                self.store.set_deleting(id)?;
                self.events.error(&format!("upload failed for node {}", id));
                Err(err)
            }
        }
    }

    async fn store_source(
        &self,
        id: i64,
        source: ByteSource,
        progress: &dyn Progress,
    ) -> VfsResult<ContentId> {
        let node = self
            .store
            .node(id)?
            .ok_or_else(|| VfsError::InvalidState(format!("node {} not found", id)))?;
        let tracker = NodeProgress {
            store: &self.store,
            id,
            inner: progress,
        };
        match source {
            ByteSource::Stream(stream) => {
                self.content
                    .store(stream, &tracker, node.size.max(0) as u64)
                    .await
            }
            ByteSource::File(path) => {
                let meta = tokio::fs::metadata(&path).await?;
                let file = tokio::fs::File::open(&path).await?;
                self.content.store(Box::new(file), &tracker, meta.len()).await
            }
            ByteSource::Url(url) => {
                let (spool, len) = self.spool_http(id, &url, progress).await?;
                let file = tokio::fs::File::open(&spool).await?;
                let result = self.content.store(Box::new(file), &tracker, len).await;
                let _ = tokio::fs::remove_file(&spool).await;
                result
            }
        }
    }

    /// Fetch a remote resource into a spool file so the content store
    /// sees a plain byte stream of known length.
    async fn spool_http(
        &self,
        id: i64,
        url: &str,
        progress: &dyn Progress,
    ) -> VfsResult<(PathBuf, u64)> {
        self.blobs.ensure_root()?;
        let spool = self.blobs.root().join(format!("spool_{}.tmp", id));
        let mut response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|err| VfsError::TransferFailed(err.to_string()))?;
        if !response.status().is_success() {
            return Err(VfsError::TransferFailed(format!(
                "{} for {}",
                response.status(),
                url
            )));
        }
        let expected = response.content_length().unwrap_or(0);
        let mut file = tokio::fs::File::create(&spool).await?;
        let mut written = 0u64;
        loop {
            let chunk = match response
                .chunk()
                .await
                .map_err(|err| VfsError::TransferFailed(err.to_string()))?
            {
                Some(chunk) => chunk,
                None => break,
            };
            if progress.is_cancelled() {
                drop(file);
                let _ = tokio::fs::remove_file(&spool).await;
                return Err(VfsError::Closed);
            }
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
            if expected > 0 && !progress.should_throttle() {
                progress.report(((written * 100) / expected).min(100) as u8);
            }
        }
        file.flush().await?;
        Ok((spool, written))
    }

    /// Mirror a local directory tree into the store under `parent`.
    /// Entry failures tombstone the entry and continue; cancellation
    /// stops the walk.
    pub async fn upload_folder(
        &self,
        parent: i64,
        path: &Path,
        progress: &dyn Progress,
        folder: &dyn FolderProgress,
    ) -> VfsResult<i64> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                VfsError::InvalidParam(format!("not a folder name: {}", path.display()))
            })?
            .to_string();
        let dir = self.content.create_empty_directory().await?;
        let id = self.sync.create_document(
            parent,
            Some(DIR_MIME_TYPE),
            Some(dir),
            Some(format!("file://{}", path.display())),
            &name,
            0,
            false,
            false,
        )?;
        self.claim(id, &folder_key(&path.display().to_string()))?;
        let result = self.copy_folder(id, path, progress, folder).await;
        self.store.reset_job(id)?;
        match result {
            Ok(()) => {
                self.store
                    .set_size(id, self.store.children_total_size(id)?)?;
                self.store.set_done(id, None)?;
                self.sync.finish_document(id).await?;
                Ok(id)
            }
            Err(err) => {
                self.store.reset_leaching(id)?;
                Err(err)
            }
        }
    }

    #[async_recursion]
    async fn copy_folder(
        &self,
        id: i64,
        path: &Path,
        progress: &dyn Progress,
        folder: &dyn FolderProgress,
    ) -> VfsResult<()> {
        let mut entries = Vec::new();
        let mut dir = tokio::fs::read_dir(path).await?;
        while let Some(entry) = dir.next_entry().await? {
            entries.push(entry.path());
        }
        entries.sort();

        let total = entries.len();
        for (index, entry) in entries.iter().enumerate() {
            if progress.is_cancelled() {
                return Err(VfsError::Closed);
            }
            let name = match entry.file_name().and_then(|n| n.to_str()) {
                Some(name) => name.to_string(),
                None => {
                    warn!("skipping undecodable entry in {}", path.display());
                    continue;
                }
            };
            folder.entry(&name, index, total);

            let meta = tokio::fs::metadata(entry).await?;
            if meta.is_dir() {
                let sub = self.content.create_empty_directory().await?;
                let child = self.sync.create_document(
                    id,
                    Some(DIR_MIME_TYPE),
                    Some(sub),
                    Some(format!("file://{}", entry.display())),
                    &name,
                    0,
                    false,
                    false,
                )?;
                self.store.set_leaching(child)?;
                self.copy_folder(child, entry, progress, folder).await?;
                self.store
                    .set_size(child, self.store.children_total_size(child)?)?;
                self.store.set_done(child, None)?;
                self.sync.finish_document(child).await?;
            } else {
                let child = self.sync.create_document(
                    id,
                    None,
                    None,
                    Some(format!("file://{}", entry.display())),
                    &name,
                    meta.len() as i64,
                    false,
                    false,
                )?;
                self.store.set_leaching(child)?;
                let file = tokio::fs::File::open(entry).await?;
                let tracker = NodeProgress {
                    store: &self.store,
                    id: child,
                    inner: progress,
                };
                match self.content.store(Box::new(file), &tracker, meta.len()).await {
                    Ok(cid) => {
                        self.store.set_done(child, Some(&cid))?;
                        self.sync.finish_document(child).await?;
                    }
                    Err(err) if err.is_closed() => return Err(err),
                    Err(err) => {
                        self.store.set_deleting(child)?;
                        self.events.error(&format!("upload failed for {}", name));
                        warn!("folder entry failed for {}: {}", entry.display(), err);
                    }
                }
            }
        }
        Ok(())
    }
}
