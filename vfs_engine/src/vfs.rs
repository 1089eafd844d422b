use crate::{
    folder_key, source_key, ByteSource, FolderProgress, JobRegistry, LocalBlobs, NamePublisher,
    NameResolver, RedirectEngine, TransferPipeline, TreeSynchronizer,
};
use log::warn;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tree_meta::{unix_millis, TreeStore};
use vfs_lib::{
    Address, CancelFlag, ContentId, ContentStore, DnsLinkResolver, EventSink, NameService,
    PeerKey, Progress, VfsError, VfsResult, DIR_MIME_TYPE, SCHEME_NAME,
};

pub struct VfsConfig {
    pub db_path: PathBuf,
    pub blob_root: PathBuf,
}

/// Top-level handle tying the tree mirror, the resolver, the redirect
/// engine, the synchronizer, the transfer pipeline and the publisher
/// together over one database and one set of collaborator services.
pub struct Vfs {
    store: TreeStore,
    content: Arc<dyn ContentStore>,
    names: Arc<dyn NameService>,
    events: Arc<dyn EventSink>,
    resolver: Arc<NameResolver>,
    redirect: RedirectEngine,
    sync: Arc<TreeSynchronizer>,
    pipeline: TransferPipeline,
    publisher: Arc<NamePublisher>,
    blobs: LocalBlobs,
    jobs: JobRegistry,
}

impl Vfs {
    pub fn new(
        config: VfsConfig,
        content: Arc<dyn ContentStore>,
        names: Arc<dyn NameService>,
        dns: Arc<dyn DnsLinkResolver>,
        events: Arc<dyn EventSink>,
    ) -> VfsResult<Self> {
        let store = TreeStore::open(&config.db_path)?;
        let blobs = LocalBlobs::new(&config.blob_root);
        blobs.ensure_root()?;

        let resolver = Arc::new(NameResolver::new(
            store.clone(),
            content.clone(),
            names.clone(),
            dns,
        ));
        let redirect = RedirectEngine::new(store.clone(), content.clone(), resolver.clone());
        let sync = Arc::new(TreeSynchronizer::new(
            store.clone(),
            content.clone(),
            names.local_key(),
        ));
        let pipeline = TransferPipeline::new(
            store.clone(),
            content.clone(),
            sync.clone(),
            blobs.clone(),
            events.clone(),
        );
        let publisher = Arc::new(NamePublisher::new(
            store.clone(),
            content.clone(),
            names.clone(),
        ));

        Ok(Self {
            store,
            content,
            names,
            events,
            resolver,
            redirect,
            sync,
            pipeline,
            publisher,
            blobs,
            jobs: JobRegistry::new(),
        })
    }

    /// Bootstrap the published root: make sure the local name record
    /// exists and rebuild its directory from the pinned set, so an
    /// interrupted session cannot leave the record pointing at a stale
    /// root.
    pub async fn init(&self) -> VfsResult<()> {
        let local = self.local_key();
        self.store.ensure_name_record(&local)?;
        let mut dir = self.content.create_empty_directory().await?;
        for pin in self.store.pins()? {
            if let Some(content) = &pin.content {
                dir = self.content.add_link(&dir, &pin.name, content).await?;
            }
        }
        self.store.set_record_content(&local, &dir)
    }

    pub fn store(&self) -> &TreeStore {
        &self.store
    }

    pub fn resolver(&self) -> &NameResolver {
        &self.resolver
    }

    pub fn synchronizer(&self) -> &TreeSynchronizer {
        &self.sync
    }

    pub fn pipeline(&self) -> &TransferPipeline {
        &self.pipeline
    }

    pub fn blobs(&self) -> &LocalBlobs {
        &self.blobs
    }

    pub fn local_key(&self) -> PeerKey {
        self.names.local_key()
    }

    /// `name://<local identity>`.
    pub fn home_address(&self) -> Address {
        Address::new(SCHEME_NAME, self.local_key().as_str())
    }

    /// Name address of a node: the local root plus the node's ancestor
    /// path, root-most first.
    pub fn node_address(&self, id: i64, download: bool) -> VfsResult<Address> {
        let path = self.store.ancestors(id)?;
        if path.is_empty() {
            return Err(VfsError::InvalidState(format!("node {} not found", id)));
        }
        Ok(self
            .home_address()
            .with_segments(path.into_iter().map(|n| n.name))
            .with_download(download))
    }

    // ---------- addresses ----------

    pub async fn normalize(&self, addr: Address, progress: &dyn Progress) -> VfsResult<Address> {
        self.redirect.normalize(addr, progress).await
    }

    pub async fn resolve_root(
        &self,
        addr: &Address,
        progress: &dyn Progress,
    ) -> VfsResult<ContentId> {
        self.resolver.root(addr, progress).await
    }

    pub async fn content_at(
        &self,
        addr: &Address,
        progress: &dyn Progress,
    ) -> VfsResult<ContentId> {
        self.resolver.content_at(addr, progress).await
    }

    // ---------- tree mutation ----------

    pub async fn create_folder(&self, parent: i64, name: &str) -> VfsResult<i64> {
        let id = self.sync.create_folder(parent, name).await?;
        self.events.refresh();
        Ok(id)
    }

    pub async fn rename(&self, id: i64, name: &str) -> VfsResult<()> {
        self.sync.rename(id, name).await?;
        self.events.refresh();
        Ok(())
    }

    /// Tombstone a subtree; rows and content disappear for good on the
    /// next reclamation pass.
    pub async fn delete(&self, id: i64) -> VfsResult<()> {
        self.sync.mark_deleting(id).await?;
        self.events.refresh();
        Ok(())
    }

    // ---------- transfers ----------

    pub async fn upload_file(
        &self,
        parent: i64,
        path: &Path,
        progress: &dyn Progress,
    ) -> VfsResult<i64> {
        // keyed by the source, and acquired before the node row exists, so
        // a second upload of the same file is turned away instead of
        // racing the first
        let uri = format!("file://{}", path.display());
        let _guard = self
            .jobs
            .acquire(source_key(&uri))
            .ok_or_else(|| VfsError::InvalidState(format!("upload already running for {}", uri)))?;
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| VfsError::InvalidParam(format!("not a file name: {}", path.display())))?
            .to_string();
        let size = tokio::fs::metadata(path).await?.len();
        let id = self.sync.create_document(
            parent,
            None,
            None,
            Some(uri),
            &name,
            size as i64,
            false,
            true,
        )?;
        let result = self
            .pipeline
            .publish_source(id, ByteSource::File(path.to_path_buf()), progress)
            .await;
        self.events.refresh();
        result.map(|_| id)
    }

    pub async fn upload_from_url(
        &self,
        parent: i64,
        url: &str,
        name: &str,
        size: i64,
        progress: &dyn Progress,
    ) -> VfsResult<i64> {
        let _guard = self
            .jobs
            .acquire(source_key(url))
            .ok_or_else(|| VfsError::InvalidState(format!("upload already running for {}", url)))?;
        let id = self.sync.create_document(
            parent,
            None,
            None,
            Some(url.to_string()),
            name,
            size,
            false,
            true,
        )?;
        let result = self
            .pipeline
            .publish_source(id, ByteSource::Url(url.to_string()), progress)
            .await;
        self.events.refresh();
        result.map(|_| id)
    }

    pub async fn upload_folder(
        &self,
        parent: i64,
        path: &Path,
        progress: &dyn Progress,
        folder: &dyn FolderProgress,
    ) -> VfsResult<i64> {
        let key = folder_key(&path.display().to_string());
        let _guard = self.jobs.acquire(key).ok_or_else(|| {
            VfsError::InvalidState(format!("folder upload already running for {}", path.display()))
        })?;
        let result = self.pipeline.upload_folder(parent, path, progress, folder).await;
        self.events.refresh();
        result
    }

    /// Materialize the content behind an address into the local tree,
    /// reusing a live root-level node that already carries the same
    /// content.
    pub async fn download(&self, addr: &Address, progress: &dyn Progress) -> VfsResult<i64> {
        let _guard = self
            .jobs
            .acquire(format!("download-{}", addr))
            .ok_or_else(|| {
                VfsError::InvalidState(format!("download already running for {}", addr))
            })?;
        let root = self.resolver.content_at(addr, progress).await?;
        let existing = self.store.nodes_by_content_and_parent(&root, 0)?;
        let id = match existing.iter().find(|n| !n.deleting) {
            Some(node) => node.id,
            None => {
                let mime = if self.content.is_directory(&root).await? {
                    Some(DIR_MIME_TYPE)
                } else {
                    None
                };
                self.sync.create_document(
                    0,
                    mime,
                    Some(root),
                    Some(addr.to_string()),
                    &addr.file_name(),
                    0,
                    false,
                    true,
                )?
            }
        };
        let result = self.pipeline.materialize(id, progress).await;
        self.events.refresh();
        result.map(|_| id)
    }

    // ---------- publishing and reclamation ----------

    pub async fn publish(&self, progress: &dyn Progress) -> VfsResult<()> {
        self.publisher.publish(progress).await
    }

    pub fn spawn_periodic_publish(&self, cancel: CancelFlag) -> tokio::task::JoinHandle<()> {
        self.publisher.clone().spawn_periodic(cancel)
    }

    /// Remove tombstoned rows and reclaim content nothing references any
    /// more. Only tombstones older than `grace` are touched, leaving a
    /// window to notice a mistaken delete; a failed content removal keeps
    /// its row for the next pass.
    pub async fn reclaim(&self, grace: Duration) -> VfsResult<()> {
        let cutoff = unix_millis() - grace.as_millis() as i64;
        for id in self.store.tombstoned_before(cutoff)? {
            let node = match self.store.node(id)? {
                Some(node) => node,
                None => continue,
            };
            if !node.deleting {
                continue;
            }
            if let Some(content) = &node.content {
                if self.store.reference_count(content)? <= 1 {
                    if let Err(err) = self.content.remove(content).await {
                        warn!("content removal failed for {}, keeping row: {}", content, err);
                        continue;
                    }
                }
            }
            self.store.remove_node(id)?;
            self.blobs.remove(id);
        }
        Ok(())
    }
}
