use async_recursion::async_recursion;
use log::{info, warn};
use std::sync::Arc;
use std::time::Duration;
use tree_meta::TreeStore;
use vfs_lib::{CancelFlag, ContentId, ContentStore, NameService, Progress, VfsResult};

/// Re-announces the published tree and pushes a fresh name record:
/// depth-first announce of every reachable id, then a monotonic sequence
/// bump, a best-effort record push to connected peers, and the Name
/// Service publish itself.
pub struct NamePublisher {
    store: TreeStore,
    content: Arc<dyn ContentStore>,
    names: Arc<dyn NameService>,
}

impl NamePublisher {
    pub fn new(store: TreeStore, content: Arc<dyn ContentStore>, names: Arc<dyn NameService>) -> Self {
        Self {
            store,
            content,
            names,
        }
    }

    pub async fn publish(&self, progress: &dyn Progress) -> VfsResult<()> {
        let local = self.names.local_key();
        let record = self.store.ensure_name_record(&local)?;
        let root = match record.content {
            Some(root) => root,
            // nothing has been published from this node yet
            None => return Ok(()),
        };

        self.announce_tree(&root, progress).await;
        if progress.is_cancelled() {
            return Err(vfs_lib::VfsError::Closed);
        }

        let sequence = self.store.sequence()? + 1;
        self.store.set_sequence(sequence)?;
        self.store.set_record_sequence(&local, sequence)?;

        let payload = serde_json::json!({
            "peer": local.as_str(),
            "content": root.as_str(),
            "sequence": sequence,
        })
        .to_string();
        for peer in self.names.connected_peers().await {
            match self.names.connect_and_notify(&peer, &payload).await {
                Ok(accepted) => info!("record pushed to {} [{}]", peer, accepted),
                Err(err) => warn!("record push to {} failed: {}", peer, err),
            }
        }

        self.names.publish(&root, sequence, progress).await
    }

    /// Announce every id reachable from `root`, children before their
    /// directory. Individual announce failures are logged and skipped.
    #[async_recursion]
    async fn announce_tree(&self, root: &ContentId, progress: &dyn Progress) {
        if progress.is_cancelled() {
            return;
        }
        match self.content.list_links(root, true).await {
            Ok(links) => {
                for link in links {
                    self.announce_tree(&link.id, progress).await;
                }
            }
            Err(err) => warn!("link listing failed for {}: {}", root, err),
        }
        if let Err(err) = self.names.announce(root, progress).await {
            warn!("announce failed for {}: {}", root, err);
        }
    }

    /// Periodic republish loop, gated on the publisher setting. The
    /// returned handle stops when `cancel` fires; the flag has no waker,
    /// so the wait is sliced into short ticks and the flag polled on each.
    pub fn spawn_periodic(self: Arc<Self>, cancel: CancelFlag) -> tokio::task::JoinHandle<()> {
        const TICK: Duration = Duration::from_millis(250);
        tokio::spawn(async move {
            'republish: loop {
                let hours = self.store.publish_interval_hours().unwrap_or(6);
                let deadline = tokio::time::Instant::now() + Duration::from_secs(hours * 3600);
                while tokio::time::Instant::now() < deadline {
                    tokio::time::sleep(TICK).await;
                    if cancel.is_cancelled() {
                        break 'republish;
                    }
                }
                if !self.store.publisher_enabled().unwrap_or(true) {
                    continue;
                }
                if let Err(err) = self.publish(&cancel).await {
                    if !err.is_closed() {
                        warn!("periodic publish failed: {}", err);
                    }
                }
            }
        })
    }
}
