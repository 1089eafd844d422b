use crate::{ContentId, Link, PeerKey, Progress, VfsResult};
use async_trait::async_trait;
use tokio::io::AsyncRead;

pub type ByteStream = Box<dyn AsyncRead + Send + Unpin>;

/// Black-box immutable content-addressed object store (blocks plus
/// directory DAG nodes). Directory mutation returns the id of the new
/// directory node, the old one stays intact.
#[async_trait]
pub trait ContentStore: Send + Sync {
    async fn is_directory(&self, id: &ContentId) -> VfsResult<bool>;

    async fn create_empty_directory(&self) -> VfsResult<ContentId>;

    async fn add_link(
        &self,
        dir: &ContentId,
        name: &str,
        child: &ContentId,
    ) -> VfsResult<ContentId>;

    /// Returns `None` when the directory holds no link of that name.
    async fn remove_link(&self, dir: &ContentId, name: &str) -> VfsResult<Option<ContentId>>;

    async fn list_links(&self, dir: &ContentId, resolve_children: bool) -> VfsResult<Vec<Link>>;

    async fn open_read_stream(&self, id: &ContentId) -> VfsResult<ByteStream>;

    /// Store a byte source, reporting percent progress against
    /// `expected_size` (pass 0 when unknown).
    async fn store(
        &self,
        source: ByteStream,
        progress: &dyn Progress,
        expected_size: u64,
    ) -> VfsResult<ContentId>;

    /// Physical removal; only legal once nothing references the id.
    async fn remove(&self, id: &ContentId) -> VfsResult<()>;

    /// Walk `segments` under `root`; `None` when the path does not exist.
    async fn resolve_path(
        &self,
        root: &ContentId,
        segments: &[String],
    ) -> VfsResult<Option<ContentId>>;
}

/// One resolved name record as returned by the Name Service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameEntry {
    pub content: ContentId,
    pub sequence: u64,
}

/// Black-box distributed name system (publish/resolve) plus the peer
/// connectivity needed for best-effort record pushing.
#[async_trait]
pub trait NameService: Send + Sync {
    fn local_key(&self) -> PeerKey;

    /// Resolve a name, using `sequence_hint` as a freshness floor.
    /// `None` when no record could be found on the network.
    async fn resolve(
        &self,
        name: &str,
        sequence_hint: u64,
        progress: &dyn Progress,
    ) -> VfsResult<Option<NameEntry>>;

    async fn publish(
        &self,
        content: &ContentId,
        sequence: u64,
        progress: &dyn Progress,
    ) -> VfsResult<()>;

    /// Push a record payload to one peer; false when the peer could not
    /// be reached or rejected the notification.
    async fn connect_and_notify(&self, peer: &PeerKey, payload: &str) -> VfsResult<bool>;

    async fn connected_peers(&self) -> Vec<PeerKey>;

    /// DHT-style provide: advertise that this node can serve `content`.
    async fn announce(&self, content: &ContentId, progress: &dyn Progress) -> VfsResult<()>;
}

/// DNS-based indirection: a TXT-style record mapping a conventional
/// domain to a content-path or name-path prefix.
#[async_trait]
pub trait DnsLinkResolver: Send + Sync {
    /// Empty string when the domain carries no DNS-link record.
    async fn resolve_dns_link(&self, domain: &str) -> VfsResult<String>;
}

/// User-facing event channel; failures are surfaced here instead of
/// crashing the process, cancellations never are.
pub trait EventSink: Send + Sync {
    fn error(&self, message: &str);

    /// Content changed, any attached view should re-query.
    fn refresh(&self);
}
