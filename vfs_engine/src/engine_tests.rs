use crate::{FolderProgress, Vfs, VfsConfig};
use async_trait::async_trait;
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::AsyncReadExt;
use vfs_lib::{
    Address, ByteStream, CancelFlag, ContentId, ContentStore, DnsLinkResolver, EventSink, Link,
    NameEntry, NameService, NoProgress, PeerKey, Progress, VfsError, VfsResult,
};

// ---------- in-memory collaborators ----------

#[derive(Clone)]
enum Object {
    Blob(Vec<u8>),
    Dir(BTreeMap<String, ContentId>),
}

#[derive(Default)]
struct MemStore {
    objects: Mutex<HashMap<String, Object>>,
    removed: Mutex<Vec<String>>,
    fail_reads: Mutex<HashSet<String>>,
    fail_store: AtomicBool,
    store_delay_ms: AtomicU64,
}

fn derive_id(tag: &str, bytes: &[u8]) -> ContentId {
    let mut hasher = DefaultHasher::new();
    tag.hash(&mut hasher);
    bytes.hash(&mut hasher);
    ContentId::from_trusted(format!("Qm{:a>44}", format!("{:x}", hasher.finish())))
}

impl MemStore {
    fn insert_blob(&self, bytes: &[u8]) -> ContentId {
        let id = derive_id("blob", bytes);
        self.objects
            .lock()
            .unwrap()
            .insert(id.as_str().to_string(), Object::Blob(bytes.to_vec()));
        id
    }

    fn put_dir(&self, map: BTreeMap<String, ContentId>) -> ContentId {
        let mut bytes = Vec::new();
        for (name, child) in &map {
            bytes.extend_from_slice(name.as_bytes());
            bytes.push(0);
            bytes.extend_from_slice(child.as_str().as_bytes());
            bytes.push(0);
        }
        let id = derive_id("dir", &bytes);
        self.objects
            .lock()
            .unwrap()
            .insert(id.as_str().to_string(), Object::Dir(map));
        id
    }

    fn make_dir(&self, entries: &[(&str, &ContentId)]) -> ContentId {
        let map = entries
            .iter()
            .map(|(name, child)| (name.to_string(), (*child).clone()))
            .collect();
        self.put_dir(map)
    }

    fn fail_reads_for(&self, id: &ContentId) {
        self.fail_reads
            .lock()
            .unwrap()
            .insert(id.as_str().to_string());
    }

    fn clear_read_failures(&self) {
        self.fail_reads.lock().unwrap().clear();
    }

    fn was_removed(&self, id: &ContentId) -> bool {
        self.removed.lock().unwrap().contains(&id.as_str().to_string())
    }

    fn dir_names(&self, id: &ContentId) -> Vec<String> {
        match self.objects.lock().unwrap().get(id.as_str()) {
            Some(Object::Dir(map)) => map.keys().cloned().collect(),
            _ => panic!("{} is not a directory", id),
        }
    }

    fn object(&self, id: &ContentId) -> Option<Object> {
        self.objects.lock().unwrap().get(id.as_str()).cloned()
    }
}

#[async_trait]
impl ContentStore for MemStore {
    async fn is_directory(&self, id: &ContentId) -> VfsResult<bool> {
        match self.object(id) {
            Some(Object::Dir(_)) => Ok(true),
            Some(Object::Blob(_)) => Ok(false),
            None => Err(VfsError::ContentNotFound(id.to_string())),
        }
    }

    async fn create_empty_directory(&self) -> VfsResult<ContentId> {
        Ok(self.put_dir(BTreeMap::new()))
    }

    async fn add_link(
        &self,
        dir: &ContentId,
        name: &str,
        child: &ContentId,
    ) -> VfsResult<ContentId> {
        let mut map = match self.object(dir) {
            Some(Object::Dir(map)) => map,
            _ => return Err(VfsError::ContentNotFound(dir.to_string())),
        };
        map.insert(name.to_string(), child.clone());
        Ok(self.put_dir(map))
    }

    async fn remove_link(&self, dir: &ContentId, name: &str) -> VfsResult<Option<ContentId>> {
        let mut map = match self.object(dir) {
            Some(Object::Dir(map)) => map,
            _ => return Err(VfsError::ContentNotFound(dir.to_string())),
        };
        if map.remove(name).is_none() {
            return Ok(None);
        }
        Ok(Some(self.put_dir(map)))
    }

    async fn list_links(&self, dir: &ContentId, _resolve_children: bool) -> VfsResult<Vec<Link>> {
        let map = match self.object(dir) {
            Some(Object::Dir(map)) => map,
            Some(Object::Blob(_)) => return Ok(Vec::new()),
            None => return Err(VfsError::ContentNotFound(dir.to_string())),
        };
        let mut links = Vec::new();
        for (name, child) in map {
            let (size, directory) = match self.object(&child) {
                Some(Object::Blob(bytes)) => (bytes.len() as u64, false),
                Some(Object::Dir(_)) => (0, true),
                None => (0, false),
            };
            links.push(Link::new(name, child, size, directory));
        }
        Ok(links)
    }

    async fn open_read_stream(&self, id: &ContentId) -> VfsResult<ByteStream> {
        if self.fail_reads.lock().unwrap().contains(id.as_str()) {
            return Err(VfsError::TransferFailed(format!(
                "injected read failure for {}",
                id
            )));
        }
        match self.object(id) {
            Some(Object::Blob(bytes)) => Ok(Box::new(std::io::Cursor::new(bytes))),
            Some(Object::Dir(_)) => Err(VfsError::InvalidState(format!("{} is a directory", id))),
            None => Err(VfsError::ContentNotFound(id.to_string())),
        }
    }

    async fn store(
        &self,
        mut source: ByteStream,
        progress: &dyn Progress,
        _expected_size: u64,
    ) -> VfsResult<ContentId> {
        if self.fail_store.load(Ordering::SeqCst) {
            return Err(VfsError::TransferFailed("injected store failure".into()));
        }
        let delay = self.store_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if progress.is_cancelled() {
            return Err(VfsError::Closed);
        }
        let mut bytes = Vec::new();
        source.read_to_end(&mut bytes).await?;
        progress.report(100);
        Ok(self.insert_blob(&bytes))
    }

    async fn remove(&self, id: &ContentId) -> VfsResult<()> {
        self.objects.lock().unwrap().remove(id.as_str());
        self.removed
            .lock()
            .unwrap()
            .push(id.as_str().to_string());
        Ok(())
    }

    async fn resolve_path(
        &self,
        root: &ContentId,
        segments: &[String],
    ) -> VfsResult<Option<ContentId>> {
        let mut cursor = root.clone();
        for segment in segments {
            let map = match self.object(&cursor) {
                Some(Object::Dir(map)) => map,
                _ => return Ok(None),
            };
            match map.get(segment) {
                Some(child) => cursor = child.clone(),
                None => return Ok(None),
            }
        }
        Ok(Some(cursor))
    }
}

struct MemNames {
    local: PeerKey,
    records: Mutex<HashMap<String, NameEntry>>,
    resolve_calls: AtomicUsize,
    fail_resolve: AtomicBool,
    published: Mutex<Vec<(ContentId, u64)>>,
    announced: Mutex<Vec<String>>,
    peers: Vec<PeerKey>,
    notified: Mutex<Vec<(String, String)>>,
}

impl MemNames {
    fn new(local: PeerKey, peers: Vec<PeerKey>) -> Self {
        Self {
            local,
            records: Mutex::new(HashMap::new()),
            resolve_calls: AtomicUsize::new(0),
            fail_resolve: AtomicBool::new(false),
            published: Mutex::new(Vec::new()),
            announced: Mutex::new(Vec::new()),
            peers,
            notified: Mutex::new(Vec::new()),
        }
    }

    fn put_record(&self, name: &str, content: ContentId, sequence: u64) {
        self.records
            .lock()
            .unwrap()
            .insert(name.to_string(), NameEntry { content, sequence });
    }
}

#[async_trait]
impl NameService for MemNames {
    fn local_key(&self) -> PeerKey {
        self.local.clone()
    }

    async fn resolve(
        &self,
        name: &str,
        _sequence_hint: u64,
        _progress: &dyn Progress,
    ) -> VfsResult<Option<NameEntry>> {
        self.resolve_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_resolve.load(Ordering::SeqCst) {
            return Err(VfsError::TransferFailed("injected resolve failure".into()));
        }
        Ok(self.records.lock().unwrap().get(name).cloned())
    }

    async fn publish(
        &self,
        content: &ContentId,
        sequence: u64,
        _progress: &dyn Progress,
    ) -> VfsResult<()> {
        self.published
            .lock()
            .unwrap()
            .push((content.clone(), sequence));
        Ok(())
    }

    async fn connect_and_notify(&self, peer: &PeerKey, payload: &str) -> VfsResult<bool> {
        self.notified
            .lock()
            .unwrap()
            .push((peer.as_str().to_string(), payload.to_string()));
        Ok(true)
    }

    async fn connected_peers(&self) -> Vec<PeerKey> {
        self.peers.clone()
    }

    async fn announce(&self, content: &ContentId, _progress: &dyn Progress) -> VfsResult<()> {
        self.announced
            .lock()
            .unwrap()
            .push(content.as_str().to_string());
        Ok(())
    }
}

#[derive(Default)]
struct MemDns {
    links: Mutex<HashMap<String, String>>,
}

impl MemDns {
    fn put_link(&self, domain: &str, link: &str) {
        self.links
            .lock()
            .unwrap()
            .insert(domain.to_string(), link.to_string());
    }

    fn clear(&self) {
        self.links.lock().unwrap().clear();
    }
}

#[async_trait]
impl DnsLinkResolver for MemDns {
    async fn resolve_dns_link(&self, domain: &str) -> VfsResult<String> {
        Ok(self
            .links
            .lock()
            .unwrap()
            .get(domain)
            .cloned()
            .unwrap_or_default())
    }
}

#[derive(Default)]
struct MemEvents {
    errors: Mutex<Vec<String>>,
    refreshes: AtomicUsize,
}

impl EventSink for MemEvents {
    fn error(&self, message: &str) {
        self.errors.lock().unwrap().push(message.to_string());
    }

    fn refresh(&self) {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct RecordingFolderProgress {
    entries: Mutex<Vec<(String, usize, usize)>>,
}

impl FolderProgress for RecordingFolderProgress {
    fn entry(&self, name: &str, index: usize, total: usize) {
        self.entries
            .lock()
            .unwrap()
            .push((name.to_string(), index, total));
    }
}

// ---------- fixture ----------

struct Fixture {
    vfs: Vfs,
    content: Arc<MemStore>,
    names: Arc<MemNames>,
    dns: Arc<MemDns>,
    events: Arc<MemEvents>,
    _tmp: TempDir,
}

fn local_key() -> PeerKey {
    PeerKey::from_trusted("L".repeat(52))
}

fn create_fixture() -> Fixture {
    let _ = simplelog::SimpleLogger::init(
        simplelog::LevelFilter::Debug,
        simplelog::Config::default(),
    );
    let tmp = TempDir::new().unwrap();
    let content = Arc::new(MemStore::default());
    let names = Arc::new(MemNames::new(
        local_key(),
        vec![PeerKey::from_trusted("Q".repeat(52))],
    ));
    let dns = Arc::new(MemDns::default());
    let events = Arc::new(MemEvents::default());
    let vfs = Vfs::new(
        VfsConfig {
            db_path: tmp.path().join("tree.db"),
            blob_root: tmp.path().join("blobs"),
        },
        content.clone(),
        names.clone(),
        dns.clone(),
        events.clone(),
    )
    .unwrap();
    Fixture {
        vfs,
        content,
        names,
        dns,
        events,
        _tmp: tmp,
    }
}

fn write_file(dir: &TempDir, name: &str, bytes: &[u8]) -> PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, bytes).unwrap();
    path
}

fn root_content(fx: &Fixture) -> ContentId {
    fx.vfs
        .store()
        .name_record(&local_key())
        .unwrap()
        .unwrap()
        .content
        .unwrap()
}

// ---------- uploads and tree maintenance ----------

#[tokio::test]
async fn test_upload_file_updates_ancestor_sizes() {
    let fx = create_fixture();
    fx.vfs.init().await.unwrap();
    let data = TempDir::new().unwrap();

    let docs = fx.vfs.create_folder(0, "docs").await.unwrap();
    let notes = write_file(&data, "notes.txt", b"hello");
    let file = fx.vfs.upload_file(docs, &notes, &NoProgress).await.unwrap();

    let node = fx.vfs.store().node(file).unwrap().unwrap();
    assert!(node.seeding);
    assert_eq!(node.size, 5);
    assert_eq!(node.mime_type, "text/plain");
    assert_eq!(fx.vfs.store().node(docs).unwrap().unwrap().size, 5);

    let more = write_file(&data, "more.txt", b"abcdefg");
    fx.vfs.upload_file(docs, &more, &NoProgress).await.unwrap();
    assert_eq!(fx.vfs.store().node(docs).unwrap().unwrap().size, 12);

    assert_eq!(fx.content.dir_names(&root_content(&fx)), ["docs"]);
    assert!(fx.events.refreshes.load(Ordering::SeqCst) >= 3);
}

#[tokio::test]
async fn test_rename_to_same_name_is_noop() {
    let fx = create_fixture();
    fx.vfs.init().await.unwrap();
    let data = TempDir::new().unwrap();

    let notes = write_file(&data, "notes.txt", b"hello");
    let file = fx.vfs.upload_file(0, &notes, &NoProgress).await.unwrap();
    let before_root = root_content(&fx);
    let before = fx.vfs.store().node(file).unwrap().unwrap();

    fx.vfs.rename(file, "notes.txt").await.unwrap();
    assert_eq!(root_content(&fx), before_root);
    assert_eq!(
        fx.vfs.store().node(file).unwrap().unwrap().last_modified,
        before.last_modified
    );
}

#[tokio::test]
async fn test_rename_rewrites_parent_directory() {
    let fx = create_fixture();
    fx.vfs.init().await.unwrap();
    let data = TempDir::new().unwrap();

    let notes = write_file(&data, "notes.txt", b"hello");
    let file = fx.vfs.upload_file(0, &notes, &NoProgress).await.unwrap();

    fx.vfs.rename(file, "renamed.txt").await.unwrap();
    assert_eq!(fx.vfs.store().node(file).unwrap().unwrap().name, "renamed.txt");
    assert_eq!(fx.content.dir_names(&root_content(&fx)), ["renamed.txt"]);
}

#[tokio::test]
async fn test_unique_sibling_names() {
    let fx = create_fixture();
    fx.vfs.init().await.unwrap();
    let first_dir = TempDir::new().unwrap();
    let second_dir = TempDir::new().unwrap();

    let first = write_file(&first_dir, "file.txt", b"one");
    let second = write_file(&second_dir, "file.txt", b"two");
    fx.vfs.upload_file(0, &first, &NoProgress).await.unwrap();
    fx.vfs.upload_file(0, &second, &NoProgress).await.unwrap();

    let mut names: Vec<String> = fx
        .vfs
        .store()
        .visible_children(0)
        .unwrap()
        .into_iter()
        .map(|n| n.name)
        .collect();
    names.sort();
    assert_eq!(names, ["file (1).txt", "file.txt"]);
    assert_eq!(fx.content.dir_names(&root_content(&fx)).len(), 2);
}

#[tokio::test]
async fn test_concurrent_upload_of_same_source_rejected() {
    let fx = create_fixture();
    fx.vfs.init().await.unwrap();
    let data = TempDir::new().unwrap();
    let notes = write_file(&data, "notes.txt", b"hello");

    // keep the winner in flight long enough for the loser to knock
    fx.content.store_delay_ms.store(20, Ordering::SeqCst);
    let (first, second) = tokio::join!(
        fx.vfs.upload_file(0, &notes, &NoProgress),
        fx.vfs.upload_file(0, &notes, &NoProgress)
    );

    assert!(first.is_ok() != second.is_ok());
    let err = first.and(second).unwrap_err();
    assert!(matches!(err, VfsError::InvalidState(_)));
    // the rejected run never created a node row
    assert_eq!(fx.vfs.store().visible_children(0).unwrap().len(), 1);

    // once the winner finishes, the same source is admitted again
    fx.content.store_delay_ms.store(0, Ordering::SeqCst);
    fx.vfs.upload_file(0, &notes, &NoProgress).await.unwrap();
}

#[tokio::test]
async fn test_delete_hides_subtree_and_reclaim_respects_references() {
    let fx = create_fixture();
    fx.vfs.init().await.unwrap();
    let data = TempDir::new().unwrap();

    // identical bytes produce the same content id
    let keep = write_file(&data, "keep.txt", b"shared");
    let lose = write_file(&data, "lose.txt", b"shared");
    let kept = fx.vfs.upload_file(0, &keep, &NoProgress).await.unwrap();
    let docs = fx.vfs.create_folder(0, "docs").await.unwrap();
    let doomed = fx.vfs.upload_file(docs, &lose, &NoProgress).await.unwrap();

    let shared = fx.vfs.store().node(kept).unwrap().unwrap().content.unwrap();
    fx.vfs.delete(docs).await.unwrap();

    let visible: Vec<i64> = fx
        .vfs
        .store()
        .visible_children(0)
        .unwrap()
        .into_iter()
        .map(|n| n.id)
        .collect();
    assert_eq!(visible, [kept]);
    assert!(fx.vfs.store().node(doomed).unwrap().unwrap().deleting);
    assert_eq!(fx.content.dir_names(&root_content(&fx)), ["keep.txt"]);

    let docs_content = fx.vfs.store().node(docs).unwrap().unwrap().content.unwrap();

    // a fresh tombstone is still inside the grace window
    fx.vfs.reclaim(Duration::from_secs(3600)).await.unwrap();
    assert!(fx.vfs.store().node(docs).unwrap().is_some());

    fx.vfs.reclaim(Duration::ZERO).await.unwrap();

    assert!(fx.vfs.store().node(docs).unwrap().is_none());
    assert!(fx.vfs.store().node(doomed).unwrap().is_none());
    assert!(fx.content.was_removed(&docs_content));
    // still referenced by the surviving node
    assert!(!fx.content.was_removed(&shared));
}

// ---------- resolution ----------

#[tokio::test]
async fn test_resolve_local_identity_short_circuits() {
    let fx = create_fixture();
    fx.vfs.init().await.unwrap();
    let data = TempDir::new().unwrap();
    let notes = write_file(&data, "notes.txt", b"hello");
    fx.vfs.upload_file(0, &notes, &NoProgress).await.unwrap();

    let resolved = fx
        .vfs
        .resolve_root(&fx.vfs.home_address(), &NoProgress)
        .await
        .unwrap();
    assert_eq!(resolved, root_content(&fx));
    assert_eq!(fx.names.resolve_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_resolve_remote_name_caches_per_session() {
    let fx = create_fixture();
    let remote = "P".repeat(52);
    let cid = fx.content.insert_blob(b"remote page");
    fx.names.put_record(&remote, cid.clone(), 1500);

    let addr = Address::parse(&format!("name://{}", remote)).unwrap();
    assert_eq!(fx.vfs.resolve_root(&addr, &NoProgress).await.unwrap(), cid);
    assert_eq!(fx.vfs.resolve_root(&addr, &NoProgress).await.unwrap(), cid);
    assert_eq!(fx.names.resolve_calls.load(Ordering::SeqCst), 1);

    // the resolved record is persisted for offline fallback
    let record = fx
        .vfs
        .store()
        .name_record(&PeerKey::from_trusted(remote))
        .unwrap()
        .unwrap();
    assert_eq!(record.content, Some(cid));
    assert_eq!(record.sequence, 1500);
}

#[tokio::test]
async fn test_invalidate_drops_session_cache_entry() {
    let fx = create_fixture();
    let remote = "P".repeat(52);
    let cid = fx.content.insert_blob(b"remote page");
    fx.names.put_record(&remote, cid.clone(), 1500);

    let addr = Address::parse(&format!("name://{}", remote)).unwrap();
    fx.vfs.resolve_root(&addr, &NoProgress).await.unwrap();
    fx.vfs.resolver().invalidate(&addr);
    fx.vfs.resolve_root(&addr, &NoProgress).await.unwrap();
    assert_eq!(fx.names.resolve_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_resolve_falls_back_to_last_known_record() {
    let fx = create_fixture();
    let remote = PeerKey::from_trusted("R".repeat(52));
    let cid = fx.content.insert_blob(b"old page");
    fx.vfs.store().ensure_name_record(&remote).unwrap();
    fx.vfs.store().set_record_content(&remote, &cid).unwrap();
    fx.names.fail_resolve.store(true, Ordering::SeqCst);

    let addr = Address::parse(&format!("name://{}", remote)).unwrap();
    assert_eq!(fx.vfs.resolve_root(&addr, &NoProgress).await.unwrap(), cid);

    // a name with no last known record fails for good
    let unknown = Address::parse(&format!("name://{}", "S".repeat(52))).unwrap();
    let err = fx.vfs.resolve_root(&unknown, &NoProgress).await.unwrap_err();
    assert!(matches!(err, VfsError::ResolveFailed(_)));
}

#[tokio::test]
async fn test_resolve_domain_via_dns_link_with_cached_fallback() {
    let fx = create_fixture();
    let cid = fx.content.insert_blob(b"site");
    fx.dns
        .put_link("docs.example.org", &format!("/content/{}", cid));

    let addr = Address::parse("name://docs.example.org").unwrap();
    assert_eq!(fx.vfs.resolve_root(&addr, &NoProgress).await.unwrap(), cid);
    assert!(fx
        .vfs
        .store()
        .dns_link("docs.example.org")
        .unwrap()
        .is_some());

    // lookup goes dark, the persisted link still answers
    fx.dns.clear();
    assert_eq!(fx.vfs.resolve_root(&addr, &NoProgress).await.unwrap(), cid);
}

#[tokio::test]
async fn test_resolve_domain_via_name_path_link() {
    let fx = create_fixture();
    let remote = "P".repeat(52);
    let cid = fx.content.insert_blob(b"page");
    fx.names.put_record(&remote, cid.clone(), 2000);
    fx.dns
        .put_link("example.org", &format!("/name/{}", remote));

    let addr = Address::parse("name://example.org").unwrap();
    assert_eq!(fx.vfs.resolve_root(&addr, &NoProgress).await.unwrap(), cid);
}

#[tokio::test]
async fn test_content_at_walks_path_segments() {
    let fx = create_fixture();
    let blob = fx.content.insert_blob(b"body");
    let sub = fx.content.make_dir(&[("page.html", &blob)]);
    let root = fx.content.make_dir(&[("sub", &sub)]);

    let addr = Address::parse(&format!("content://{}/sub/page.html", root)).unwrap();
    assert_eq!(fx.vfs.content_at(&addr, &NoProgress).await.unwrap(), blob);

    let missing = Address::parse(&format!("content://{}/sub/other.html", root)).unwrap();
    let err = fx.vfs.content_at(&missing, &NoProgress).await.unwrap_err();
    assert!(err.is_not_found());
}

// ---------- redirects ----------

#[tokio::test]
async fn test_redirect_rebases_embedded_address() {
    let fx = create_fixture();
    let cid = fx.content.insert_blob(b"target");
    let host = "N".repeat(52);

    let addr = Address::parse(&format!("name://{}/content/{}/a/b", host, cid)).unwrap();
    let out = fx.vfs.normalize(addr, &NoProgress).await.unwrap();
    assert_eq!(out.to_string(), format!("content://{}/a/b", cid));

    // an embedded pair with an invalid id is left alone
    let addr = Address::parse(&format!("name://{}/content/short/a", host)).unwrap();
    let out = fx.vfs.normalize(addr.clone(), &NoProgress).await.unwrap();
    assert_eq!(out, addr);
}

#[tokio::test]
async fn test_redirect_appends_index_html() {
    let fx = create_fixture();
    let page = fx.content.insert_blob(b"<html></html>");
    let site = fx.content.make_dir(&[("index.html", &page)]);

    let addr = Address::parse(&format!("content://{}", site)).unwrap();
    let out = fx.vfs.normalize(addr.clone(), &NoProgress).await.unwrap();
    assert_eq!(out.segments(), ["index.html"]);

    fx.vfs.store().set_redirect_index(false).unwrap();
    let out = fx.vfs.normalize(addr.clone(), &NoProgress).await.unwrap();
    assert_eq!(out, addr);
}

#[tokio::test]
async fn test_redirect_skips_directories_without_index() {
    let fx = create_fixture();
    let page = fx.content.insert_blob(b"data");
    let site = fx.content.make_dir(&[("readme.txt", &page)]);

    let addr = Address::parse(&format!("content://{}", site)).unwrap();
    let out = fx.vfs.normalize(addr.clone(), &NoProgress).await.unwrap();
    assert_eq!(out, addr);

    // leaf targets never gain an index segment
    let leaf = Address::parse(&format!("content://{}", page)).unwrap();
    let out = fx.vfs.normalize(leaf.clone(), &NoProgress).await.unwrap();
    assert_eq!(out, leaf);
}

#[tokio::test]
async fn test_redirect_http_rules() {
    let fx = create_fixture();
    let cid = fx.content.insert_blob(b"gateway target");

    let loopback = Address::parse(&format!("http://localhost:8080/content/{}", cid)).unwrap();
    let out = fx.vfs.normalize(loopback, &NoProgress).await.unwrap();
    assert_eq!(out.to_string(), format!("content://{}", cid));

    let remote = Address::parse(&format!("http://example.com/content/{}", cid)).unwrap();
    let out = fx.vfs.normalize(remote.clone(), &NoProgress).await.unwrap();
    assert_eq!(out, remote);

    let https = Address::parse(&format!("https://gateway.io/content/{}", cid)).unwrap();
    let out = fx.vfs.normalize(https.clone(), &NoProgress).await.unwrap();
    assert_eq!(out, https);

    fx.vfs.store().set_redirect_url(true).unwrap();
    let out = fx.vfs.normalize(https, &NoProgress).await.unwrap();
    assert_eq!(out.to_string(), format!("content://{}", cid));
}

// ---------- materialize ----------

#[tokio::test]
async fn test_materialize_directory_tree() {
    let fx = create_fixture();
    fx.vfs.init().await.unwrap();
    let a = fx.content.insert_blob(b"aaaa");
    let b = fx.content.insert_blob(b"bb");
    let sub = fx.content.make_dir(&[("b.txt", &b)]);
    let root = fx.content.make_dir(&[("a.txt", &a), ("sub", &sub)]);

    let addr = Address::parse(&format!("content://{}", root)).unwrap();
    let id = fx.vfs.download(&addr, &NoProgress).await.unwrap();

    let node = fx.vfs.store().node(id).unwrap().unwrap();
    assert!(node.seeding);
    assert!(node.is_dir());
    assert_eq!(node.size, 6);

    let children = fx.vfs.store().visible_children(id).unwrap();
    assert_eq!(children.len(), 2);
    let leaf = children.iter().find(|c| c.name == "a.txt").unwrap();
    assert!(leaf.seeding);
    assert_eq!(leaf.size, 4);
    assert_eq!(
        std::fs::read(fx.vfs.blobs().data_path(leaf.id)).unwrap(),
        b"aaaa"
    );

    let sub_node = children.iter().find(|c| c.name == "sub").unwrap();
    assert!(sub_node.seeding);
    assert_eq!(sub_node.size, 2);
    let grand = fx.vfs.store().visible_children(sub_node.id).unwrap();
    assert_eq!(grand.len(), 1);
    assert!(grand[0].seeding);
}

#[tokio::test]
async fn test_materialize_empty_directory() {
    let fx = create_fixture();
    fx.vfs.init().await.unwrap();
    let empty = fx.content.make_dir(&[]);

    let addr = Address::parse(&format!("content://{}", empty)).unwrap();
    let id = fx.vfs.download(&addr, &NoProgress).await.unwrap();

    let node = fx.vfs.store().node(id).unwrap().unwrap();
    assert!(node.seeding);
    assert!(node.is_dir());
    assert_eq!(node.size, 0);
}

#[tokio::test]
async fn test_failed_child_keeps_directory_resumable() {
    let fx = create_fixture();
    fx.vfs.init().await.unwrap();
    let good = fx.content.insert_blob(b"good");
    let bad = fx.content.insert_blob(b"bad");
    let root = fx.content.make_dir(&[("good.txt", &good), ("bad.txt", &bad)]);
    fx.content.fail_reads_for(&bad);

    let addr = Address::parse(&format!("content://{}", root)).unwrap();
    let id = fx.vfs.download(&addr, &NoProgress).await.unwrap();

    let node = fx.vfs.store().node(id).unwrap().unwrap();
    assert!(!node.seeding);
    // the run released its claim even though it did not error out
    assert!(!node.leaching);
    assert!(node.job.is_none());
    assert_eq!(fx.events.errors.lock().unwrap().len(), 1);

    // the second run re-creates the failed entry and completes
    fx.content.clear_read_failures();
    let again = fx.vfs.download(&addr, &NoProgress).await.unwrap();
    assert_eq!(again, id);

    let node = fx.vfs.store().node(id).unwrap().unwrap();
    assert!(node.seeding);
    let mut names: Vec<String> = fx
        .vfs
        .store()
        .visible_children(id)
        .unwrap()
        .into_iter()
        .map(|n| n.name)
        .collect();
    names.sort();
    assert_eq!(names, ["bad.txt", "good.txt"]);
}

#[tokio::test]
async fn test_cancelled_transfer_leaves_no_partial_state() {
    let fx = create_fixture();
    fx.vfs.init().await.unwrap();
    let blob = fx.content.insert_blob(b"payload");

    let cancel = CancelFlag::new();
    cancel.cancel();
    let addr = Address::parse(&format!("content://{}", blob)).unwrap();
    let err = fx.vfs.download(&addr, &cancel).await.unwrap_err();
    assert!(err.is_closed());
    assert!(fx.events.errors.lock().unwrap().is_empty());

    let nodes = fx.vfs.store().nodes_by_content_and_parent(&blob, 0).unwrap();
    assert_eq!(nodes.len(), 1);
    assert!(!nodes[0].seeding);
    assert!(!nodes[0].leaching);
    assert!(!nodes[0].deleting);
    assert!(!fx.vfs.blobs().data_path(nodes[0].id).exists());

    // a fresh run completes on the same node
    let id = fx.vfs.download(&addr, &NoProgress).await.unwrap();
    assert_eq!(id, nodes[0].id);
    assert!(fx.vfs.store().node(id).unwrap().unwrap().seeding);
}

#[tokio::test]
async fn test_download_reuses_existing_root_node() {
    let fx = create_fixture();
    fx.vfs.init().await.unwrap();
    let blob = fx.content.insert_blob(b"payload");

    let addr = Address::parse(&format!("content://{}", blob)).unwrap();
    let first = fx.vfs.download(&addr, &NoProgress).await.unwrap();
    let second = fx.vfs.download(&addr, &NoProgress).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(
        fx.vfs.store().nodes_by_content_and_parent(&blob, 0).unwrap().len(),
        1
    );
}

// ---------- folder upload ----------

#[tokio::test]
async fn test_upload_folder_mirrors_structure() {
    let fx = create_fixture();
    fx.vfs.init().await.unwrap();
    let data = TempDir::new().unwrap();
    let folder = data.path().join("album");
    std::fs::create_dir_all(folder.join("sub")).unwrap();
    std::fs::write(folder.join("one.txt"), b"one").unwrap();
    std::fs::write(folder.join("sub").join("two.txt"), b"seven").unwrap();

    let recorder = RecordingFolderProgress::default();
    let id = fx
        .vfs
        .upload_folder(0, &folder, &NoProgress, &recorder)
        .await
        .unwrap();

    let node = fx.vfs.store().node(id).unwrap().unwrap();
    assert!(node.seeding);
    assert!(node.is_dir());
    assert_eq!(node.name, "album");
    assert_eq!(node.size, 8);

    let children = fx.vfs.store().visible_children(id).unwrap();
    let one = children.iter().find(|c| c.name == "one.txt").unwrap();
    assert!(one.seeding);
    assert_eq!(one.size, 3);
    let sub = children.iter().find(|c| c.name == "sub").unwrap();
    assert!(sub.seeding);
    assert_eq!(sub.size, 5);

    let entries = recorder.entries.lock().unwrap();
    assert_eq!(
        *entries,
        [
            ("one.txt".to_string(), 0, 2),
            ("sub".to_string(), 1, 2),
            ("two.txt".to_string(), 0, 1),
        ]
    );

    assert_eq!(fx.content.dir_names(&root_content(&fx)), ["album"]);
}

// ---------- publishing ----------

#[tokio::test]
async fn test_publish_bumps_sequence_and_notifies_peers() {
    let fx = create_fixture();
    fx.vfs.init().await.unwrap();
    let data = TempDir::new().unwrap();
    let notes = write_file(&data, "notes.txt", b"hello");
    let file = fx.vfs.upload_file(0, &notes, &NoProgress).await.unwrap();
    let file_content = fx.vfs.store().node(file).unwrap().unwrap().content.unwrap();

    fx.vfs.publish(&NoProgress).await.unwrap();

    assert_eq!(fx.vfs.store().sequence().unwrap(), 1001);
    let root = root_content(&fx);
    assert_eq!(*fx.names.published.lock().unwrap(), [(root.clone(), 1001)]);

    let announced = fx.names.announced.lock().unwrap();
    assert!(announced.contains(&file_content.as_str().to_string()));
    // the root is announced after everything below it
    assert_eq!(announced.last().map(String::as_str), Some(root.as_str()));

    let notified = fx.names.notified.lock().unwrap();
    assert_eq!(notified.len(), 1);
    let payload: serde_json::Value = serde_json::from_str(&notified[0].1).unwrap();
    assert_eq!(payload["peer"], local_key().as_str());
    assert_eq!(payload["content"], root.as_str());
    assert_eq!(payload["sequence"], 1001);

    let record = fx.vfs.store().name_record(&local_key()).unwrap().unwrap();
    assert_eq!(record.sequence, 1001);
}

#[tokio::test]
async fn test_publish_without_root_is_a_noop() {
    let fx = create_fixture();
    fx.vfs.publish(&NoProgress).await.unwrap();
    assert!(fx.names.published.lock().unwrap().is_empty());
    assert_eq!(fx.vfs.store().sequence().unwrap(), 1000);
}

#[tokio::test]
async fn test_periodic_publish_stops_promptly_on_cancel() {
    let fx = create_fixture();
    let cancel = CancelFlag::new();
    let handle = fx.vfs.spawn_periodic_publish(cancel.clone());

    // the interval is hours long; cancellation must not wait it out
    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("publish loop kept running after cancellation")
        .unwrap();
    assert!(fx.names.published.lock().unwrap().is_empty());
}

// ---------- addresses ----------

#[tokio::test]
async fn test_node_address_follows_ancestor_path() {
    let fx = create_fixture();
    fx.vfs.init().await.unwrap();
    let data = TempDir::new().unwrap();

    let docs = fx.vfs.create_folder(0, "docs").await.unwrap();
    let notes = write_file(&data, "notes.txt", b"hello");
    let file = fx.vfs.upload_file(docs, &notes, &NoProgress).await.unwrap();

    let addr = fx.vfs.node_address(file, true).unwrap();
    assert_eq!(
        addr.to_string(),
        format!("name://{}/docs/notes.txt?download=1", "L".repeat(52))
    );
}

#[tokio::test]
async fn test_init_rebuilds_root_from_pins() {
    let fx = create_fixture();
    fx.vfs.init().await.unwrap();
    let data = TempDir::new().unwrap();
    let notes = write_file(&data, "notes.txt", b"hello");
    fx.vfs.upload_file(0, &notes, &NoProgress).await.unwrap();
    fx.vfs.create_folder(0, "docs").await.unwrap();

    // clobber the record, then let init put the pinned set back
    let stray = fx.content.insert_blob(b"stray");
    fx.vfs.store().set_record_content(&local_key(), &stray).unwrap();
    fx.vfs.init().await.unwrap();

    let mut names = fx.content.dir_names(&root_content(&fx));
    names.sort();
    assert_eq!(names, ["docs", "notes.txt"]);
}
