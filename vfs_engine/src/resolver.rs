use async_recursion::async_recursion;
use log::{debug, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tree_meta::TreeStore;
use vfs_lib::{
    Address, ContentId, ContentStore, DnsLinkResolver, NameService, PeerKey, Progress, VfsError,
    VfsResult, CONTENT_PATH, NAME_PATH, SCHEME_NAME,
};

/// Turns an address into the content root it currently points at.
/// `content://` authorities are ids and resolve syntactically; `name://`
/// authorities go through the local identity short-circuit, the
/// per-session resolve cache, the Name Service, and finally the DNS-link
/// fallback for domain-shaped names.
pub struct NameResolver {
    store: TreeStore,
    content: Arc<dyn ContentStore>,
    names: Arc<dyn NameService>,
    dns: Arc<dyn DnsLinkResolver>,
    resolves: Mutex<HashMap<PeerKey, ContentId>>,
}

impl NameResolver {
    pub fn new(
        store: TreeStore,
        content: Arc<dyn ContentStore>,
        names: Arc<dyn NameService>,
        dns: Arc<dyn DnsLinkResolver>,
    ) -> Self {
        Self {
            store,
            content,
            names,
            dns,
            resolves: Mutex::new(HashMap::new()),
        }
    }

    pub fn cache_resolved(&self, peer: PeerKey, content: ContentId) {
        self.resolves.lock().unwrap().insert(peer, content);
    }

    /// Drop the session cache entry for a name address so the next
    /// resolution hits the network again.
    pub fn invalidate(&self, addr: &Address) {
        if addr.scheme() == SCHEME_NAME {
            if let Some(peer) = PeerKey::decode_name(addr.host()) {
                self.resolves.lock().unwrap().remove(&peer);
            }
        }
    }

    /// Content root of an address, ignoring its path.
    pub async fn root(&self, addr: &Address, progress: &dyn Progress) -> VfsResult<ContentId> {
        if addr.scheme() == SCHEME_NAME {
            self.resolve_address(addr, progress).await
        } else {
            ContentId::decode(addr.host())
                .map_err(|_| VfsError::InvalidName(addr.to_string()))
        }
    }

    /// Content id the full address (root plus path) points at.
    pub async fn content_at(&self, addr: &Address, progress: &dyn Progress) -> VfsResult<ContentId> {
        let root = self.root(addr, progress).await?;
        if addr.segments().is_empty() {
            return Ok(root);
        }
        self.content
            .resolve_path(&root, addr.segments())
            .await?
            .ok_or_else(|| VfsError::ContentNotFound(addr.to_string()))
    }

    async fn resolve_address(
        &self,
        addr: &Address,
        progress: &dyn Progress,
    ) -> VfsResult<ContentId> {
        let host = addr.host().to_string();
        if PeerKey::decode_name(&host).is_some() {
            self.resolve_name(addr, &host, progress).await
        } else {
            self.resolve_host(addr, &host, progress).await
        }
    }

    /// Resolve an identity-form name. The local identity answers from the
    /// local name record without touching the network; remote names try
    /// the session cache, then the Name Service with the last known
    /// sequence as freshness floor, then fall back to the last known
    /// content.
    pub async fn resolve_name(
        &self,
        addr: &Address,
        name: &str,
        progress: &dyn Progress,
    ) -> VfsResult<ContentId> {
        let local = self.names.local_key();
        if name == local.as_str() {
            if let Some(record) = self.store.name_record(&local)? {
                if let Some(content) = record.content {
                    return Ok(content);
                }
            }
        }

        let peer = PeerKey::decode_name(name)
            .ok_or_else(|| VfsError::InvalidName(addr.to_string()))?;
        if let Some(cached) = self.resolves.lock().unwrap().get(&peer).cloned() {
            return Ok(cached);
        }

        let record = self.store.ensure_name_record(&peer)?;
        let resolved = match self.names.resolve(name, record.sequence, progress).await {
            Ok(entry) => entry,
            Err(err) if err.is_closed() => return Err(err),
            Err(err) => {
                debug!("name service resolve failed for {}: {}", name, err);
                None
            }
        };

        match resolved {
            Some(entry) => {
                self.cache_resolved(peer.clone(), entry.content.clone());
                self.store.set_record_content(&peer, &entry.content)?;
                self.store.set_record_sequence(&peer, entry.sequence)?;
                Ok(entry.content)
            }
            None => match record.content {
                Some(content) => {
                    warn!("falling back to last known record for {}", name);
                    self.cache_resolved(peer, content.clone());
                    Ok(content)
                }
                None => Err(VfsError::ResolveFailed(addr.to_string())),
            },
        }
    }

    /// Resolve a domain-shaped name via its DNS link. A fresh link is
    /// persisted; when the lookup yields nothing the persisted link is
    /// tried before giving up.
    #[async_recursion]
    async fn resolve_host(
        &self,
        addr: &Address,
        domain: &str,
        progress: &dyn Progress,
    ) -> VfsResult<ContentId> {
        let link = match self.dns.resolve_dns_link(domain).await {
            Ok(link) => link,
            Err(err) if err.is_closed() => return Err(err),
            Err(err) => {
                debug!("dns link lookup failed for {}: {}", domain, err);
                String::new()
            }
        };

        if link.is_empty() {
            match self.store.dns_link(domain)? {
                Some(cached) => {
                    warn!("using cached dns link for {}", domain);
                    self.follow_dns_link(addr, &cached, progress).await
                }
                None => Err(VfsError::ResolveFailed(addr.to_string())),
            }
        } else {
            self.store.store_dns_link(domain, &link)?;
            self.follow_dns_link(addr, &link, progress).await
        }
    }

    /// Interpret a DNS-link value: `/content/<id>` is terminal,
    /// `/name/<target>` recurses on the target (identity or another
    /// domain).
    #[async_recursion]
    async fn follow_dns_link(
        &self,
        addr: &Address,
        link: &str,
        progress: &dyn Progress,
    ) -> VfsResult<ContentId> {
        if let Some(rest) = link.strip_prefix(CONTENT_PATH) {
            let root = rest.split('/').next().unwrap_or("");
            ContentId::decode(root).map_err(|_| VfsError::ResolveFailed(addr.to_string()))
        } else if let Some(rest) = link.strip_prefix(NAME_PATH) {
            let target = rest.split('/').next().unwrap_or("");
            if target.is_empty() {
                return Err(VfsError::ResolveFailed(addr.to_string()));
            }
            if PeerKey::decode_name(target).is_some() {
                self.resolve_name(addr, target, progress).await
            } else {
                self.resolve_host(addr, target, progress).await
            }
        } else {
            Err(VfsError::ResolveFailed(addr.to_string()))
        }
    }
}
