use crate::NameResolver;
use log::debug;
use std::sync::Arc;
use tree_meta::TreeStore;
use vfs_lib::{
    Address, ContentId, ContentStore, Progress, VfsResult, INDEX_HTML, SCHEME_CONTENT,
    SCHEME_HTTP, SCHEME_HTTPS, SCHEME_NAME,
};

/// Pre-navigation address rewriting, applied in order and first match
/// wins:
///   1. a `content`/`name` address whose path embeds another
///      `/{content|name}/<id>` pair is rebased onto the embedded address;
///   2. a `content`/`name` address whose target is a directory holding an
///      `index.html` entry gains that segment (behind a setting, on by
///      default);
///   3. a loopback `http` address is rewritten like rule 1;
///   4. a general `https` address is rewritten like rule 1 (behind a
///      setting, off by default).
pub struct RedirectEngine {
    store: TreeStore,
    content: Arc<dyn ContentStore>,
    resolver: Arc<NameResolver>,
}

impl RedirectEngine {
    pub fn new(store: TreeStore, content: Arc<dyn ContentStore>, resolver: Arc<NameResolver>) -> Self {
        Self {
            store,
            content,
            resolver,
        }
    }

    pub async fn normalize(&self, addr: Address, progress: &dyn Progress) -> VfsResult<Address> {
        let scheme = addr.scheme().to_string();
        match scheme.as_str() {
            SCHEME_CONTENT | SCHEME_NAME => {
                if let Some(rebased) = embedded_rewrite(&addr) {
                    return Ok(rebased);
                }
                if self.store.redirect_index()? {
                    match self.index_redirect(&addr, progress).await {
                        Ok(Some(indexed)) => return Ok(indexed),
                        Ok(None) => {}
                        Err(err) if err.is_closed() => return Err(err),
                        // probe failures leave the address unchanged
                        Err(err) => debug!("index probe failed for {}: {}", addr, err),
                    }
                }
                Ok(addr)
            }
            SCHEME_HTTP if addr.is_loopback() => Ok(embedded_rewrite(&addr).unwrap_or(addr)),
            SCHEME_HTTPS if self.store.redirect_url()? => {
                Ok(embedded_rewrite(&addr).unwrap_or(addr))
            }
            _ => Ok(addr),
        }
    }

    /// Probe whether the address lands on a directory with an
    /// `index.html` entry.
    async fn index_redirect(
        &self,
        addr: &Address,
        progress: &dyn Progress,
    ) -> VfsResult<Option<Address>> {
        let root = self.resolver.root(addr, progress).await?;
        let target = match self.content.resolve_path(&root, addr.segments()).await? {
            Some(target) => target,
            None => return Ok(None),
        };
        if !self.content.is_directory(&target).await? {
            return Ok(None);
        }
        let index = self
            .content
            .resolve_path(&target, &[INDEX_HTML.to_string()])
            .await?;
        Ok(index.map(|_| addr.clone().push_segment(INDEX_HTML)))
    }
}

/// Rebase onto a `/{content|name}/<id>/...` pair embedded in the path.
/// The embedded authority must be a syntactically valid id; anything else
/// leaves the address alone.
fn embedded_rewrite(addr: &Address) -> Option<Address> {
    let segments = addr.segments();
    if segments.len() < 2 {
        return None;
    }
    let scheme = segments[0].as_str();
    if scheme != SCHEME_CONTENT && scheme != SCHEME_NAME {
        return None;
    }
    let authority = segments[1].as_str();
    if !ContentId::is_valid(authority) {
        return None;
    }
    let mut rebased = Address::new(scheme, authority).with_segments(segments[2..].to_vec());
    if let Some(download) = addr.download() {
        rebased = rebased.with_download(download);
    }
    Some(rebased)
}
