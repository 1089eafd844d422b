use crate::{VfsError, VfsResult};
use std::fmt;

/// Abstract URI form consumed throughout the engine:
/// `content://<id>/<path...>` and `name://<identity-or-domain>/<path...>`,
/// optionally carrying a `download=0|1` query marker used by the transfer
/// pipeline to distinguish "render inline" from "materialize to local
/// storage" requests. Plain `http(s)` addresses are carried too so the
/// redirect engine can rewrite them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    scheme: String,
    authority: String,
    segments: Vec<String>,
    download: Option<bool>,
}

impl Address {
    pub fn new(scheme: impl Into<String>, authority: impl Into<String>) -> Self {
        Self {
            scheme: scheme.into(),
            authority: authority.into(),
            segments: Vec::new(),
            download: None,
        }
    }

    pub fn parse(s: &str) -> VfsResult<Self> {
        let (scheme, rest) = s
            .split_once("://")
            .ok_or_else(|| VfsError::InvalidParam(format!("invalid address: {}", s)))?;
        if scheme.is_empty() {
            return Err(VfsError::InvalidParam(format!("invalid address: {}", s)));
        }

        let (rest, query) = match rest.split_once('?') {
            Some((r, q)) => (r, Some(q)),
            None => (rest, None),
        };

        let mut parts = rest.split('/');
        let authority = parts.next().unwrap_or("").to_string();
        if authority.is_empty() {
            return Err(VfsError::InvalidParam(format!("invalid address: {}", s)));
        }
        let segments: Vec<String> = parts
            .filter(|p| !p.is_empty())
            .map(|p| p.to_string())
            .collect();

        let mut download = None;
        if let Some(query) = query {
            for pair in query.split('&') {
                if let Some((k, v)) = pair.split_once('=') {
                    if k == "download" {
                        download = Some(v == "1");
                    }
                }
            }
        }

        Ok(Self {
            scheme: scheme.to_string(),
            authority,
            segments,
            download,
        })
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn authority(&self) -> &str {
        &self.authority
    }

    /// Authority without a trailing `:port`.
    pub fn host(&self) -> &str {
        match self.authority.rsplit_once(':') {
            Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host,
            _ => &self.authority,
        }
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn download(&self) -> Option<bool> {
        self.download
    }

    pub fn push_segment(mut self, segment: impl Into<String>) -> Self {
        self.segments.push(segment.into());
        self
    }

    pub fn with_segments<I, S>(mut self, segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.segments = segments.into_iter().map(|s| s.into()).collect();
        self
    }

    pub fn with_download(mut self, download: bool) -> Self {
        self.download = Some(download);
        self
    }

    /// Display name for the addressed entry: last path segment, or the
    /// authority when the address points at a root.
    pub fn file_name(&self) -> String {
        match self.segments.last() {
            Some(name) => name.clone(),
            None => self.authority.clone(),
        }
    }

    pub fn is_loopback(&self) -> bool {
        let host = self.host();
        host == "localhost" || host == "127.0.0.1"
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme, self.authority)?;
        for segment in &self.segments {
            write!(f, "/{}", segment)?;
        }
        if let Some(download) = self.download {
            write!(f, "?download={}", if download { 1 } else { 0 })?;
        }
        Ok(())
    }
}
