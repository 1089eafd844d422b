mod address;
mod id;
mod link;
mod mime;
mod progress;
mod store;

pub use address::*;
pub use id::*;
pub use link::*;
pub use mime::*;
pub use progress::*;
pub use store::*;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum VfsError {
    #[error("internal error: {0}")]
    Internal(String),
    #[error("invalid name detected for {0}")]
    InvalidName(String),
    #[error("resolve name failed for {0}")]
    ResolveFailed(String),
    #[error("content not found for {0}")]
    ContentNotFound(String),
    #[error("transfer failed: {0}")]
    TransferFailed(String),
    #[error("operation closed")]
    Closed,
    #[error("I/O error: {0}")]
    IoError(String),
    #[error("db error: {0}")]
    DbError(String),
    #[error("invalid param: {0}")]
    InvalidParam(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
}

impl VfsError {
    pub fn is_closed(&self) -> bool {
        matches!(self, VfsError::Closed)
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, VfsError::ContentNotFound(_))
    }
}

pub type VfsResult<T> = std::result::Result<T, VfsError>;

impl From<std::io::Error> for VfsError {
    fn from(err: std::io::Error) -> Self {
        VfsError::IoError(err.to_string())
    }
}

pub const SCHEME_CONTENT: &str = "content";
pub const SCHEME_NAME: &str = "name";
pub const SCHEME_HTTP: &str = "http";
pub const SCHEME_HTTPS: &str = "https";

/// DNS-link record prefixes, interpreted by the name resolver.
pub const CONTENT_PATH: &str = "/content/";
pub const NAME_PATH: &str = "/name/";

pub const INDEX_HTML: &str = "index.html";
