mod blobs;
mod jobs;
mod pipeline;
mod publisher;
mod redirect;
mod resolver;
mod tree_sync;
mod vfs;

#[cfg(test)]
mod engine_tests;

pub use blobs::*;
pub use jobs::*;
pub use pipeline::*;
pub use publisher::*;
pub use redirect::*;
pub use resolver::*;
pub use tree_sync::*;
pub use vfs::*;
