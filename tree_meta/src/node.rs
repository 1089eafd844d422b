use vfs_lib::{ContentId, PeerKey, DIR_MIME_TYPE};

/// One row of the local tree mirror. Exactly one of `init`, `leaching`
/// and `seeding` describes "not started / in progress / done"; `deleting`
/// tombstones the row from any of the three and hides it from visible
/// children queries until the reclamation pass removes it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeNode {
    pub id: i64,
    pub parent: i64,
    pub name: String,
    pub mime_type: String,
    pub content: Option<ContentId>,
    pub size: i64,
    pub source_uri: Option<String>,
    pub last_modified: i64,
    pub progress: i64,
    pub job: Option<String>,
    pub init: bool,
    pub leaching: bool,
    pub seeding: bool,
    pub deleting: bool,
}

impl TreeNode {
    pub fn is_dir(&self) -> bool {
        self.mime_type == DIR_MIME_TYPE
    }
}

/// Insert-time fields of a tree node; everything else starts zeroed.
#[derive(Debug, Clone, Default)]
pub struct NewNode {
    pub parent: i64,
    pub name: String,
    pub mime_type: String,
    pub content: Option<ContentId>,
    pub size: i64,
    pub source_uri: Option<String>,
    pub init: bool,
    pub seeding: bool,
}

/// Mutable, sequence-numbered pointer from a publisher identity to a
/// content root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameRecord {
    pub peer: PeerKey,
    pub content: Option<ContentId>,
    pub sequence: u64,
}
