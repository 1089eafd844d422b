use crate::ContentId;

/// One entry of a directory DAG node, as reported by the Content Store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    pub name: String,
    pub id: ContentId,
    pub size: u64,
    pub directory: bool,
}

impl Link {
    pub fn new(name: impl Into<String>, id: ContentId, size: u64, directory: bool) -> Self {
        Self {
            name: name.into(),
            id,
            size,
            directory,
        }
    }

    pub fn is_file(&self) -> bool {
        !self.directory
    }
}
