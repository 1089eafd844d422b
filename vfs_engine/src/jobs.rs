use std::collections::HashSet;
use std::sync::{Arc, Mutex};

/// Admission control for transfer/publish jobs: at most one job per
/// uniqueness key; duplicate submissions are rejected instead of run in
/// parallel.
#[derive(Clone, Default)]
pub struct JobRegistry {
    active: Arc<Mutex<HashSet<String>>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// `None` when a job with the same key is already running.
    pub fn acquire(&self, key: impl Into<String>) -> Option<JobGuard> {
        let key = key.into();
        let mut active = self.active.lock().unwrap();
        if !active.insert(key.clone()) {
            return None;
        }
        Some(JobGuard {
            active: self.active.clone(),
            key,
        })
    }

    pub fn is_active(&self, key: &str) -> bool {
        self.active.lock().unwrap().contains(key)
    }
}

/// Releases the key on drop.
pub struct JobGuard {
    active: Arc<Mutex<HashSet<String>>>,
    key: String,
}

impl JobGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for JobGuard {
    fn drop(&mut self) {
        self.active.lock().unwrap().remove(&self.key);
    }
}

pub fn materialize_key(id: i64) -> String {
    format!("materialize-{}", id)
}

pub fn publish_key(id: i64) -> String {
    format!("publish-{}", id)
}

pub fn folder_key(uri: &str) -> String {
    format!("folder-{}", uri)
}

pub fn source_key(uri: &str) -> String {
    format!("source-{}", uri)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_jobs_rejected() {
        let jobs = JobRegistry::new();
        let guard = jobs.acquire(materialize_key(7)).unwrap();
        assert!(jobs.acquire(materialize_key(7)).is_none());
        assert!(jobs.is_active(guard.key()));
        drop(guard);
        assert!(jobs.acquire(materialize_key(7)).is_some());
    }
}
