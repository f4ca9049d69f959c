//! Per-root commit locks.
//!
//! Sessions for the same root must not interleave their Committing steps;
//! sessions for distinct roots share nothing and proceed concurrently. The
//! registry hands out one async mutex per root id, created on first use.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::Mutex as AsyncMutex;

#[derive(Default)]
pub struct RootLocks {
    inner: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl RootLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// The commit lock for `root_id`, shared by every session on that root.
    pub fn for_root(&self, root_id: &str) -> Arc<AsyncMutex<()>> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(
            inner
                .entry(root_id.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_same_root_serializes() {
        let locks = RootLocks::new();
        let a = locks.for_root("docs");
        let b = locks.for_root("docs");

        let held = a.lock().await;
        assert!(b.try_lock().is_err());
        drop(held);
        assert!(b.try_lock().is_ok());
    }

    #[tokio::test]
    async fn test_distinct_roots_proceed_concurrently() {
        let locks = RootLocks::new();
        let docs = locks.for_root("docs");
        let photos = locks.for_root("photos");

        let _held = docs.lock().await;
        assert!(photos.try_lock().is_ok());
    }
}
