use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::timeout;

/// In-memory per-scope serialization.
///
/// Operations on the same (project, environment) queue on a fair tokio
/// mutex (waiters acquire in FIFO order); different scopes proceed in
/// parallel. Acquisition is bounded: a caller that cannot get the lock
/// within its wait budget receives None and surfaces `scope_busy`.
#[derive(Default)]
pub struct ScopeLocks {
    inner: std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ScopeLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, key: &str, wait: Duration) -> Option<OwnedMutexGuard<()>> {
        let lock = {
            let mut map = self.inner.lock().expect("scope lock map poisoned");
            map.entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        timeout(wait, lock.lock_owned()).await.ok()
    }
}
