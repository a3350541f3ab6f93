use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use futures::{stream::FuturesUnordered, StreamExt};
use tokio::{sync::Semaphore, task::JoinHandle};
use tracing::warn;
use turbopath::{AbsoluteSystemPath, AbsoluteSystemPathBuf, AnchoredSystemPathBuf};
use turborepo_api_client::{APIAuth, APIClient};

use crate::{multiplexer::CacheMultiplexer, CacheError, CacheHitMetadata, CacheOpts};

const WARNING_CUTOFF: u8 = 4;

/// Wraps the multiplexer with a bounded worker pool for writes so slow
/// uploads never hold an execution slot, and single-flights operations per
/// cache key within this process.
pub struct AsyncCache {
    real_cache: Arc<CacheMultiplexer>,
    writer_sema: Arc<Semaphore>,
    writers: Mutex<FuturesUnordered<JoinHandle<()>>>,
    // duplicate requests for a key wait on the first one
    key_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl AsyncCache {
    pub fn new(
        opts: &CacheOpts,
        repo_root: &AbsoluteSystemPath,
        client: Option<APIClient>,
        api_auth: Option<APIAuth>,
    ) -> Result<AsyncCache, CacheError> {
        let max_workers = opts.workers.max(1) as usize;
        let real_cache = Arc::new(CacheMultiplexer::new(opts, repo_root, client, api_auth)?);

        Ok(AsyncCache {
            real_cache,
            writer_sema: Arc::new(Semaphore::new(max_workers)),
            writers: Mutex::new(FuturesUnordered::new()),
            key_locks: Mutex::new(HashMap::new()),
        })
    }

    fn key_lock(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.key_locks.lock().expect("key lock map poisoned");
        locks.entry(key.to_string()).or_default().clone()
    }

    /// Queues a cache write and returns immediately. Failed writes are
    /// warnings; the task that produced the outputs already succeeded.
    pub async fn put(
        &self,
        anchor: AbsoluteSystemPathBuf,
        key: String,
        files: Vec<AnchoredSystemPathBuf>,
        duration: u64,
    ) {
        let real_cache = self.real_cache.clone();
        let writer_sema = self.writer_sema.clone();
        let key_lock = self.key_lock(&key);
        let handle = tokio::spawn(async move {
            let _guard = key_lock.lock().await;
            let _permit = writer_sema
                .acquire()
                .await
                .expect("cache worker semaphore is never closed");
            if let Err(err) = real_cache.put(&anchor, &key, &files, duration).await {
                warn!("failed to cache {key}: {err}");
            }
        });
        self.writers
            .lock()
            .expect("cache writer set poisoned")
            .push(handle);
    }

    pub async fn fetch(
        &self,
        anchor: &AbsoluteSystemPath,
        key: &str,
    ) -> Result<Option<(CacheHitMetadata, Vec<AnchoredSystemPathBuf>)>, CacheError> {
        let key_lock = self.key_lock(key);
        let _guard = key_lock.lock().await;
        self.real_cache.fetch(anchor, key).await
    }

    pub async fn exists(&self, key: &str) -> Result<Option<CacheHitMetadata>, CacheError> {
        self.real_cache.exists(key).await
    }

    pub fn clean(&self, key: &str) -> Result<(), CacheError> {
        self.real_cache.clean(key)
    }

    pub fn clean_all(&self) -> Result<(), CacheError> {
        self.real_cache.clean_all()
    }

    /// Waits for queued writes to land. Called once at the end of a run;
    /// nags the user when a slow remote is holding up shutdown.
    pub async fn shutdown(&self) {
        let writers = {
            let mut writers = self.writers.lock().expect("cache writer set poisoned");
            std::mem::take(&mut *writers)
        };

        let mut warning_count = 0u8;
        let mut writers = writers;
        loop {
            tokio::select! {
                result = writers.next() => {
                    match result {
                        Some(_) => continue,
                        None => break,
                    }
                }
                _ = tokio::time::sleep(std::time::Duration::from_secs(5)) => {
                    if warning_count < WARNING_CUTOFF {
                        warning_count += 1;
                        warn!("still waiting on cache uploads...");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn test_put_is_asynchronous_and_drains_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let repo_root = AbsoluteSystemPathBuf::try_from(dir.path()).unwrap();
        let opts = CacheOpts {
            cache_dir: "cache".into(),
            workers: 2,
            ..Default::default()
        };
        let cache = AsyncCache::new(&opts, &repo_root, None, None).unwrap();

        repo_root
            .join_component("out.txt")
            .create_with_contents("contents")
            .unwrap();
        let files = vec![AnchoredSystemPathBuf::from_raw("out.txt").unwrap()];

        cache
            .put(repo_root.clone(), "key1".to_string(), files.clone(), 5)
            .await;
        cache.shutdown().await;

        let hit = cache.fetch(&repo_root, "key1").await.unwrap();
        assert!(hit.is_some());
    }

    #[tokio::test]
    async fn test_duplicate_puts_single_flight() {
        let dir = tempfile::tempdir().unwrap();
        let repo_root = AbsoluteSystemPathBuf::try_from(dir.path()).unwrap();
        let opts = CacheOpts {
            cache_dir: "cache".into(),
            workers: 4,
            ..Default::default()
        };
        let cache = AsyncCache::new(&opts, &repo_root, None, None).unwrap();

        repo_root
            .join_component("out.txt")
            .create_with_contents("contents")
            .unwrap();
        let files = vec![AnchoredSystemPathBuf::from_raw("out.txt").unwrap()];

        for _ in 0..4 {
            cache
                .put(repo_root.clone(), "same-key".to_string(), files.clone(), 5)
                .await;
        }
        cache.shutdown().await;
        assert!(cache.fetch(&repo_root, "same-key").await.unwrap().is_some());
    }
}
