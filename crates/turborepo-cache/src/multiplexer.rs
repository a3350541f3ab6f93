use std::sync::atomic::{AtomicBool, Ordering};

use camino::Utf8Path;
use tracing::{debug, warn};
use turbopath::{AbsoluteSystemPath, AnchoredSystemPathBuf};
use turborepo_api_client::{APIAuth, APIClient};

use crate::{fs::FSCache, http::HTTPCache, CacheError, CacheHitMetadata, CacheOpts};

/// Composes the filesystem and HTTP tiers. Reads probe local first and
/// backfill it on a remote hit; writes go to every configured tier, and only
/// fail when all of them do. A server-side "caching disabled" signal turns
/// the remote tier off for the rest of the run.
pub struct CacheMultiplexer {
    // keep the tier but stop using it once the server says no
    should_use_http_cache: AtomicBool,
    remote_cache_read_only: bool,
    fs: Option<FSCache>,
    http: Option<HTTPCache>,
}

impl CacheMultiplexer {
    pub fn new(
        opts: &CacheOpts,
        repo_root: &AbsoluteSystemPath,
        client: Option<APIClient>,
        api_auth: Option<APIAuth>,
    ) -> Result<Self, CacheError> {
        let use_fs_cache = !opts.skip_filesystem;
        let use_http_cache = !opts.skip_remote;

        // The flags are not mutually exclusive, so it is possible to
        // configure yourself out of having a cache entirely.
        if !use_fs_cache && !use_http_cache {
            return Err(CacheError::NoCachesEnabled);
        }

        let fs_cache = use_fs_cache
            .then(|| FSCache::new(Utf8Path::new(opts.cache_dir.as_str()), repo_root))
            .transpose()?;

        let http_cache = match (use_http_cache, client, api_auth) {
            (true, Some(client), Some(api_auth)) => Some(HTTPCache::new(
                client,
                opts,
                repo_root.to_owned(),
                api_auth,
            )),
            (true, _, _) => {
                debug!("remote caching is unavailable without credentials");
                None
            }
            _ => None,
        };

        Ok(CacheMultiplexer {
            should_use_http_cache: AtomicBool::new(true),
            remote_cache_read_only: opts.remote_cache_read_only,
            fs: fs_cache,
            http: http_cache,
        })
    }

    fn http(&self) -> Option<&HTTPCache> {
        self.should_use_http_cache
            .load(Ordering::Relaxed)
            .then_some(self.http.as_ref())
            .flatten()
    }

    /// Disables the remote tier when the server reports caching policy
    /// errors, so we stop paying for doomed requests.
    fn handle_http_error(&self, err: &CacheError) {
        if matches!(
            err,
            CacheError::ApiClientError(
                box_err,
                ..
            ) if matches!(**box_err, turborepo_api_client::Error::CacheDisabled { .. })
        ) {
            warn!("remote caching is disabled, skipping remote cache for the rest of this run");
            self.should_use_http_cache.store(false, Ordering::Relaxed);
        }
    }

    pub async fn put(
        &self,
        anchor: &AbsoluteSystemPath,
        key: &str,
        files: &[AnchoredSystemPathBuf],
        duration: u64,
    ) -> Result<(), CacheError> {
        let mut errors = Vec::new();
        let mut any_succeeded = false;

        if let Some(fs) = &self.fs {
            match fs.put(anchor, key, files, duration) {
                Ok(()) => any_succeeded = true,
                Err(e) => errors.push(e),
            }
        }

        if let Some(http) = self.http() {
            if self.remote_cache_read_only {
                debug!("remote cache is read-only, skipping upload of {key}");
            } else {
                match http.put(anchor, key, files, duration).await {
                    Ok(()) => any_succeeded = true,
                    Err(e) => {
                        self.handle_http_error(&e);
                        errors.push(e);
                    }
                }
            }
        }

        match (any_succeeded, errors.into_iter().next()) {
            // partial failure is a warning, not an error
            (true, Some(err)) => {
                warn!("failed to write to one cache tier: {err}");
                Ok(())
            }
            (_, None) => Ok(()),
            (false, Some(err)) => Err(err),
        }
    }

    pub async fn fetch(
        &self,
        anchor: &AbsoluteSystemPath,
        key: &str,
    ) -> Result<Option<(CacheHitMetadata, Vec<AnchoredSystemPathBuf>)>, CacheError> {
        if let Some(fs) = &self.fs {
            match fs.fetch(anchor, key) {
                Ok(Some(hit)) => return Ok(Some(hit)),
                Ok(None) => {}
                // a failed local read is a miss, not a failure
                Err(e) => debug!("local cache read failed for {key}: {e}"),
            }
        }

        if let Some(http) = self.http() {
            match http.fetch(key).await {
                Ok(Some((metadata, files))) => {
                    // Backfill the local tier so the next fetch is cheap.
                    // Failures here cost nothing but the speedup.
                    if let Some(fs) = &self.fs {
                        if let Err(e) = fs.put(anchor, key, &files, metadata.time_saved) {
                            warn!("failed to backfill local cache for {key}: {e}");
                        }
                    }
                    return Ok(Some((metadata, files)));
                }
                Ok(None) => {}
                Err(e) => {
                    self.handle_http_error(&e);
                    debug!("remote cache read failed for {key}: {e}");
                }
            }
        }

        Ok(None)
    }

    /// Removes a local entry. The remote tier has no delete surface; its
    /// entries age out server-side.
    pub fn clean(&self, key: &str) -> Result<(), CacheError> {
        match &self.fs {
            Some(fs) => fs.clean(key),
            None => Ok(()),
        }
    }

    pub fn clean_all(&self) -> Result<(), CacheError> {
        match &self.fs {
            Some(fs) => fs.clean_all(),
            None => Ok(()),
        }
    }

    pub async fn exists(&self, key: &str) -> Result<Option<CacheHitMetadata>, CacheError> {
        if let Some(fs) = &self.fs {
            if let Ok(Some(hit)) = fs.exists(key) {
                return Ok(Some(hit));
            }
        }
        if let Some(http) = self.http() {
            match http.exists(key).await {
                Ok(Some(hit)) => return Ok(Some(hit)),
                Ok(None) => {}
                Err(e) => {
                    self.handle_http_error(&e);
                    debug!("remote cache probe failed for {key}: {e}");
                }
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod test {
    use turbopath::AbsoluteSystemPathBuf;

    use super::*;

    #[test]
    fn test_no_caches_enabled_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let repo_root = AbsoluteSystemPathBuf::try_from(dir.path()).unwrap();
        let opts = CacheOpts {
            skip_filesystem: true,
            skip_remote: true,
            ..Default::default()
        };
        assert!(matches!(
            CacheMultiplexer::new(&opts, &repo_root, None, None),
            Err(CacheError::NoCachesEnabled)
        ));
    }

    #[tokio::test]
    async fn test_fs_only_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let repo_root = AbsoluteSystemPathBuf::try_from(dir.path()).unwrap();
        let opts = CacheOpts {
            cache_dir: "cache".into(),
            ..Default::default()
        };
        let cache = CacheMultiplexer::new(&opts, &repo_root, None, None).unwrap();

        repo_root
            .join_component("out.txt")
            .create_with_contents("hello")
            .unwrap();
        let files = vec![AnchoredSystemPathBuf::from_raw("out.txt").unwrap()];

        assert!(cache.fetch(&repo_root, "abc").await.unwrap().is_none());
        cache.put(&repo_root, "abc", &files, 10).await.unwrap();
        let (metadata, restored) = cache.fetch(&repo_root, "abc").await.unwrap().unwrap();
        assert_eq!(metadata.time_saved, 10);
        assert_eq!(restored, files);
    }
}
