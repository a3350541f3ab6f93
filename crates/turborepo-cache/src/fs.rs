use std::backtrace::Backtrace;

use camino::Utf8Path;
use serde::{Deserialize, Serialize};
use tracing::debug;
use turbopath::{AbsoluteSystemPath, AbsoluteSystemPathBuf, AnchoredSystemPathBuf};

use crate::{
    cache_archive::{CacheReader, CacheWriter},
    CacheError, CacheHitMetadata, CacheSource,
};

/// The local content-addressed cache: one `<hash>.tar.zst` per entry plus a
/// `<hash>-meta.json` sidecar.
pub struct FSCache {
    cache_directory: AbsoluteSystemPathBuf,
}

#[derive(Debug, Deserialize, Serialize)]
struct CacheMetadata {
    hash: String,
    duration: u64,
}

impl CacheMetadata {
    fn read(path: &AbsoluteSystemPath) -> Result<CacheMetadata, CacheError> {
        serde_json::from_str(&path.read_to_string()?)
            .map_err(|e| CacheError::InvalidMetadata(e, Backtrace::capture()))
    }
}

impl FSCache {
    pub fn new(cache_dir: &Utf8Path, repo_root: &AbsoluteSystemPath) -> Result<Self, CacheError> {
        let cache_directory = AbsoluteSystemPathBuf::from_unknown(repo_root, cache_dir);
        cache_directory.create_dir_all()?;
        Ok(FSCache { cache_directory })
    }

    fn archive_path(&self, hash: &str) -> AbsoluteSystemPathBuf {
        self.cache_directory.join_component(&format!("{hash}.tar.zst"))
    }

    fn metadata_path(&self, hash: &str) -> AbsoluteSystemPathBuf {
        self.cache_directory.join_component(&format!("{hash}-meta.json"))
    }

    #[tracing::instrument(skip_all, fields(hash = hash))]
    pub fn fetch(
        &self,
        anchor: &AbsoluteSystemPath,
        hash: &str,
    ) -> Result<Option<(CacheHitMetadata, Vec<AnchoredSystemPathBuf>)>, CacheError> {
        // Support uncompressed archives for entries written by hand or by
        // older versions.
        let uncompressed_cache_path = self.cache_directory.join_component(&format!("{hash}.tar"));
        let compressed_cache_path = self.archive_path(hash);

        let cache_path = if compressed_cache_path.exists() {
            compressed_cache_path
        } else if uncompressed_cache_path.exists() {
            uncompressed_cache_path
        } else {
            debug!("local cache miss for {hash}");
            return Ok(None);
        };

        let mut cache_reader = CacheReader::open(&cache_path)?;
        let restored_files = cache_reader.restore(anchor)?;

        let meta = CacheMetadata::read(&self.metadata_path(hash))?;
        debug!("local cache hit for {hash}");

        Ok(Some((
            CacheHitMetadata {
                source: CacheSource::Local,
                time_saved: meta.duration,
            },
            restored_files,
        )))
    }

    pub fn exists(&self, hash: &str) -> Result<Option<CacheHitMetadata>, CacheError> {
        if !self.archive_path(hash).exists()
            && !self
                .cache_directory
                .join_component(&format!("{hash}.tar"))
                .exists()
        {
            return Ok(None);
        }

        let duration = CacheMetadata::read(&self.metadata_path(hash))
            .map(|meta| meta.duration)
            .unwrap_or(0);

        Ok(Some(CacheHitMetadata {
            source: CacheSource::Local,
            time_saved: duration,
        }))
    }

    /// Drops a single entry.
    pub fn clean(&self, hash: &str) -> Result<(), CacheError> {
        for path in [
            self.archive_path(hash),
            self.cache_directory.join_component(&format!("{hash}.tar")),
            self.metadata_path(hash),
        ] {
            match path.remove_file() {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Drops every entry in the cache directory.
    pub fn clean_all(&self) -> Result<(), CacheError> {
        match self.cache_directory.remove_dir_all() {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.cache_directory.create_dir_all()?;
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(hash = hash))]
    pub fn put(
        &self,
        anchor: &AbsoluteSystemPath,
        hash: &str,
        files: &[AnchoredSystemPathBuf],
        duration: u64,
    ) -> Result<(), CacheError> {
        let cache_path = self.archive_path(hash);

        let mut cache_item = CacheWriter::create(&cache_path)?;
        for file in files {
            cache_item.add_file(anchor, file)?;
        }
        // atomic rename happens here
        cache_item.finish()?;

        let meta = CacheMetadata {
            hash: hash.to_string(),
            duration,
        };
        let meta_json = serde_json::to_string(&meta)
            .map_err(|e| CacheError::InvalidMetadata(e, Backtrace::capture()))?;

        // Same write-to-temp-then-rename dance for the sidecar.
        let temp_metadata_path = self
            .cache_directory
            .join_component(&format!(".{hash}-meta.json.{}.tmp", std::process::id()));
        temp_metadata_path.create_with_contents(&meta_json)?;
        temp_metadata_path.rename(&self.metadata_path(hash))?;

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use anyhow::Result;
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn test_round_trip() -> Result<()> {
        let repo_root = tempdir()?;
        let repo_root_path = AbsoluteSystemPath::from_std_path(repo_root.path())?;
        let cache = FSCache::new(Utf8Path::new("cache"), repo_root_path)?;

        repo_root_path
            .join_component("out.txt")
            .create_with_contents("output contents")?;
        let files = vec![AnchoredSystemPathBuf::from_raw("out.txt")?];

        assert!(cache.fetch(repo_root_path, "deadbeef")?.is_none());
        cache.put(repo_root_path, "deadbeef", &files, 42)?;

        // remove the original so the fetch provably restores it
        repo_root_path.join_component("out.txt").remove_file()?;

        let (metadata, restored) = cache.fetch(repo_root_path, "deadbeef")?.unwrap();
        assert_eq!(
            metadata,
            CacheHitMetadata {
                source: CacheSource::Local,
                time_saved: 42
            }
        );
        assert_eq!(restored, files);
        assert_eq!(
            repo_root_path.join_component("out.txt").read_to_string()?,
            "output contents"
        );
        Ok(())
    }

    #[test]
    fn test_exists_reads_sidecar() -> Result<()> {
        let repo_root = tempdir()?;
        let repo_root_path = AbsoluteSystemPath::from_std_path(repo_root.path())?;
        let cache = FSCache::new(Utf8Path::new("cache"), repo_root_path)?;

        assert_eq!(cache.exists("cafe")?, None);

        repo_root_path
            .join_component("out.txt")
            .create_with_contents("x")?;
        cache.put(
            repo_root_path,
            "cafe",
            &[AnchoredSystemPathBuf::from_raw("out.txt")?],
            7,
        )?;
        assert_eq!(
            cache.exists("cafe")?,
            Some(CacheHitMetadata {
                source: CacheSource::Local,
                time_saved: 7
            })
        );
        Ok(())
    }

    #[test]
    fn test_no_partial_archives_visible() -> Result<()> {
        let repo_root = tempdir()?;
        let repo_root_path = AbsoluteSystemPath::from_std_path(repo_root.path())?;
        let cache = FSCache::new(Utf8Path::new("cache"), repo_root_path)?;

        repo_root_path
            .join_component("out.txt")
            .create_with_contents("x")?;
        cache.put(
            repo_root_path,
            "beef",
            &[AnchoredSystemPathBuf::from_raw("out.txt")?],
            1,
        )?;

        let temp_files: Vec<_> = std::fs::read_dir(
            repo_root_path.join_component("cache").as_std_path(),
        )?
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
        .collect();
        assert!(temp_files.is_empty(), "{temp_files:?}");
        Ok(())
    }
}
