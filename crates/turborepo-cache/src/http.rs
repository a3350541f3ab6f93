use std::backtrace::Backtrace;

use tracing::debug;
use turbopath::{AbsoluteSystemPath, AbsoluteSystemPathBuf, AnchoredSystemPathBuf};
use turborepo_api_client::{APIAuth, APIClient};

use crate::{
    cache_archive::{CacheReader, CacheWriter},
    signature_authentication::ArtifactSignatureAuthenticator,
    CacheError, CacheHitMetadata, CacheOpts, CacheSource,
};

/// The remote cache tier. Artifacts travel as uncompressed tarballs; the
/// server records the original task duration in `x-artifact-duration`.
pub struct HTTPCache {
    client: APIClient,
    signer_verifier: Option<ArtifactSignatureAuthenticator>,
    repo_root: AbsoluteSystemPathBuf,
    api_auth: APIAuth,
}

impl HTTPCache {
    pub fn new(
        client: APIClient,
        opts: &CacheOpts,
        repo_root: AbsoluteSystemPathBuf,
        api_auth: APIAuth,
    ) -> HTTPCache {
        let signer_verifier = opts
            .remote_cache_opts
            .as_ref()
            .filter(|remote_cache_opts| remote_cache_opts.signature)
            .map(|_| {
                ArtifactSignatureAuthenticator::new(
                    api_auth
                        .team_id
                        .as_deref()
                        .unwrap_or_default()
                        .as_bytes()
                        .to_vec(),
                    None,
                )
            });

        HTTPCache {
            client,
            signer_verifier,
            repo_root,
            api_auth,
        }
    }

    #[tracing::instrument(skip_all, fields(hash = hash))]
    pub async fn put(
        &self,
        anchor: &AbsoluteSystemPath,
        hash: &str,
        files: &[AnchoredSystemPathBuf],
        duration: u64,
    ) -> Result<(), CacheError> {
        let mut artifact_body = Vec::new();
        {
            let mut cache_archive = CacheWriter::from_writer(&mut artifact_body, false)?;
            for file in files {
                cache_archive.add_file(anchor, file)?;
            }
            cache_archive.finish()?;
        }

        let tag = self
            .signer_verifier
            .as_ref()
            .map(|signer| signer.generate_tag(hash.as_bytes(), &artifact_body))
            .transpose()?;

        debug!("uploading {hash} ({} bytes)", artifact_body.len());
        self.client
            .put_artifact(
                hash,
                artifact_body,
                duration,
                tag.as_deref(),
                &self.api_auth.token,
                self.api_auth.team_id.as_deref(),
                self.api_auth.team_slug.as_deref(),
            )
            .await?;
        debug!("uploaded {hash}");
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(hash = hash))]
    pub async fn exists(&self, hash: &str) -> Result<Option<CacheHitMetadata>, CacheError> {
        let Some(response) = self
            .client
            .artifact_exists(
                hash,
                &self.api_auth.token,
                self.api_auth.team_id.as_deref(),
                self.api_auth.team_slug.as_deref(),
            )
            .await?
        else {
            return Ok(None);
        };

        let duration = Self::get_duration_from_response(&response)?;
        Ok(Some(CacheHitMetadata {
            source: CacheSource::Remote,
            time_saved: duration,
        }))
    }

    #[tracing::instrument(skip_all, fields(hash = hash))]
    pub async fn fetch(
        &self,
        hash: &str,
    ) -> Result<Option<(CacheHitMetadata, Vec<AnchoredSystemPathBuf>)>, CacheError> {
        let Some(response) = self
            .client
            .fetch_artifact(
                hash,
                &self.api_auth.token,
                self.api_auth.team_id.as_deref(),
                self.api_auth.team_slug.as_deref(),
            )
            .await?
        else {
            debug!("remote cache miss for {hash}");
            return Ok(None);
        };

        let duration = Self::get_duration_from_response(&response)?;

        let expected_tag = response
            .headers()
            .get("x-artifact-tag")
            .map(|tag| {
                tag.to_str()
                    .map(|s| s.to_string())
                    .map_err(|_| CacheError::InvalidTag(Backtrace::capture()))
            })
            .transpose()?;

        let body = response
            .bytes()
            .await
            .map_err(|e| CacheError::from(turborepo_api_client::Error::ReqwestError(e)))?;

        if let Some(signer_verifier) = &self.signer_verifier {
            let expected_tag =
                expected_tag.ok_or_else(|| CacheError::ArtifactTagMissing(Backtrace::capture()))?;
            if !signer_verifier.validate(hash.as_bytes(), &body, &expected_tag)? {
                return Err(CacheError::InvalidTag(Backtrace::capture()));
            }
        }

        let files = Self::restore_tar(&self.repo_root, &body)?;
        debug!("remote cache hit for {hash}");

        Ok(Some((
            CacheHitMetadata {
                source: CacheSource::Remote,
                time_saved: duration,
            },
            files,
        )))
    }

    fn get_duration_from_response(
        response: &turborepo_api_client::Response,
    ) -> Result<u64, CacheError> {
        let Some(duration_value) = response.headers().get("x-artifact-duration") else {
            return Ok(0);
        };
        duration_value
            .to_str()
            .ok()
            .and_then(|duration| duration.parse::<u64>().ok())
            .ok_or_else(|| CacheError::InvalidDuration(Backtrace::capture()))
    }

    pub(crate) fn restore_tar(
        root: &AbsoluteSystemPath,
        body: &[u8],
    ) -> Result<Vec<AnchoredSystemPathBuf>, CacheError> {
        let mut cache_reader = CacheReader::from_reader(body, false)?;
        cache_reader.restore(root)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_restore_tar_round_trip() -> anyhow::Result<()> {
        let input_dir = tempfile::tempdir()?;
        let input = AbsoluteSystemPathBuf::try_from(input_dir.path())?;
        input
            .join_component("artifact.txt")
            .create_with_contents("remote bytes")?;

        let mut body = Vec::new();
        {
            let mut writer = CacheWriter::from_writer(&mut body, false)?;
            writer.add_file(&input, &AnchoredSystemPathBuf::from_raw("artifact.txt")?)?;
            writer.finish()?;
        }

        let output_dir = tempfile::tempdir()?;
        let output = AbsoluteSystemPathBuf::try_from(output_dir.path())?;
        let files = HTTPCache::restore_tar(&output, &body)?;
        assert_eq!(files.len(), 1);
        assert_eq!(
            output.join_component("artifact.txt").read_to_string()?,
            "remote bytes"
        );
        Ok(())
    }
}
