//! HTTP client for the remote cache artifact protocol.
//!
//! Artifacts are addressed by hash under `/v8/artifacts/{hash}`; requests
//! carry a bearer token and optionally a team. Server-side caching policy
//! states (disabled, over limit, paused) surface as distinct errors so the
//! cache layer can decide whether to keep the remote tier alive.

#![feature(error_generic_member_access)]
#![deny(clippy::all)]

use std::{backtrace::Backtrace, time::Duration};

use lazy_static::lazy_static;
use regex::Regex;
pub use reqwest::Response;
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use url::Url;

mod error;
mod retry;

pub use error::{Error, Result};

lazy_static! {
    static ref AUTHORIZATION_REGEX: Regex =
        Regex::new(r"(?i)(?:^|,) *authorization *(?:,|$)").unwrap();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CachingStatus {
    Disabled,
    Enabled,
    OverLimit,
    Paused,
}

#[derive(Debug, Deserialize)]
pub struct CachingStatusResponse {
    pub status: CachingStatus,
}

#[derive(Debug, Deserialize)]
struct APIError {
    code: String,
    message: String,
}

#[derive(Debug, Clone)]
pub struct APIAuth {
    pub team_id: Option<String>,
    pub token: String,
    pub team_slug: Option<String>,
}

impl APIAuth {
    pub fn is_linked(&self) -> bool {
        self.team_id.is_some() || self.team_slug.is_some()
    }
}

/// Where a preflight told us to send the real request.
#[derive(Debug)]
struct PreflightResponse {
    location: Url,
    allow_authorization_header: bool,
}

#[derive(Clone)]
pub struct APIClient {
    client: reqwest::Client,
    base_url: String,
    user_agent: String,
    use_preflight: bool,
}

impl APIClient {
    pub fn new(
        base_url: impl AsRef<str>,
        timeout: Option<Duration>,
        version: &str,
        use_preflight: bool,
    ) -> Result<Self> {
        let client_build = match timeout {
            Some(timeout) => reqwest::Client::builder().timeout(timeout).build(),
            None => reqwest::Client::builder().build(),
        };
        let client = client_build.map_err(Error::ReqwestError)?;

        Ok(APIClient {
            client,
            base_url: base_url.as_ref().to_string(),
            user_agent: format!("turbo {version} {} {}", std::env::consts::OS, std::env::consts::ARCH),
            use_preflight,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn make_url(&self, endpoint: &str) -> Result<Url> {
        let url = format!("{}{}", self.base_url, endpoint);
        Url::parse(&url).map_err(|err| Error::InvalidUrl { url, err })
    }

    fn artifact_url(&self, hash: &str, team_id: Option<&str>, team_slug: Option<&str>) -> Result<Url> {
        let mut url = self.make_url(&format!("/v8/artifacts/{hash}"))?;
        if let Some(team_id) = team_id {
            url.query_pairs_mut().append_pair("teamId", team_id);
        }
        if let Some(team_slug) = team_slug {
            url.query_pairs_mut().append_pair("slug", team_slug);
        }
        Ok(url)
    }

    /// OPTIONS probe before the real request. The response may redirect us
    /// and may forbid the Authorization header.
    async fn do_preflight(
        &self,
        token: &str,
        request_url: Url,
        request_method: &str,
        request_headers: &str,
    ) -> Result<PreflightResponse> {
        let request_builder = self
            .client
            .request(Method::OPTIONS, request_url.clone())
            .header("User-Agent", self.user_agent.clone())
            .header("Access-Control-Request-Method", request_method)
            .header("Access-Control-Request-Headers", request_headers)
            .header("Authorization", format!("Bearer {token}"));

        let response = retry::make_retryable_request(request_builder).await?;

        let headers = response.headers();
        let location = if let Some(location) = headers.get("Location") {
            let location = location.to_str().unwrap_or_default();
            match Url::parse(location) {
                Ok(location) => location,
                Err(url::ParseError::RelativeUrlWithoutBase) => {
                    request_url.join(location).map_err(|err| Error::InvalidUrl {
                        url: location.to_string(),
                        err,
                    })?
                }
                Err(err) => {
                    return Err(Error::InvalidUrl {
                        url: location.to_string(),
                        err,
                    })
                }
            }
        } else {
            request_url
        };

        let allow_auth = headers
            .get("Access-Control-Allow-Headers")
            .map_or(false, |h| {
                AUTHORIZATION_REGEX.is_match(h.to_str().unwrap_or_default())
            });

        Ok(PreflightResponse {
            location,
            allow_authorization_header: allow_auth,
        })
    }

    async fn get_artifact(
        &self,
        hash: &str,
        token: &str,
        team_id: Option<&str>,
        team_slug: Option<&str>,
        method: Method,
    ) -> Result<Option<Response>> {
        let mut request_url = self.artifact_url(hash, team_id, team_slug)?;
        let mut allow_auth = true;

        if self.use_preflight {
            let method_name = method.as_str().to_owned();
            let preflight = self
                .do_preflight(token, request_url, &method_name, "Authorization, User-Agent")
                .await?;
            allow_auth = preflight.allow_authorization_header;
            request_url = preflight.location;
        }

        let mut request_builder = self
            .client
            .request(method, request_url)
            .header("User-Agent", self.user_agent.clone());
        if allow_auth {
            request_builder = request_builder.header("Authorization", format!("Bearer {token}"));
        }

        let response = retry::make_retryable_request(request_builder).await?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            StatusCode::FORBIDDEN => Err(Self::handle_403(response).await),
            _ => Ok(Some(response.error_for_status()?)),
        }
    }

    /// GET an artifact. `None` is a miss.
    pub async fn fetch_artifact(
        &self,
        hash: &str,
        token: &str,
        team_id: Option<&str>,
        team_slug: Option<&str>,
    ) -> Result<Option<Response>> {
        self.get_artifact(hash, token, team_id, team_slug, Method::GET)
            .await
    }

    /// HEAD probe for an artifact's existence.
    pub async fn artifact_exists(
        &self,
        hash: &str,
        token: &str,
        team_id: Option<&str>,
        team_slug: Option<&str>,
    ) -> Result<Option<Response>> {
        self.get_artifact(hash, token, team_id, team_slug, Method::HEAD)
            .await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn put_artifact(
        &self,
        hash: &str,
        artifact_body: Vec<u8>,
        duration_ms: u64,
        tag: Option<&str>,
        token: &str,
        team_id: Option<&str>,
        team_slug: Option<&str>,
    ) -> Result<()> {
        let mut request_url = self.artifact_url(hash, team_id, team_slug)?;
        request_url
            .query_pairs_mut()
            .append_pair("duration", &duration_ms.to_string());
        let mut allow_auth = true;

        if self.use_preflight {
            let preflight = self
                .do_preflight(
                    token,
                    request_url,
                    "PUT",
                    "Authorization, Content-Type, User-Agent, x-artifact-duration, x-artifact-tag",
                )
                .await?;
            allow_auth = preflight.allow_authorization_header;
            request_url = preflight.location;
        }

        let mut request_builder = self
            .client
            .put(request_url)
            .header("Content-Type", "application/octet-stream")
            .header("x-artifact-duration", duration_ms.to_string())
            .header("User-Agent", self.user_agent.clone());
        if allow_auth {
            request_builder = request_builder.header("Authorization", format!("Bearer {token}"));
        }
        if let Some(tag) = tag {
            request_builder = request_builder.header("x-artifact-tag", tag);
        }
        request_builder = request_builder.body(artifact_body);

        let response = retry::make_retryable_request(request_builder).await?;
        if response.status() == StatusCode::FORBIDDEN {
            return Err(Self::handle_403(response).await);
        }
        // 202 Accepted on success
        response.error_for_status()?;
        Ok(())
    }

    pub async fn get_caching_status(
        &self,
        token: &str,
        team_id: Option<&str>,
        team_slug: Option<&str>,
    ) -> Result<CachingStatusResponse> {
        let mut url = self.make_url("/v8/artifacts/status")?;
        if let Some(team_id) = team_id {
            url.query_pairs_mut().append_pair("teamId", team_id);
        }
        if let Some(team_slug) = team_slug {
            url.query_pairs_mut().append_pair("slug", team_slug);
        }
        let request_builder = self
            .client
            .get(url)
            .header("User-Agent", self.user_agent.clone())
            .header("Authorization", format!("Bearer {token}"));

        let response = retry::make_retryable_request(request_builder)
            .await?
            .error_for_status()?;

        let text = response.text().await?;
        serde_json::from_str(&text).map_err(|err| Error::InvalidJson { err, text })
    }

    /// 403s carry a JSON body whose error code distinguishes policy states
    /// from plain authorization failures.
    async fn handle_403(response: Response) -> Error {
        #[derive(Deserialize)]
        struct WrappedAPIError {
            error: APIError,
        }
        let body = match response.text().await {
            Ok(body) => body,
            Err(e) => return Error::ReqwestError(e),
        };

        let WrappedAPIError { error: api_error } = match serde_json::from_str(&body) {
            Ok(api_error) => api_error,
            Err(err) => return Error::InvalidJson { err, text: body },
        };

        if let Some(status_string) = api_error.code.strip_prefix("remote_caching_") {
            let status = match status_string {
                "disabled" => CachingStatus::Disabled,
                "enabled" => CachingStatus::Enabled,
                "over_limit" => CachingStatus::OverLimit,
                "paused" => CachingStatus::Paused,
                _ => return Error::UnknownCachingStatus(status_string.to_string(), Backtrace::capture()),
            };
            Error::CacheDisabled {
                status,
                message: api_error.message,
            }
        } else {
            Error::UnknownStatus {
                code: api_error.code,
                message: api_error.message,
                backtrace: Backtrace::capture(),
            }
        }
    }
}

impl std::fmt::Debug for APIClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("APIClient")
            .field("base_url", &self.base_url)
            .field("use_preflight", &self.use_preflight)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_authorization_regex() {
        assert!(AUTHORIZATION_REGEX.is_match("Authorization"));
        assert!(AUTHORIZATION_REGEX.is_match("User-Agent, authorization"));
        assert!(AUTHORIZATION_REGEX.is_match("authorization, Content-Type"));
        assert!(!AUTHORIZATION_REGEX.is_match("User-Agent"));
        assert!(!AUTHORIZATION_REGEX.is_match("proxy-authorization"));
    }

    #[test]
    fn test_artifact_url_carries_team() {
        let client = APIClient::new("https://cache.example.com", None, "2.0.0", false).unwrap();
        let url = client
            .artifact_url("deadbeef", Some("team_123"), None)
            .unwrap();
        assert_eq!(
            url.as_str(),
            "https://cache.example.com/v8/artifacts/deadbeef?teamId=team_123"
        );
    }
}
