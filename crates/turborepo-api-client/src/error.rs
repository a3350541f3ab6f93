use std::backtrace::Backtrace;

use thiserror::Error;

use crate::CachingStatus;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to make request: {0}")]
    ReqwestError(#[from] reqwest::Error),
    #[error("invalid url {url}: {err}")]
    InvalidUrl {
        url: String,
        #[source]
        err: url::ParseError,
    },
    #[error("unable to parse response as json: {text}")]
    InvalidJson {
        #[source]
        err: serde_json::Error,
        text: String,
    },
    #[error("{message}")]
    CacheDisabled {
        status: CachingStatus,
        message: String,
    },
    #[error("unknown caching status: {0}")]
    UnknownCachingStatus(String, #[backtrace] Backtrace),
    #[error("unknown status {code}: {message}")]
    UnknownStatus {
        code: String,
        message: String,
        #[backtrace]
        backtrace: Backtrace,
    },
}

pub type Result<T> = std::result::Result<T, Error>;
