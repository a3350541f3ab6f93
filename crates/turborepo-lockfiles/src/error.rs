use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("error parsing lockfile: {0}")]
    Json(#[from] serde_json::Error),
    #[error("error parsing lockfile: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("error parsing bun.lock: {message}")]
    BunParse { message: String },
    #[error("error parsing yarn.lock on line {line}: {message}")]
    Yarn1Parse { line: usize, message: String },
    #[error("unsupported npm lockfile version, only v2 and v3 are supported")]
    UnsupportedNpmVersion,
    #[error("unsupported lockfile version: {0}")]
    UnsupportedVersion(String),
    #[error("no lockfile entry found for workspace '{0}'")]
    MissingWorkspace(String),
    #[error("no lockfile entry found for '{0}'")]
    MissingPackage(String),
    #[error("lockfile entry '{0}' has no version")]
    MissingVersion(String),
}
