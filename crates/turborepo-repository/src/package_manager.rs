use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use turbopath::{AbsoluteSystemPath, AbsoluteSystemPathBuf};
use turborepo_lockfiles::{
    BerryLockfile, BunLockfile, Lockfile, NpmLockfile, PnpmLockfile, Yarn1Lockfile,
};

use crate::package_json::PackageJson;

pub const WORKSPACE_IGNORES: &[&str] = &["**/node_modules/**", "**/.git/**"];

#[derive(Debug, Error)]
pub enum Error {
    #[error(
        "Could not determine package manager. Set the \"packageManager\" field in the root \
         package.json or add a lockfile."
    )]
    NoPackageManager,
    #[error("invalid packageManager field: {0}")]
    InvalidPackageManager(String),
    #[error("workspace glob {0} escapes the repository root")]
    WorkspaceOutsideRoot(String),
    #[error("{manager} requires workspaces to be defined in {file}")]
    MissingWorkspaces { manager: String, file: String },
    #[error("unable to read {path}: {err}")]
    Io {
        path: String,
        #[source]
        err: std::io::Error,
    },
    #[error("unable to parse {path}: {err}")]
    WorkspaceYaml {
        path: String,
        #[source]
        err: serde_yaml::Error,
    },
    #[error(transparent)]
    Lockfile(#[from] turborepo_lockfiles::Error),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PackageManager {
    Npm,
    Yarn,
    Berry,
    Pnpm,
    Bun,
}

impl fmt::Display for PackageManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PackageManager::Npm => write!(f, "npm"),
            PackageManager::Yarn => write!(f, "yarn"),
            PackageManager::Berry => write!(f, "berry"),
            PackageManager::Pnpm => write!(f, "pnpm"),
            PackageManager::Bun => write!(f, "bun"),
        }
    }
}

/// Globs that locate workspace package directories, with `!` exclusions
/// split out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceGlobs {
    pub inclusions: Vec<String>,
    pub exclusions: Vec<String>,
}

impl WorkspaceGlobs {
    pub fn new<S: Into<String>>(globs: Vec<S>) -> Result<Self, Error> {
        let mut inclusions = Vec::new();
        let mut exclusions: Vec<String> = WORKSPACE_IGNORES.iter().map(|s| s.to_string()).collect();
        for glob in globs {
            let glob: String = glob.into();
            if glob.starts_with("../") || glob.starts_with("..\\") {
                return Err(Error::WorkspaceOutsideRoot(glob));
            }
            if let Some(exclusion) = glob.strip_prefix('!') {
                exclusions.push(exclusion.to_string());
            } else {
                inclusions.push(glob);
            }
        }
        Ok(Self {
            inclusions,
            exclusions,
        })
    }
}

#[derive(Debug, Deserialize)]
struct PnpmWorkspace {
    packages: Vec<String>,
}

impl PackageManager {
    /// Resolves the package manager from the `packageManager` manifest field,
    /// falling back to lockfile sniffing.
    pub fn get_package_manager(
        repo_root: &AbsoluteSystemPath,
        pkg: &PackageJson,
    ) -> Result<Self, Error> {
        if let Some(manager) = Self::read_package_manager_field(pkg)? {
            return Ok(manager);
        }
        Self::detect_from_lockfiles(repo_root)
    }

    fn read_package_manager_field(pkg: &PackageJson) -> Result<Option<Self>, Error> {
        let Some(value) = &pkg.package_manager else {
            return Ok(None);
        };
        let (manager, version) = value
            .split_once('@')
            .ok_or_else(|| Error::InvalidPackageManager(value.clone()))?;
        let manager = match manager {
            "npm" => PackageManager::Npm,
            "pnpm" => PackageManager::Pnpm,
            "bun" => PackageManager::Bun,
            "yarn" => {
                // yarn 1 is "classic"; anything newer is berry
                let major = version
                    .split('.')
                    .next()
                    .and_then(|major| major.parse::<u32>().ok())
                    .ok_or_else(|| Error::InvalidPackageManager(value.clone()))?;
                if major > 1 {
                    PackageManager::Berry
                } else {
                    PackageManager::Yarn
                }
            }
            _ => return Err(Error::InvalidPackageManager(value.clone())),
        };
        Ok(Some(manager))
    }

    fn detect_from_lockfiles(repo_root: &AbsoluteSystemPath) -> Result<Self, Error> {
        for manager in [
            PackageManager::Pnpm,
            PackageManager::Npm,
            PackageManager::Bun,
            PackageManager::Yarn,
        ] {
            if manager.lockfile_path(repo_root).exists() {
                if manager == PackageManager::Yarn {
                    // yarn.lock is shared between classic and berry; berry
                    // lockfiles open with a __metadata block.
                    let contents = manager
                        .lockfile_path(repo_root)
                        .read_to_string()
                        .unwrap_or_default();
                    if contents.contains("__metadata") {
                        return Ok(PackageManager::Berry);
                    }
                }
                return Ok(manager);
            }
        }
        Err(Error::NoPackageManager)
    }

    pub fn lockfile_name(&self) -> &'static str {
        match self {
            PackageManager::Npm => "package-lock.json",
            PackageManager::Yarn | PackageManager::Berry => "yarn.lock",
            PackageManager::Pnpm => "pnpm-lock.yaml",
            PackageManager::Bun => "bun.lock",
        }
    }

    pub fn lockfile_path(&self, repo_root: &AbsoluteSystemPath) -> AbsoluteSystemPathBuf {
        repo_root.join_component(self.lockfile_name())
    }

    /// The separate config file workspace globs live in, when the manager
    /// uses one instead of the manifest.
    pub fn workspace_configuration_path(&self) -> Option<&'static str> {
        match self {
            PackageManager::Pnpm => Some("pnpm-workspace.yaml"),
            _ => None,
        }
    }

    pub fn get_workspace_globs(
        &self,
        repo_root: &AbsoluteSystemPath,
        root_package_json: &PackageJson,
    ) -> Result<WorkspaceGlobs, Error> {
        match self.workspace_configuration_path() {
            Some(config_file) => {
                let path = repo_root.join_component(config_file);
                let contents = path.read_to_string().map_err(|err| Error::Io {
                    path: path.to_string(),
                    err,
                })?;
                let config: PnpmWorkspace =
                    serde_yaml::from_str(&contents).map_err(|err| Error::WorkspaceYaml {
                        path: path.to_string(),
                        err,
                    })?;
                WorkspaceGlobs::new(config.packages)
            }
            None => {
                let globs = root_package_json
                    .workspaces
                    .as_ref()
                    .map(|workspaces| workspaces.as_ref().to_vec())
                    .ok_or_else(|| Error::MissingWorkspaces {
                        manager: self.to_string(),
                        file: "package.json#workspaces".to_string(),
                    })?;
                WorkspaceGlobs::new(globs)
            }
        }
    }

    pub fn read_lockfile(
        &self,
        repo_root: &AbsoluteSystemPath,
    ) -> Result<Box<dyn Lockfile>, Error> {
        let path = self.lockfile_path(repo_root);
        let contents = path.read().map_err(|err| Error::Io {
            path: path.to_string(),
            err,
        })?;
        self.parse_lockfile(&contents)
    }

    pub fn parse_lockfile(&self, contents: &[u8]) -> Result<Box<dyn Lockfile>, Error> {
        Ok(match self {
            PackageManager::Npm => Box::new(NpmLockfile::load(contents)?),
            PackageManager::Yarn => Box::new(Yarn1Lockfile::from_bytes(contents)?),
            PackageManager::Berry => Box::new(BerryLockfile::load(contents)?),
            PackageManager::Pnpm => Box::new(PnpmLockfile::from_bytes(contents)?),
            PackageManager::Bun => Box::new(BunLockfile::from_bytes(contents)?),
        })
    }

    /// The lockfile key for a workspace directory. npm keys the root
    /// workspace as "", pnpm as ".".
    pub fn workspace_lockfile_key(&self, package_path: &str) -> String {
        match self {
            PackageManager::Pnpm if package_path.is_empty() => ".".to_string(),
            _ => package_path.to_string(),
        }
    }
}
