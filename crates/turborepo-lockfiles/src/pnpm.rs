use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use turbopath::RelativeUnixPathBuf;

use crate::{Error, Lockfile, Package};

type Map<K, V> = std::collections::BTreeMap<K, V>;

/// pnpm-lock.yaml. Workspace manifests live under `importers`, external
/// packages under `packages` keyed by a dep path whose shape depends on the
/// lockfile version: `/name/version` (v5), `/name@version` (v6/v7),
/// `name@version` (v9, with dependency edges under `snapshots`).
#[derive(Debug, Serialize, Deserialize)]
pub struct PnpmLockfile {
    #[serde(rename = "lockfileVersion")]
    lockfile_version: serde_yaml::Value,
    #[serde(default)]
    importers: Map<String, Importer>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    packages: Map<String, PackageEntry>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    snapshots: Map<String, PackageEntry>,
    #[serde(
        rename = "patchedDependencies",
        default,
        skip_serializing_if = "Map::is_empty"
    )]
    patched_dependencies: Map<String, PatchEntry>,
    #[serde(flatten)]
    other: Map<String, serde_yaml::Value>,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct Importer {
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    dependencies: Map<String, DependencyEntry>,
    #[serde(rename = "devDependencies", default, skip_serializing_if = "Map::is_empty")]
    dev_dependencies: Map<String, DependencyEntry>,
    #[serde(
        rename = "optionalDependencies",
        default,
        skip_serializing_if = "Map::is_empty"
    )]
    optional_dependencies: Map<String, DependencyEntry>,
}

impl Importer {
    fn resolve(&self, name: &str) -> Option<&DependencyEntry> {
        self.dependencies
            .get(name)
            .or_else(|| self.dev_dependencies.get(name))
            .or_else(|| self.optional_dependencies.get(name))
    }
}

/// v5 stores plain version strings; v6+ stores {specifier, version} tables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum DependencyEntry {
    Version(String),
    Detailed { specifier: String, version: String },
}

impl DependencyEntry {
    fn version(&self) -> &str {
        match self {
            DependencyEntry::Version(v) => v,
            DependencyEntry::Detailed { version, .. } => version,
        }
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct PackageEntry {
    #[serde(skip_serializing_if = "Option::is_none")]
    version: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    dependencies: Map<String, String>,
    #[serde(
        rename = "optionalDependencies",
        default,
        skip_serializing_if = "Map::is_empty"
    )]
    optional_dependencies: Map<String, String>,
    #[serde(flatten)]
    other: Map<String, serde_yaml::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PatchEntry {
    path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    hash: Option<String>,
}

impl PnpmLockfile {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        let lockfile: Self = serde_yaml::from_slice(bytes)?;
        // Make sure we understand the dep path shape before using it.
        lockfile.major_version()?;
        Ok(lockfile)
    }

    fn major_version(&self) -> Result<u32, Error> {
        let version = match &self.lockfile_version {
            serde_yaml::Value::String(s) => s.clone(),
            serde_yaml::Value::Number(n) => n.to_string(),
            other => {
                return Err(Error::UnsupportedVersion(format!(
                    "pnpm lockfileVersion {other:?}"
                )))
            }
        };
        let major: u32 = version
            .split('.')
            .next()
            .and_then(|major| major.parse().ok())
            .ok_or_else(|| Error::UnsupportedVersion(format!("pnpm lockfileVersion {version}")))?;
        match major {
            5 | 6 | 7 | 9 => Ok(major),
            _ => Err(Error::UnsupportedVersion(format!(
                "pnpm lockfileVersion {version}"
            ))),
        }
    }

    fn format_key(&self, name: &str, version: &str) -> String {
        match self.major_version().expect("validated at load") {
            5 => format!("/{name}/{version}"),
            6 | 7 => format!("/{name}@{version}"),
            _ => format!("{name}@{version}"),
        }
    }

    fn entry(&self, key: &str) -> Option<&PackageEntry> {
        self.snapshots.get(key).or_else(|| self.packages.get(key))
    }

    /// Resolved version for a dep path. Peer suffixes ("(react@18.2.0)") are
    /// part of the key but not of the version.
    fn version_for(&self, key: &str, pinned: &str) -> String {
        self.packages
            .get(key)
            .and_then(|entry| entry.version.clone())
            .unwrap_or_else(|| pinned.split('(').next().unwrap_or(pinned).to_string())
    }
}

impl Lockfile for PnpmLockfile {
    fn resolve_package(
        &self,
        workspace_path: &str,
        name: &str,
        version: &str,
    ) -> Result<Option<Package>, Error> {
        // pnpm keys the root importer as "."
        let importer_key = if workspace_path.is_empty() { "." } else { workspace_path };
        let importer = self
            .importers
            .get(importer_key)
            .ok_or_else(|| Error::MissingWorkspace(importer_key.to_string()))?;

        // Initial calls carry a manifest specifier and resolve through the
        // importer; recursive calls carry the pinned version directly.
        let pinned = importer
            .resolve(name)
            .map(|entry| entry.version())
            .unwrap_or(version);
        // workspace links don't appear in `packages`
        if pinned.starts_with("link:") {
            return Ok(None);
        }

        let key = self.format_key(name, pinned);
        if self.entry(&key).is_none() {
            return Ok(None);
        }
        Ok(Some(Package {
            version: self.version_for(&key, pinned),
            key,
        }))
    }

    fn all_dependencies(&self, key: &str) -> Result<Option<HashMap<String, String>>, Error> {
        let Some(entry) = self.entry(key) else {
            return Ok(None);
        };
        Ok(Some(
            entry
                .dependencies
                .iter()
                .chain(entry.optional_dependencies.iter())
                .map(|(name, version)| (name.clone(), version.clone()))
                .collect(),
        ))
    }

    fn subgraph(
        &self,
        workspace_packages: &[String],
        packages: &[String],
    ) -> Result<Box<dyn Lockfile>, Error> {
        let importers = self
            .importers
            .iter()
            .filter(|(key, _)| key.as_str() == "." || workspace_packages.contains(key))
            .map(|(key, importer)| (key.clone(), importer.clone()))
            .collect();
        let prune = |entries: &Map<String, PackageEntry>| {
            entries
                .iter()
                .filter(|(key, _)| packages.contains(key))
                .map(|(key, entry)| (key.clone(), entry.clone()))
                .collect()
        };
        Ok(Box::new(Self {
            lockfile_version: self.lockfile_version.clone(),
            importers,
            packages: prune(&self.packages),
            snapshots: prune(&self.snapshots),
            patched_dependencies: self.patched_dependencies.clone(),
            other: self.other.clone(),
        }))
    }

    fn encode(&self) -> Result<Vec<u8>, Error> {
        Ok(serde_yaml::to_string(self)?.into_bytes())
    }

    fn patches(&self) -> Result<Vec<RelativeUnixPathBuf>, Error> {
        let mut patches = self
            .patched_dependencies
            .values()
            .filter_map(|patch| RelativeUnixPathBuf::new(patch.path.as_str()).ok())
            .collect::<Vec<_>>();
        patches.sort();
        Ok(patches)
    }

    fn global_change_key(&self) -> Vec<u8> {
        let mut buf = vec![b'p', b'n', b'p', b'm', 0];
        buf.extend(
            serde_json::to_vec(&serde_json::json!({
                "version": format!("{:?}", self.lockfile_version),
                "overrides": self.other.get("overrides").map(|v| format!("{v:?}")),
                "packageExtensionsChecksum": self
                    .other
                    .get("packageExtensionsChecksum")
                    .map(|v| format!("{v:?}")),
            }))
            .expect("serializing to Vec cannot fail"),
        );
        buf
    }
}

#[cfg(test)]
mod test {
    use test_case::test_case;

    use super::*;

    const LOCKFILE_V6: &str = r#"
lockfileVersion: '6.0'

importers:
  .:
    devDependencies:
      typescript:
        specifier: ^5.0.0
        version: 5.0.4
  apps/web:
    dependencies:
      has-flag:
        specifier: ^4.0.0
        version: 4.0.0
      supports-color:
        specifier: ^7.2.0
        version: 7.2.0
      ui:
        specifier: workspace:*
        version: link:../../packages/ui

packages:
  /has-flag@4.0.0:
    resolution: {integrity: sha512-deadbeef}
    dev: false
  /supports-color@7.2.0:
    resolution: {integrity: sha512-deadbeef}
    dependencies:
      has-flag: 4.0.0
    dev: false
  /typescript@5.0.4:
    resolution: {integrity: sha512-deadbeef}
    dev: true
"#;

    const LOCKFILE_V5: &str = r#"
lockfileVersion: 5.4

importers:
  apps/web:
    specifiers:
      has-flag: ^4.0.0
    dependencies:
      has-flag: 4.0.0

packages:
  /has-flag/4.0.0:
    resolution: {integrity: sha512-deadbeef}
    dev: false
"#;

    #[test_case(LOCKFILE_V6, "/has-flag@4.0.0" ; "v6 dep path")]
    #[test_case(LOCKFILE_V5, "/has-flag/4.0.0" ; "v5 dep path")]
    fn test_resolve_package(lockfile: &str, expected_key: &str) {
        let lockfile = PnpmLockfile::from_bytes(lockfile.as_bytes()).unwrap();
        let pkg = lockfile
            .resolve_package("apps/web", "has-flag", "^4.0.0")
            .unwrap()
            .unwrap();
        assert_eq!(pkg.key, expected_key);
        assert_eq!(pkg.version, "4.0.0");
    }

    #[test]
    fn test_closure_includes_transitive_deps() {
        let lockfile = PnpmLockfile::from_bytes(LOCKFILE_V6.as_bytes()).unwrap();
        let closure = crate::transitive_closure(
            &lockfile,
            "apps/web",
            [("supports-color".to_string(), "^7.2.0".to_string())]
                .into_iter()
                .collect(),
        )
        .unwrap();
        assert_eq!(
            closure,
            [
                Package::new("/supports-color@7.2.0", "7.2.0"),
                Package::new("/has-flag@4.0.0", "4.0.0"),
            ]
            .into_iter()
            .collect()
        );
    }

    #[test]
    fn test_workspace_links_are_skipped() {
        let lockfile = PnpmLockfile::from_bytes(LOCKFILE_V6.as_bytes()).unwrap();
        assert_eq!(
            lockfile
                .resolve_package("apps/web", "ui", "workspace:*")
                .unwrap(),
            None
        );
    }

    #[test]
    fn test_missing_importer_errors() {
        let lockfile = PnpmLockfile::from_bytes(LOCKFILE_V6.as_bytes()).unwrap();
        assert!(matches!(
            lockfile.resolve_package("apps/missing", "has-flag", "*"),
            Err(Error::MissingWorkspace(_))
        ));
    }

    #[test]
    fn test_unsupported_version_rejected() {
        let bad = LOCKFILE_V6.replace("'6.0'", "'3.0'");
        assert!(matches!(
            PnpmLockfile::from_bytes(bad.as_bytes()),
            Err(Error::UnsupportedVersion(_))
        ));
    }

    #[test]
    fn test_subgraph_prunes_importers_and_packages() {
        let lockfile = PnpmLockfile::from_bytes(LOCKFILE_V6.as_bytes()).unwrap();
        let pruned = lockfile
            .subgraph(&["apps/web".to_string()], &["/has-flag@4.0.0".to_string()])
            .unwrap();
        let encoded = String::from_utf8(pruned.encode().unwrap()).unwrap();
        assert!(encoded.contains("has-flag@4.0.0"));
        assert!(!encoded.contains("typescript@5.0.4"));
    }
}
