use std::collections::HashMap;

use serde::Deserialize;

use crate::{Error, Lockfile, Package};

type Map<K, V> = std::collections::BTreeMap<K, V>;

/// bun.lock, a JSONC document. `packages` maps an install location key (the
/// package name, or `parent/name` when a conflicting version is nested) to a
/// tuple of `[ident, registry, info, integrity]`.
#[derive(Debug, Deserialize)]
pub struct BunLockfile {
    #[serde(rename = "lockfileVersion")]
    lockfile_version: i32,
    #[serde(default)]
    workspaces: Map<String, WorkspaceEntry>,
    #[serde(default)]
    packages: Map<String, PackageEntry>,
    #[serde(rename = "patchedDependencies", default)]
    patched_dependencies: Map<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
struct WorkspaceEntry {
    #[allow(dead_code)]
    name: Option<String>,
    #[serde(default)]
    dependencies: Map<String, String>,
    #[serde(rename = "devDependencies", default)]
    dev_dependencies: Map<String, String>,
    #[serde(rename = "optionalDependencies", default)]
    optional_dependencies: Map<String, String>,
}

/// `[ident, registry, info, integrity]`; shorter forms appear for
/// workspace and root entries.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum PackageEntry {
    Full(
        String,
        #[serde(default)] serde_json::Value,
        #[serde(default)] PackageInfo,
        #[serde(default)] serde_json::Value,
    ),
    Short(String, #[serde(default)] serde_json::Value, #[serde(default)] PackageInfo),
    IdentOnly((String,)),
}

#[derive(Debug, Default, Clone, Deserialize)]
struct PackageInfo {
    #[serde(default)]
    dependencies: Map<String, String>,
    #[serde(rename = "optionalDependencies", default)]
    optional_dependencies: Map<String, String>,
}

impl PackageEntry {
    fn ident(&self) -> &str {
        match self {
            PackageEntry::Full(ident, ..) => ident,
            PackageEntry::Short(ident, ..) => ident,
            PackageEntry::IdentOnly((ident,)) => ident,
        }
    }

    /// "name@1.2.3" -> "1.2.3"; scoped names keep their leading '@'.
    fn version(&self) -> &str {
        let ident = self.ident();
        ident
            .rfind('@')
            .filter(|idx| *idx != 0)
            .map(|idx| &ident[idx + 1..])
            .unwrap_or("")
    }

    fn info(&self) -> Option<&PackageInfo> {
        match self {
            PackageEntry::Full(_, _, info, _) => Some(info),
            PackageEntry::Short(_, _, info) => Some(info),
            PackageEntry::IdentOnly(_) => None,
        }
    }
}

impl BunLockfile {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        let text = std::str::from_utf8(bytes).map_err(|_| Error::BunParse {
            message: "bun.lock is not valid utf8".into(),
        })?;
        // the parse error's Display includes line and column information
        let value = jsonc_parser::parse_to_serde_value(text, &Default::default())
            .map_err(|e| Error::BunParse {
                message: e.to_string(),
            })?
            .ok_or_else(|| Error::BunParse {
                message: "bun.lock is empty".into(),
            })?;
        let lockfile: Self = serde_json::from_value(value)?;
        if lockfile.lockfile_version != 0 && lockfile.lockfile_version != 1 {
            return Err(Error::UnsupportedVersion(format!(
                "bun lockfileVersion {}",
                lockfile.lockfile_version
            )));
        }
        Ok(lockfile)
    }

    /// Finds the entry a package resolves to from a given location: the most
    /// nested key wins, mirroring how bun hoists.
    fn find_entry(&self, location_key: &str, name: &str) -> Option<(String, &PackageEntry)> {
        let mut prefix = location_key;
        loop {
            let key = if prefix.is_empty() {
                name.to_string()
            } else {
                format!("{prefix}/{name}")
            };
            if let Some(entry) = self.packages.get(&key) {
                return Some((key, entry));
            }
            if prefix.is_empty() {
                return None;
            }
            prefix = prefix.rsplit_once('/').map(|(head, _)| head).unwrap_or("");
        }
    }
}

impl Lockfile for BunLockfile {
    fn resolve_package(
        &self,
        workspace_path: &str,
        name: &str,
        _version: &str,
    ) -> Result<Option<Package>, Error> {
        if !workspace_path.is_empty() && !self.workspaces.contains_key(workspace_path) {
            return Err(Error::MissingWorkspace(workspace_path.to_string()));
        }
        Ok(self.find_entry("", name).map(|(key, entry)| Package {
            version: entry.version().to_string(),
            key,
        }))
    }

    fn all_dependencies(&self, key: &str) -> Result<Option<HashMap<String, String>>, Error> {
        let Some(entry) = self.packages.get(key) else {
            return Ok(None);
        };
        let Some(info) = entry.info() else {
            return Ok(Some(HashMap::new()));
        };
        // Resolution happens by name from this entry's location, so the
        // specifier side is advisory.
        Ok(Some(
            info.dependencies
                .iter()
                .chain(info.optional_dependencies.iter())
                .map(|(name, specifier)| (name.clone(), specifier.clone()))
                .collect(),
        ))
    }

    fn subgraph(
        &self,
        workspace_packages: &[String],
        packages: &[String],
    ) -> Result<Box<dyn Lockfile>, Error> {
        let workspaces = self
            .workspaces
            .iter()
            .filter(|(key, _)| key.is_empty() || workspace_packages.contains(key))
            .map(|(key, entry)| (key.clone(), entry.clone()))
            .collect();
        let packages = self
            .packages
            .iter()
            .filter(|(key, _)| packages.contains(key))
            .map(|(key, entry)| (key.clone(), entry.clone()))
            .collect();
        Ok(Box::new(Self {
            lockfile_version: self.lockfile_version,
            workspaces,
            packages,
            patched_dependencies: self.patched_dependencies.clone(),
        }))
    }

    fn encode(&self) -> Result<Vec<u8>, Error> {
        // bun.lock is written by bun itself; pruned lockfiles serialize the
        // subset we track.
        let mut packages = serde_json::Map::new();
        for (key, entry) in &self.packages {
            packages.insert(key.clone(), serde_json::json!([entry.ident()]));
        }
        Ok(serde_json::to_vec_pretty(&serde_json::json!({
            "lockfileVersion": self.lockfile_version,
            "packages": packages,
        }))?)
    }

    fn patches(&self) -> Result<Vec<turbopath::RelativeUnixPathBuf>, Error> {
        let mut patches = self
            .patched_dependencies
            .values()
            .filter_map(|path| turbopath::RelativeUnixPathBuf::new(path.as_str()).ok())
            .collect::<Vec<_>>();
        patches.sort();
        Ok(patches)
    }

    fn global_change_key(&self) -> Vec<u8> {
        let mut buf = vec![b'b', b'u', b'n', 0];
        buf.extend(self.lockfile_version.to_le_bytes());
        buf
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const LOCKFILE: &str = r#"{
  // bun.lock allows comments and trailing commas
  "lockfileVersion": 1,
  "workspaces": {
    "": { "name": "monorepo" },
    "apps/web": {
      "name": "web",
      "dependencies": { "chalk": "^5.0.0" },
    },
  },
  "packages": {
    "chalk": ["chalk@5.2.0", "", { "dependencies": { "ansi-styles": "^6.0.0" } }, "sha512-aaa"],
    "ansi-styles": ["ansi-styles@6.2.1", "", {}, "sha512-bbb"],
    "web/ansi-styles": ["ansi-styles@5.0.0", "", {}, "sha512-ccc"],
  },
}"#;

    #[test]
    fn test_parses_jsonc() {
        let lockfile = BunLockfile::from_bytes(LOCKFILE.as_bytes()).unwrap();
        assert_eq!(lockfile.lockfile_version, 1);
    }

    #[test]
    fn test_resolve_and_version_split() {
        let lockfile = BunLockfile::from_bytes(LOCKFILE.as_bytes()).unwrap();
        let pkg = lockfile
            .resolve_package("apps/web", "chalk", "^5.0.0")
            .unwrap()
            .unwrap();
        assert_eq!(pkg.key, "chalk");
        assert_eq!(pkg.version, "5.2.0");
    }

    #[test]
    fn test_closure() {
        let lockfile = BunLockfile::from_bytes(LOCKFILE.as_bytes()).unwrap();
        let closure = crate::transitive_closure(
            &lockfile,
            "apps/web",
            [("chalk".to_string(), "^5.0.0".to_string())].into_iter().collect(),
        )
        .unwrap();
        assert_eq!(
            closure,
            [
                Package::new("chalk", "5.2.0"),
                Package::new("ansi-styles", "6.2.1"),
            ]
            .into_iter()
            .collect()
        );
    }

    #[test]
    fn test_missing_workspace() {
        let lockfile = BunLockfile::from_bytes(LOCKFILE.as_bytes()).unwrap();
        assert!(matches!(
            lockfile.resolve_package("apps/missing", "chalk", "*"),
            Err(Error::MissingWorkspace(_))
        ));
    }

    #[test]
    fn test_malformed_lockfile_is_a_parse_error() {
        let err = BunLockfile::from_bytes(b"{ \"lockfileVersion\": }").unwrap_err();
        assert!(matches!(err, Error::BunParse { .. }));
    }
}
