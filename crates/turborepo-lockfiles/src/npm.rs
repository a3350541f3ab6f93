use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::{Error, Lockfile, Package};

type Map<K, V> = std::collections::BTreeMap<K, V>;

/// package-lock.json v2/v3. Entries live under `packages` keyed by their
/// path inside `node_modules` (or the workspace directory for workspace
/// entries).
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct NpmLockfile {
    #[serde(rename = "lockfileVersion")]
    lockfile_version: i32,
    packages: Map<String, NpmPackage>,
    // Parsed so it doesn't end up in `other`; v1-style and never
    // reserialized.
    #[serde(skip_serializing, default)]
    dependencies: Map<String, Value>,
    // Fields we don't use are reserialized as-is rather than described.
    #[serde(flatten)]
    other: Map<String, Value>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
struct NpmPackage {
    version: Option<String>,
    resolved: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    dependencies: Map<String, String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    dev_dependencies: Map<String, String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    peer_dependencies: Map<String, String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    optional_dependencies: Map<String, String>,
    #[serde(flatten)]
    other: Map<String, Value>,
}

impl NpmPackage {
    fn dep_keys(&self) -> impl Iterator<Item = &String> {
        self.dependencies
            .keys()
            .chain(self.dev_dependencies.keys())
            .chain(self.optional_dependencies.keys())
            .chain(self.peer_dependencies.keys())
    }
}

impl NpmLockfile {
    pub fn load(content: &[u8]) -> Result<Self, Error> {
        let lockfile: NpmLockfile = serde_json::from_slice(content)?;

        // Lockfiles without `packages` would require walking node_modules to
        // resolve dependencies, which v1 clients did. Not supported.
        if lockfile.lockfile_version <= 1
            || (lockfile.packages.is_empty() && !lockfile.dependencies.is_empty())
        {
            Err(Error::UnsupportedNpmVersion)
        } else {
            Ok(lockfile)
        }
    }

    fn get_package(&self, key: &str) -> Result<&NpmPackage, Error> {
        self.packages
            .get(key)
            .ok_or_else(|| Error::MissingPackage(key.to_string()))
    }

    /// All keys a dependency of `key` could be stored under, from the most
    /// nested `node_modules` outwards.
    fn possible_npm_deps(key: &str, dep: &str) -> Vec<String> {
        let mut possible_deps = vec![format!("{key}/node_modules/{dep}")];
        let mut curr = Some(key);
        while let Some(key) = curr {
            let next = Self::npm_path_parent(key);
            possible_deps.push(format!("{}node_modules/{}", next.unwrap_or(""), dep));
            curr = next;
        }
        possible_deps
    }

    fn npm_path_parent(key: &str) -> Option<&str> {
        key.rsplit_once("node_modules/")
            .map(|(first, _)| first)
            .filter(|parent| !parent.is_empty())
    }
}

impl Lockfile for NpmLockfile {
    fn resolve_package(
        &self,
        workspace_path: &str,
        name: &str,
        _version: &str,
    ) -> Result<Option<Package>, Error> {
        if !self.packages.contains_key(workspace_path) {
            return Err(Error::MissingWorkspace(workspace_path.to_string()));
        }

        let possible_keys = [
            // all_dependencies returns fully-qualified keys
            name.to_string(),
            // a version nested under the workspace wins over the hoisted one
            format!("{workspace_path}/node_modules/{name}"),
            format!("node_modules/{name}"),
        ];
        Ok(possible_keys.into_iter().find_map(|key| {
            self.packages.get(&key).map(|pkg| Package {
                version: pkg.version.clone().unwrap_or_default(),
                key,
            })
        }))
    }

    fn all_dependencies(&self, key: &str) -> Result<Option<HashMap<String, String>>, Error> {
        self.packages
            .get(key)
            .map(|pkg| {
                pkg.dep_keys()
                    .filter_map(|name| {
                        Self::possible_npm_deps(key, name)
                            .into_iter()
                            .find_map(|possible_key| {
                                let entry = self.packages.get(&possible_key)?;
                                match entry.version.as_deref() {
                                    Some(version) => Some(Ok((possible_key, version.to_string()))),
                                    // workspace link entries have no version
                                    None if entry.resolved.is_some() => None,
                                    None => Some(Err(Error::MissingVersion(possible_key.clone()))),
                                }
                            })
                    })
                    .collect()
            })
            .transpose()
    }

    fn subgraph(
        &self,
        workspace_packages: &[String],
        packages: &[String],
    ) -> Result<Box<dyn Lockfile>, Error> {
        let mut pruned_packages = Map::new();
        for pkg_key in packages {
            let pkg = self.get_package(pkg_key)?;
            pruned_packages.insert(pkg_key.clone(), pkg.clone());
        }
        if let Some(root) = self.packages.get("") {
            pruned_packages.insert(String::new(), root.clone());
        }
        for workspace in workspace_packages {
            let pkg = self.get_package(workspace)?;
            pruned_packages.insert(workspace.clone(), pkg.clone());
            // keep the node_modules link entry pointing at the workspace
            if let Some((key, entry)) = self
                .packages
                .iter()
                .find(|(_, entry)| entry.resolved.as_deref() == Some(workspace))
            {
                pruned_packages.insert(key.clone(), entry.clone());
            }
        }

        Ok(Box::new(Self {
            lockfile_version: 3,
            packages: pruned_packages,
            dependencies: Map::default(),
            other: self.other.clone(),
        }))
    }

    fn encode(&self) -> Result<Vec<u8>, Error> {
        Ok(serde_json::to_vec_pretty(&self)?)
    }

    fn global_change_key(&self) -> Vec<u8> {
        let mut buf = vec![b'n', b'p', b'm', 0];
        serde_json::to_writer(
            &mut buf,
            &json!({
                "requires": self.other.get("requires"),
                "version": self.lockfile_version,
            }),
        )
        .expect("writing to Vec cannot fail");
        buf
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const BASIC_LOCKFILE: &str = r#"{
        "name": "basic",
        "lockfileVersion": 3,
        "requires": true,
        "packages": {
            "": { "name": "basic", "version": "1.0.0" },
            "apps/web": { "name": "web", "version": "0.0.0", "dependencies": { "lodash": "^4.17.0" } },
            "node_modules/web": { "resolved": "apps/web", "link": true },
            "node_modules/lodash": { "version": "4.17.21" },
            "apps/web/node_modules/chalk": { "version": "5.2.0" },
            "node_modules/chalk": { "version": "4.1.2", "dependencies": { "ansi-styles": "^4.1.0" } },
            "node_modules/ansi-styles": { "version": "4.3.0" }
        }
    }"#;

    #[test]
    fn test_rejects_v1() {
        let v1 = r#"{"lockfileVersion": 1, "dependencies": {"lodash": {"version": "4.17.21"}}}"#;
        assert!(matches!(
            NpmLockfile::load(v1.as_bytes()),
            Err(Error::UnsupportedNpmVersion)
        ));
    }

    #[test]
    fn test_nested_version_wins() {
        let lockfile = NpmLockfile::load(BASIC_LOCKFILE.as_bytes()).unwrap();
        let chalk = lockfile
            .resolve_package("apps/web", "chalk", "^5.0.0")
            .unwrap()
            .unwrap();
        assert_eq!(chalk.key, "apps/web/node_modules/chalk");
        assert_eq!(chalk.version, "5.2.0");
    }

    #[test]
    fn test_missing_workspace_errors() {
        let lockfile = NpmLockfile::load(BASIC_LOCKFILE.as_bytes()).unwrap();
        assert!(matches!(
            lockfile.resolve_package("apps/missing", "lodash", "*"),
            Err(Error::MissingWorkspace(_))
        ));
    }

    #[test]
    fn test_transitive_closure() {
        let lockfile = NpmLockfile::load(BASIC_LOCKFILE.as_bytes()).unwrap();
        let closure = crate::transitive_closure(
            &lockfile,
            "apps/web",
            [("chalk".to_string(), "^4.0.0".to_string())].into_iter().collect(),
        )
        .unwrap();
        // nested chalk shadows the hoisted one, and the nested entry has no deps
        assert_eq!(
            closure,
            [Package::new("apps/web/node_modules/chalk", "5.2.0")]
                .into_iter()
                .collect()
        );

        let closure = crate::transitive_closure(
            &lockfile,
            "",
            [("chalk".to_string(), "^4.0.0".to_string())].into_iter().collect(),
        )
        .unwrap();
        assert_eq!(
            closure,
            [
                Package::new("node_modules/chalk", "4.1.2"),
                Package::new("node_modules/ansi-styles", "4.3.0"),
            ]
            .into_iter()
            .collect()
        );
    }

    #[test]
    fn test_global_change_key_tracks_version() {
        let v3 = NpmLockfile::load(BASIC_LOCKFILE.as_bytes()).unwrap();
        let v2 = NpmLockfile::load(&BASIC_LOCKFILE.replace("\"lockfileVersion\": 3", "\"lockfileVersion\": 2").into_bytes())
            .unwrap();
        assert!(crate::global_change(&v3, &v2));
        assert!(!crate::global_change(&v3, &v3));
    }
}
