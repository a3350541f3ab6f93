use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use turbopath::RelativeUnixPathBuf;

use crate::{Error, Lockfile, Package};

type Map<K, V> = std::collections::BTreeMap<K, V>;

/// yarn-berry yaml lockfile. Entries are keyed by comma-separated descriptor
/// lists ("name@protocol:range"); we index each descriptor individually.
#[derive(Debug)]
pub struct BerryLockfile {
    metadata: Metadata,
    /// descriptor ("name@range") -> resolution entry
    descriptors: Map<String, BerryPackage>,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize, PartialEq)]
struct Metadata {
    version: u64,
    #[serde(rename = "cacheKey", skip_serializing_if = "Option::is_none")]
    cache_key: Option<serde_yaml::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BerryPackage {
    version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    resolution: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    dependencies: Map<String, String>,
    #[serde(rename = "optionalDependencies", default, skip_serializing_if = "Map::is_empty")]
    optional_dependencies: Map<String, String>,
}

impl BerryLockfile {
    pub fn load(contents: &[u8]) -> Result<Self, Error> {
        let raw: Map<String, serde_yaml::Value> = serde_yaml::from_slice(contents)?;

        let mut metadata = None;
        let mut descriptors = Map::new();
        for (key, value) in raw {
            if key == "__metadata" {
                metadata = Some(serde_yaml::from_value(value)?);
                continue;
            }
            let package: BerryPackage = serde_yaml::from_value(value)?;
            for descriptor in key.split(", ") {
                descriptors.insert(descriptor.to_string(), package.clone());
            }
        }

        let metadata: Metadata = metadata
            .ok_or_else(|| Error::UnsupportedVersion("berry lockfile missing __metadata".into()))?;
        // Lockfile versions below 6 used a different descriptor syntax.
        if metadata.version < 6 {
            return Err(Error::UnsupportedVersion(format!(
                "berry lockfile version {}",
                metadata.version
            )));
        }

        Ok(Self {
            metadata,
            descriptors,
        })
    }

    fn lookup(&self, name: &str, range: &str) -> Option<(String, &BerryPackage)> {
        // Manifests omit the npm protocol; descriptors in the lockfile
        // usually carry it.
        let candidates = if range.contains(':') {
            vec![format!("{name}@{range}")]
        } else {
            vec![format!("{name}@npm:{range}"), format!("{name}@{range}")]
        };
        candidates
            .into_iter()
            .find_map(|key| self.descriptors.get(&key).map(|pkg| (key, pkg)))
    }
}

impl Lockfile for BerryLockfile {
    fn resolve_package(
        &self,
        _workspace_path: &str,
        name: &str,
        version: &str,
    ) -> Result<Option<Package>, Error> {
        Ok(self.lookup(name, version).map(|(key, entry)| Package {
            key,
            version: entry.version.clone(),
        }))
    }

    fn all_dependencies(&self, key: &str) -> Result<Option<HashMap<String, String>>, Error> {
        let Some(entry) = self.descriptors.get(key) else {
            return Ok(None);
        };
        Ok(Some(
            entry
                .dependencies
                .iter()
                .chain(entry.optional_dependencies.iter())
                .map(|(name, range)| (name.clone(), range.clone()))
                .collect(),
        ))
    }

    fn subgraph(
        &self,
        _workspace_packages: &[String],
        packages: &[String],
    ) -> Result<Box<dyn Lockfile>, Error> {
        let descriptors = self
            .descriptors
            .iter()
            .filter(|(key, _)| packages.contains(key))
            .map(|(key, entry)| (key.clone(), entry.clone()))
            .collect();
        Ok(Box::new(Self {
            metadata: self.metadata.clone(),
            descriptors,
        }))
    }

    fn encode(&self) -> Result<Vec<u8>, Error> {
        // Descriptors that share an entry are not re-merged; yarn accepts
        // the expanded form.
        let mut doc: Map<String, serde_yaml::Value> = Map::new();
        doc.insert("__metadata".into(), serde_yaml::to_value(&self.metadata)?);
        for (key, entry) in &self.descriptors {
            doc.insert(key.clone(), serde_yaml::to_value(entry)?);
        }
        Ok(serde_yaml::to_string(&doc)?.into_bytes())
    }

    fn patches(&self) -> Result<Vec<RelativeUnixPathBuf>, Error> {
        let mut patches = Vec::new();
        for entry in self.descriptors.values() {
            let Some(resolution) = &entry.resolution else {
                continue;
            };
            // "pkg@patch:pkg@npm%3A1.0.0#./.yarn/patches/pkg.patch::..."
            let Some((_, rest)) = resolution.split_once("patch:") else {
                continue;
            };
            let Some((_, path_and_meta)) = rest.split_once('#') else {
                continue;
            };
            let path = path_and_meta
                .split("::")
                .next()
                .unwrap_or(path_and_meta)
                .trim_start_matches("./");
            // Builtin patches (e.g. "~builtin<compat/...>") are not files.
            if !path.starts_with('~') {
                if let Ok(path) = RelativeUnixPathBuf::new(path) {
                    patches.push(path);
                }
            }
        }
        patches.sort();
        patches.dedup();
        Ok(patches)
    }

    fn global_change_key(&self) -> Vec<u8> {
        let mut buf = vec![b'b', b'e', b'r', b'r', b'y', 0];
        buf.extend(
            serde_json::to_vec(&serde_json::json!({
                "version": self.metadata.version,
                "cacheKey": format!("{:?}", self.metadata.cache_key),
            }))
            .expect("serializing to Vec cannot fail"),
        );
        buf
    }
}
