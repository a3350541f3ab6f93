use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use turbopath::AbsoluteSystemPath;

type Map<K, V> = BTreeMap<K, V>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unable to read {path}: {err}")]
    Io {
        path: String,
        #[source]
        err: std::io::Error,
    },
    #[error("unable to parse {path}: {err}")]
    Parse {
        path: String,
        #[source]
        err: serde_json::Error,
    },
}

/// The subset of package.json the runner cares about. Unknown fields are
/// preserved on a best-effort basis for reserialization but never inspected.
#[derive(Debug, Default, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PackageJson {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub package_manager: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub scripts: Map<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub engines: Option<Map<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workspaces: Option<Workspaces>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dependencies: Option<Map<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dev_dependencies: Option<Map<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub optional_dependencies: Option<Map<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peer_dependencies: Option<Map<String, String>>,
    #[serde(flatten)]
    pub other: Map<String, serde_json::Value>,
}

/// npm/yarn allow both a bare array and a `{ "packages": [...] }` table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum Workspaces {
    TopLevel(Vec<String>),
    Nested { packages: Vec<String> },
}

impl AsRef<[String]> for Workspaces {
    fn as_ref(&self) -> &[String] {
        match self {
            Workspaces::TopLevel(packages) => packages.as_slice(),
            Workspaces::Nested { packages } => packages.as_slice(),
        }
    }
}

impl PackageJson {
    pub fn load(path: &AbsoluteSystemPath) -> Result<PackageJson, Error> {
        let contents = path.read_to_string().map_err(|err| Error::Io {
            path: path.to_string(),
            err,
        })?;
        serde_json::from_str(&contents).map_err(|err| Error::Parse {
            path: path.to_string(),
            err,
        })
    }

    /// Prod and dev dependencies, the maps that create internal workspace
    /// edges. Dev deps are included so a package rebuilds when its tooling
    /// package changes.
    pub fn all_dependencies(&self) -> impl Iterator<Item = (&String, &String)> + '_ {
        self.dependencies
            .iter()
            .flatten()
            .chain(self.dev_dependencies.iter().flatten())
            .chain(self.optional_dependencies.iter().flatten())
    }

    pub fn command(&self, task_name: &str) -> Option<&str> {
        self.scripts.get(task_name).map(String::as_str)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_workspaces_forms() {
        let top_level: PackageJson =
            serde_json::from_str(r#"{"workspaces": ["apps/*", "packages/*"]}"#).unwrap();
        let nested: PackageJson =
            serde_json::from_str(r#"{"workspaces": {"packages": ["apps/*"]}}"#).unwrap();
        assert_eq!(
            top_level.workspaces.unwrap().as_ref(),
            &["apps/*".to_string(), "packages/*".to_string()]
        );
        assert_eq!(nested.workspaces.unwrap().as_ref(), &["apps/*".to_string()]);
    }

    #[test]
    fn test_all_dependencies_spans_maps() {
        let json: PackageJson = serde_json::from_str(
            r#"{
                "dependencies": {"a": "^1.0.0"},
                "devDependencies": {"b": "^2.0.0"},
                "optionalDependencies": {"c": "^3.0.0"}
            }"#,
        )
        .unwrap();
        let deps: Vec<_> = json.all_dependencies().map(|(name, _)| name.as_str()).collect();
        assert_eq!(deps, vec!["a", "b", "c"]);
    }
}
