use std::{collections::HashMap, sync::Arc};

use turbopath::AbsoluteSystemPath;
use turborepo_errors::WithMetadata;
use turborepo_repository::package_graph::{PackageGraph, PackageName};

use super::{parse_raw_turbo_json, Error, RawTurboJson, TurboJson, CONFIG_FILE};

/// Loads and caches turbo.json files for the run: the root configuration
/// plus any per-package overrides. All reads happen up front so the engine
/// builder works against immutable data.
#[derive(Debug)]
pub struct TurboJsonLoader {
    configs: HashMap<PackageName, TurboJson>,
}

impl TurboJsonLoader {
    /// Reads the root turbo.json and every package-level turbo.json that
    /// exists. Missing package configs are fine; a missing root config is
    /// an error for multi-package repos.
    pub fn workspace(
        repo_root: &AbsoluteSystemPath,
        package_graph: &PackageGraph,
    ) -> Result<Self, Error> {
        let mut configs = HashMap::new();

        let root_path = repo_root.join_component(CONFIG_FILE);
        let root = Self::read_turbo_json(&root_path, true)?.ok_or(Error::NoTurboJson)?;
        configs.insert(PackageName::Root, root);

        for (name, info) in package_graph.packages() {
            if *name == PackageName::Root {
                continue;
            }
            let config_path = repo_root
                .resolve(info.package_path())
                .join_component(CONFIG_FILE);
            if let Some(turbo_json) = Self::read_turbo_json(&config_path, false)? {
                configs.insert(name.clone(), turbo_json);
            }
        }

        Ok(Self { configs })
    }

    /// Single-package repos run against the root config only.
    pub fn single_package(repo_root: &AbsoluteSystemPath) -> Result<Self, Error> {
        let root_path = repo_root.join_component(CONFIG_FILE);
        let root = Self::read_turbo_json(&root_path, true)?.ok_or(Error::NoTurboJson)?;
        Ok(Self {
            configs: HashMap::from([(PackageName::Root, root)]),
        })
    }

    /// Preloaded configs, for tests.
    pub fn noop(configs: HashMap<PackageName, TurboJson>) -> Self {
        Self { configs }
    }

    pub fn load(&self, package: &PackageName) -> Option<&TurboJson> {
        self.configs.get(package)
    }

    pub fn root(&self) -> &TurboJson {
        self.configs
            .get(&PackageName::Root)
            .expect("loader is constructed with a root config")
    }

    fn read_turbo_json(
        path: &AbsoluteSystemPath,
        is_root: bool,
    ) -> Result<Option<TurboJson>, Error> {
        let Some(contents) = path.read_existing_to_string().map_err(|err| Error::Io {
            path: path.to_string(),
            err,
        })?
        else {
            return Ok(None);
        };

        let mut raw = parse_raw_turbo_json(&contents)?;
        let path_arc: Arc<str> = Arc::from(path.as_str());
        let text_arc: Arc<str> = Arc::from(contents.as_str());
        raw.add_path(path_arc);
        raw.add_text(text_arc.clone());

        if is_root {
            if let Some(extends) = &raw.extends {
                let (span, text) = extends.span_and_text(CONFIG_FILE);
                return Err(Error::ExtendsInRootConfig { span, text });
            }
        } else {
            // Package configs may only shape their own tasks.
            if let Some(tasks) = &raw.tasks {
                for (task_name, definition) in tasks.iter() {
                    if task_name.is_package_task() {
                        let (span, text) = definition.span_and_text(CONFIG_FILE);
                        return Err(Error::PackageTaskInPackageConfig { span, text });
                    }
                }
            }
        }

        TurboJson::try_from(raw).map(Some)
    }
}

#[cfg(test)]
mod test {
    use turbopath::AbsoluteSystemPathBuf;

    use super::*;

    #[test]
    fn test_missing_root_errors() {
        let dir = tempfile::tempdir().unwrap();
        let repo_root = AbsoluteSystemPathBuf::try_from(dir.path()).unwrap();
        let result = TurboJsonLoader::single_package(&repo_root);
        assert!(matches!(result, Err(Error::NoTurboJson)));
    }

    #[test]
    fn test_loads_root_config() {
        let dir = tempfile::tempdir().unwrap();
        let repo_root = AbsoluteSystemPathBuf::try_from(dir.path()).unwrap();
        repo_root
            .join_component(CONFIG_FILE)
            .create_with_contents(r#"{"tasks": {"build": {"outputs": ["dist/**"]}}}"#)
            .unwrap();

        let loader = TurboJsonLoader::single_package(&repo_root).unwrap();
        let root = loader.root();
        assert!(root
            .tasks
            .contains_key(&crate::task_id::TaskName::from("build")));
    }

    #[test]
    fn test_package_config_cannot_declare_other_packages() {
        let dir = tempfile::tempdir().unwrap();
        let repo_root = AbsoluteSystemPathBuf::try_from(dir.path()).unwrap();
        let config_path = repo_root.join_component(CONFIG_FILE);
        config_path
            .create_with_contents(r#"{"tasks": {"web#build": {}}}"#)
            .unwrap();

        let result = TurboJsonLoader::read_turbo_json(&config_path, false);
        assert!(matches!(
            result,
            Err(Error::PackageTaskInPackageConfig { .. })
        ));
    }

    #[test]
    fn test_root_config_cannot_extend() {
        let dir = tempfile::tempdir().unwrap();
        let repo_root = AbsoluteSystemPathBuf::try_from(dir.path()).unwrap();
        let config_path = repo_root.join_component(CONFIG_FILE);
        config_path
            .create_with_contents(r#"{"extends": ["//"]}"#)
            .unwrap();

        let result = TurboJsonLoader::read_turbo_json(&config_path, true);
        assert!(matches!(result, Err(Error::ExtendsInRootConfig { .. })));
    }
}
