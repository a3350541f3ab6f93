//! turbo.json loading and validation.
//!
//! The raw form mirrors what the user wrote, with every interesting value
//! wrapped in `Spanned` so validation errors can point back at the source.
//! `TurboJson` is the validated root/package configuration the rest of the
//! run consumes.

mod loader;
mod parser;

use std::{
    collections::BTreeMap,
    ops::{Deref, DerefMut},
    sync::Arc,
};

use miette::{Diagnostic, NamedSource, SourceSpan};
use serde::Serialize;
use thiserror::Error;
use turborepo_errors::{Spanned, WithMetadata};

pub use loader::TurboJsonLoader;
pub use parser::parse_raw_turbo_json;

use crate::{cli::EnvMode, task_id::TaskName};

pub const CONFIG_FILE: &str = "turbo.json";

#[derive(Debug, Error, Diagnostic)]
pub enum Error {
    #[error("unable to read {path}: {err}")]
    Io {
        path: String,
        #[source]
        err: std::io::Error,
    },
    #[error("Could not find {CONFIG_FILE} at the root of your repository")]
    NoTurboJson,
    #[error("failed to parse {CONFIG_FILE}: {message}")]
    Parse {
        message: String,
        #[source_code]
        text: NamedSource,
        #[label("here")]
        span: Option<SourceSpan>,
    },
    #[error("expected {expected}")]
    UnexpectedType {
        expected: &'static str,
        #[source_code]
        text: NamedSource,
        #[label("found this instead")]
        span: Option<SourceSpan>,
    },
    #[error("unknown key \"{key}\"")]
    UnknownKey {
        key: String,
        #[source_code]
        text: NamedSource,
        #[label("not a recognized option")]
        span: Option<SourceSpan>,
    },
    #[error("\"pipeline\" was renamed to \"tasks\", declare only \"tasks\"")]
    PipelineAndTasks {
        #[source_code]
        text: NamedSource,
        #[label("remove this")]
        span: Option<SourceSpan>,
    },
    #[error("environment variables should not be prefixed with \"$\"")]
    #[diagnostic(help("declare the variable in \"env\" as \"{stripped}\""))]
    InvalidEnvPrefix {
        stripped: String,
        #[source_code]
        text: NamedSource,
        #[label("variable with \"$\" prefix")]
        span: Option<SourceSpan>,
    },
    #[error("\"dependsOn\" entries may not reference environment variables")]
    #[diagnostic(help("move \"{value}\" to the task's \"env\" list as \"{stripped}\""))]
    InvalidDependsOnValue {
        value: String,
        stripped: String,
        #[source_code]
        text: NamedSource,
        #[label("environment variable dependency")]
        span: Option<SourceSpan>,
    },
    #[error("package configurations may only define tasks for their own package")]
    PackageTaskInPackageConfig {
        #[source_code]
        text: NamedSource,
        #[label("this task belongs to another package")]
        span: Option<SourceSpan>,
    },
    #[error("\"extends\" is only allowed in package configurations")]
    ExtendsInRootConfig {
        #[source_code]
        text: NamedSource,
        #[label("remove this")]
        span: Option<SourceSpan>,
    },
    #[error("interactive tasks cannot be cached")]
    InteractiveNoCacheable {
        #[source_code]
        text: NamedSource,
        #[label("cache this task or make it interactive, not both")]
        span: Option<SourceSpan>,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UIMode {
    #[default]
    Stream,
    Tui,
}

/// How much of a task's output is shown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
#[clap(rename_all = "kebab-case")]
pub enum OutputLogsMode {
    #[default]
    Full,
    None,
    HashOnly,
    NewOnly,
    ErrorsOnly,
}

#[derive(Debug, Default, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RawRemoteCacheOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub team_id: Option<Spanned<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<Spanned<bool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preflight: Option<Spanned<bool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled: Option<Spanned<bool>>,
}

/// The pipeline: task keys mapped to their raw definitions.
#[derive(Debug, Default, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Pipeline(pub BTreeMap<TaskName<'static>, Spanned<RawTaskDefinition>>);

impl Deref for Pipeline {
    type Target = BTreeMap<TaskName<'static>, Spanned<RawTaskDefinition>>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for Pipeline {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl IntoIterator for Pipeline {
    type Item = (TaskName<'static>, Spanned<RawTaskDefinition>);
    type IntoIter =
        std::collections::btree_map::IntoIter<TaskName<'static>, Spanned<RawTaskDefinition>>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// A task definition exactly as authored.
#[derive(Debug, Default, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RawTaskDefinition {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache: Option<Spanned<bool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub depends_on: Option<Spanned<Vec<Spanned<String>>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub env: Option<Vec<Spanned<String>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inputs: Option<Vec<Spanned<String>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pass_through_env: Option<Vec<Spanned<String>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub persistent: Option<Spanned<bool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interactive: Option<Spanned<bool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outputs: Option<Vec<Spanned<String>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_logs: Option<Spanned<OutputLogsMode>>,
}

impl RawTaskDefinition {
    /// Override semantics: any field present in `other` wins.
    pub fn merge(&mut self, other: RawTaskDefinition) {
        macro_rules! set_field {
            ($this:ident, $other:ident, $field:ident) => {{
                if let Some(value) = $other.$field {
                    $this.$field = Some(value);
                }
            }};
        }
        set_field!(self, other, cache);
        set_field!(self, other, depends_on);
        set_field!(self, other, env);
        set_field!(self, other, inputs);
        set_field!(self, other, pass_through_env);
        set_field!(self, other, persistent);
        set_field!(self, other, interactive);
        set_field!(self, other, outputs);
        set_field!(self, other, output_logs);
    }
}

/// The whole document as authored.
#[derive(Debug, Default, Clone)]
pub struct RawTurboJson {
    pub schema: Option<String>,
    pub global_dependencies: Option<Vec<Spanned<String>>>,
    pub global_env: Option<Vec<Spanned<String>>>,
    pub global_pass_through_env: Option<Vec<Spanned<String>>>,
    pub global_cache_key: Option<Spanned<String>>,
    pub remote_cache: Option<RawRemoteCacheOptions>,
    pub ui: Option<Spanned<UIMode>>,
    pub tasks: Option<Pipeline>,
    pub pipeline: Option<Spanned<Pipeline>>,
    pub extends: Option<Spanned<Vec<Spanned<String>>>>,
    pub env_mode: Option<Spanned<EnvMode>>,
    pub cache_dir: Option<Spanned<String>>,
}

impl WithMetadata for RawTaskDefinition {
    fn add_text(&mut self, text: Arc<str>) {
        self.cache.add_text(text.clone());
        if let Some(depends_on) = &mut self.depends_on {
            depends_on.add_text(text.clone());
            depends_on.value.add_text(text.clone());
        }
        self.env.add_text(text.clone());
        self.inputs.add_text(text.clone());
        self.pass_through_env.add_text(text.clone());
        self.persistent.add_text(text.clone());
        self.interactive.add_text(text.clone());
        self.outputs.add_text(text.clone());
        self.output_logs.add_text(text);
    }

    fn add_path(&mut self, path: Arc<str>) {
        self.cache.add_path(path.clone());
        if let Some(depends_on) = &mut self.depends_on {
            depends_on.add_path(path.clone());
            depends_on.value.add_path(path.clone());
        }
        self.env.add_path(path.clone());
        self.inputs.add_path(path.clone());
        self.pass_through_env.add_path(path.clone());
        self.persistent.add_path(path.clone());
        self.interactive.add_path(path.clone());
        self.outputs.add_path(path.clone());
        self.output_logs.add_path(path);
    }
}

impl WithMetadata for RawTurboJson {
    fn add_text(&mut self, text: Arc<str>) {
        self.global_dependencies.add_text(text.clone());
        self.global_env.add_text(text.clone());
        self.global_pass_through_env.add_text(text.clone());
        self.global_cache_key.add_text(text.clone());
        if let Some(extends) = &mut self.extends {
            extends.add_text(text.clone());
            extends.value.add_text(text.clone());
        }
        if let Some(tasks) = &mut self.tasks {
            for def in tasks.0.values_mut() {
                def.add_text(text.clone());
                def.value.add_text(text.clone());
            }
        }
        if let Some(pipeline) = &mut self.pipeline {
            pipeline.add_text(text.clone());
        }
        self.env_mode.add_text(text.clone());
        self.cache_dir.add_text(text);
    }

    fn add_path(&mut self, path: Arc<str>) {
        self.global_dependencies.add_path(path.clone());
        self.global_env.add_path(path.clone());
        self.global_pass_through_env.add_path(path.clone());
        self.global_cache_key.add_path(path.clone());
        if let Some(extends) = &mut self.extends {
            extends.add_path(path.clone());
            extends.value.add_path(path.clone());
        }
        if let Some(tasks) = &mut self.tasks {
            for def in tasks.0.values_mut() {
                def.add_path(path.clone());
                def.value.add_path(path.clone());
            }
        }
        if let Some(pipeline) = &mut self.pipeline {
            pipeline.add_path(path.clone());
        }
        self.env_mode.add_path(path.clone());
        self.cache_dir.add_path(path);
    }
}

/// A validated turbo.json.
#[derive(Debug, Default, Clone)]
pub struct TurboJson {
    pub global_deps: Vec<String>,
    pub global_env: Vec<String>,
    pub global_pass_through_env: Option<Vec<String>>,
    pub global_cache_key: Option<String>,
    pub tasks: Pipeline,
    pub extends: Spanned<Vec<String>>,
    pub remote_cache: Option<RawRemoteCacheOptions>,
    pub ui: Option<UIMode>,
    pub env_mode: Option<EnvMode>,
    pub cache_dir: Option<String>,
}

impl TryFrom<RawTurboJson> for TurboJson {
    type Error = Error;

    fn try_from(raw: RawTurboJson) -> Result<Self, Error> {
        let tasks = match (raw.tasks, raw.pipeline) {
            (Some(_), Some(pipeline)) => {
                let (span, text) = pipeline.span_and_text(CONFIG_FILE);
                return Err(Error::PipelineAndTasks { span, text });
            }
            (Some(tasks), None) => tasks,
            (None, Some(pipeline)) => {
                tracing::warn!("\"pipeline\" is deprecated, rename the key to \"tasks\"");
                pipeline.into_inner()
            }
            (None, None) => Pipeline::default(),
        };

        let mut global_env = Vec::new();
        for env_var in raw.global_env.into_iter().flatten() {
            if let Some(stripped) = env_var.strip_prefix('$') {
                let stripped = stripped.to_string();
                let (span, text) = env_var.span_and_text(CONFIG_FILE);
                return Err(Error::InvalidEnvPrefix { stripped, span, text });
            }
            global_env.push(env_var.into_inner());
        }
        global_env.sort();
        global_env.dedup();

        let mut global_deps: Vec<String> = raw
            .global_dependencies
            .into_iter()
            .flatten()
            .map(Spanned::into_inner)
            .collect();
        global_deps.sort();
        global_deps.dedup();

        let global_pass_through_env = raw.global_pass_through_env.map(|vars| {
            let mut vars: Vec<String> = vars.into_iter().map(Spanned::into_inner).collect();
            vars.sort();
            vars.dedup();
            vars
        });

        Ok(TurboJson {
            global_deps,
            global_env,
            global_pass_through_env,
            global_cache_key: raw.global_cache_key.map(Spanned::into_inner),
            tasks,
            extends: raw
                .extends
                .map(|extends| {
                    extends.map(|packages| {
                        packages.into_iter().map(Spanned::into_inner).collect()
                    })
                })
                .unwrap_or_default(),
            remote_cache: raw.remote_cache,
            ui: raw.ui.map(Spanned::into_inner),
            env_mode: raw.env_mode.map(Spanned::into_inner),
            cache_dir: raw.cache_dir.map(Spanned::into_inner),
        })
    }
}

impl TurboJson {
    /// Looks up a task definition: the qualified `pkg#task` key wins over
    /// the bare `task` key.
    pub fn task(&self, task_id: &crate::task_id::TaskId, task_name: &TaskName) -> Option<Spanned<RawTaskDefinition>> {
        match self.tasks.get(&task_id.as_task_name().into_owned()) {
            Some(entry) => Some(entry.clone()),
            None => self.tasks.get(&task_name.clone().into_owned()).cloned(),
        }
    }

}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_pipeline_is_accepted_as_alias() {
        let raw = parse_raw_turbo_json(r#"{"pipeline": {"build": {}}}"#).unwrap();
        let turbo_json = TurboJson::try_from(raw).unwrap();
        assert!(turbo_json.tasks.contains_key(&TaskName::from("build")));
    }

    #[test]
    fn test_tasks_and_pipeline_conflict() {
        let raw =
            parse_raw_turbo_json(r#"{"tasks": {"build": {}}, "pipeline": {"build": {}}}"#).unwrap();
        assert!(matches!(
            TurboJson::try_from(raw),
            Err(Error::PipelineAndTasks { .. })
        ));
    }

    #[test]
    fn test_dollar_prefixed_global_env_rejected() {
        let raw = parse_raw_turbo_json(r#"{"globalEnv": ["$API_KEY"]}"#).unwrap();
        let err = TurboJson::try_from(raw).unwrap_err();
        assert!(matches!(err, Error::InvalidEnvPrefix { .. }));
    }

    #[test]
    fn test_global_lists_are_sorted_and_deduped() {
        let raw = parse_raw_turbo_json(
            r#"{"globalEnv": ["ZED", "ALPHA", "ZED"], "globalDependencies": ["b.txt", "a.txt"]}"#,
        )
        .unwrap();
        let turbo_json = TurboJson::try_from(raw).unwrap();
        assert_eq!(turbo_json.global_env, vec!["ALPHA", "ZED"]);
        assert_eq!(turbo_json.global_deps, vec!["a.txt", "b.txt"]);
    }

    #[test]
    fn test_qualified_task_lookup_wins() {
        let raw = parse_raw_turbo_json(
            r#"{"tasks": {"build": {"cache": true}, "web#build": {"cache": false}}}"#,
        )
        .unwrap();
        let turbo_json = TurboJson::try_from(raw).unwrap();
        let task_id = crate::task_id::TaskId::new("web", "build");
        let def = turbo_json
            .task(&task_id, &TaskName::from("build"))
            .unwrap();
        assert_eq!(def.cache.as_ref().map(|c| *c.as_inner()), Some(false));
    }
}
