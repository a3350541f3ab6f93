use serde::Serialize;
use turbopath::{AnchoredSystemPathBuf, RelativeUnixPathBuf};
use turborepo_cache::{CacheHitMetadata, CacheSource};

use super::execution::TaskExecutionSummary;
use crate::{task_graph::TaskDefinition, task_id::TaskId};

/// Where (if anywhere) a task's artifact was found, as reported in the run
/// summary and in dry runs.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TaskCacheSummary {
    pub local: bool,
    pub remote: bool,
    pub status: CacheStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_saved: Option<u64>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq)]
#[serde(rename_all = "UPPERCASE")]
pub enum CacheStatus {
    Hit,
    #[default]
    Miss,
}

impl TaskCacheSummary {
    pub fn from_hit(hit: Option<CacheHitMetadata>) -> Self {
        match hit {
            Some(CacheHitMetadata { source, time_saved }) => Self {
                local: source == CacheSource::Local,
                remote: source == CacheSource::Remote,
                status: CacheStatus::Hit,
                time_saved: Some(time_saved),
            },
            None => Self::default(),
        }
    }
}

/// Everything the summary records about one task.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSummary {
    pub task_id: TaskId<'static>,
    pub task: String,
    pub package: String,
    pub hash: String,
    pub inputs: Vec<(RelativeUnixPathBuf, String)>,
    pub hash_of_external_dependencies: String,
    pub cache_state: TaskCacheSummary,
    pub command: String,
    pub outputs: Vec<String>,
    pub excluded_outputs: Vec<String>,
    pub log_file: String,
    pub directory: String,
    pub dependencies: Vec<TaskId<'static>>,
    pub dependents: Vec<TaskId<'static>>,
    pub resolved_task_definition: TaskDefinition,
    pub expanded_outputs: Vec<AnchoredSystemPathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution: Option<TaskExecutionSummary>,
}

impl TaskSummary {
    pub fn exit_code(&self) -> Option<i32> {
        self.execution.as_ref().and_then(|execution| execution.exit_code())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_cache_summary_from_hit() {
        let miss = TaskCacheSummary::from_hit(None);
        assert_eq!(miss.status, CacheStatus::Miss);
        assert!(!miss.local && !miss.remote);

        let local = TaskCacheSummary::from_hit(Some(CacheHitMetadata {
            source: CacheSource::Local,
            time_saved: 100,
        }));
        assert_eq!(local.status, CacheStatus::Hit);
        assert!(local.local);
        assert!(!local.remote);
        assert_eq!(local.time_saved, Some(100));
    }

    #[test]
    fn test_serialized_field_names() {
        let summary = TaskSummary {
            task_id: TaskId::new("web", "build").into_owned(),
            task: "build".to_string(),
            package: "web".to_string(),
            hash: "deadbeef".to_string(),
            inputs: Vec::new(),
            hash_of_external_dependencies: String::new(),
            cache_state: TaskCacheSummary::default(),
            command: "echo building".to_string(),
            outputs: vec!["dist/**".to_string()],
            excluded_outputs: Vec::new(),
            log_file: "packages/web/.turbo/turbo-build.log".to_string(),
            directory: "packages/web".to_string(),
            dependencies: Vec::new(),
            dependents: Vec::new(),
            resolved_task_definition: TaskDefinition::default(),
            expanded_outputs: Vec::new(),
            execution: None,
        };
        let json = serde_json::to_value(&summary).unwrap();
        for field in [
            "taskId",
            "hash",
            "cacheState",
            "command",
            "outputs",
            "dependencies",
            "dependents",
            "resolvedTaskDefinition",
        ] {
            assert!(json.get(field).is_some(), "missing field {field}");
        }
        assert_eq!(json["taskId"], "web#build");
        assert!(json["cacheState"].get("local").is_some());
        assert!(json["cacheState"].get("remote").is_some());
    }
}
