use std::{borrow::Cow, fmt};

use serde::Serialize;
use turborepo_repository::package_graph::ROOT_PKG_NAME;

pub const TASK_DELIMITER: &str = "#";

/// A task identifier: the package it runs in plus the script name.
/// Rendered as `package#task`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId<'a> {
    package: Cow<'a, str>,
    task: Cow<'a, str>,
}

/// A task name as written in configuration: either bare (`build`), meaning
/// the task in every package that has it, or package-qualified
/// (`web#build`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskName<'a> {
    package: Option<Cow<'a, str>>,
    task: Cow<'a, str>,
}

// Both render to their display form so they can serve as JSON map keys.
impl Serialize for TaskId<'_> {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl Serialize for TaskName<'_> {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("'{input}' is not a task id, task ids must be of the form package{TASK_DELIMITER}task")]
pub struct TaskIdError<'a> {
    input: &'a str,
}

impl<'a> TaskId<'a> {
    pub fn new(package: &'a str, task: &'a str) -> Self {
        debug_assert!(!task.contains(TASK_DELIMITER), "tasks contain no '#'");
        TaskId {
            package: package.into(),
            task: task.into(),
        }
    }

    pub fn from_static(package: String, task: String) -> TaskId<'static> {
        TaskId {
            package: package.into(),
            task: task.into(),
        }
    }

    pub fn package(&self) -> &str {
        &self.package
    }

    pub fn task(&self) -> &str {
        &self.task
    }

    pub fn in_workspace(&self, workspace: &str) -> bool {
        self.package == workspace
    }

    pub fn to_workspace_name(&self) -> turborepo_repository::package_graph::PackageName {
        turborepo_repository::package_graph::PackageName::from(self.package.as_ref())
    }

    pub fn as_task_name(&self) -> TaskName<'_> {
        TaskName {
            package: Some(self.package.as_ref().into()),
            task: self.task.as_ref().into(),
        }
    }

    /// The bare task name, e.g. for looking up the script in a manifest.
    pub fn as_non_workspace_task_name(&self) -> TaskName<'_> {
        TaskName {
            package: None,
            task: self.task.as_ref().into(),
        }
    }

    pub fn into_owned(self) -> TaskId<'static> {
        let TaskId { package, task } = self;
        TaskId {
            package: package.into_owned().into(),
            task: task.into_owned().into(),
        }
    }
}

impl fmt::Display for TaskId<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{TASK_DELIMITER}{}", self.package, self.task)
    }
}

impl<'a> TryFrom<&'a str> for TaskId<'a> {
    type Error = TaskIdError<'a>;

    fn try_from(input: &'a str) -> Result<Self, Self::Error> {
        match input.split_once(TASK_DELIMITER) {
            Some(("", _)) | None => Err(TaskIdError { input }),
            Some((package, task)) => Ok(TaskId {
                package: package.into(),
                task: task.into(),
            }),
        }
    }
}

impl<'a> TaskName<'a> {
    pub fn package(&self) -> Option<&str> {
        self.package.as_deref()
    }

    pub fn task(&self) -> &str {
        &self.task
    }

    pub fn is_package_task(&self) -> bool {
        self.package.is_some()
    }

    /// The task id, when the name is package-qualified.
    pub fn task_id(&self) -> Option<TaskId<'_>> {
        let package: &str = self.package.as_deref()?;
        let task: &str = &self.task;
        Some(TaskId {
            package: package.into(),
            task: task.into(),
        })
    }

    pub fn into_non_workspace_task(self) -> TaskName<'a> {
        TaskName {
            package: None,
            task: self.task,
        }
    }

    pub fn into_root_task(self) -> TaskName<'static> {
        TaskName {
            package: Some(ROOT_PKG_NAME.to_string().into()),
            task: self.task.into_owned().into(),
        }
    }

    pub fn in_workspace(&self, workspace: &str) -> bool {
        match &self.package {
            Some(package) => package == workspace,
            None => true,
        }
    }

    pub fn into_owned(self) -> TaskName<'static> {
        let TaskName { package, task } = self;
        TaskName {
            package: package.map(|p| p.into_owned().into()),
            task: task.into_owned().into(),
        }
    }
}

impl fmt::Display for TaskName<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.package {
            Some(package) => write!(f, "{package}{TASK_DELIMITER}{}", self.task),
            None => self.task.fmt(f),
        }
    }
}

impl<'a> From<&'a str> for TaskName<'a> {
    fn from(input: &'a str) -> Self {
        match input.split_once(TASK_DELIMITER).filter(|(package, _)| !package.is_empty()) {
            Some((package, task)) => TaskName {
                package: Some(package.into()),
                task: task.into(),
            },
            None => TaskName {
                package: None,
                task: input.into(),
            },
        }
    }
}

impl From<String> for TaskName<'static> {
    fn from(input: String) -> Self {
        let copy: TaskName<'_> = input.as_str().into();
        copy.into_owned()
    }
}

impl<'a> From<TaskId<'a>> for TaskName<'a> {
    fn from(id: TaskId<'a>) -> Self {
        TaskName {
            package: Some(id.package),
            task: id.task,
        }
    }
}

#[cfg(test)]
mod test {
    use test_case::test_case;

    use super::*;

    #[test_case("build", None, "build" ; "bare")]
    #[test_case("web#build", Some("web"), "build" ; "qualified")]
    #[test_case("//#build", Some("//"), "build" ; "root")]
    fn test_task_name_parsing(input: &str, package: Option<&str>, task: &str) {
        let name = TaskName::from(input);
        assert_eq!(name.package(), package);
        assert_eq!(name.task(), task);
    }

    #[test]
    fn test_task_id_round_trip() {
        let id = TaskId::try_from("web#build").unwrap();
        assert_eq!(id.package(), "web");
        assert_eq!(id.task(), "build");
        assert_eq!(id.to_string(), "web#build");
    }

    #[test]
    fn test_bad_task_ids() {
        assert!(TaskId::try_from("build").is_err());
        assert!(TaskId::try_from("#build").is_err());
    }

    #[test]
    fn test_in_workspace() {
        let bare = TaskName::from("build");
        assert!(bare.in_workspace("web"));
        let qualified = TaskName::from("web#build");
        assert!(qualified.in_workspace("web"));
        assert!(!qualified.in_workspace("docs"));
    }
}
