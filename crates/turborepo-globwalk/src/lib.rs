//! Glob walking over an absolute base path with inclusion and exclusion
//! patterns. Used for workspace discovery and for enumerating task input
//! files.

#![deny(clippy::all)]

use std::{borrow::Cow, collections::HashSet, io::ErrorKind};

use itertools::Itertools;
use path_slash::PathExt;
use turbopath::{AbsoluteSystemPath, AbsoluteSystemPathBuf, PathError};
use wax::{Any, Glob, Pattern};

#[derive(Debug, PartialEq, Clone, Copy)]
pub enum WalkType {
    Files,
    Folders,
    All,
}

impl WalkType {
    fn should_emit(&self, is_dir: bool) -> bool {
        match self {
            WalkType::Files => !is_dir,
            WalkType::Folders => is_dir,
            WalkType::All => true,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WalkError {
    // wax 0.5 carries a lifetime in BuildError, so stringify eagerly
    #[error("bad glob pattern {0}: {1}")]
    BadPattern(String, String),
    #[error("path is not valid unicode")]
    InvalidPath,
    #[error("walk error: {0}")]
    WalkError(#[from] walkdir::Error),
    #[error(transparent)]
    Path(#[from] PathError),
}

/// wax rejects `**` adjacent to anything but a separator. Rewrites the
/// offending segments: `**.js` becomes `**/*.js`, `foo**` becomes `foo*/**`.
/// Windows separators are normalized first.
pub fn fix_glob_pattern(pattern: &str) -> String {
    let pattern = pattern.replace('\\', "/");
    let mut segments = Vec::new();
    for segment in pattern.split('/') {
        if segment == "**" || !segment.contains("**") {
            segments.push(segment.to_string());
            continue;
        }
        let (head, tail) = segment.split_once("**").expect("segment contains **");
        if !head.is_empty() {
            segments.push(format!("{head}*"));
        }
        segments.push("**".to_string());
        if !tail.is_empty() {
            // the tail may itself contain another doublestar
            let fixed_tail = fix_glob_pattern(&format!("*{tail}"));
            segments.push(fixed_tail);
        }
    }
    segments.join("/")
}

/// An `Any` matcher that matches everything when built from no patterns.
struct InclusiveEmptyAny<'a>(Option<Any<'a>>);

impl<'a> InclusiveEmptyAny<'a> {
    fn new(globs: Vec<Glob<'a>>, text: &[String]) -> Result<Self, WalkError> {
        if globs.is_empty() {
            Ok(Self(None))
        } else {
            Ok(Self(Some(wax::any::<Glob<'_>, _>(globs).map_err(|e| {
                WalkError::BadPattern(text.iter().join(","), e.to_string())
            })?)))
        }
    }

    fn is_match(&self, path: &str) -> bool {
        self.0.as_ref().map_or(true, |any| any.is_match(path))
    }
}

fn compile_glob(raw: &str) -> Result<Glob<'static>, WalkError> {
    Glob::new(raw)
        .map(Glob::into_owned)
        .map_err(|e| WalkError::BadPattern(raw.to_string(), e.to_string()))
}

fn join_unix_like_paths(a: &str, b: &str) -> String {
    [a.trim_end_matches('/'), "/", b.trim_start_matches('/')].concat()
}

/// Collapses `.` and `..` segments. Returns `None` when the path would
/// traverse above its root.
fn collapse_path(path: &str) -> Option<Cow<'_, str>> {
    let mut stack: Vec<&str> = vec![];
    let mut changed = false;
    let is_root = path.starts_with('/');

    for segment in path.trim_start_matches('/').split('/') {
        match segment {
            ".." => {
                stack.pop()?;
                changed = true;
            }
            "." => changed = true,
            _ => stack.push(segment),
        }
    }

    if !changed {
        Some(Cow::Borrowed(path))
    } else if is_root {
        Some(Cow::Owned(format!("/{}", stack.join("/"))))
    } else {
        Some(Cow::Owned(stack.join("/")))
    }
}

/// Prepends the base path to each glob and expands exclusions so that an
/// excluded directory also excludes everything beneath it.
fn preprocess_paths_and_globs(
    base_path: &AbsoluteSystemPath,
    include: &[String],
    exclude: &[String],
) -> Result<(Vec<String>, Vec<String>), WalkError> {
    let base_path_slash = base_path
        .as_std_path()
        .to_slash()
        // ':' is a valid token in unix paths but a glob separator on windows drives
        .map(|s| s.replace(':', "\\:"))
        .ok_or(WalkError::InvalidPath)?;

    let include_paths = include
        .iter()
        .map(|s| fix_glob_pattern(s))
        .map(|s| join_unix_like_paths(&base_path_slash, &s))
        .filter_map(|s| collapse_path(&s).map(|s| s.into_owned()))
        .collect::<Vec<_>>();

    let mut exclude_paths = vec![];
    for glob in exclude
        .iter()
        .map(|s| fix_glob_pattern(s))
        .map(|s| join_unix_like_paths(&base_path_slash, &s))
        .filter_map(|s| collapse_path(&s).map(|s| s.into_owned()))
    {
        // An excluded path also excludes its subtree.
        if let Some(stripped) = glob.strip_suffix('/') {
            if stripped.ends_with("**") {
                exclude_paths.push(stripped.to_string());
            } else {
                exclude_paths.push(format!("{glob}**"));
            }
        } else if glob.ends_with("/**") {
            exclude_paths.push(glob);
        } else {
            exclude_paths.push(format!("{glob}/**"));
            exclude_paths.push(glob);
        }
    }

    Ok((include_paths, exclude_paths))
}

/// Walks `base_path`, yielding paths matched by `include` (everything, when
/// empty) and not matched by `exclude`. Excluded directories are pruned from
/// traversal; symlinks are yielded but never followed.
pub fn globwalk(
    base_path: &AbsoluteSystemPath,
    include: &[String],
    exclude: &[String],
    walk_type: WalkType,
) -> Result<HashSet<AbsoluteSystemPathBuf>, WalkError> {
    let (include_paths, exclude_paths) =
        preprocess_paths_and_globs(base_path, include, exclude)?;

    let include_globs = include_paths
        .iter()
        .map(|raw| compile_glob(raw))
        .collect::<Result<Vec<_>, _>>()?;
    let exclude_globs = exclude_paths
        .iter()
        .map(|raw| compile_glob(raw))
        .collect::<Result<Vec<_>, _>>()?;

    let include_matcher = InclusiveEmptyAny::new(include_globs, &include_paths)?;
    let exclude_matcher = InclusiveEmptyAny::new(exclude_globs, &exclude_paths)?;
    let has_exclusions = !exclude_paths.is_empty();

    let mut results = HashSet::new();
    let mut iter = walkdir::WalkDir::new(base_path.as_std_path())
        .follow_links(false)
        .into_iter();

    loop {
        let Some(entry) = iter.next() else {
            break;
        };
        let (is_symlink, path) = match entry {
            Ok(entry) => (entry.path_is_symlink(), entry.into_path()),
            Err(err) => match (err.io_error(), err.path()) {
                // yield broken symlinks rather than failing the walk
                (Some(io_err), Some(path))
                    if io_err.kind() == ErrorKind::NotFound && path.is_symlink() =>
                {
                    (true, path.to_owned())
                }
                _ => return Err(err.into()),
            },
        };

        let Some(path_unix) = path.to_slash() else {
            continue;
        };
        let is_directory = !is_symlink && path.is_dir();

        let excluded = has_exclusions && exclude_matcher.is_match(path_unix.as_ref());
        if (excluded || is_symlink) && is_directory {
            iter.skip_current_dir();
        }
        if excluded {
            continue;
        }

        if include_matcher.is_match(path_unix.as_ref()) && walk_type.should_emit(is_directory) {
            results.insert(AbsoluteSystemPathBuf::try_from(path.as_path())?);
        }
    }

    Ok(results)
}

#[cfg(test)]
mod test {
    use test_case::test_case;

    use super::*;

    #[test_case("**", "**" ; "bare doublestar")]
    #[test_case("**/*.js", "**/*.js" ; "already valid")]
    #[test_case("**.js", "**/*.js" ; "doublestar extension")]
    #[test_case("dist**", "dist*/**" ; "trailing doublestar")]
    #[test_case("a/**b/c", "a/**/*b/c" ; "doublestar prefixing segment")]
    fn test_fix_glob_pattern(input: &str, expected: &str) {
        assert_eq!(fix_glob_pattern(input), expected);
    }

    #[test_case("a/b/../c", Some("a/c") ; "dotdot")]
    #[test_case("a/./b", Some("a/b") ; "dot")]
    #[test_case("../a", None ; "escape")]
    #[test_case("a/b", Some("a/b") ; "unchanged")]
    fn test_collapse_path(input: &str, expected: Option<&str>) {
        assert_eq!(collapse_path(input).as_deref(), expected);
    }

    fn setup() -> (tempfile::TempDir, AbsoluteSystemPathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let root = AbsoluteSystemPathBuf::try_from(dir.path()).unwrap();
        for file in [
            "package.json",
            "apps/web/package.json",
            "apps/web/src/index.ts",
            "apps/web/node_modules/lodash/package.json",
            "packages/ui/package.json",
            "packages/ui/dist/index.js",
        ] {
            let path = root.join_unix_path(turbopath::RelativeUnixPath::new(file).unwrap());
            path.ensure_dir().unwrap();
            path.create_with_contents("{}").unwrap();
        }
        (dir, root)
    }

    #[test]
    fn test_discovery_walk_excludes_node_modules() {
        let (_dir, root) = setup();
        let found = globwalk(
            &root,
            &["apps/*/package.json".to_string(), "packages/*/package.json".to_string()],
            &["**/node_modules/**".to_string()],
            WalkType::Files,
        )
        .unwrap();
        let mut names: Vec<_> = found
            .iter()
            .map(|p| root.anchor(p).unwrap().to_unix().into_string())
            .collect();
        names.sort();
        assert_eq!(names, vec!["apps/web/package.json", "packages/ui/package.json"]);
    }

    #[test]
    fn test_empty_include_matches_all_files() {
        let (_dir, root) = setup();
        let found = globwalk(&root, &[], &["**/node_modules/**".to_string()], WalkType::Files).unwrap();
        assert_eq!(found.len(), 5);
    }

    #[test]
    fn test_folder_walk() {
        let (_dir, root) = setup();
        let found = globwalk(&root, &["apps/*".to_string()], &[], WalkType::Folders).unwrap();
        assert_eq!(found.len(), 1);
        assert!(found.iter().next().unwrap().as_str().ends_with("web"));
    }
}
