use std::str::FromStr;

use regex::Regex;
use turbopath::AnchoredSystemPathBuf;

/// A git range inside a selector: `[ref]` compares the ref against the
/// working tree (uncommitted changes included), `[a...b]` compares two refs.
#[derive(Debug, Default, PartialEq)]
pub struct GitRange {
    pub from_ref: String,
    pub to_ref: Option<String>,
    pub include_uncommitted: bool,
}

/// One parsed `--filter` expression.
#[derive(Debug, Default, PartialEq)]
pub struct TargetSelector {
    pub include_dependencies: bool,
    pub include_dependents: bool,
    pub exclude: bool,
    pub exclude_self: bool,
    pub parent_dir: Option<AnchoredSystemPathBuf>,
    pub name_pattern: String,
    pub git_range: Option<GitRange>,
    pub raw: String,
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum InvalidSelectorError {
    #[error("invalid anchored path: {0}")]
    InvalidAnchoredPath(String),
    #[error("empty path specification")]
    EmptyPathSpecification,
    #[error("invalid git range selector: {0}")]
    InvalidGitRange(String),
    #[error("selector \"{0}\" must have a reference, directory, or name pattern")]
    InvalidSelector(String),
}

impl FromStr for TargetSelector {
    type Err = InvalidSelectorError;

    fn from_str(raw_selector: &str) -> Result<Self, Self::Err> {
        let (exclude, selector) = match raw_selector.strip_prefix('!') {
            Some(rest) => (true, rest),
            None => (false, raw_selector),
        };

        let mut exclude_self = false;
        let (include_dependencies, selector) = match selector.strip_suffix("...") {
            Some(rest) => match rest.strip_suffix('^') {
                Some(rest) => {
                    exclude_self = true;
                    (true, rest)
                }
                None => (true, rest),
            },
            None => (false, selector),
        };
        let (include_dependents, selector) = match selector.strip_prefix("...") {
            Some(rest) => match rest.strip_prefix('^') {
                Some(rest) => {
                    exclude_self = true;
                    (true, rest)
                }
                None => (true, rest),
            },
            None => (false, selector),
        };

        // name, optional {directory}, optional [git range]
        let re = Regex::new(
            r"^(?P<name>[^.{}\[\]](?:[^{}\[\]]*[^{}\[\].])?)?(\{(?P<directory>[^}]*)\})?(?P<commits>\[[^\]]*\])?$",
        )
        .expect("selector regex is valid");

        let Some(captures) = re.captures(selector) else {
            // a raw path selector such as "./apps/web"
            return match parse_path_selector(selector) {
                Some(parent_dir) => Ok(TargetSelector {
                    exclude,
                    exclude_self,
                    include_dependencies,
                    include_dependents,
                    parent_dir: Some(parent_dir?),
                    raw: raw_selector.to_string(),
                    ..Default::default()
                }),
                None => Ok(TargetSelector {
                    exclude,
                    exclude_self,
                    include_dependencies,
                    include_dependents,
                    name_pattern: selector.to_string(),
                    raw: raw_selector.to_string(),
                    ..Default::default()
                }),
            };
        };

        let name_pattern = captures
            .name("name")
            .map_or(String::new(), |m| m.as_str().to_string());

        // "./path" forms are matched as names by the regex; reroute them
        if let Some(parent_dir) = parse_path_selector(&name_pattern) {
            return Ok(TargetSelector {
                exclude,
                exclude_self,
                include_dependencies,
                include_dependents,
                parent_dir: Some(parent_dir?),
                raw: raw_selector.to_string(),
                ..Default::default()
            });
        }

        let parent_dir = match captures.name("directory") {
            Some(directory) if directory.as_str().is_empty() => {
                return Err(InvalidSelectorError::EmptyPathSpecification)
            }
            Some(directory) => {
                let cleaned = path_clean::clean(std::path::Path::new(directory.as_str()));
                Some(
                    AnchoredSystemPathBuf::from_system_path(&cleaned).map_err(|_| {
                        InvalidSelectorError::InvalidAnchoredPath(directory.as_str().to_string())
                    })?,
                )
            }
            None => None,
        };

        let git_range = match captures.name("commits") {
            Some(commits) => {
                let inner = commits
                    .as_str()
                    .strip_prefix('[')
                    .and_then(|s| s.strip_suffix(']'))
                    .expect("regex guarantees brackets");
                if inner.is_empty() {
                    return Err(InvalidSelectorError::InvalidGitRange(inner.to_string()));
                }
                Some(match inner.split_once("...") {
                    Some((from, to)) => {
                        if from.is_empty() || to.is_empty() {
                            return Err(InvalidSelectorError::InvalidGitRange(inner.to_string()));
                        }
                        GitRange {
                            from_ref: from.to_string(),
                            to_ref: Some(to.to_string()),
                            include_uncommitted: false,
                        }
                    }
                    // an open range includes uncommitted changes
                    None => GitRange {
                        from_ref: inner.to_string(),
                        to_ref: None,
                        include_uncommitted: true,
                    },
                })
            }
            None => None,
        };

        if name_pattern.is_empty() && parent_dir.is_none() && git_range.is_none() {
            return Err(InvalidSelectorError::InvalidSelector(
                raw_selector.to_string(),
            ));
        }

        Ok(TargetSelector {
            exclude,
            exclude_self,
            include_dependencies,
            include_dependents,
            parent_dir,
            name_pattern,
            git_range,
            raw: raw_selector.to_string(),
        })
    }
}

fn parse_path_selector(
    selector: &str,
) -> Option<Result<AnchoredSystemPathBuf, InvalidSelectorError>> {
    let exact_matches = [".", ".."];
    let prefixes = ["./", ".\\", "../", "..\\"];
    if exact_matches.contains(&selector)
        || prefixes.iter().any(|prefix| selector.starts_with(prefix))
    {
        let cleaned = path_clean::clean(std::path::Path::new(selector));
        Some(
            AnchoredSystemPathBuf::from_system_path(&cleaned)
                .map_err(|_| InvalidSelectorError::InvalidAnchoredPath(selector.to_string())),
        )
    } else {
        None
    }
}
