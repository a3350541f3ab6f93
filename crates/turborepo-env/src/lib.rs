#![deny(clippy::all)]

use std::{
    collections::HashMap,
    env,
    ops::{Deref, DerefMut},
};

use regex::Regex;
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Clone, Debug, Error)]
pub enum Error {
    #[error("Failed to parse regex: {0}")]
    Regex(#[from] regex::Error),
}

/// A snapshot of environment variables. The full environment is captured once
/// at startup; every later consumer works against that snapshot.
#[derive(Clone, Debug, Default, Serialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct EnvironmentVariableMap(HashMap<String, String>);

/// A list of "k=v" strings for env variables and their values
pub type EnvironmentVariablePairs = Vec<String>;

/// A pair of maps selected by wildcard patterns: what the inclusion patterns
/// matched and what the `!`-prefixed exclusion patterns matched. User
/// exclusions take primacy over inclusions when resolved.
#[derive(Debug)]
pub struct WildcardMaps {
    pub inclusions: EnvironmentVariableMap,
    pub exclusions: EnvironmentVariableMap,
}

impl WildcardMaps {
    fn resolve(self) -> EnvironmentVariableMap {
        let mut output = self.inclusions;
        output.difference(&self.exclusions);
        output
    }
}

/// Environment variables broken down by how they were selected.
#[derive(Debug, Serialize)]
pub struct BySource {
    pub explicit: EnvironmentVariableMap,
    pub matching: EnvironmentVariableMap,
}

/// The composite map plus its by-source breakdown. `all` feeds the hasher,
/// `by_source` feeds dry runs and the run summary.
#[derive(Debug, Serialize)]
pub struct DetailedMap {
    pub all: EnvironmentVariableMap,
    pub by_source: BySource,
}

impl From<HashMap<String, String>> for EnvironmentVariableMap {
    fn from(map: HashMap<String, String>) -> Self {
        EnvironmentVariableMap(map)
    }
}

impl Deref for EnvironmentVariableMap {
    type Target = HashMap<String, String>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for EnvironmentVariableMap {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl EnvironmentVariableMap {
    pub fn infer() -> Self {
        EnvironmentVariableMap(env::vars().collect())
    }

    pub fn into_inner(self) -> HashMap<String, String> {
        self.0
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.keys().cloned().collect();
        names.sort();
        names
    }

    /// Sorted "k=v" pairs, the form that enters a hash.
    pub fn to_hashable(&self) -> EnvironmentVariablePairs {
        let mut pairs: Vec<_> = self.iter().map(|(k, v)| format!("{k}={v}")).collect();
        pairs.sort();
        pairs
    }

    /// Sorted "k=sha256(v)" pairs. Values never enter the hash or the run
    /// summary in the clear; an unset or empty value gets an empty marker.
    pub fn to_secret_hashable(&self) -> EnvironmentVariablePairs {
        let mut pairs: Vec<_> = self
            .iter()
            .map(|(k, v)| {
                if v.is_empty() {
                    format!("{k}=")
                } else {
                    let mut hasher = Sha256::new();
                    hasher.update(v.as_bytes());
                    format!("{k}={}", hex::encode(hasher.finalize()))
                }
            })
            .collect();
        pairs.sort();
        pairs
    }

    /// Adds `another` into `self`, overwriting existing values.
    pub fn union(&mut self, another: &EnvironmentVariableMap) {
        for (key, value) in &another.0 {
            self.0.insert(key.clone(), value.clone());
        }
    }

    /// Removes keys found in `another` from `self`.
    pub fn difference(&mut self, another: &EnvironmentVariableMap) {
        for key in another.0.keys() {
            self.0.remove(key);
        }
    }

    fn wildcard_map_from_wildcards(
        &self,
        wildcard_patterns: &[impl AsRef<str>],
    ) -> Result<WildcardMaps, regex::Error> {
        let mut output = WildcardMaps {
            inclusions: EnvironmentVariableMap::default(),
            exclusions: EnvironmentVariableMap::default(),
        };

        let mut include_patterns = Vec::new();
        let mut exclude_patterns = Vec::new();

        for wildcard_pattern in wildcard_patterns {
            let wildcard_pattern = wildcard_pattern.as_ref();
            if let Some(rest) = wildcard_pattern.strip_prefix('!') {
                exclude_patterns.push(wildcard_to_regex_pattern(rest));
            } else if let Some(rest) = wildcard_pattern.strip_prefix("\\!") {
                // A literal leading bang.
                include_patterns.push(wildcard_to_regex_pattern(&format!("!{rest}")));
            } else {
                include_patterns.push(wildcard_to_regex_pattern(wildcard_pattern));
            }
        }

        let include_regex = Regex::new(&format!("^({})$", include_patterns.join("|")))?;
        let exclude_regex = Regex::new(&format!("^({})$", exclude_patterns.join("|")))?;
        for (env_var, env_value) in &self.0 {
            if !include_patterns.is_empty() && include_regex.is_match(env_var) {
                output.inclusions.insert(env_var.clone(), env_value.clone());
            }
            if !exclude_patterns.is_empty() && exclude_regex.is_match(env_var) {
                output.exclusions.insert(env_var.clone(), env_value.clone());
            }
        }

        Ok(output)
    }

    /// Returns the variables in `self` matched by the wildcard patterns,
    /// after applying `!` exclusions.
    pub fn from_wildcards(
        &self,
        wildcard_patterns: &[impl AsRef<str>],
    ) -> Result<EnvironmentVariableMap, Error> {
        if wildcard_patterns.is_empty() {
            return Ok(EnvironmentVariableMap::default());
        }
        Ok(self.wildcard_map_from_wildcards(wildcard_patterns)?.resolve())
    }

    /// Like `from_wildcards` but keeps inclusions and exclusions separate so
    /// callers can give user exclusions primacy over inferred inclusions.
    pub fn wildcard_map_from_wildcards_unresolved(
        &self,
        wildcard_patterns: &[impl AsRef<str>],
    ) -> Result<WildcardMaps, Error> {
        if wildcard_patterns.is_empty() {
            return Ok(WildcardMaps {
                inclusions: EnvironmentVariableMap::default(),
                exclusions: EnvironmentVariableMap::default(),
            });
        }
        Ok(self.wildcard_map_from_wildcards(wildcard_patterns)?)
    }
}

const WILDCARD: char = '*';
const WILDCARD_ESCAPE: char = '\\';
const REGEX_WILDCARD_SEGMENT: &str = ".*";

fn wildcard_to_regex_pattern(pattern: &str) -> String {
    let mut regex_string = Vec::new();
    let mut previous_index = 0;
    let mut previous_char: Option<char> = None;

    for (i, char) in pattern.char_indices() {
        if char == WILDCARD {
            if previous_char == Some(WILDCARD_ESCAPE) {
                // A literal "*": replace the trailing "\*" with "*" before
                // escaping the segment.
                regex_string.push(regex::escape(&format!(
                    "{}*",
                    &pattern[previous_index..(i - 1)]
                )));
            } else {
                // Static segment since the last wildcard; can be zero length.
                regex_string.push(regex::escape(&pattern[previous_index..i]));
                // Collapse adjacent dynamic segments.
                if regex_string.last().map(String::as_str) != Some(REGEX_WILDCARD_SEGMENT) {
                    regex_string.push(REGEX_WILDCARD_SEGMENT.to_string());
                }
            }
            previous_index = i + 1;
        }
        previous_char = Some(char);
    }

    regex_string.push(regex::escape(&pattern[previous_index..]));
    regex_string.join("")
}

/// Resolves the run-wide hashable env vars: explicit names plus wildcard
/// matches, with `!` exclusions winning over inclusions.
pub fn get_global_hashable_env_vars(
    env_at_execution_start: &EnvironmentVariableMap,
    global_env: &[String],
) -> Result<DetailedMap, Error> {
    let user_env_var_set =
        env_at_execution_start.wildcard_map_from_wildcards_unresolved(global_env)?;

    let mut all_env_var_map = EnvironmentVariableMap::default();
    all_env_var_map.union(&user_env_var_set.inclusions);
    all_env_var_map.difference(&user_env_var_set.exclusions);

    let explicit_names: Vec<&String> = global_env
        .iter()
        .filter(|name| !name.contains(WILDCARD) && !name.starts_with('!'))
        .collect();
    let mut explicit_env_var_map = EnvironmentVariableMap::default();
    for name in explicit_names {
        if let Some(value) = all_env_var_map.get(name) {
            explicit_env_var_map.insert(name.clone(), value.clone());
        }
    }

    let mut matching_env_var_map = all_env_var_map.clone();
    matching_env_var_map.difference(&explicit_env_var_map);

    Ok(DetailedMap {
        all: all_env_var_map,
        by_source: BySource {
            explicit: explicit_env_var_map,
            matching: matching_env_var_map,
        },
    })
}
