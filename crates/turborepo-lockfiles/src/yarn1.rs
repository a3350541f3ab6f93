use std::collections::HashMap;

use crate::{Error, Lockfile, Package};

type Map<K, V> = std::collections::BTreeMap<K, V>;

/// yarn.lock v1. The format is line-oriented: an unindented line lists the
/// descriptors an entry satisfies ("name@range", comma separated), followed
/// by indented `version`, `resolved`, `integrity` fields and optional
/// `dependencies:` / `optionalDependencies:` blocks.
#[derive(Debug, Default)]
pub struct Yarn1Lockfile {
    entries: Map<String, Entry>,
}

#[derive(Debug, Default, Clone, PartialEq)]
struct Entry {
    version: String,
    dependencies: Map<String, String>,
    optional_dependencies: Map<String, String>,
}

impl Entry {
    fn all_deps(&self) -> impl Iterator<Item = (&String, &String)> {
        self.dependencies.iter().chain(self.optional_dependencies.iter())
    }
}

enum Section {
    None,
    Dependencies,
    OptionalDependencies,
}

impl Yarn1Lockfile {
    pub fn from_bytes(input: &[u8]) -> Result<Self, Error> {
        let input = std::str::from_utf8(input).map_err(|_| Error::Yarn1Parse {
            line: 0,
            message: "lockfile is not valid utf8".into(),
        })?;
        Self::from_str(input)
    }

    pub fn from_str(input: &str) -> Result<Self, Error> {
        let mut entries = Map::new();
        let mut current_keys: Vec<String> = Vec::new();
        let mut current = Entry::default();
        let mut section = Section::None;

        let mut flush = |keys: &mut Vec<String>, entry: &mut Entry| {
            for key in keys.drain(..) {
                entries.insert(key, entry.clone());
            }
            *entry = Entry::default();
        };

        for (index, line) in input.lines().enumerate() {
            let line_no = index + 1;
            if line.trim().is_empty() || line.trim_start().starts_with('#') {
                continue;
            }

            let indent = line.len() - line.trim_start().len();
            let trimmed = line.trim();

            if indent == 0 {
                // New entry header; flush the previous one.
                flush(&mut current_keys, &mut current);
                section = Section::None;
                let header = trimmed.strip_suffix(':').ok_or_else(|| Error::Yarn1Parse {
                    line: line_no,
                    message: format!("expected descriptor line ending in ':', got '{trimmed}'"),
                })?;
                current_keys = header
                    .split(", ")
                    .map(|descriptor| unquote(descriptor).to_string())
                    .collect();
            } else if indent == 2 {
                match trimmed {
                    "dependencies:" => section = Section::Dependencies,
                    "optionalDependencies:" => section = Section::OptionalDependencies,
                    _ => {
                        section = Section::None;
                        if let Some((key, value)) = split_field(trimmed) {
                            if key == "version" {
                                current.version = value.to_string();
                            }
                            // resolved/integrity don't feed the closure
                        }
                    }
                }
            } else {
                // A dependency line inside a dependencies block.
                let (name, range) = split_field(trimmed).ok_or_else(|| Error::Yarn1Parse {
                    line: line_no,
                    message: format!("malformed dependency line '{trimmed}'"),
                })?;
                match section {
                    Section::Dependencies => {
                        current.dependencies.insert(name.to_string(), range.to_string());
                    }
                    Section::OptionalDependencies => {
                        current
                            .optional_dependencies
                            .insert(name.to_string(), range.to_string());
                    }
                    Section::None => {
                        return Err(Error::Yarn1Parse {
                            line: line_no,
                            message: "indented line outside of a dependencies block".into(),
                        });
                    }
                }
            }
        }
        flush(&mut current_keys, &mut current);

        Ok(Self { entries })
    }
}

/// Strips surrounding double quotes if present.
fn unquote(s: &str) -> &str {
    s.strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .unwrap_or(s)
}

/// Splits `key "value"` or `"key" "value"` lines.
fn split_field(line: &str) -> Option<(&str, &str)> {
    let (key, value) = line.split_once(' ')?;
    Some((unquote(key), unquote(value)))
}

impl Lockfile for Yarn1Lockfile {
    fn resolve_package(
        &self,
        _workspace_path: &str,
        name: &str,
        version: &str,
    ) -> Result<Option<Package>, Error> {
        for key in [format!("{name}@{version}"), format!("{name}@npm:{version}")] {
            if let Some(entry) = self.entries.get(&key) {
                return Ok(Some(Package {
                    key,
                    version: entry.version.clone(),
                }));
            }
        }
        Ok(None)
    }

    fn all_dependencies(&self, key: &str) -> Result<Option<HashMap<String, String>>, Error> {
        let Some(entry) = self.entries.get(key) else {
            return Ok(None);
        };
        Ok(Some(
            entry
                .all_deps()
                .map(|(name, range)| (name.clone(), range.clone()))
                .collect(),
        ))
    }

    fn subgraph(
        &self,
        _workspace_packages: &[String],
        packages: &[String],
    ) -> Result<Box<dyn Lockfile>, Error> {
        let entries = packages
            .iter()
            .filter_map(|key| {
                self.entries
                    .get(key)
                    .map(|entry| (key.clone(), entry.clone()))
            })
            .collect();
        Ok(Box::new(Self { entries }))
    }

    fn encode(&self) -> Result<Vec<u8>, Error> {
        let mut out = String::from("# THIS IS AN AUTOGENERATED FILE. DO NOT EDIT THIS FILE DIRECTLY.\n# yarn lockfile v1\n\n");
        for (key, entry) in &self.entries {
            out.push_str(&format!("\"{key}\":\n  version \"{}\"\n", entry.version));
            if !entry.dependencies.is_empty() {
                out.push_str("  dependencies:\n");
                for (name, range) in &entry.dependencies {
                    out.push_str(&format!("    \"{name}\" \"{range}\"\n"));
                }
            }
            if !entry.optional_dependencies.is_empty() {
                out.push_str("  optionalDependencies:\n");
                for (name, range) in &entry.optional_dependencies {
                    out.push_str(&format!("    \"{name}\" \"{range}\"\n"));
                }
            }
            out.push('\n');
        }
        Ok(out.into_bytes())
    }

    fn global_change_key(&self) -> Vec<u8> {
        // yarn1 has no lockfile-wide version or settings that would
        // invalidate unrelated packages.
        vec![b'y', b'a', b'r', b'n', b'1', 0]
    }
}
