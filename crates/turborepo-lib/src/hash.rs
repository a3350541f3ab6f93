//! Deterministic hashing of run and task inputs.
//!
//! Every hashable value is serialized into a canonical byte stream: fields
//! in a fixed order, strings and lists length-prefixed so that adjacent
//! fields can never alias each other. The digest is SHA-256, truncated to
//! its first 64 bits and rendered as hex, which keeps cache keys short
//! while leaving collisions out of practical reach.

use sha2::{Digest, Sha256};
use turbopath::RelativeUnixPathBuf;
use turborepo_lockfiles::Package;

use crate::cli::EnvMode;

pub trait TurboHash {
    fn hash(&self) -> String;
}

/// Canonical encoder. Length prefixes are big-endian u64s.
struct HashEncoder {
    hasher: Sha256,
}

impl HashEncoder {
    fn new() -> Self {
        Self {
            hasher: Sha256::new(),
        }
    }

    fn write_str(&mut self, s: &str) {
        self.hasher.update((s.len() as u64).to_be_bytes());
        self.hasher.update(s.as_bytes());
    }

    fn write_bool(&mut self, b: bool) {
        self.hasher.update([b as u8]);
    }

    fn write_list<S: AsRef<str>>(&mut self, items: impl IntoIterator<Item = S>) {
        let items: Vec<S> = items.into_iter().collect();
        self.hasher.update((items.len() as u64).to_be_bytes());
        for item in items {
            self.write_str(item.as_ref());
        }
    }

    fn write_pairs<'a>(&mut self, pairs: impl IntoIterator<Item = (&'a str, &'a str)>) {
        let pairs: Vec<_> = pairs.into_iter().collect();
        self.hasher.update((pairs.len() as u64).to_be_bytes());
        for (key, value) in pairs {
            self.write_str(key);
            self.write_str(value);
        }
    }

    fn finish(self) -> String {
        let digest = self.hasher.finalize();
        hex::encode(&digest[..8])
    }
}

impl EnvMode {
    fn discriminator(&self) -> &'static str {
        match self {
            EnvMode::Loose => "loose",
            EnvMode::Strict => "strict",
        }
    }
}

/// The run-wide hash prefix mixed into every task hash.
#[derive(Debug)]
pub struct GlobalHashable {
    pub global_cache_key: String,
    /// glob-matched global file dependencies and their content hashes,
    /// sorted by path
    pub global_file_hash_map: Vec<(RelativeUnixPathBuf, String)>,
    pub root_external_deps_hash: String,
    /// the resolved pipeline, canonically serialized (sorted task keys)
    pub pipeline: String,
    /// declared global env var names, sorted
    pub env: Vec<String>,
    /// resolved global env values as "name=sha256" pairs, sorted
    pub resolved_env_vars: Vec<String>,
    pub pass_through_env: Vec<String>,
    pub env_mode: EnvMode,
    /// the root manifest's engines table, sorted by key
    pub engines: Vec<(String, String)>,
}

impl TurboHash for GlobalHashable {
    fn hash(&self) -> String {
        let mut encoder = HashEncoder::new();
        encoder.write_str(&self.global_cache_key);
        encoder.write_pairs(
            self.global_file_hash_map
                .iter()
                .map(|(path, hash)| (path.as_str(), hash.as_str())),
        );
        encoder.write_str(&self.root_external_deps_hash);
        encoder.write_str(&self.pipeline);
        encoder.write_list(&self.env);
        encoder.write_list(&self.resolved_env_vars);
        encoder.write_list(&self.pass_through_env);
        encoder.write_str(self.env_mode.discriminator());
        encoder.write_pairs(
            self.engines
                .iter()
                .map(|(engine, version)| (engine.as_str(), version.as_str())),
        );
        encoder.finish()
    }
}

/// Everything that can affect one task's output.
#[derive(Debug)]
pub struct TaskHashable<'a> {
    pub global_hash: &'a str,
    pub task_dependency_hashes: Vec<String>,
    pub package_dir: RelativeUnixPathBuf,
    pub task: String,
    pub external_deps_hash: String,
    /// hash over the sorted (path, hash) pairs of the task's input files
    pub hash_of_files: &'a str,
    pub outputs: crate::task_graph::TaskOutputs,
    pub task_definition: String,
    pub env: Vec<String>,
    pub resolved_env_vars: Vec<String>,
    pub pass_through_env: Vec<String>,
    pub env_mode: EnvMode,
}

impl TurboHash for TaskHashable<'_> {
    fn hash(&self) -> String {
        let mut encoder = HashEncoder::new();
        encoder.write_str(self.global_hash);
        encoder.write_list(&self.task_dependency_hashes);
        encoder.write_str(self.package_dir.as_str());
        encoder.write_str(&self.task);
        encoder.write_str(&self.external_deps_hash);
        encoder.write_str(self.hash_of_files);
        encoder.write_list(&self.outputs.inclusions);
        encoder.write_list(&self.outputs.exclusions);
        encoder.write_str(&self.task_definition);
        encoder.write_list(&self.env);
        encoder.write_list(&self.resolved_env_vars);
        encoder.write_list(&self.pass_through_env);
        encoder.write_str(self.env_mode.discriminator());
        encoder.finish()
    }
}

/// A package's external dependency closure. Entries are sorted before
/// hashing so lockfile iteration order cannot leak in.
pub struct LockFilePackages(pub Vec<Package>);

impl TurboHash for LockFilePackages {
    fn hash(&self) -> String {
        let LockFilePackages(packages) = self;
        let mut packages: Vec<_> = packages
            .iter()
            .map(|Package { key, version }| (key.as_str(), version.as_str()))
            .collect();
        packages.sort();
        let mut encoder = HashEncoder::new();
        encoder.write_pairs(packages);
        encoder.finish()
    }
}

/// A set of (path, content-hash) pairs, e.g. a task's input files.
pub struct FileHashes(pub std::collections::HashMap<RelativeUnixPathBuf, String>);

impl TurboHash for FileHashes {
    fn hash(&self) -> String {
        let FileHashes(hashes) = self;
        let mut pairs: Vec<_> = hashes
            .iter()
            .map(|(path, hash)| (path.as_str(), hash.as_str()))
            .collect();
        pairs.sort();
        let mut encoder = HashEncoder::new();
        encoder.write_pairs(pairs);
        encoder.finish()
    }
}
