use std::collections::HashSet;

use turbopath::{AbsoluteSystemPath, AnchoredSystemPath, AnchoredSystemPathBuf, RelativeUnixPathBuf};

use crate::{hash_object, Error, Git, GitHashes};

impl Git {
    pub(crate) fn merge_base(&self, a: &str, b: &str) -> Result<String, Error> {
        let out = self.spawn_git_command(&["merge-base", a, b])?;
        let base = String::from_utf8(out).map_err(|_| Error::NonUtf8GitOutput)?;
        let base = base.trim();
        if base.is_empty() {
            return Err(Error::git_error(format!("no merge base between {a} and {b}")));
        }
        Ok(base.to_string())
    }

    pub(crate) fn changed_files(
        &self,
        turbo_root: &AbsoluteSystemPath,
        from_ref: &str,
        to_ref: Option<&str>,
        include_uncommitted: bool,
    ) -> Result<HashSet<AnchoredSystemPathBuf>, Error> {
        let mut files = HashSet::new();

        let range = match to_ref {
            Some(to_ref) => format!("{from_ref}...{to_ref}"),
            None => from_ref.to_string(),
        };
        let output =
            self.spawn_git_command(&["diff", "--name-only", "--no-renames", range.as_str()])?;
        self.add_files_from_stdout(&mut files, turbo_root, &output)?;

        if include_uncommitted {
            // untracked files aren't in any diff
            let output =
                self.spawn_git_command(&["ls-files", "--others", "--exclude-standard"])?;
            self.add_files_from_stdout(&mut files, turbo_root, &output)?;
        }

        Ok(files)
    }

    /// git outputs paths relative to the git root, which may sit above the
    /// repo root turbo cares about. Re-anchor and drop everything outside.
    fn add_files_from_stdout(
        &self,
        files: &mut HashSet<AnchoredSystemPathBuf>,
        turbo_root: &AbsoluteSystemPath,
        stdout: &[u8],
    ) -> Result<(), Error> {
        let stdout = std::str::from_utf8(stdout).map_err(|_| Error::NonUtf8GitOutput)?;
        for line in stdout.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let absolute = self
                .root
                .join_unix_path(turbopath::RelativeUnixPath::new(line)?);
            if let Ok(anchored) = turbo_root.anchor(&absolute) {
                files.insert(anchored);
            }
        }
        Ok(())
    }

    /// Hashes every committed file under the package via the index, then
    /// patches the result with the working-tree state: modified and
    /// untracked files are re-hashed from disk, deleted files are dropped.
    pub(crate) fn get_package_file_hashes(
        &self,
        turbo_root: &AbsoluteSystemPath,
        package_path: &AnchoredSystemPath,
        default_exclusions: &[String],
    ) -> Result<GitHashes, Error> {
        let package_abs = turbo_root.resolve(package_path);
        let package_spec = package_abs.as_str().to_string();

        let mut hashes = GitHashes::new();

        // "<mode> <oid> <stage>\t<path>" per line
        let ls_files =
            self.spawn_git_command(&["ls-files", "-s", "-z", "--", package_spec.as_str()])?;
        for entry in split_null(&ls_files)? {
            let (metadata, path) = entry
                .split_once('\t')
                .ok_or_else(|| Error::git_error(format!("malformed ls-files entry: {entry}")))?;
            let oid = metadata
                .split(' ')
                .nth(1)
                .ok_or_else(|| Error::git_error(format!("malformed ls-files entry: {entry}")))?;
            if let Some(relative) = self.to_package_relative(turbo_root, package_path, path)? {
                hashes.insert(relative, oid.to_string());
            }
        }

        // "XY <path>" per entry; ?? marks untracked
        let status = self.spawn_git_command(&[
            "status",
            "--porcelain=v1",
            "-z",
            "--untracked-files",
            "--no-renames",
            "--",
            package_spec.as_str(),
        ])?;
        for entry in split_null(&status)? {
            if entry.len() < 4 {
                continue;
            }
            let (code, path) = entry.split_at(3);
            let code = &code[..2];
            let Some(relative) = self.to_package_relative(turbo_root, package_path, path)? else {
                continue;
            };
            let is_delete = code.contains('D');
            if is_delete {
                hashes.remove(&relative);
            } else {
                let absolute = self
                    .root
                    .join_unix_path(turbopath::RelativeUnixPath::new(path)?);
                match hash_object::hash_object(&absolute) {
                    Ok(hash) => {
                        hashes.insert(relative, hash);
                    }
                    // racing with a delete is not an error
                    Err(Error::Io(e, _)) if e.kind() == std::io::ErrorKind::NotFound => {
                        hashes.remove(&relative);
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        if !default_exclusions.is_empty() {
            crate::manual::remove_excluded(&mut hashes, default_exclusions)?;
        }

        Ok(hashes)
    }

    /// Converts a git-root-relative path to a package-relative unix path.
    /// Returns `None` for files outside the package (git's pathspec matches
    /// the directory prefix, but status can surface renames from elsewhere).
    fn to_package_relative(
        &self,
        turbo_root: &AbsoluteSystemPath,
        package_path: &AnchoredSystemPath,
        git_relative: &str,
    ) -> Result<Option<RelativeUnixPathBuf>, Error> {
        let absolute = self
            .root
            .join_unix_path(turbopath::RelativeUnixPath::new(git_relative)?);
        let package_abs = turbo_root.resolve(package_path);
        match package_abs.anchor(&absolute) {
            Ok(anchored) => Ok(Some(anchored.to_unix())),
            Err(_) => Ok(None),
        }
    }
}

fn split_null(output: &[u8]) -> Result<impl Iterator<Item = &str>, Error> {
    let output = std::str::from_utf8(output).map_err(|_| Error::NonUtf8GitOutput)?;
    Ok(output.split('\0').filter(|s| !s.is_empty()))
}

#[cfg(test)]
mod test {
    use std::process::Command;

    use turbopath::AbsoluteSystemPathBuf;

    use super::*;
    use crate::SCM;

    fn require_git() -> bool {
        which::which("git").is_ok()
    }

    fn git(root: &AbsoluteSystemPath, args: &[&str]) {
        let out = Command::new("git")
            .args(args)
            .current_dir(root.as_std_path())
            .env("GIT_AUTHOR_NAME", "test")
            .env("GIT_AUTHOR_EMAIL", "test@example.com")
            .env("GIT_COMMITTER_NAME", "test")
            .env("GIT_COMMITTER_EMAIL", "test@example.com")
            .output()
            .unwrap();
        assert!(out.status.success(), "git {args:?}: {}", String::from_utf8_lossy(&out.stderr));
    }

    fn setup_repo() -> Option<(tempfile::TempDir, AbsoluteSystemPathBuf)> {
        if !require_git() {
            return None;
        }
        let dir = tempfile::tempdir().unwrap();
        let root = AbsoluteSystemPathBuf::try_from(dir.path()).unwrap();
        git(&root, &["init", "-b", "main"]);
        let pkg = root.join_components(&["packages", "a"]);
        pkg.create_dir_all().unwrap();
        pkg.join_component("index.js")
            .create_with_contents("console.log('hi')\n")
            .unwrap();
        git(&root, &["add", "."]);
        git(&root, &["commit", "-m", "init"]);
        Some((dir, root))
    }

    #[test]
    fn test_package_hashes_track_working_tree() {
        let Some((_dir, root)) = setup_repo() else {
            return;
        };
        let scm = SCM::new(&root);
        let package = AnchoredSystemPathBuf::from_raw("packages/a").unwrap();

        let clean = scm
            .get_package_file_hashes(&root, &package, &[], &[])
            .unwrap();
        let index_js = RelativeUnixPathBuf::new("index.js").unwrap();
        assert!(clean.contains_key(&index_js));

        // dirty the file; the hash must change and match manual hashing
        root.join_components(&["packages", "a", "index.js"])
            .create_with_contents("console.log('bye')\n")
            .unwrap();
        let dirty = scm
            .get_package_file_hashes(&root, &package, &[], &[])
            .unwrap();
        assert_ne!(clean[&index_js], dirty[&index_js]);
        assert_eq!(
            dirty[&index_js],
            crate::hash_object::hash_bytes(b"console.log('bye')\n")
        );

        // untracked files show up too
        root.join_components(&["packages", "a", "new.js"])
            .create_with_contents("x")
            .unwrap();
        let with_untracked = scm
            .get_package_file_hashes(&root, &package, &[], &[])
            .unwrap();
        assert!(with_untracked.contains_key(&RelativeUnixPathBuf::new("new.js").unwrap()));
    }

    #[test]
    fn test_changed_files_since_head() {
        let Some((_dir, root)) = setup_repo() else {
            return;
        };
        let scm = SCM::new(&root);
        root.join_components(&["packages", "a", "touched.js"])
            .create_with_contents("x")
            .unwrap();
        let changed = scm.changed_files(&root, "HEAD", None, true).unwrap();
        assert_eq!(
            changed,
            [AnchoredSystemPathBuf::from_raw("packages/a/touched.js").unwrap()]
                .into_iter()
                .collect()
        );
    }
}
