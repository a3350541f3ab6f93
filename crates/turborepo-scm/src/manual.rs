use globwalk::{fix_glob_pattern, globwalk, WalkType};
use turbopath::{AbsoluteSystemPath, AnchoredSystemPath, AnchoredSystemPathBuf};

use crate::{hash_object::hash_object, Error, GitHashes};

/// Directories that never count as task inputs.
const DEFAULT_IGNORES: &[&str] = &[".git/**", "**/node_modules/**", ".turbo/**"];

/// Walks the package and hashes every matched file from disk. With empty
/// `inputs`, all files are included apart from the default ignores and the
/// task's declared outputs.
pub(crate) fn get_package_file_hashes(
    turbo_root: &AbsoluteSystemPath,
    package_path: &AnchoredSystemPath,
    inputs: &[String],
    default_exclusions: &[String],
) -> Result<GitHashes, Error> {
    let package_abs = turbo_root.resolve(package_path);

    let mut includes = Vec::new();
    let mut excludes: Vec<String> = DEFAULT_IGNORES.iter().map(|s| s.to_string()).collect();
    for input in inputs {
        if let Some(exclusion) = input.strip_prefix('!') {
            excludes.push(fix_glob_pattern(exclusion));
        } else {
            includes.push(fix_glob_pattern(input));
        }
    }
    if includes.is_empty() {
        excludes.extend(default_exclusions.iter().map(|glob| fix_glob_pattern(glob)));
    }

    let files = globwalk(&package_abs, &includes, &excludes, WalkType::Files)?;

    let mut hashes = GitHashes::new();
    for file in files {
        let relative = package_abs.anchor(&file)?.to_unix();
        hashes.insert(relative, hash_object(&file)?);
    }
    Ok(hashes)
}

/// Hashes an explicit list of files anchored at the repo root. With
/// `allow_missing`, nonexistent files are skipped instead of failing; the
/// hasher uses this for glob-derived lists that may race with deletes.
pub(crate) fn hash_files(
    turbo_root: &AbsoluteSystemPath,
    files: &[AnchoredSystemPathBuf],
    allow_missing: bool,
) -> Result<GitHashes, Error> {
    let mut hashes = GitHashes::new();
    for file in files {
        let absolute = turbo_root.resolve(file);
        match hash_object(&absolute) {
            Ok(hash) => {
                hashes.insert(file.to_unix(), hash);
            }
            Err(Error::Io(e, _)) if allow_missing && e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
    }
    Ok(hashes)
}

/// Drops entries matching any of the exclusion globs (package-relative unix
/// patterns).
pub(crate) fn remove_excluded(hashes: &mut GitHashes, exclusions: &[String]) -> Result<(), Error> {
    use wax::Pattern;
    let globs = exclusions
        .iter()
        .map(|raw| {
            wax::Glob::new(&fix_glob_pattern(raw))
                .map(wax::Glob::into_owned)
                .map_err(|e| {
                    Error::Glob(globwalk::WalkError::BadPattern(raw.clone(), e.to_string()))
                })
        })
        .collect::<Result<Vec<_>, _>>()?;
    let matcher = wax::any::<wax::Glob<'_>, _>(globs).map_err(|e| {
        Error::Glob(globwalk::WalkError::BadPattern(
            exclusions.join(","),
            e.to_string(),
        ))
    })?;
    hashes.retain(|path, _| !matcher.is_match(path.as_str()));
    Ok(())
}

#[cfg(test)]
mod test {
    use turbopath::{AbsoluteSystemPathBuf, RelativeUnixPathBuf};

    use super::*;

    fn setup() -> (tempfile::TempDir, AbsoluteSystemPathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let root = AbsoluteSystemPathBuf::try_from(dir.path()).unwrap();
        for (file, contents) in [
            ("packages/a/package.json", "{}"),
            ("packages/a/src/index.ts", "export {}"),
            ("packages/a/dist/index.js", "bundled"),
            ("packages/a/node_modules/dep/index.js", "dep"),
        ] {
            let path = root.join_unix_path(turbopath::RelativeUnixPath::new(file).unwrap());
            path.ensure_dir().unwrap();
            path.create_with_contents(contents).unwrap();
        }
        (dir, root)
    }

    #[test]
    fn test_default_inputs_skip_node_modules_and_outputs() {
        let (_dir, root) = setup();
        let package = turbopath::AnchoredSystemPathBuf::from_raw("packages/a").unwrap();
        let hashes =
            get_package_file_hashes(&root, &package, &[], &["dist/**".to_string()]).unwrap();
        let mut paths: Vec<_> = hashes.keys().map(|k| k.as_str()).collect();
        paths.sort();
        assert_eq!(paths, vec!["package.json", "src/index.ts"]);
    }

    #[test]
    fn test_explicit_inputs_with_negation() {
        let (_dir, root) = setup();
        let package = turbopath::AnchoredSystemPathBuf::from_raw("packages/a").unwrap();
        let hashes = get_package_file_hashes(
            &root,
            &package,
            &["**/*.ts".to_string(), "!src/index.ts".to_string()],
            &[],
        )
        .unwrap();
        assert!(hashes.is_empty());

        let hashes =
            get_package_file_hashes(&root, &package, &["src/**".to_string()], &[]).unwrap();
        assert_eq!(hashes.len(), 1);
        assert!(hashes.contains_key(&RelativeUnixPathBuf::new("src/index.ts").unwrap()));
    }

    #[test]
    fn test_hash_files_allow_missing() {
        let (_dir, root) = setup();
        let files = vec![
            turbopath::AnchoredSystemPathBuf::from_raw("packages/a/package.json").unwrap(),
            turbopath::AnchoredSystemPathBuf::from_raw("missing.txt").unwrap(),
        ];
        let hashes = hash_files(&root, &files, true).unwrap();
        assert_eq!(hashes.len(), 1);
        assert!(hash_files(&root, &files, false).is_err());
    }
}
