use std::{backtrace::Backtrace, io::Read, path::Component};

use turbopath::{AbsoluteSystemPath, AnchoredSystemPathBuf};

use crate::CacheError;

/// Reads a cache archive and restores its entries under an anchor
/// directory. Entries that would escape the anchor (via `..`, absolute
/// paths, or symlink targets) are rejected.
pub struct CacheReader<'a> {
    reader: Box<dyn Read + 'a>,
}

impl<'a> CacheReader<'a> {
    pub fn from_reader(reader: impl Read + 'a, is_compressed: bool) -> Result<Self, CacheError> {
        let reader: Box<dyn Read> = if is_compressed {
            Box::new(zstd::Decoder::new(reader)?)
        } else {
            Box::new(reader)
        };
        Ok(CacheReader { reader })
    }

    pub fn open(path: &AbsoluteSystemPath) -> Result<Self, CacheError> {
        let file = path.open()?;
        Self::from_reader(file, path.extension() == Some("zst"))
    }

    pub fn restore(
        &mut self,
        anchor: &AbsoluteSystemPath,
    ) -> Result<Vec<AnchoredSystemPathBuf>, CacheError> {
        let mut restored = Vec::new();
        anchor.create_dir_all()?;

        let mut archive = tar::Archive::new(&mut self.reader);

        // Symlinks whose targets don't exist yet are deferred; links can
        // point at other links, so keep retrying until a pass makes no
        // progress. No progress with links remaining means a cycle.
        let mut deferred_symlinks: Vec<(AnchoredSystemPathBuf, String, u32)> = Vec::new();

        for entry in archive.entries()? {
            let mut entry = entry?;
            let entry_path = safe_entry_path(&entry)?;

            match entry.header().entry_type() {
                tar::EntryType::Directory => {
                    let target = anchor.resolve(&entry_path);
                    target.create_dir_all()?;
                    restore_mode(&target, entry.header())?;
                    restored.push(entry_path);
                }
                tar::EntryType::Regular => {
                    let target = anchor.resolve(&entry_path);
                    target.ensure_dir()?;
                    let mut options = std::fs::OpenOptions::new();
                    options.write(true).create(true).truncate(true);
                    let mut file = target.open_with_options(options)?;
                    std::io::copy(&mut entry, &mut file)?;
                    drop(file);
                    restore_mode(&target, entry.header())?;
                    restored.push(entry_path);
                }
                tar::EntryType::Symlink => {
                    let linkname = entry
                        .header()
                        .link_name()?
                        .ok_or_else(|| CacheError::LinkTargetNotOnHeader(Backtrace::capture()))?;
                    let linkname = linkname
                        .to_str()
                        .ok_or_else(|| CacheError::MalformedTar(Backtrace::capture()))?
                        .to_string();
                    let mode = entry.header().mode().unwrap_or(0o777);
                    match restore_symlink(anchor, &entry_path, &linkname, mode) {
                        Ok(()) => restored.push(entry_path),
                        Err(CacheError::LinkTargetDoesNotExist(..)) => {
                            deferred_symlinks.push((entry_path, linkname, mode));
                        }
                        Err(e) => return Err(e),
                    }
                }
                ty => {
                    return Err(CacheError::RestoreUnsupportedFileType(
                        ty,
                        Backtrace::capture(),
                    ))
                }
            }
        }

        while !deferred_symlinks.is_empty() {
            let mut made_progress = false;
            let mut still_deferred = Vec::new();
            for (entry_path, linkname, mode) in deferred_symlinks {
                match restore_symlink(anchor, &entry_path, &linkname, mode) {
                    Ok(()) => {
                        restored.push(entry_path);
                        made_progress = true;
                    }
                    Err(CacheError::LinkTargetDoesNotExist(..)) => {
                        still_deferred.push((entry_path, linkname, mode));
                    }
                    Err(e) => return Err(e),
                }
            }
            if !made_progress && !still_deferred.is_empty() {
                return Err(CacheError::CycleDetected(Backtrace::capture()));
            }
            deferred_symlinks = still_deferred;
        }

        Ok(restored)
    }
}

/// Validates a tar entry path: relative, unicode, and no traversal out of
/// the anchor.
fn safe_entry_path<R: Read>(entry: &tar::Entry<R>) -> Result<AnchoredSystemPathBuf, CacheError> {
    let path = entry.path().map_err(|_| CacheError::MalformedTar(Backtrace::capture()))?;
    for component in path.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            _ => {
                return Err(CacheError::LinkOutsideOfDirectory(
                    path.to_string_lossy().into_owned(),
                    Backtrace::capture(),
                ))
            }
        }
    }
    AnchoredSystemPathBuf::from_system_path(&path).map_err(|_| {
        CacheError::LinkOutsideOfDirectory(path.to_string_lossy().into_owned(), Backtrace::capture())
    })
}

fn restore_symlink(
    anchor: &AbsoluteSystemPath,
    entry_path: &AnchoredSystemPathBuf,
    linkname: &str,
    _mode: u32,
) -> Result<(), CacheError> {
    let link_location = anchor.resolve(entry_path);

    // Resolve the target relative to the link's directory and refuse
    // anything that escapes the anchor.
    let target = canonicalize_linkname(anchor, entry_path, linkname)?;
    if !target.exists() {
        return Err(CacheError::LinkTargetDoesNotExist(
            linkname.to_string(),
            Backtrace::capture(),
        ));
    }

    link_location.ensure_dir()?;
    if link_location.exists() {
        link_location.remove_file()?;
    }
    if target.is_dir() {
        link_location.symlink_to_dir(linkname)?;
    } else {
        link_location.symlink_to_file(linkname)?;
    }
    Ok(())
}

/// The absolute path a symlink target resolves to, verified to stay inside
/// the anchor.
fn canonicalize_linkname(
    anchor: &AbsoluteSystemPath,
    entry_path: &AnchoredSystemPathBuf,
    linkname: &str,
) -> Result<turbopath::AbsoluteSystemPathBuf, CacheError> {
    let link_dir = anchor
        .resolve(entry_path)
        .parent()
        .map(|p| p.to_owned())
        .unwrap_or_else(|| anchor.to_owned());
    let resolved = link_dir.join_unix_path(
        turbopath::RelativeUnixPath::new(&linkname.replace('\\', "/")).map_err(|_| {
            CacheError::LinkOutsideOfDirectory(linkname.to_string(), Backtrace::capture())
        })?,
    );
    if !resolved.starts_with(anchor) {
        return Err(CacheError::LinkOutsideOfDirectory(
            linkname.to_string(),
            Backtrace::capture(),
        ));
    }
    Ok(resolved)
}

fn restore_mode(
    path: &AbsoluteSystemPath,
    header: &tar::Header,
) -> Result<(), CacheError> {
    #[cfg(unix)]
    if let Ok(mode) = header.mode() {
        path.set_mode(mode & 0o777)?;
    }
    #[cfg(windows)]
    {
        let _ = (path, header);
    }
    Ok(())
}
