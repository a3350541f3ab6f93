use std::{
    fmt, fs,
    fs::{File, Metadata, OpenOptions},
    io,
    path::Path,
};

use camino::{Utf8Components, Utf8Path, Utf8PathBuf};

use crate::{
    AbsoluteSystemPathBuf, AnchoredSystemPath, AnchoredSystemPathBuf, PathError, RelativeUnixPath,
};

/// A borrowed absolute path using the host separator convention.
///
/// All filesystem access in the workspace goes through this type or its owned
/// counterpart so that relative paths can never silently resolve against the
/// current working directory.
#[derive(Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct AbsoluteSystemPath(Utf8Path);

impl AbsoluteSystemPath {
    /// Validates that the path is absolute and creates an
    /// `AbsoluteSystemPath`. Does not check that the separators are correct
    /// for the platform, use with care.
    pub fn new<P: AsRef<str> + ?Sized>(value: &P) -> Result<&Self, PathError> {
        let path: &Utf8Path = value.as_ref().into();
        if path.is_relative() {
            return Err(PathError::NotAbsolute(path.to_string()));
        }
        Ok(Self::new_unchecked(path))
    }

    pub fn from_std_path(path: &Path) -> Result<&Self, PathError> {
        let path: &Utf8Path = path
            .try_into()
            .map_err(|_| PathError::invalid_utf8_error(path.as_os_str()))?;
        if path.is_relative() {
            return Err(PathError::NotAbsolute(path.to_string()));
        }
        Ok(Self::new_unchecked(path))
    }

    pub(crate) fn new_unchecked(path: &Utf8Path) -> &Self {
        // SAFETY: repr(transparent) over Utf8Path
        unsafe { &*(path as *const Utf8Path as *const Self) }
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    pub fn as_path(&self) -> &Utf8Path {
        &self.0
    }

    pub fn as_std_path(&self) -> &Path {
        self.0.as_std_path()
    }

    pub fn to_owned(&self) -> AbsoluteSystemPathBuf {
        AbsoluteSystemPathBuf::new_unchecked(self.0.to_owned())
    }

    pub fn parent(&self) -> Option<&AbsoluteSystemPath> {
        self.0.parent().map(Self::new_unchecked)
    }

    pub fn ancestors(&self) -> impl Iterator<Item = &AbsoluteSystemPath> {
        self.0.ancestors().map(Self::new_unchecked)
    }

    pub fn components(&self) -> Utf8Components<'_> {
        self.0.components()
    }

    pub fn file_name(&self) -> Option<&str> {
        self.0.file_name()
    }

    pub fn extension(&self) -> Option<&str> {
        self.0.extension()
    }

    pub fn starts_with(&self, other: &AbsoluteSystemPath) -> bool {
        self.0.starts_with(other.as_path())
    }

    /// Joining a single component can skip revalidation as a component can
    /// never make the path relative.
    pub fn join_component(&self, segment: &str) -> AbsoluteSystemPathBuf {
        debug_assert!(!segment.contains(std::path::MAIN_SEPARATOR));
        AbsoluteSystemPathBuf::new_unchecked(self.0.join(segment))
    }

    pub fn join_components(&self, segments: &[&str]) -> AbsoluteSystemPathBuf {
        let mut path = self.0.to_owned();
        for segment in segments {
            debug_assert!(!segment.contains(std::path::MAIN_SEPARATOR));
            path.push(segment);
        }
        AbsoluteSystemPathBuf::new_unchecked(path)
    }

    pub fn join_unix_path(&self, unix_path: &RelativeUnixPath) -> AbsoluteSystemPathBuf {
        let tail = crate::to_system_separators(unix_path.as_str());
        AbsoluteSystemPathBuf::new_unchecked(
            Utf8PathBuf::try_from(path_clean::clean(self.0.join(tail).as_std_path()))
                .expect("joined paths are valid utf8"),
        )
    }

    /// Resolves an anchored path against this path.
    pub fn resolve(&self, path: &AnchoredSystemPath) -> AbsoluteSystemPathBuf {
        AbsoluteSystemPathBuf::new_unchecked(self.0.join(path.as_path()))
    }

    /// Produces the anchored path of `path` relative to `self`.
    pub fn anchor(&self, path: &AbsoluteSystemPath) -> Result<AnchoredSystemPathBuf, PathError> {
        AnchoredSystemPathBuf::strip_root(self, path)
    }

    pub fn exists(&self) -> bool {
        self.0.symlink_metadata().is_ok()
    }

    pub fn is_dir(&self) -> bool {
        self.0.is_dir()
    }

    pub fn is_file(&self) -> bool {
        self.0.is_file()
    }

    pub fn create_dir_all(&self) -> Result<(), io::Error> {
        fs::create_dir_all(&self.0)
    }

    /// Creates the parent directory of this path if it does not exist.
    pub fn ensure_dir(&self) -> Result<(), io::Error> {
        if let Some(parent) = self.0.parent() {
            fs::create_dir_all(parent)
        } else {
            Ok(())
        }
    }

    pub fn remove_dir_all(&self) -> Result<(), io::Error> {
        fs::remove_dir_all(&self.0)
    }

    pub fn remove_file(&self) -> Result<(), io::Error> {
        fs::remove_file(&self.0)
    }

    pub fn create_with_contents<B: AsRef<[u8]>>(&self, contents: B) -> Result<(), io::Error> {
        fs::write(&self.0, contents)
    }

    pub fn read(&self) -> Result<Vec<u8>, io::Error> {
        fs::read(&self.0)
    }

    pub fn read_to_string(&self) -> Result<String, io::Error> {
        fs::read_to_string(&self.0)
    }

    /// Reads the file, mapping a not-found error to `None`.
    pub fn read_existing_to_string(&self) -> Result<Option<String>, io::Error> {
        match fs::read_to_string(&self.0) {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn open(&self) -> Result<File, io::Error> {
        File::open(&self.0)
    }

    pub fn open_with_options(&self, options: OpenOptions) -> Result<File, io::Error> {
        options.open(&self.0)
    }

    /// Renames to `other`. On the same filesystem this is atomic, which the
    /// cache relies on for crash-safe writes.
    pub fn rename(&self, other: &AbsoluteSystemPath) -> Result<(), io::Error> {
        fs::rename(&self.0, other.as_path())
    }

    pub fn metadata(&self) -> Result<Metadata, io::Error> {
        fs::metadata(&self.0)
    }

    pub fn symlink_metadata(&self) -> Result<Metadata, io::Error> {
        fs::symlink_metadata(&self.0)
    }

    pub fn read_link(&self) -> Result<std::path::PathBuf, io::Error> {
        fs::read_link(&self.0)
    }

    #[cfg(unix)]
    pub fn symlink_to_file<P: AsRef<str>>(&self, to: P) -> Result<(), io::Error> {
        std::os::unix::fs::symlink(to.as_ref(), &self.0)
    }

    #[cfg(windows)]
    pub fn symlink_to_file<P: AsRef<str>>(&self, to: P) -> Result<(), io::Error> {
        std::os::windows::fs::symlink_file(to.as_ref(), &self.0)
    }

    #[cfg(unix)]
    pub fn symlink_to_dir<P: AsRef<str>>(&self, to: P) -> Result<(), io::Error> {
        std::os::unix::fs::symlink(to.as_ref(), &self.0)
    }

    #[cfg(windows)]
    pub fn symlink_to_dir<P: AsRef<str>>(&self, to: P) -> Result<(), io::Error> {
        std::os::windows::fs::symlink_dir(to.as_ref(), &self.0)
    }

    #[cfg(unix)]
    pub fn set_mode(&self, mode: u32) -> Result<(), io::Error> {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&self.0, fs::Permissions::from_mode(mode))
    }
}

impl fmt::Display for AbsoluteSystemPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl AsRef<Path> for AbsoluteSystemPath {
    fn as_ref(&self) -> &Path {
        self.0.as_std_path()
    }
}

impl<'a> From<&'a AbsoluteSystemPath> for AbsoluteSystemPathBuf {
    fn from(path: &'a AbsoluteSystemPath) -> Self {
        path.to_owned()
    }
}
