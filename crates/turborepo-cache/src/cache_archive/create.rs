use std::{
    backtrace::Backtrace,
    fs,
    fs::OpenOptions,
    io::{BufWriter, Read, Write},
    sync::atomic::{AtomicU64, Ordering},
};

use tar::{EntryType, Header};
use turbopath::{AbsoluteSystemPath, AbsoluteSystemPathBuf, AnchoredSystemPath};

use crate::CacheError;

/// Counter for unique temp filenames within the process; combined with the
/// pid for uniqueness across processes writing the same cache directory.
static TEMP_FILE_COUNTER: AtomicU64 = AtomicU64::new(0);

fn generate_temp_path(final_path: &AbsoluteSystemPath) -> AbsoluteSystemPathBuf {
    let file_name = final_path.file_name().unwrap_or("cache");
    let unique_id = TEMP_FILE_COUNTER.fetch_add(1, Ordering::Relaxed);
    let temp_name = format!(".{}.{}.{}.tmp", file_name, std::process::id(), unique_id);
    final_path
        .parent()
        .expect("cache path must have a parent")
        .join_component(&temp_name)
}

/// Writes a cache archive. When created with [`CacheWriter::create`] the
/// archive goes to a temp file that is atomically renamed into place on
/// [`CacheWriter::finish`]; readers therefore only ever observe complete
/// archives. The temp file is removed on drop if `finish` never ran.
pub struct CacheWriter<'a> {
    builder: tar::Builder<Box<dyn Write + 'a>>,
    temp_path: Option<AbsoluteSystemPathBuf>,
    final_path: Option<AbsoluteSystemPathBuf>,
}

impl Drop for CacheWriter<'_> {
    fn drop(&mut self) {
        if let Some(temp_path) = self.temp_path.take() {
            // best effort; we may be unwinding
            let _ = temp_path.remove_file();
        }
    }
}

impl<'a> CacheWriter<'a> {
    pub fn from_writer(writer: impl Write + 'a, use_compression: bool) -> Result<Self, CacheError> {
        let writer: Box<dyn Write> = if use_compression {
            Box::new(zstd::Encoder::new(writer, 0)?.auto_finish())
        } else {
            Box::new(writer)
        };
        Ok(CacheWriter {
            builder: tar::Builder::new(writer),
            temp_path: None,
            final_path: None,
        })
    }

    /// Creates an archive at `path`, compressed when the extension says so.
    pub fn create(path: &AbsoluteSystemPath) -> Result<Self, CacheError> {
        let temp_path = generate_temp_path(path);

        let mut options = OpenOptions::new();
        options.write(true).create(true).truncate(true);
        let file = temp_path.open_with_options(options)?;

        // Flush to disk in 1mb chunks.
        let file_buffer = BufWriter::with_capacity(2usize.pow(20), file);

        let writer: Box<dyn Write> = if path.extension() == Some("zst") {
            Box::new(zstd::Encoder::new(file_buffer, 0)?.auto_finish())
        } else {
            Box::new(file_buffer)
        };

        Ok(CacheWriter {
            builder: tar::Builder::new(writer),
            temp_path: Some(temp_path),
            final_path: Some(path.to_owned()),
        })
    }

    pub fn add_file(
        &mut self,
        anchor: &AbsoluteSystemPath,
        file_path: &AnchoredSystemPath,
    ) -> Result<(), CacheError> {
        let source_path = anchor.resolve(file_path);
        let file_info = source_path.symlink_metadata()?;

        // Archive entries are unix paths, directories with a trailing slash.
        let mut tar_path = file_path.to_unix();
        tar_path.make_canonical_for_tar(file_info.is_dir());

        let mut header = Self::create_header(&file_info)?;

        if matches!(header.entry_type(), EntryType::Regular) && file_info.len() > 0 {
            let file = source_path.open()?;
            self.append_data(&mut header, tar_path.as_str(), file)?;
        } else if matches!(header.entry_type(), EntryType::Symlink) {
            let target = source_path.read_link()?;
            let target = target
                .to_str()
                .ok_or_else(|| CacheError::PathError(
                    turbopath::PathError::invalid_utf8_error(target.as_os_str()),
                    Backtrace::capture(),
                ))?
                .replace(std::path::MAIN_SEPARATOR, "/");
            self.builder
                .append_link(&mut header, tar_path.as_str(), target)?;
        } else {
            self.append_data(&mut header, tar_path.as_str(), &mut std::io::empty())?;
        }

        Ok(())
    }

    fn append_data(
        &mut self,
        header: &mut Header,
        path: &str,
        body: impl Read,
    ) -> Result<(), CacheError> {
        Ok(self.builder.append_data(header, path, body)?)
    }

    fn create_header(file_info: &fs::Metadata) -> Result<Header, CacheError> {
        let mut header = Header::new_gnu();

        #[cfg(unix)]
        {
            use std::os::unix::fs::MetadataExt;
            header.set_mode(file_info.mode());
        }
        #[cfg(windows)]
        {
            header.set_mode(0o755);
        }

        if file_info.is_symlink() {
            // linkname is set via append_link so long targets get extensions
            header.set_entry_type(EntryType::Symlink);
            header.set_size(0);
        } else if file_info.is_dir() {
            header.set_entry_type(EntryType::Directory);
            header.set_size(0);
        } else if file_info.is_file() {
            header.set_entry_type(EntryType::Regular);
            header.set_size(file_info.len());
        } else {
            return Err(CacheError::CreateUnsupportedFileType(Backtrace::capture()));
        }

        // Byte-identical archives for identical content.
        header.set_uid(0);
        header.set_gid(0);
        header.set_mtime(0);
        header.as_gnu_mut().unwrap().set_atime(0);
        header.as_gnu_mut().unwrap().set_ctime(0);

        Ok(header)
    }

    /// Finishes the archive and, for file-backed writers, renames it into
    /// its final location.
    pub fn finish(mut self) -> Result<(), CacheError> {
        self.builder.finish()?;

        if let (Some(temp_path), Some(final_path)) = (self.temp_path.take(), self.final_path.take())
        {
            temp_path.rename(&final_path)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use anyhow::Result;
    use tempfile::tempdir;
    use turbopath::{AnchoredSystemPathBuf, AbsoluteSystemPathBuf};

    use super::*;
    use crate::cache_archive::CacheReader;

    #[test]
    fn test_round_trip_files_and_dirs() -> Result<()> {
        let input_dir = tempdir()?;
        let input = AbsoluteSystemPathBuf::try_from(input_dir.path())?;
        let archive_dir = tempdir()?;
        let archive_path =
            AbsoluteSystemPathBuf::try_from(archive_dir.path())?.join_component("out.tar.zst");

        let dist = input.join_component("dist");
        dist.create_dir_all()?;
        dist.join_component("index.js")
            .create_with_contents("content")?;

        let mut writer = CacheWriter::create(&archive_path)?;
        writer.add_file(&input, &AnchoredSystemPathBuf::from_raw("dist")?)?;
        writer.add_file(&input, &AnchoredSystemPathBuf::from_raw("dist/index.js")?)?;
        writer.finish()?;

        let output_dir = tempdir()?;
        let output = AbsoluteSystemPathBuf::try_from(output_dir.path())?;
        let mut reader = CacheReader::open(&archive_path)?;
        let restored = reader.restore(&output)?;

        assert_eq!(restored.len(), 2);
        assert_eq!(
            output
                .join_components(&["dist", "index.js"])
                .read_to_string()?,
            "content"
        );
        Ok(())
    }

    #[test]
    fn test_temp_file_removed_without_finish() -> Result<()> {
        let archive_dir = tempdir()?;
        let archive_path =
            AbsoluteSystemPathBuf::try_from(archive_dir.path())?.join_component("out.tar.zst");
        {
            let _writer = CacheWriter::create(&archive_path)?;
            // dropped without finish()
        }
        let leftovers: Vec<_> = std::fs::read_dir(archive_dir.path())?
            .filter_map(|e| e.ok())
            .collect();
        assert!(leftovers.is_empty(), "{leftovers:?}");
        Ok(())
    }

    #[test]
    fn test_missing_file_is_an_error() -> Result<()> {
        let input_dir = tempdir()?;
        let input = AbsoluteSystemPathBuf::try_from(input_dir.path())?;
        let archive_dir = tempdir()?;
        let archive_path =
            AbsoluteSystemPathBuf::try_from(archive_dir.path())?.join_component("out.tar");

        let mut writer = CacheWriter::create(&archive_path)?;
        let result = writer.add_file(&input, &AnchoredSystemPathBuf::from_raw("nope.txt")?);
        assert!(result.is_err());
        Ok(())
    }

    #[test]
    #[cfg(unix)]
    fn test_unsupported_file_type_rejected() -> Result<()> {
        use std::ffi::CString;

        let input_dir = tempdir()?;
        let input = AbsoluteSystemPathBuf::try_from(input_dir.path())?;
        let fifo = input.join_component("fifo");
        let path_cstr = CString::new(fifo.as_str())?;
        unsafe {
            libc_mkfifo(path_cstr.as_ptr());
        }

        let archive_dir = tempdir()?;
        let archive_path =
            AbsoluteSystemPathBuf::try_from(archive_dir.path())?.join_component("out.tar");
        let mut writer = CacheWriter::create(&archive_path)?;
        let result = writer.add_file(&input, &AnchoredSystemPathBuf::from_raw("fifo")?);
        assert!(matches!(
            result,
            Err(CacheError::CreateUnsupportedFileType(_))
        ));
        Ok(())
    }

    #[cfg(unix)]
    unsafe fn libc_mkfifo(path: *const std::os::raw::c_char) {
        extern "C" {
            fn mkfifo(path: *const std::os::raw::c_char, mode: u32) -> i32;
        }
        mkfifo(path, 0o644);
    }
}
