use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Read a file to string, replacing invalid UTF-8 sequences with the replacement character.
///
/// Opam metadata files are nominally UTF-8 but older entries in the
/// repository carry Latin-1 author names.
///
/// # Errors
/// Returns an error if the file cannot be read.
pub fn read_to_string_lossy(path: &Path) -> io::Result<String> {
    let bytes = fs::read(path)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Atomically write bytes to a file by writing to a temp file then renaming.
///
/// The file will either have the old contents or the new contents, never a
/// partial write. Missing parent directories are created.
///
/// # Errors
/// Returns an error if the write or rename fails.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let parent = path.parent().unwrap_or(Path::new("."));
    fs::create_dir_all(parent)?;

    let temp_path = sibling_temp_path(path);

    {
        let mut file = File::create(&temp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }

    match fs::rename(&temp_path, path) {
        Ok(()) => Ok(()),
        Err(e) => {
            if cfg!(windows) {
                fs::copy(&temp_path, path)?;
                let _ = fs::remove_file(&temp_path);
                Ok(())
            } else {
                let _ = fs::remove_file(&temp_path);
                Err(e)
            }
        }
    }
}

/// Move a file, falling back to copy + remove when `rename` fails
/// (e.g. the temp directory lives on another filesystem).
///
/// # Errors
/// Returns an error if both the rename and the copy fail.
pub fn move_file(src: &Path, dst: &Path) -> io::Result<()> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)?;
    }
    if fs::rename(src, dst).is_ok() {
        return Ok(());
    }
    // Copy next to the target first so `dst` never holds a partial file
    let temp_path = sibling_temp_path(dst);
    if let Err(e) = fs::copy(src, &temp_path).and_then(|_| fs::rename(&temp_path, dst)) {
        let _ = fs::remove_file(&temp_path);
        return Err(e);
    }
    fs::remove_file(src)
}

/// Temp file name in the same directory as `path`, so a rename onto
/// `path` never crosses filesystems.
fn sibling_temp_path(path: &Path) -> PathBuf {
    let parent = path.parent().unwrap_or(Path::new("."));
    parent.join(format!(
        ".{}.tmp.{}",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("file"),
        std::process::id()
    ))
}

/// What a listed entry is on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Symlink,
}

/// List regular files and symlinks below `root`, as paths relative to
/// `root`. Symlinks are reported as links and never followed.
///
/// The result is sorted so callers that hash or pack the listing get a
/// stable order across platforms.
///
/// # Errors
/// Returns an error if the directory cannot be walked.
pub fn list_entries(root: &Path) -> io::Result<Vec<(PathBuf, EntryKind)>> {
    let mut entries = Vec::new();
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry.map_err(io::Error::other)?;
        let file_type = entry.file_type();
        let kind = if file_type.is_symlink() {
            EntryKind::Symlink
        } else if file_type.is_file() {
            EntryKind::File
        } else {
            continue;
        };
        if let Ok(rel) = entry.path().strip_prefix(root) {
            entries.push((rel.to_path_buf(), kind));
        }
    }
    entries.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(entries)
}

/// List every regular file below `root`, as paths relative to `root`.
///
/// # Errors
/// Returns an error if the directory cannot be walked.
pub fn list_files(root: &Path) -> io::Result<Vec<PathBuf>> {
    Ok(list_entries(root)?
        .into_iter()
        .filter(|(_, kind)| *kind == EntryKind::File)
        .map(|(path, _)| path)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::{tempdir, NamedTempFile};

    #[test]
    fn test_read_to_string_lossy_invalid_utf8() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(&[0x48, 0x65, 0x6c, 0x6c, 0x6f, 0x80, 0x81])
            .unwrap();
        file.flush().unwrap();

        let content = read_to_string_lossy(file.path()).unwrap();
        assert!(content.starts_with("Hello"));
        assert!(content.contains('\u{FFFD}'));
    }

    #[test]
    fn test_atomic_write_creates_parent_and_overwrites() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("opam-urls");

        atomic_write(&path, b"first").unwrap();
        atomic_write(&path, b"second").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "second");

        let entries: Vec<_> = fs::read_dir(path.parent().unwrap()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_move_file() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("a.tgz");
        let dst = dir.path().join("cache").join("b.tgz");
        fs::write(&src, b"data").unwrap();

        move_file(&src, &dst).unwrap();
        assert!(!src.exists());
        assert_eq!(fs::read(&dst).unwrap(), b"data");
    }

    #[test]
    fn test_list_files_sorted_relative() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("b/c")).unwrap();
        fs::write(dir.path().join("b/c/z.ml"), "").unwrap();
        fs::write(dir.path().join("a.patch"), "").unwrap();

        let files = list_files(dir.path()).unwrap();
        assert_eq!(
            files,
            vec![PathBuf::from("a.patch"), PathBuf::from("b/c/z.ml")]
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_list_entries_reports_symlinks() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("real.ml"), "").unwrap();
        std::os::unix::fs::symlink("real.ml", dir.path().join("link.ml")).unwrap();

        assert_eq!(
            list_entries(dir.path()).unwrap(),
            vec![
                (PathBuf::from("link.ml"), EntryKind::Symlink),
                (PathBuf::from("real.ml"), EntryKind::File),
            ]
        );
        assert_eq!(list_files(dir.path()).unwrap(), vec![PathBuf::from("real.ml")]);
    }
}
