//! Source archive extraction and canonical tarball pack/unpack.
//!
//! Upstream archives come in several formats. gzip tarballs and zip files
//! are extracted in-process; bzip2 and xz go through the host `tar`.
//! Whatever the source, the fetcher repacks the staged tree into one
//! canonical gzip tarball with every entry under `package/`.

use crate::error::{OpamError, Result};
use crate::process::{args, CommandRunner};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use opamfetch_util::fs::EntryKind;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};
use tar::{Archive, Builder, EntryType, Header};

/// Top-level directory of every entry in a canonical tarball.
pub const PACKAGE_PREFIX: &str = "package";

const DIR_MODE: u32 = 0o755;
const EXEC_MODE: u32 = 0o755;
const FILE_MODE: u32 = 0o644;
const LINK_MODE: u32 = 0o777;

/// Compression of a downloaded source archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Gzip,
    Bzip2,
    Xz,
    Zip,
}

impl ArchiveFormat {
    /// Guess the format from a file name; unknown suffixes are treated as gzip.
    #[must_use]
    pub fn from_filename(name: &str) -> Self {
        let name = name.to_ascii_lowercase();
        if [".tar.bz", ".tar.bz2", ".tbz", ".tbz2"]
            .iter()
            .any(|s| name.ends_with(s))
        {
            Self::Bzip2
        } else if name.ends_with(".tar.xz") || name.ends_with(".txz") || name.ends_with(".xz") {
            Self::Xz
        } else if name.ends_with(".zip") {
            Self::Zip
        } else {
            Self::Gzip
        }
    }

    /// File suffix used when saving a download in this format.
    #[must_use]
    pub fn suffix(self) -> &'static str {
        match self {
            Self::Gzip => "tar.gz",
            Self::Bzip2 => "tar.bz2",
            Self::Xz => "tar.xz",
            Self::Zip => "zip",
        }
    }
}

/// Extract a downloaded source archive into `dest`.
///
/// # Errors
/// Returns an error if the archive is corrupt, contains unsafe paths, or the
/// host `tar` fails.
pub async fn extract_source(
    runner: &dyn CommandRunner,
    archive: &Path,
    format: ArchiveFormat,
    dest: &Path,
) -> Result<()> {
    tokio::fs::create_dir_all(dest).await?;
    let flag = match format {
        ArchiveFormat::Gzip | ArchiveFormat::Zip => {
            let archive = archive.to_path_buf();
            let dest = dest.to_path_buf();
            return blocking(move || {
                let file = File::open(&archive)?;
                if format == ArchiveFormat::Zip {
                    extract_zip_to(file, &dest)
                } else {
                    extract_tar_to(GzDecoder::new(file), &dest, 0)
                }
            })
            .await;
        }
        ArchiveFormat::Bzip2 => "-xjf",
        ArchiveFormat::Xz => "-xJf",
    };

    let archive = archive.to_string_lossy();
    let dest = dest.to_string_lossy();
    runner
        .run("tar", &args([flag, &*archive, "-C", &*dest]), None)
        .await?;
    Ok(())
}

/// Directory that holds the package sources after extraction.
///
/// Most archives wrap everything in a single `name-version/` directory;
/// when there is exactly one top-level entry and it is a directory, that
/// directory is the root. Otherwise the extraction directory itself is.
///
/// # Errors
/// Returns an error if the directory cannot be read.
pub fn find_extracted_root(dir: &Path) -> Result<PathBuf> {
    let entries: Vec<_> = fs::read_dir(dir)?.collect::<io::Result<_>>()?;
    if let [only] = entries.as_slice() {
        if only.file_type()?.is_dir() {
            return Ok(only.path());
        }
    }
    Ok(dir.to_path_buf())
}

/// Pack `src` into a gzip tarball at `out`.
///
/// Entries are sorted and prefixed with `package/`; ownership and mtimes
/// are zeroed so the same tree always produces the same bytes.
///
/// # Errors
/// Returns an error if a file cannot be read or the tarball cannot be written.
pub fn pack_directory(src: &Path, out: &Path) -> Result<()> {
    let entries = opamfetch_util::fs::list_entries(src)?;
    let encoder = GzEncoder::new(File::create(out)?, Compression::default());
    let mut builder = Builder::new(encoder);

    for (rel, kind) in entries {
        let path = src.join(&rel);
        let name = Path::new(PACKAGE_PREFIX).join(rel);
        let mut header = Header::new_gnu();
        header.set_uid(0);
        header.set_gid(0);
        header.set_mtime(0);

        if kind == EntryKind::Symlink {
            header.set_entry_type(EntryType::Symlink);
            header.set_size(0);
            header.set_mode(LINK_MODE);
            builder.append_link(&mut header, name, fs::read_link(&path)?)?;
            continue;
        }

        let metadata = fs::metadata(&path)?;
        header.set_entry_type(EntryType::Regular);
        header.set_size(metadata.len());
        header.set_mode(if is_executable(&metadata) {
            EXEC_MODE
        } else {
            FILE_MODE
        });
        builder.append_data(&mut header, name, File::open(&path)?)?;
    }

    builder.into_inner()?.finish()?;
    Ok(())
}

/// Unpack a canonical tarball into `dest`, stripping the leading
/// `package/` component.
///
/// # Errors
/// Returns an error if the tarball is corrupt or contains unsafe paths.
pub fn unpack_canonical(archive: &Path, dest: &Path) -> Result<()> {
    fs::create_dir_all(dest)?;
    extract_tar_to(GzDecoder::new(File::open(archive)?), dest, 1)
}

fn extract_tar_to(reader: impl Read, dest: &Path, strip: usize) -> Result<()> {
    let root = fs::canonicalize(dest)?;
    let mut archive = Archive::new(reader);
    let entries = archive
        .entries()
        .map_err(|e| OpamError::archive(format!("Failed to read tarball entries: {e}")))?;

    for entry in entries {
        let mut entry =
            entry.map_err(|e| OpamError::archive(format!("Failed to read tarball entry: {e}")))?;
        let path = entry
            .path()
            .map_err(|e| OpamError::archive(format!("Failed to read entry path: {e}")))?
            .into_owned();

        let Some(rel) = sanitize_entry(&path, strip)? else {
            continue;
        };
        let dest_path = dest.join(&rel);

        let kind = entry.header().entry_type();
        if kind.is_dir() {
            fs::create_dir_all(&dest_path)?;
            ensure_inside(&root, &dest_path, &path)?;
            set_mode(&dest_path, DIR_MODE)?;
            continue;
        }

        let parent = prepare_parent(&root, &dest_path, &path)?;
        if kind.is_file() {
            let mut file = File::create(&dest_path)?;
            io::copy(&mut entry, &mut file)?;
            let executable = entry.header().mode().is_ok_and(|m| m & 0o111 != 0);
            set_mode(&dest_path, if executable { EXEC_MODE } else { FILE_MODE })?;
        } else if kind.is_symlink() {
            let target = link_target(&entry, &path)?;
            let depth = parent.strip_prefix(&root).map_or(0, |p| p.components().count());
            if !stays_inside(depth, &target) {
                return Err(OpamError::archive(format!(
                    "Tarball symlink escapes the package: {} -> {}",
                    path.display(),
                    target.display()
                )));
            }
            make_symlink(&target, &dest_path)?;
        } else if kind.is_hard_link() {
            let target = link_target(&entry, &path)?;
            let Some(target_rel) = sanitize_entry(&target, strip)? else {
                return Err(OpamError::archive(format!(
                    "Tarball hard link has no target: {}",
                    path.display()
                )));
            };
            let source = dest.join(target_rel);
            ensure_inside(&root, &source, &target)?;
            fs::hard_link(&source, &dest_path)?;
        }
        // Device nodes, fifos and other special entries are skipped
    }

    Ok(())
}

fn link_target<R: Read>(entry: &tar::Entry<'_, R>, path: &Path) -> Result<PathBuf> {
    entry
        .link_name()
        .map_err(|e| OpamError::archive(format!("Failed to read link target: {e}")))?
        .map(std::borrow::Cow::into_owned)
        .ok_or_else(|| {
            OpamError::archive(format!("Tarball link has no target: {}", path.display()))
        })
}

/// Create the parent of `dest_path` and check that it resolves inside
/// `root`, so earlier symlinks cannot redirect the write.
fn prepare_parent(root: &Path, dest_path: &Path, shown: &Path) -> Result<PathBuf> {
    let parent = dest_path.parent().unwrap_or(root);
    fs::create_dir_all(parent)?;
    ensure_inside(root, parent, shown)
}

fn ensure_inside(root: &Path, path: &Path, shown: &Path) -> Result<PathBuf> {
    let resolved = fs::canonicalize(path)?;
    if resolved.starts_with(root) {
        Ok(resolved)
    } else {
        Err(OpamError::archive(format!(
            "Tarball entry resolves outside the package: {}",
            shown.display()
        )))
    }
}

/// Whether a relative symlink `target`, placed `depth` directories below
/// the root, stays within the root.
fn stays_inside(depth: usize, target: &Path) -> bool {
    let mut depth = depth;
    for component in target.components() {
        match component {
            Component::Normal(_) => depth += 1,
            Component::CurDir => {}
            Component::ParentDir if depth > 0 => depth -= 1,
            _ => return false,
        }
    }
    true
}

fn extract_zip_to(file: File, dest: &Path) -> Result<()> {
    let mut archive = zip::ZipArchive::new(file)
        .map_err(|e| OpamError::archive(format!("Failed to open zip archive: {e}")))?;

    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|e| OpamError::archive(format!("Failed to read zip entry: {e}")))?;
        let Some(rel) = entry.enclosed_name() else {
            return Err(OpamError::archive(format!(
                "Zip archive contains unsafe path: {}",
                entry.name()
            )));
        };
        let dest_path = dest.join(rel);

        if entry.is_dir() {
            fs::create_dir_all(&dest_path)?;
        } else {
            if let Some(parent) = dest_path.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut out = File::create(&dest_path)?;
            io::copy(&mut entry, &mut out)?;
            let executable = entry.unix_mode().is_some_and(|m| m & 0o111 != 0);
            set_mode(&dest_path, if executable { EXEC_MODE } else { FILE_MODE })?;
        }
    }

    Ok(())
}

/// Drop `strip` leading components and reject absolute or escaping paths.
/// `None` means the entry is one of the stripped directories itself.
fn sanitize_entry(path: &Path, strip: usize) -> Result<Option<PathBuf>> {
    let shown = path.to_string_lossy();
    if path.is_absolute() {
        return Err(OpamError::archive(format!(
            "Tarball contains absolute path: {shown}"
        )));
    }

    let mut rel = PathBuf::new();
    for component in path.components().skip(strip) {
        match component {
            Component::Normal(part) => rel.push(part),
            Component::CurDir => {}
            _ => {
                return Err(OpamError::archive(format!(
                    "Tarball contains path traversal: {shown}"
                )))
            }
        }
    }
    Ok((!rel.as_os_str().is_empty()).then_some(rel))
}

#[cfg(unix)]
fn is_executable(metadata: &fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_metadata: &fs::Metadata) -> bool {
    false
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> io::Result<()> {
    Ok(())
}

#[cfg(unix)]
fn make_symlink(target: &Path, link: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(not(unix))]
fn make_symlink(_target: &Path, _link: &Path) -> io::Result<()> {
    Ok(())
}

async fn blocking<T: Send + 'static>(f: impl FnOnce() -> Result<T> + Send + 'static) -> Result<T> {
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| OpamError::archive(format!("archive task failed: {e}")))?
}
