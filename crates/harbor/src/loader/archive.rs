//! Reading and unpacking plugin archives
//!
//! Everything in here is blocking file I/O and runs on the blocking pool.

use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use zip::ZipArchive;

use super::manifest::{PluginManifest, MANIFEST_FILE};
use super::LoadError;
use crate::types::is_valid_name;

/// Recognised archive extensions, compared case-insensitively
pub const ARCHIVE_EXTENSIONS: &[&str] = &["zip", "jar"];

/// An archive file found in the plugins directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArchiveCandidate {
    /// Plugin id, the archive file stem
    pub id: String,
    pub path: PathBuf,
    /// SHA-256 of the archive bytes, hex encoded
    pub fingerprint: String,
    pub modified: Option<DateTime<Utc>>,
    pub size: u64,
}

/// Whether `path` looks like a plugin archive
pub fn is_archive(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            ARCHIVE_EXTENSIONS
                .iter()
                .any(|known| ext.eq_ignore_ascii_case(known))
        })
        .unwrap_or(false)
}

/// Plugin id for an archive path, if the file stem is usable as one
pub fn plugin_id(path: &Path) -> Option<String> {
    let stem = path.file_stem()?.to_str()?;
    is_valid_name(stem).then(|| stem.to_string())
}

/// Inspect an archive on disk without opening it as a zip
pub fn inspect(path: &Path) -> Result<ArchiveCandidate, LoadError> {
    let id = plugin_id(path)
        .ok_or_else(|| LoadError::malformed(path, "file name is not a valid plugin id"))?;

    let metadata = fs::metadata(path).map_err(|e| LoadError::io(path, e))?;
    let modified = metadata.modified().ok().map(DateTime::<Utc>::from);

    let mut file = File::open(path).map_err(|e| LoadError::io(path, e))?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher).map_err(|e| LoadError::io(path, e))?;

    Ok(ArchiveCandidate {
        id,
        path: path.to_path_buf(),
        fingerprint: hex::encode(hasher.finalize()),
        modified,
        size: metadata.len(),
    })
}

fn open(path: &Path) -> Result<ZipArchive<File>, LoadError> {
    let file = File::open(path).map_err(|e| LoadError::io(path, e))?;
    ZipArchive::new(file).map_err(|e| LoadError::malformed(path, format!("not a zip archive: {e}")))
}

/// Read and validate the manifest of an archive
pub fn read_manifest(path: &Path) -> Result<PluginManifest, LoadError> {
    let mut archive = open(path)?;

    let text = {
        let mut entry = match archive.by_name(MANIFEST_FILE) {
            Ok(entry) => entry,
            Err(zip::result::ZipError::FileNotFound) => {
                return Err(LoadError::MissingManifest(path.to_path_buf()))
            }
            Err(e) => return Err(LoadError::malformed(path, e.to_string())),
        };
        let mut text = String::new();
        entry
            .read_to_string(&mut text)
            .map_err(|e| LoadError::malformed(path, format!("unreadable {MANIFEST_FILE}: {e}")))?;
        text
    };

    let manifest = PluginManifest::parse(path, &text)?;

    let entry_present = (0..archive.len()).any(|i| {
        archive
            .by_index(i)
            .ok()
            .and_then(|file| file.enclosed_name().map(|p| p == Path::new(&manifest.entry)))
            .unwrap_or(false)
    });
    if !entry_present {
        return Err(LoadError::malformed(
            path,
            format!("entry '{}' is not in the archive", manifest.entry),
        ));
    }

    Ok(manifest)
}

/// Unpack `archive` into `dest`, which must not exist yet
///
/// Entries whose names would land outside `dest` are rejected.
pub fn extract(archive_path: &Path, dest: &Path) -> Result<(), LoadError> {
    let mut archive = open(archive_path)?;
    fs::create_dir_all(dest).map_err(|e| LoadError::io(dest, e))?;

    for i in 0..archive.len() {
        let mut file = archive
            .by_index(i)
            .map_err(|e| LoadError::malformed(archive_path, e.to_string()))?;

        let relative = file.enclosed_name().map(Path::to_path_buf).ok_or_else(|| {
            LoadError::malformed(
                archive_path,
                format!("entry '{}' escapes the archive root", file.name()),
            )
        })?;
        let out_path = dest.join(relative);

        if file.is_dir() {
            fs::create_dir_all(&out_path).map_err(|e| LoadError::io(&out_path, e))?;
            continue;
        }

        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent).map_err(|e| LoadError::io(parent, e))?;
        }
        let mut out = File::create(&out_path).map_err(|e| LoadError::io(&out_path, e))?;
        io::copy(&mut file, &mut out).map_err(|e| LoadError::io(&out_path, e))?;

        #[cfg(unix)]
        if let Some(mode) = file.unix_mode() {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&out_path, fs::Permissions::from_mode(mode))
                .map_err(|e| LoadError::io(&out_path, e))?;
        }
    }

    Ok(())
}

/// Make sure the entry point can be executed after extraction
pub fn ensure_executable(path: &Path) -> Result<(), LoadError> {
    let metadata = fs::metadata(path).map_err(|e| LoadError::io(path, e))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = metadata.permissions();
        if perms.mode() & 0o111 == 0 {
            perms.set_mode(perms.mode() | 0o755);
            fs::set_permissions(path, perms).map_err(|e| LoadError::io(path, e))?;
        }
    }
    #[cfg(not(unix))]
    let _ = metadata;

    Ok(())
}
