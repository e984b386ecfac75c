/*!
Zip archive creation and extraction with byte-level progress callbacks.
*/

use crate::error::IoResultExt;
use crate::fsops;
use crate::{Result, VaultError};
use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::Path;
use tracing::debug;
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

const CHUNK_SIZE: usize = 64 * 1024;

/// Zip every entry under `source_dir` into a new archive at `archive_path`
///
/// Entry names are relative to `source_dir`. `on_bytes` is called with the
/// number of source bytes consumed after every chunk. Returns the total
/// number of source bytes archived. On error the partially written archive
/// is left for the caller to remove.
pub fn write_archive<F>(source_dir: &Path, archive_path: &Path, mut on_bytes: F) -> Result<u64>
where
    F: FnMut(u64),
{
    let file = File::create(archive_path).at_path(archive_path)?;
    let mut zip = ZipWriter::new(BufWriter::new(file));
    let mut buffer = vec![0u8; CHUNK_SIZE];
    let mut total = 0u64;

    for entry in WalkDir::new(source_dir)
        .min_depth(1)
        .follow_links(false)
        .sort_by_file_name()
    {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(source_dir).to_path_buf();
            match e.into_io_error() {
                Some(source) => VaultError::io(path, source),
                None => VaultError::integrity(format!("filesystem loop under {}", path.display())),
            }
        })?;
        let name = fsops::relative_path(source_dir, entry.path())?;

        if entry.file_type().is_dir() {
            zip.add_directory(name, SimpleFileOptions::default())
                .map_err(|e| VaultError::archive(archive_path, e))?;
            continue;
        }
        if !entry.file_type().is_file() {
            continue;
        }

        let len = entry.metadata().map(|m| m.len()).unwrap_or(0);
        let options = SimpleFileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .large_file(len > u32::MAX as u64);
        zip.start_file(name, options)
            .map_err(|e| VaultError::archive(archive_path, e))?;

        let mut source = File::open(entry.path()).at_path(entry.path())?;
        loop {
            let read = source.read(&mut buffer).at_path(entry.path())?;
            if read == 0 {
                break;
            }
            zip.write_all(&buffer[..read]).at_path(archive_path)?;
            total += read as u64;
            on_bytes(read as u64);
        }
    }

    let writer = zip
        .finish()
        .map_err(|e| VaultError::archive(archive_path, e))?;
    let file = writer
        .into_inner()
        .map_err(|e| VaultError::io(archive_path, e.into_error()))?;
    file.sync_all().at_path(archive_path)?;

    debug!(archive = %archive_path.display(), bytes = total, "Archive written");
    Ok(total)
}

/// Sum of the uncompressed sizes of every entry
pub fn uncompressed_size(archive_path: &Path) -> Result<u64> {
    let mut archive = open(archive_path)?;
    let mut total = 0u64;
    for index in 0..archive.len() {
        let entry = archive
            .by_index(index)
            .map_err(|e| VaultError::archive(archive_path, e))?;
        total = total.saturating_add(entry.size());
    }
    Ok(total)
}

/// Extract `archive_path` into `destination`
///
/// Any entry whose name would land outside `destination` fails the whole
/// extraction with a validation error. `on_bytes` is called with the number
/// of uncompressed bytes written after every chunk.
pub fn extract_archive<F>(archive_path: &Path, destination: &Path, mut on_bytes: F) -> Result<u64>
where
    F: FnMut(u64),
{
    let mut archive = open(archive_path)?;
    fs::create_dir_all(destination).at_path(destination)?;
    let mut buffer = vec![0u8; CHUNK_SIZE];
    let mut total = 0u64;

    for index in 0..archive.len() {
        let mut entry = archive
            .by_index(index)
            .map_err(|e| VaultError::archive(archive_path, e))?;

        let Some(relative) = entry.enclosed_name() else {
            return Err(VaultError::validation(format!(
                "archive {} contains unsafe entry '{}'",
                archive_path.display(),
                entry.name()
            )));
        };
        let target = destination.join(relative);

        if entry.is_dir() {
            fs::create_dir_all(&target).at_path(&target)?;
            continue;
        }

        let mut out = fsops::touch(&target)?;
        loop {
            let read = match entry.read(&mut buffer) {
                Ok(read) => read,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(VaultError::io(archive_path, e)),
            };
            if read == 0 {
                break;
            }
            out.write_all(&buffer[..read]).at_path(&target)?;
            total += read as u64;
            on_bytes(read as u64);
        }
    }

    debug!(
        archive = %archive_path.display(),
        destination = %destination.display(),
        bytes = total,
        "Archive extracted"
    );
    Ok(total)
}

fn open(archive_path: &Path) -> Result<ZipArchive<File>> {
    let file = File::open(archive_path).at_path(archive_path)?;
    ZipArchive::new(file).map_err(|e| VaultError::archive(archive_path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_archive_then_extract_restores_tree() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("save");
        fs::create_dir_all(source.join("world/maps")).unwrap();
        fs::create_dir_all(source.join("empty")).unwrap();
        fs::write(source.join("world/master.gsav"), "master").unwrap();
        fs::write(source.join("world/maps/0.map"), vec![7u8; 200_000]).unwrap();

        let archive_path = dir.path().join("snap.zip");
        let mut reported = 0u64;
        let written = write_archive(&source, &archive_path, |n| reported += n).unwrap();
        assert_eq!(written, 200_006);
        assert_eq!(reported, written);
        assert_eq!(uncompressed_size(&archive_path).unwrap(), written);

        let out = dir.path().join("out");
        let mut extracted = 0u64;
        extract_archive(&archive_path, &out, |n| extracted += n).unwrap();
        assert_eq!(extracted, written);
        assert_eq!(fs::read_to_string(out.join("world/master.gsav")).unwrap(), "master");
        assert_eq!(fs::read(out.join("world/maps/0.map")).unwrap(), vec![7u8; 200_000]);
        assert!(out.join("empty").is_dir());
    }

    #[test]
    fn test_extract_rejects_escaping_entries() {
        let dir = TempDir::new().unwrap();
        let archive_path = dir.path().join("evil.zip");
        {
            let mut zip = ZipWriter::new(File::create(&archive_path).unwrap());
            zip.start_file("../outside.txt", SimpleFileOptions::default())
                .unwrap();
            zip.write_all(b"nope").unwrap();
            zip.finish().unwrap();
        }

        let err = extract_archive(&archive_path, &dir.path().join("out"), |_| {}).unwrap_err();
        assert!(err.is_validation());
        assert!(!dir.path().join("outside.txt").exists());
    }

    #[test]
    fn test_corrupt_archive_is_archive_error() {
        let dir = TempDir::new().unwrap();
        let archive_path = dir.path().join("broken.zip");
        fs::write(&archive_path, "not a zip").unwrap();

        let err = extract_archive(&archive_path, &dir.path().join("out"), |_| {}).unwrap_err();
        assert!(matches!(err, VaultError::Archive { .. }));
    }
}
