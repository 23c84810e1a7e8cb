use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use tar::Archive;
use zip::ZipArchive;

use crate::error::MirrorError;

fn fs_err(err: impl ToString) -> MirrorError {
    MirrorError::Filesystem(err.to_string())
}

pub fn extract_zip(zip_path: &Path, target_dir: &Path) -> Result<Vec<PathBuf>, MirrorError> {
    let file = fs::File::open(zip_path)
        .map_err(|err| MirrorError::Filesystem(format!("open zip {}: {err}", zip_path.display())))?;
    let mut archive = ZipArchive::new(file).map_err(fs_err)?;

    let mut written = Vec::new();
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i).map_err(fs_err)?;
        let entry_path = match entry.enclosed_name() {
            Some(path) => target_dir.join(path),
            None => {
                return Err(MirrorError::Filesystem(
                    "zip entry path traversal detected".to_string(),
                ));
            }
        };

        if entry.is_dir() {
            fs::create_dir_all(&entry_path).map_err(fs_err)?;
            continue;
        }

        if let Some(parent) = entry_path.parent() {
            fs::create_dir_all(parent).map_err(fs_err)?;
        }
        let mut outfile = fs::File::create(&entry_path).map_err(fs_err)?;
        io::copy(&mut entry, &mut outfile).map_err(fs_err)?;
        written.push(entry_path);
    }
    Ok(written)
}

/// Name of the only file inside a zip archive, if it has exactly one.
pub fn zip_single_member(zip_path: &Path) -> Option<String> {
    let file = fs::File::open(zip_path).ok()?;
    let mut archive = ZipArchive::new(file).ok()?;
    let mut found = None;
    for i in 0..archive.len() {
        let entry = archive.by_index(i).ok()?;
        if entry.is_dir() {
            continue;
        }
        if found.is_some() {
            return None;
        }
        found = entry
            .enclosed_name()
            .and_then(|path| path.file_name().map(|name| name.to_string_lossy().to_string()));
    }
    found
}

/// Unpacks a `.tar`, `.tar.gz` or `.tgz` archive.
pub fn extract_tar(tar_path: &Path, target_dir: &Path) -> Result<(), MirrorError> {
    let file = fs::File::open(tar_path)
        .map_err(|err| MirrorError::Filesystem(format!("open tar {}: {err}", tar_path.display())))?;
    fs::create_dir_all(target_dir).map_err(fs_err)?;
    let name = tar_path.to_string_lossy();
    if name.ends_with(".gz") || name.ends_with(".tgz") {
        Archive::new(GzDecoder::new(file))
            .unpack(target_dir)
            .map_err(fs_err)
    } else {
        Archive::new(file).unpack(target_dir).map_err(fs_err)
    }
}

/// Decompresses `source` (gzip) into `dest` through a temporary sibling.
pub fn gunzip(source: &Path, dest: &Path) -> Result<(), MirrorError> {
    let input = fs::File::open(source)
        .map_err(|err| MirrorError::Filesystem(format!("open {}: {err}", source.display())))?;
    let parent = dest
        .parent()
        .ok_or_else(|| MirrorError::Filesystem("invalid destination path".to_string()))?;
    let mut temp = tempfile::Builder::new()
        .prefix("kira-mirror-gunzip")
        .tempfile_in(parent)
        .map_err(fs_err)?;
    let mut decoder = GzDecoder::new(input);
    io::copy(&mut decoder, temp.as_file_mut())
        .map_err(|err| MirrorError::Filesystem(format!("gunzip {}: {err}", source.display())))?;
    temp.persist(dest).map_err(fs_err)?;
    Ok(())
}

pub fn walk_dir(root: &Path) -> Result<Vec<PathBuf>, MirrorError> {
    let mut items = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(path) = stack.pop() {
        let entries = fs::read_dir(&path).map_err(fs_err)?;
        for entry in entries {
            let entry = entry.map_err(fs_err)?;
            let path = entry.path();
            if path.is_dir() {
                stack.push(path.clone());
            }
            items.push(path);
        }
    }
    Ok(items)
}

/// File count and byte total of a tree.
pub fn tree_stats(root: &Path) -> Result<(usize, u64), MirrorError> {
    let mut files = 0usize;
    let mut bytes = 0u64;
    for path in walk_dir(root)? {
        let meta = fs::symlink_metadata(&path).map_err(fs_err)?;
        if meta.is_file() {
            files += 1;
            bytes += meta.len();
        }
    }
    Ok((files, bytes))
}

pub fn copy_dir_recursive(source: &Path, dest: &Path) -> Result<(), MirrorError> {
    fs::create_dir_all(dest).map_err(fs_err)?;
    for entry in walk_dir(source)? {
        let relative = entry.strip_prefix(source).map_err(fs_err)?;
        let target = dest.join(relative);
        if entry.is_dir() {
            fs::create_dir_all(&target).map_err(fs_err)?;
        } else {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).map_err(fs_err)?;
            }
            fs::copy(&entry, &target).map_err(fs_err)?;
        }
    }
    Ok(())
}

pub fn find_in_path(name: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    for path in std::env::split_paths(&path_var) {
        let exe = path.join(format!("{name}.exe"));
        if exe.exists() {
            return Some(exe);
        }
        let plain = path.join(name);
        if plain.exists() {
            return Some(plain);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use flate2::Compression;
    use flate2::write::GzEncoder;

    use super::*;

    #[test]
    fn gunzip_roundtrip_in_place() {
        let temp = tempfile::tempdir().unwrap();
        let gz = temp.path().join("a.dat.gz");
        let mut encoder = GzEncoder::new(fs::File::create(&gz).unwrap(), Compression::default());
        encoder.write_all(b"ID   TEST\n//\n").unwrap();
        encoder.finish().unwrap();

        let out = temp.path().join("a.dat");
        gunzip(&gz, &out).unwrap();
        assert_eq!(fs::read(&out).unwrap(), b"ID   TEST\n//\n");
    }

    #[test]
    fn zip_member_is_sniffed() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("pack.zip");
        let mut writer = zip::ZipWriter::new(fs::File::create(&path).unwrap());
        writer
            .start_file("inner_name.fasta", zip::write::SimpleFileOptions::default())
            .unwrap();
        writer.write_all(b">x\nACGT\n").unwrap();
        writer.finish().unwrap();

        assert_eq!(zip_single_member(&path).as_deref(), Some("inner_name.fasta"));
        let written = extract_zip(&path, &temp.path().join("out")).unwrap();
        assert_eq!(written.len(), 1);
    }

    #[test]
    fn tree_stats_counts_files() {
        let temp = tempfile::tempdir().unwrap();
        fs::create_dir_all(temp.path().join("a/b")).unwrap();
        fs::write(temp.path().join("a/b/x"), b"12345").unwrap();
        fs::write(temp.path().join("y"), b"12").unwrap();
        assert_eq!(tree_stats(temp.path()).unwrap(), (2, 7));
    }
}
