use std::fs::{self, File};
use std::io::{Seek, SeekFrom};
use std::path::Path;

use chrono::{DateTime, Utc};

use crate::domain::{EntryKind, RemoteEntry, RemoteFile};
use crate::error::MirrorError;
use crate::progress::TransferMeter;
use crate::remote::{Connection, Connector, open_target};

/// Local filesystem source. Directory paths are used as given.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalConnector;

impl Connector for LocalConnector {
    fn connect(&self) -> Result<Box<dyn Connection>, MirrorError> {
        Ok(Box::new(LocalConnection))
    }

    fn host(&self) -> &str {
        "localhost"
    }
}

pub struct LocalConnection;

impl Connection for LocalConnection {
    fn list(&mut self, dir: &str) -> Result<Vec<RemoteEntry>, MirrorError> {
        let listing_error = |message: String| MirrorError::Listing {
            path: dir.to_string(),
            message,
        };
        let entries = fs::read_dir(dir).map_err(|err| listing_error(err.to_string()))?;
        let mut out = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| listing_error(err.to_string()))?;
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            // Follows symlinks; dangling links show up as unsupported entries.
            let (kind, size, modified) = match fs::metadata(entry.path()) {
                Ok(meta) if meta.is_file() => (EntryKind::File, meta.len(), modified_at(&meta)),
                Ok(meta) if meta.is_dir() => (EntryKind::Directory, 0, modified_at(&meta)),
                _ => (EntryKind::Other, 0, DateTime::<Utc>::UNIX_EPOCH),
            };
            out.push(RemoteEntry {
                name,
                kind,
                size: Some(size),
                modified,
            });
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    fn retrieve(
        &mut self,
        file: &RemoteFile,
        target: &Path,
        offset: u64,
        meter: &mut TransferMeter<'_>,
    ) -> Result<(), MirrorError> {
        let source = file.path();
        let transfer_error = |message: String| MirrorError::Transfer {
            name: file.name.clone(),
            message,
        };
        let mut input = File::open(&source).map_err(|err| transfer_error(err.to_string()))?;
        if offset > 0 {
            input
                .seek(SeekFrom::Start(offset))
                .map_err(|err| transfer_error(err.to_string()))?;
        }
        let mut output = open_target(target, offset)?;
        meter.copy(&mut input, &mut output)?;
        Ok(())
    }
}

/// Handle for an explicitly named local file.
pub fn stat_file(path: &Path) -> Result<RemoteFile, MirrorError> {
    let meta = fs::metadata(path)
        .map_err(|err| MirrorError::Filesystem(format!("stat {}: {err}", path.display())))?;
    if !meta.is_file() {
        return Err(MirrorError::Filesystem(format!(
            "not a regular file: {}",
            path.display()
        )));
    }
    let dir = path
        .parent()
        .map(|parent| parent.to_string_lossy().to_string())
        .unwrap_or_default();
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .ok_or_else(|| MirrorError::Filesystem(format!("no file name: {}", path.display())))?;
    Ok(RemoteFile::new(dir, name, meta.len(), modified_at(&meta)))
}

fn modified_at(meta: &fs::Metadata) -> DateTime<Utc> {
    meta.modified()
        .map(DateTime::<Utc>::from)
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}
