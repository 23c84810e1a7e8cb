//! Single-file retrieval: skip, resume, transfer, verify.

use std::fs;
use std::path::PathBuf;

use tracing::{debug, info};

use crate::context::RunContext;
use crate::domain::{FetchOutcome, RemoteFile};
use crate::progress::{ProgressSink, TransferMeter};
use crate::remote::Connection;

/// Extensions whose decompressed sibling counts as already retrieved.
const COMPRESSED_EXTS: &[&str] = &[".tar.gz", ".tgz", ".bz2", ".zip", ".gz", ".Z"];

pub struct RetrievalEngine<'a> {
    target_dir: PathBuf,
    ctx: &'a RunContext,
    sink: &'a dyn ProgressSink,
}

impl<'a> RetrievalEngine<'a> {
    pub fn new(target_dir: impl Into<PathBuf>, ctx: &'a RunContext, sink: &'a dyn ProgressSink) -> Self {
        Self {
            target_dir: target_dir.into(),
            ctx,
            sink,
        }
    }

    pub fn local_path(&self, file: &RemoteFile) -> PathBuf {
        self.target_dir.join(&file.name)
    }

    pub fn fetch(&self, connection: &mut dyn Connection, file: &RemoteFile) -> FetchOutcome {
        if self.ctx.is_aborted() {
            return FetchOutcome::Aborted;
        }
        let target = self.local_path(file);
        let local_size = fs::metadata(&target).map(|meta| meta.len()).ok();
        if local_size == Some(file.size) {
            debug!(file = %file.name, "already present with the listed size");
            return FetchOutcome::Skipped;
        }
        if let Some(plain) = decompressed_name(&file.name) {
            if self.target_dir.join(plain).exists() {
                debug!(file = %file.name, "decompressed form already present");
                return FetchOutcome::Skipped;
            }
        }

        let offset = match local_size {
            Some(size) if size < file.size => size,
            _ => 0,
        };
        if offset > 0 {
            info!(file = %file.name, offset, size = file.size, "resuming partial file");
        }
        let mut meter = TransferMeter::new(self.ctx, self.sink, file.name.as_str(), file.size, offset);
        if let Err(err) = connection.retrieve(file, &target, offset, &mut meter) {
            if err.is_interrupted() {
                return FetchOutcome::Aborted;
            }
            return FetchOutcome::Failed(err.to_string());
        }

        match fs::metadata(&target) {
            Ok(meta) if meta.len() == file.size => FetchOutcome::Done,
            Ok(meta) => FetchOutcome::Failed(format!(
                "size mismatch for {}: expected {} bytes, got {}",
                file.name,
                file.size,
                meta.len()
            )),
            Err(err) => FetchOutcome::Failed(format!("stat {}: {err}", target.display())),
        }
    }
}

/// Name with the known compression extension removed, if it has one.
pub fn decompressed_name(name: &str) -> Option<&str> {
    COMPRESSED_EXTS
        .iter()
        .find_map(|ext| name.strip_suffix(ext))
        .filter(|stem| !stem.is_empty())
}
