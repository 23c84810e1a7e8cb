//! Promotion of processed banks into the production tree.
//!
//! Layout: `<root>/<type>/<bank>/current` plus `history/<timestamp>` for
//! earlier versions. A new version is copied and verified next to `current`
//! before any rename touches the live tree. While `current` is moved aside a
//! `.swap` file in the bank directory names the history slot holding it, and
//! [`ProductionInstaller::recover`] moves that slot back if the swap did not
//! finish.

use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::Utc;
use serde::Serialize;
use tempfile::Builder;
use tracing::{debug, error, info, warn};

use crate::descriptor::MAX_HISTORY_DEPTH;
use crate::domain::BankType;
use crate::error::MirrorError;
use crate::fs_util::{copy_dir_recursive, tree_stats};

const HISTORY_STAMP: &str = "%Y%m%d%H%M%S";
const SWAP_MARKER: &str = ".swap";

#[derive(Debug, Clone, Serialize)]
pub struct InstallReport {
    pub bank: String,
    pub current: String,
    pub files: usize,
    pub bytes: u64,
    pub history: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ProductionInstaller {
    root: Utf8PathBuf,
}

impl ProductionInstaller {
    pub fn new(root: Utf8PathBuf) -> Self {
        Self { root }
    }

    pub fn bank_dir(&self, bank_type: BankType, name: &str) -> Utf8PathBuf {
        self.root.join(bank_type.dir_name()).join(name)
    }

    pub fn current_dir(&self, bank_type: BankType, name: &str) -> Utf8PathBuf {
        self.bank_dir(bank_type, name).join("current")
    }

    pub fn history_dir(&self, bank_type: BankType, name: &str) -> Utf8PathBuf {
        self.bank_dir(bank_type, name).join("history")
    }

    /// History entries, oldest first.
    pub fn history(&self, bank_type: BankType, name: &str) -> Result<Vec<Utf8PathBuf>, MirrorError> {
        let dir = self.history_dir(bank_type, name);
        if !dir.as_std_path().exists() {
            return Ok(Vec::new());
        }
        let mut entries = Vec::new();
        for entry in fs::read_dir(dir.as_std_path()).map_err(fs_err)? {
            let entry = entry.map_err(fs_err)?;
            let path = Utf8PathBuf::from_path_buf(entry.path())
                .map_err(|_| MirrorError::Install("non-utf8 history path".to_string()))?;
            if path.as_std_path().is_dir() {
                entries.push(path);
            }
        }
        entries.sort();
        Ok(entries)
    }

    pub fn install(
        &self,
        bank_type: BankType,
        name: &str,
        source: &Utf8Path,
        history_depth: u8,
    ) -> Result<InstallReport, MirrorError> {
        if !source.as_std_path().is_dir() {
            return Err(MirrorError::Install(format!("no tree to install at {source}")));
        }
        let depth = usize::from(history_depth.min(MAX_HISTORY_DEPTH));
        let bank_dir = self.bank_dir(bank_type, name);
        fs::create_dir_all(bank_dir.as_std_path()).map_err(fs_err)?;
        self.recover(bank_type, name)?;

        let expected = tree_stats(source.as_std_path())?;
        let staging = Builder::new()
            .prefix(".staging-")
            .tempdir_in(bank_dir.as_std_path())
            .map_err(fs_err)?;
        copy_dir_recursive(source.as_std_path(), staging.path())?;
        let staged = tree_stats(staging.path())?;
        if staged != expected {
            return Err(MirrorError::Install(format!(
                "staged copy of {name} holds {} files / {} bytes, expected {} / {}",
                staged.0, staged.1, expected.0, expected.1
            )));
        }
        debug!(bank = name, files = staged.0, bytes = staged.1, "staged copy verified");

        let current = self.current_dir(bank_type, name);
        let marker = bank_dir.join(SWAP_MARKER);
        if current.as_std_path().exists() {
            let history = self.history_dir(bank_type, name);
            fs::create_dir_all(history.as_std_path()).map_err(fs_err)?;
            let retired = unique_slot(&history, &Utc::now().format(HISTORY_STAMP).to_string());
            fs::write(marker.as_std_path(), retired.as_str()).map_err(fs_err)?;
            fs::rename(current.as_std_path(), retired.as_std_path()).map_err(fs_err)?;
            debug!(bank = name, to = %retired, "previous version moved to history");
        }
        if let Err(err) = fs::rename(staging.path(), current.as_std_path()) {
            error!(bank = name, "promoting the new version failed: {err}");
            self.recover(bank_type, name)?;
            return Err(fs_err(err));
        }
        if marker.as_std_path().exists() {
            fs::remove_file(marker.as_std_path()).map_err(fs_err)?;
        }

        let history = self.prune(bank_type, name, depth)?;
        info!(bank = name, current = %current, kept = history.len(), "installed in production");
        Ok(InstallReport {
            bank: name.to_string(),
            current: current.to_string(),
            files: expected.0,
            bytes: expected.1,
            history: history.iter().map(|path| path.to_string()).collect(),
        })
    }

    /// Finishes an interrupted swap: when `current` is missing, the history
    /// slot named by the swap marker becomes `current` again. Returns true
    /// when a version was restored.
    pub fn recover(&self, bank_type: BankType, name: &str) -> Result<bool, MirrorError> {
        let marker = self.bank_dir(bank_type, name).join(SWAP_MARKER);
        if !marker.as_std_path().exists() {
            return Ok(false);
        }
        let retired = Utf8PathBuf::from(fs::read_to_string(marker.as_std_path()).map_err(fs_err)?.trim());
        let current = self.current_dir(bank_type, name);
        let restored = !current.as_std_path().exists() && retired.as_std_path().is_dir();
        if restored {
            warn!(bank = name, from = %retired, "restoring the previous version after an interrupted install");
            fs::rename(retired.as_std_path(), current.as_std_path()).map_err(fs_err)?;
        }
        fs::remove_file(marker.as_std_path()).map_err(fs_err)?;
        Ok(restored)
    }

    /// Drops the oldest history entries beyond `depth`.
    fn prune(&self, bank_type: BankType, name: &str, depth: usize) -> Result<Vec<Utf8PathBuf>, MirrorError> {
        let mut history = self.history(bank_type, name)?;
        while history.len() > depth {
            let oldest = history.remove(0);
            debug!(bank = name, path = %oldest, "pruning history");
            fs::remove_dir_all(oldest.as_std_path()).map_err(fs_err)?;
        }
        Ok(history)
    }
}

fn unique_slot(dir: &Utf8Path, stamp: &str) -> Utf8PathBuf {
    let mut candidate = dir.join(stamp);
    let mut n = 1;
    while candidate.as_std_path().exists() {
        candidate = dir.join(format!("{stamp}-{n:02}"));
        n += 1;
    }
    candidate
}

fn fs_err(err: impl ToString) -> MirrorError {
    MirrorError::Install(err.to_string())
}
