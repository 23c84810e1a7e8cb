//! High-speed transfers through the external `ascp` client.
//!
//! `ascp` gives no byte-level callback, so the child process is polled on a
//! fixed interval while the local file size feeds the transfer meter. Listing
//! is delegated to the descriptor's regular protocol.

use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use crate::descriptor::AsperaSettings;
use crate::domain::{RemoteEntry, RemoteFile};
use crate::error::MirrorError;
use crate::fs_util::find_in_path;
use crate::progress::TransferMeter;
use crate::remote::{Connection, Connector};

const KILL_GRACE: Duration = Duration::from_millis(500);

pub struct AsperaConnector {
    lister: Box<dyn Connector>,
    program: PathBuf,
    address: String,
    username: String,
    args: Vec<String>,
    poll_interval: Duration,
}

impl AsperaConnector {
    pub fn new(
        lister: Box<dyn Connector>,
        settings: &AsperaSettings,
        username: &str,
        poll_interval: Duration,
    ) -> Result<Self, MirrorError> {
        let program =
            find_in_path("ascp").ok_or_else(|| MirrorError::MissingTool("ascp".to_string()))?;
        Ok(Self::with_program(lister, program, settings, username, poll_interval))
    }

    pub fn with_program(
        lister: Box<dyn Connector>,
        program: PathBuf,
        settings: &AsperaSettings,
        username: &str,
        poll_interval: Duration,
    ) -> Self {
        Self {
            lister,
            program,
            address: settings.address.clone(),
            username: username.to_string(),
            args: settings.args.clone(),
            poll_interval,
        }
    }
}

impl Connector for AsperaConnector {
    fn connect(&self) -> Result<Box<dyn Connection>, MirrorError> {
        Ok(Box::new(AsperaConnection {
            lister: self.lister.connect()?,
            program: self.program.clone(),
            source_prefix: format!("{}@{}:", self.username, self.address),
            args: self.args.clone(),
            poll_interval: self.poll_interval,
        }))
    }

    fn host(&self) -> &str {
        &self.address
    }
}

pub struct AsperaConnection {
    lister: Box<dyn Connection>,
    program: PathBuf,
    source_prefix: String,
    args: Vec<String>,
    poll_interval: Duration,
}

impl AsperaConnection {
    fn command(&self, file: &RemoteFile, target: &Path, stderr: File) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            // -k2: resume when the local file is a prefix of the remote one.
            .arg("-k2")
            .arg(format!("{}{}", self.source_prefix, file.path()))
            .arg(target)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::from(stderr));
        cmd
    }
}

impl Connection for AsperaConnection {
    fn list(&mut self, dir: &str) -> Result<Vec<RemoteEntry>, MirrorError> {
        self.lister.list(dir)
    }

    fn file_size(&mut self, path: &str) -> Result<u64, MirrorError> {
        self.lister.file_size(path)
    }

    fn retrieve(
        &mut self,
        file: &RemoteFile,
        target: &Path,
        offset: u64,
        meter: &mut TransferMeter<'_>,
    ) -> Result<(), MirrorError> {
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|err| MirrorError::Filesystem(err.to_string()))?;
        }
        if offset == 0 && target.exists() {
            fs::remove_file(target).map_err(|err| MirrorError::Filesystem(err.to_string()))?;
        }
        let fs_error = |err: std::io::Error| MirrorError::Filesystem(err.to_string());
        // stderr goes to an unnamed file so a chatty ascp cannot fill a pipe.
        let stderr = tempfile::tempfile().map_err(fs_error)?;
        let stderr_handle = stderr.try_clone().map_err(fs_error)?;
        debug!(file = %file.name, offset, "starting ascp");
        let child = self
            .command(file, target, stderr_handle)
            .spawn()
            .map_err(|err| MirrorError::Transfer {
                name: file.name.clone(),
                message: format!("spawn {}: {err}", self.program.display()),
            })?;
        watch(child, stderr, file, target, meter, self.poll_interval)
    }
}

/// Polls a transfer process until it exits or the run is aborted. `stderr`
/// is the file the process writes its diagnostics to.
pub fn watch(
    mut child: Child,
    mut stderr: File,
    file: &RemoteFile,
    target: &Path,
    meter: &mut TransferMeter<'_>,
    poll_interval: Duration,
) -> Result<(), MirrorError> {
    let transfer_error = |message: String| MirrorError::Transfer {
        name: file.name.clone(),
        message,
    };
    loop {
        let exited = child
            .try_wait()
            .map_err(|err| transfer_error(err.to_string()))?;
        if let Some(status) = exited {
            if status.success() {
                meter.observe(local_size(target))?;
                return Ok(());
            }
            let mut message = String::new();
            if stderr.seek(SeekFrom::Start(0)).is_ok() {
                let _ = stderr.read_to_string(&mut message);
            }
            return Err(transfer_error(format!(
                "transfer process exited with {status}: {}",
                message.trim()
            )));
        }

        if let Err(err) = meter.observe(local_size(target)) {
            warn!(file = %file.name, "abort requested, stopping transfer process");
            let _ = child.kill();
            thread::sleep(KILL_GRACE);
            let _ = child.try_wait();
            return Err(err);
        }
        thread::sleep(poll_interval);
    }
}

fn local_size(path: &Path) -> u64 {
    fs::metadata(path).map(|meta| meta.len()).unwrap_or(0)
}
