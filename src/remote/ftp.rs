//! FTP connections over `suppaftp`.
//!
//! Sessions use Extended Passive Mode (EPSV) and binary transfers. Partial
//! files resume with `REST`.

use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use suppaftp::list::File as ListLine;
use suppaftp::types::FileType;
use suppaftp::{FtpStream, Mode};
use tracing::{debug, warn};

use crate::domain::{EntryKind, RemoteEntry, RemoteFile};
use crate::error::MirrorError;
use crate::progress::TransferMeter;
use crate::remote::{Connection, Connector, open_target};

#[derive(Debug, Clone)]
pub struct FtpConnector {
    host: String,
    port: u16,
    username: String,
    password: String,
}

impl FtpConnector {
    pub fn new(host: &str, port: u16, username: &str, password: &str) -> Self {
        Self {
            host: host.to_string(),
            port,
            username: username.to_string(),
            password: password.to_string(),
        }
    }

    fn connection_error(&self, message: impl ToString) -> MirrorError {
        MirrorError::Connection {
            host: self.host.clone(),
            message: message.to_string(),
        }
    }
}

impl Connector for FtpConnector {
    fn connect(&self) -> Result<Box<dyn Connection>, MirrorError> {
        debug!("Connecting to FTP server: {}:{}", self.host, self.port);
        let mut stream = FtpStream::connect(format!("{}:{}", self.host, self.port))
            .map_err(|err| self.connection_error(err))?;
        stream.set_mode(Mode::ExtendedPassive);

        debug!("Logging in as: {}", self.username);
        stream
            .login(self.username.as_str(), self.password.as_str())
            .map_err(|err| self.connection_error(format!("login: {err}")))?;
        stream
            .transfer_type(FileType::Binary)
            .map_err(|err| self.connection_error(format!("binary mode: {err}")))?;

        Ok(Box::new(FtpConnection { stream }))
    }

    fn host(&self) -> &str {
        &self.host
    }
}

pub struct FtpConnection {
    stream: FtpStream,
}

impl Connection for FtpConnection {
    fn list(&mut self, dir: &str) -> Result<Vec<RemoteEntry>, MirrorError> {
        debug!("Listing directory: {}", dir);
        let lines = self
            .stream
            .list(Some(dir))
            .map_err(|err| MirrorError::Listing {
                path: dir.to_string(),
                message: err.to_string(),
            })?;
        Ok(lines.iter().filter_map(|line| parse_list_line(line)).collect())
    }

    fn retrieve(
        &mut self,
        file: &RemoteFile,
        target: &Path,
        offset: u64,
        meter: &mut TransferMeter<'_>,
    ) -> Result<(), MirrorError> {
        let transfer_error = |message: String| MirrorError::Transfer {
            name: file.name.clone(),
            message,
        };
        if offset > 0 {
            debug!(file = %file.name, offset, "resuming transfer");
            self.stream
                .resume_transfer(offset as usize)
                .map_err(|err| transfer_error(format!("REST {offset}: {err}")))?;
        }
        let mut output = open_target(target, offset)?;
        let mut reader = self
            .stream
            .retr_as_stream(file.path())
            .map_err(|err| transfer_error(err.to_string()))?;
        // On abort the data stream is dropped without finalizing; the worker
        // discards this connection afterwards.
        meter.copy(&mut reader, &mut output)?;
        self.stream
            .finalize_retr_stream(reader)
            .map_err(|err| transfer_error(err.to_string()))?;
        Ok(())
    }
}

impl Drop for FtpConnection {
    fn drop(&mut self) {
        if let Err(e) = self.stream.quit() {
            warn!("Failed to quit FTP session gracefully: {}", e);
        }
    }
}

/// Parses one `LIST` line (UNIX or DOS style).
pub fn parse_list_line(line: &str) -> Option<RemoteEntry> {
    let parsed = ListLine::from_str(line).ok()?;
    let name = parsed.name().to_string();
    if name == "." || name == ".." {
        return None;
    }
    let kind = if parsed.is_directory() {
        EntryKind::Directory
    } else if parsed.is_file() {
        EntryKind::File
    } else {
        EntryKind::Other
    };
    Some(RemoteEntry {
        name,
        kind,
        size: Some(parsed.size() as u64),
        modified: DateTime::<Utc>::from(parsed.modified()),
    })
}
