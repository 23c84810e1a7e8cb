//! Protocol connections used by the listing and retrieval engines.
//!
//! A [`Connector`] is shared by every worker of a pool and opens one
//! [`Connection`] per worker. Connections are owned by a single worker and
//! reused for all of its files.

use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom};
use std::path::Path;
use std::time::Duration;

use crate::descriptor::DatabankDescriptor;
use crate::domain::{Protocol, RemoteEntry, RemoteFile};
use crate::error::MirrorError;
use crate::progress::TransferMeter;

pub mod aspera;
pub mod ftp;
pub mod http;
pub mod local;

pub use aspera::AsperaConnector;
pub use ftp::FtpConnector;
pub use http::HttpConnector;
pub use local::LocalConnector;

pub trait Connection: Send {
    /// Lists the entries of one directory.
    fn list(&mut self, dir: &str) -> Result<Vec<RemoteEntry>, MirrorError>;

    /// Exact size of a listed file whose entry carried none.
    fn file_size(&mut self, path: &str) -> Result<u64, MirrorError> {
        Err(MirrorError::Listing {
            path: path.to_string(),
            message: "no exact size in listing".to_string(),
        })
    }

    /// Transfers `file` into `target`, continuing from `offset` bytes.
    /// Returns [`MirrorError::Interrupted`] when the meter observes an abort.
    fn retrieve(
        &mut self,
        file: &RemoteFile,
        target: &Path,
        offset: u64,
        meter: &mut TransferMeter<'_>,
    ) -> Result<(), MirrorError>;
}

pub trait Connector: Send + Sync {
    fn connect(&self) -> Result<Box<dyn Connection>, MirrorError>;

    /// Host label used in log lines.
    fn host(&self) -> &str;
}

/// Builds the connector a descriptor asks for. The high-speed transfer
/// wraps the descriptor's protocol, which keeps doing the listing.
pub fn connector_for(
    descriptor: &DatabankDescriptor,
    poll_interval: Duration,
) -> Result<Box<dyn Connector>, MirrorError> {
    let base: Box<dyn Connector> = match descriptor.protocol {
        Protocol::Local => return Ok(Box::new(LocalConnector)),
        Protocol::Ftp => Box::new(FtpConnector::new(
            &descriptor.server,
            descriptor.port,
            &descriptor.username,
            &descriptor.password,
        )),
        Protocol::Http | Protocol::Https => Box::new(HttpConnector::new(
            descriptor.protocol,
            &descriptor.server,
            descriptor.port,
        )?),
    };
    match &descriptor.aspera {
        Some(settings) => Ok(Box::new(AsperaConnector::new(
            base,
            settings,
            &descriptor.username,
            poll_interval,
        )?)),
        None => Ok(base),
    }
}

/// Opens the local target for writing at `offset`, truncating anything past
/// it. Offset zero starts a fresh file.
pub fn open_target(target: &Path, offset: u64) -> Result<File, MirrorError> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).map_err(|err| MirrorError::Filesystem(err.to_string()))?;
    }
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(offset == 0)
        .open(target)
        .map_err(|err| {
            MirrorError::Filesystem(format!("open {}: {err}", target.display()))
        })?;
    if offset > 0 {
        file.set_len(offset)
            .map_err(|err| MirrorError::Filesystem(err.to_string()))?;
        file.seek(SeekFrom::Start(offset))
            .map_err(|err| MirrorError::Filesystem(err.to_string()))?;
    }
    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn open_target_keeps_prefix() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("nested").join("f.dat");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, b"abcdXXXX").unwrap();
        let mut file = open_target(&path, 4).unwrap();
        file.write_all(b"ef").unwrap();
        drop(file);
        assert_eq!(fs::read(&path).unwrap(), b"abcdef");

        let mut file = open_target(&path, 0).unwrap();
        file.write_all(b"z").unwrap();
        drop(file);
        assert_eq!(fs::read(&path).unwrap(), b"z");
    }
}
