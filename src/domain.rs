use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::error::MirrorError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BankType {
    Protein,
    Nucleic,
    Dictionary,
}

impl BankType {
    /// Directory name used under the production root.
    pub fn dir_name(self) -> &'static str {
        match self {
            BankType::Protein => "protein",
            BankType::Nucleic => "nucleic",
            BankType::Dictionary => "dictionary",
        }
    }
}

impl fmt::Display for BankType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BankType::Protein => write!(f, "p"),
            BankType::Nucleic => write!(f, "n"),
            BankType::Dictionary => write!(f, "d"),
        }
    }
}

impl FromStr for BankType {
    type Err = MirrorError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "p" | "protein" => Ok(BankType::Protein),
            "n" | "nucleic" => Ok(BankType::Nucleic),
            "d" | "dictionary" => Ok(BankType::Dictionary),
            _ => Err(MirrorError::InvalidBankType(value.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Ftp,
    Http,
    Https,
    Local,
}

impl Protocol {
    pub fn scheme(self) -> &'static str {
        match self {
            Protocol::Ftp => "ftp",
            Protocol::Http => "http",
            Protocol::Https => "https",
            Protocol::Local => "file",
        }
    }

    pub fn default_port(self) -> u16 {
        match self {
            Protocol::Ftp => 21,
            Protocol::Http => 80,
            Protocol::Https => 443,
            Protocol::Local => 0,
        }
    }
}

impl FromStr for Protocol {
    type Err = MirrorError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "" | "ftp" => Ok(Protocol::Ftp),
            "http" => Ok(Protocol::Http),
            "https" => Ok(Protocol::Https),
            "local" | "file" => Ok(Protocol::Local),
            other => Err(MirrorError::InvalidDescriptor {
                name: "protocol".to_string(),
                message: format!("unsupported protocol {other}"),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum, Default)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    #[default]
    Download,
    Info,
}

/// One remote object (or local file) selected for retrieval.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFile {
    pub dir: String,
    pub name: String,
    pub size: u64,
    pub modified: DateTime<Utc>,
}

impl RemoteFile {
    pub fn new(dir: impl Into<String>, name: impl Into<String>, size: u64, modified: DateTime<Utc>) -> Self {
        Self {
            dir: dir.into(),
            name: name.into(),
            size,
            modified,
        }
    }

    /// Directory and name joined with a single `/`.
    pub fn path(&self) -> String {
        if self.dir.is_empty() {
            self.name.clone()
        } else if self.dir.ends_with('/') {
            format!("{}{}", self.dir, self.name)
        } else {
            format!("{}/{}", self.dir, self.name)
        }
    }
}

/// Entry kind reported by a directory listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    pub name: String,
    pub kind: EntryKind,
    /// `None` when the listing only shows a rounded size.
    pub size: Option<u64>,
    pub modified: DateTime<Utc>,
}

/// Result of retrieving one file. Codes follow the batch contract:
/// 0 failure, 1 success, 2 skip, 3 aborted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    Failed(String),
    Done,
    Skipped,
    Aborted,
}

impl FetchOutcome {
    pub fn code(&self) -> u8 {
        match self {
            FetchOutcome::Failed(_) => 0,
            FetchOutcome::Done => 1,
            FetchOutcome::Skipped => 2,
            FetchOutcome::Aborted => 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListOutcome {
    Failed(String),
    Listed(Vec<RemoteFile>),
    Aborted,
}

impl ListOutcome {
    pub fn code(&self) -> u8 {
        match self {
            ListOutcome::Failed(_) => 0,
            ListOutcome::Listed(_) => 1,
            ListOutcome::Aborted => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Ok,
    Error,
    Aborted,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Ok => write!(f, "ok"),
            RunStatus::Error => write!(f, "error"),
            RunStatus::Aborted => write!(f, "aborted"),
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn parse_bank_type() {
        assert_eq!("p".parse::<BankType>().unwrap(), BankType::Protein);
        assert_eq!("N".parse::<BankType>().unwrap(), BankType::Nucleic);
        assert_eq!("d".parse::<BankType>().unwrap(), BankType::Dictionary);
        let err = "x".parse::<BankType>().unwrap_err();
        assert_matches!(err, MirrorError::InvalidBankType(_));
    }

    #[test]
    fn remote_path_joins_once() {
        let at = Utc::now();
        assert_eq!(RemoteFile::new("/pub/", "a.gz", 1, at).path(), "/pub/a.gz");
        assert_eq!(RemoteFile::new("/pub", "a.gz", 1, at).path(), "/pub/a.gz");
        assert_eq!(RemoteFile::new("", "a.gz", 1, at).path(), "a.gz");
    }

    #[test]
    fn outcome_codes() {
        assert_eq!(FetchOutcome::Failed("x".to_string()).code(), 0);
        assert_eq!(FetchOutcome::Done.code(), 1);
        assert_eq!(FetchOutcome::Skipped.code(), 2);
        assert_eq!(FetchOutcome::Aborted.code(), 3);
        assert_eq!(ListOutcome::Aborted.code(), 3);
    }
}
