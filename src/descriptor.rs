//! Per-databank descriptors loaded from `key=value` files.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::domain::{BankType, Protocol};
use crate::error::MirrorError;
use crate::filter::{DateMatcher, NameMatcher};

pub const DESCRIPTOR_EXT: &str = "properties";
pub const MAX_HISTORY_DEPTH: u8 = 5;

pub mod keys {
    pub const NAME: &str = "db.name";
    pub const FULLNAME: &str = "db.fullname";
    pub const PROVIDER: &str = "db.provider";
    pub const TYPE: &str = "db.type";
    pub const DATA_DIR: &str = "data.dir";
    pub const PROTOCOL: &str = "protocol";
    pub const SERVER: &str = "server";
    pub const PORT: &str = "port";
    pub const USERNAME: &str = "username";
    pub const PASSWORD: &str = "password";
    pub const ASPERA_USE: &str = "aspera.use";
    pub const ASPERA_ADDRESS: &str = "aspera.address";
    pub const ASPERA_ARGS: &str = "aspera.args";
    pub const REMOTE_DIR: &str = "remote.dir";
    pub const REMOTE_EXCLUDED_DIRS: &str = "remote.excluded.dirs";
    pub const REMOTE_FILES: &str = "remote.files";
    pub const REMOTE_EXCLUDED_FILES: &str = "remote.excluded.files";
    pub const LOCAL_DIR: &str = "local.dir";
    pub const LOCAL_FILES: &str = "local.files";
    pub const DATE_FROM: &str = "files.date.from";
    pub const DATE_TO: &str = "files.date.to";
    pub const UNIT_TASKS: &str = "db.unit.tasks";
    pub const GLOBAL_TASKS: &str = "db.global.tasks";
    pub const GLOBAL_PRE_TASKS: &str = "db.global.pre.tasks";
    pub const HISTORY: &str = "keep.old.version";
    pub const DEPENDS: &str = "depends";
    pub const INSTALL_PROD_ONLY: &str = "install.prod.only";
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AsperaSettings {
    pub address: String,
    pub args: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabankDescriptor {
    pub name: String,
    pub description: String,
    pub provider: String,
    pub bank_type: BankType,
    pub data_dir: PathBuf,
    pub protocol: Protocol,
    pub server: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub aspera: Option<AsperaSettings>,
    /// Path patterns, remote or local depending on `protocol`.
    pub dirs: Vec<String>,
    pub excluded_dirs: Vec<String>,
    pub files: Vec<String>,
    pub excluded_files: Vec<String>,
    pub date_from: Option<String>,
    pub date_to: Option<String>,
    pub unit_tasks: String,
    pub global_tasks: String,
    pub global_pre_tasks: String,
    pub history_depth: u8,
    pub depends: Vec<String>,
    pub install_only: Option<PathBuf>,
}

impl DatabankDescriptor {
    /// Download target; files stay here between runs so interrupted
    /// transfers can resume.
    pub fn offline_dir(&self) -> PathBuf {
        self.data_dir.join(&self.name).join("offline")
    }

    /// Output tree of the processing tasks, promoted to production.
    pub fn work_dir(&self) -> PathBuf {
        self.data_dir.join(&self.name).join("work")
    }

    pub fn name_matcher(&self) -> Result<NameMatcher, MirrorError> {
        NameMatcher::new(&self.files, &self.excluded_files)
    }

    pub fn excluded_dir_matcher(&self) -> Result<Option<NameMatcher>, MirrorError> {
        if self.excluded_dirs.is_empty() {
            return Ok(None);
        }
        NameMatcher::new(&self.excluded_dirs, &[]).map(Some)
    }

    pub fn date_matcher(&self) -> Option<DateMatcher> {
        if self.date_from.is_none() && self.date_to.is_none() {
            return None;
        }
        Some(DateMatcher::new(
            self.date_from.as_deref().unwrap_or(""),
            self.date_to.as_deref().unwrap_or(""),
        ))
    }

    /// Global tasks, falling back to the type's default pipeline.
    pub fn effective_global_tasks(&self) -> String {
        if !self.global_tasks.trim().is_empty() {
            return self.global_tasks.clone();
        }
        match self.bank_type {
            BankType::Protein | BankType::Nucleic => "finalize".to_string(),
            BankType::Dictionary => "dicoindex".to_string(),
        }
    }

    pub fn is_local(&self) -> bool {
        self.protocol == Protocol::Local
    }

    /// `protocol://host` prefix used in listing side files.
    pub fn origin(&self) -> String {
        match self.protocol {
            Protocol::Local => format!("file://{}", self.server),
            protocol => format!("{}://{}", protocol.scheme(), self.server),
        }
    }

    /// Minimal descriptor promoting an already prepared tree.
    pub fn install_only_descriptor(&self) -> Option<DatabankDescriptor> {
        let source = self.install_only.clone()?;
        Some(DatabankDescriptor {
            name: self.name.clone(),
            description: self.description.clone(),
            provider: self.provider.clone(),
            bank_type: self.bank_type,
            data_dir: self.data_dir.clone(),
            protocol: Protocol::Local,
            server: String::new(),
            port: 0,
            username: String::new(),
            password: String::new(),
            aspera: None,
            dirs: Vec::new(),
            excluded_dirs: Vec::new(),
            files: Vec::new(),
            excluded_files: Vec::new(),
            date_from: None,
            date_to: None,
            unit_tasks: String::new(),
            global_tasks: String::new(),
            global_pre_tasks: String::new(),
            history_depth: self.history_depth,
            depends: Vec::new(),
            install_only: Some(source),
        })
    }
}

pub struct DescriptorLoader;

impl DescriptorLoader {
    /// Resolves a batch entry: either a path to a descriptor file or a base
    /// name looked up as `<dir>/<name>.properties`.
    pub fn locate(dir: &Path, entry: &str) -> PathBuf {
        let direct = PathBuf::from(entry);
        if direct.is_file() {
            return direct;
        }
        let file_name = if entry.ends_with(&format!(".{DESCRIPTOR_EXT}")) {
            entry.to_string()
        } else {
            format!("{entry}.{DESCRIPTOR_EXT}")
        };
        dir.join(file_name)
    }

    pub fn load(path: &Path) -> Result<DatabankDescriptor, MirrorError> {
        let content = fs::read_to_string(path)
            .map_err(|_| MirrorError::DescriptorRead(path.to_path_buf()))?;
        let fallback = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or_default();
        Self::parse(fallback, &content)
    }

    pub fn parse(fallback_name: &str, content: &str) -> Result<DatabankDescriptor, MirrorError> {
        let props = parse_properties(content);
        let get = |key: &str| props.get(key).map(|value| value.trim()).unwrap_or("");
        let name = match get(keys::NAME) {
            "" => fallback_name.to_string(),
            value => value.to_string(),
        };
        let invalid = |message: String| MirrorError::InvalidDescriptor {
            name: name.clone(),
            message,
        };
        if name.is_empty() {
            return Err(invalid(format!("missing {}", keys::NAME)));
        }

        let bank_type: BankType = get(keys::TYPE).parse()?;
        let protocol: Protocol = get(keys::PROTOCOL).parse()?;
        let data_dir = match get(keys::DATA_DIR) {
            "" => return Err(invalid(format!("missing {}", keys::DATA_DIR))),
            value => PathBuf::from(value),
        };
        let port = match get(keys::PORT) {
            "" => protocol.default_port(),
            value => value
                .parse()
                .map_err(|_| invalid(format!("invalid port {value}")))?,
        };
        let history_depth = match get(keys::HISTORY) {
            "" => 0,
            value => value
                .parse::<u8>()
                .ok()
                .filter(|depth| *depth <= MAX_HISTORY_DEPTH)
                .ok_or_else(|| invalid(format!("{} must be 0-5, got {value}", keys::HISTORY)))?,
        };

        let aspera = if parse_bool(get(keys::ASPERA_USE)) {
            Some(AsperaSettings {
                address: match get(keys::ASPERA_ADDRESS) {
                    "" => get(keys::SERVER).to_string(),
                    value => value.to_string(),
                },
                args: get(keys::ASPERA_ARGS)
                    .split_whitespace()
                    .map(str::to_string)
                    .collect(),
            })
        } else {
            None
        };

        let (dirs, files) = if protocol == Protocol::Local {
            (split_list(get(keys::LOCAL_DIR)), split_list(get(keys::LOCAL_FILES)))
        } else {
            (split_list(get(keys::REMOTE_DIR)), split_list(get(keys::REMOTE_FILES)))
        };
        let install_only = match get(keys::INSTALL_PROD_ONLY) {
            "" | "false" => None,
            value => Some(PathBuf::from(value)),
        };
        if files.is_empty() && install_only.is_none() {
            warn!(bank = %name, "no file patterns configured; nothing will be listed");
        }

        Ok(DatabankDescriptor {
            description: get(keys::FULLNAME).to_string(),
            provider: get(keys::PROVIDER).to_string(),
            bank_type,
            data_dir,
            protocol,
            server: get(keys::SERVER).to_string(),
            port,
            username: match get(keys::USERNAME) {
                "" => "anonymous".to_string(),
                value => value.to_string(),
            },
            password: get(keys::PASSWORD).to_string(),
            aspera,
            dirs,
            excluded_dirs: split_list(get(keys::REMOTE_EXCLUDED_DIRS)),
            files,
            excluded_files: split_list(get(keys::REMOTE_EXCLUDED_FILES)),
            date_from: non_empty(get(keys::DATE_FROM)),
            date_to: non_empty(get(keys::DATE_TO)),
            unit_tasks: get(keys::UNIT_TASKS).to_string(),
            global_tasks: get(keys::GLOBAL_TASKS).to_string(),
            global_pre_tasks: get(keys::GLOBAL_PRE_TASKS).to_string(),
            history_depth,
            depends: split_list(get(keys::DEPENDS)),
            install_only,
            name,
        })
    }
}

/// Parses `key=value` lines. `#` and `!` start comments, a trailing `\`
/// continues the value on the next line, later keys override earlier ones.
pub fn parse_properties(content: &str) -> HashMap<String, String> {
    let mut props = HashMap::new();
    let mut pending: Option<(String, String)> = None;
    for raw in content.lines() {
        let line = raw.trim();
        if let Some((key, mut value)) = pending.take() {
            let (chunk, more) = strip_continuation(line);
            value.push_str(chunk);
            if more {
                pending = Some((key, value));
            } else {
                props.insert(key, value);
            }
            continue;
        }
        if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let (value, more) = strip_continuation(value.trim());
        if more {
            pending = Some((key.trim().to_string(), value.to_string()));
        } else {
            props.insert(key.trim().to_string(), value.to_string());
        }
    }
    if let Some((key, value)) = pending {
        props.insert(key, value);
    }
    props
}

fn strip_continuation(line: &str) -> (&str, bool) {
    match line.strip_suffix('\\') {
        Some(rest) => (rest, true),
        None => (line, false),
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

fn non_empty(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}

fn parse_bool(value: &str) -> bool {
    matches!(value.to_ascii_lowercase().as_str(), "true" | "yes" | "1")
}
