use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum MirrorError {
    #[error("missing config file kira-mirror.json in current directory")]
    MissingConfig,

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("failed to read descriptor at {0}")]
    DescriptorRead(PathBuf),

    #[error("invalid descriptor {name}: {message}")]
    InvalidDescriptor { name: String, message: String },

    #[error("invalid bank type: {0} (expected p, n or d)")]
    InvalidBankType(String),

    #[error("invalid name pattern {pattern}: {message}")]
    InvalidPattern { pattern: String, message: String },

    #[error("invalid task specification: {0}")]
    InvalidTaskSpec(String),

    #[error("dependency cycle between descriptors: {0}")]
    DependencyCycle(String),

    #[error("unknown descriptor dependency: {0}")]
    UnknownDependency(String),

    #[error("connection to {host} failed: {message}")]
    Connection { host: String, message: String },

    #[error("listing {path} failed: {message}")]
    Listing { path: String, message: String },

    #[error("transfer of {name} failed: {message}")]
    Transfer { name: String, message: String },

    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("server returned status {status}: {message}")]
    HttpStatus { status: u16, message: String },

    #[error("transfer interrupted")]
    Interrupted,

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("required tool not found: {0}")]
    MissingTool(String),

    #[error("task {task} failed: {message}")]
    Task { task: String, message: String },

    #[error("production install failed: {0}")]
    Install(String),
}

impl MirrorError {
    pub fn is_interrupted(&self) -> bool {
        matches!(self, MirrorError::Interrupted)
    }
}
