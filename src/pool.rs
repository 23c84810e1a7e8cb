//! Parallel download of a listed file set.
//!
//! Workers pull `(index, file)` pairs from one shared cursor. Each worker owns
//! a single connection, opened on first use and reopened after a failed
//! attempt.

use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::context::RunContext;
use crate::domain::{FetchOutcome, RemoteFile};
use crate::error::MirrorError;
use crate::remote::{Connection, Connector};
use crate::retrieval::RetrievalEngine;

#[derive(Debug, Clone, Copy)]
pub struct PoolSettings {
    pub workers: usize,
    pub retries: u32,
    pub delay: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            workers: 2,
            retries: 3,
            delay: Duration::from_secs(1),
        }
    }
}

/// Per-file status handed to the monitor. Skipped files are `Ok`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileStatus {
    Ok,
    Failed(String),
    Aborted,
}

/// Observer of worker progress. Calls arrive from several workers at once.
pub trait LoaderMonitor: Send + Sync {
    fn file_begin(&self, index: usize, file: &RemoteFile);
    fn file_done(&self, index: usize, file: &RemoteFile, status: &FileStatus);
}

#[derive(Debug, Clone, Serialize)]
pub struct FailedFile {
    pub name: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolReport {
    pub downloaded: usize,
    pub skipped: usize,
    pub failed: Vec<FailedFile>,
    pub aborted: bool,
}

impl PoolReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && !self.aborted
    }

    fn merge(&mut self, other: PoolReport) {
        self.downloaded += other.downloaded;
        self.skipped += other.skipped;
        self.failed.extend(other.failed);
        self.aborted |= other.aborted;
    }
}

pub struct WorkerPool<'a> {
    connector: &'a dyn Connector,
    engine: &'a RetrievalEngine<'a>,
    monitor: &'a dyn LoaderMonitor,
    ctx: &'a RunContext,
    settings: PoolSettings,
}

impl<'a> WorkerPool<'a> {
    pub fn new(
        connector: &'a dyn Connector,
        engine: &'a RetrievalEngine<'a>,
        monitor: &'a dyn LoaderMonitor,
        ctx: &'a RunContext,
        settings: PoolSettings,
    ) -> Self {
        Self {
            connector,
            engine,
            monitor,
            ctx,
            settings,
        }
    }

    pub fn run(&self, files: &[RemoteFile]) -> PoolReport {
        let cursor = Mutex::new(0usize);
        let workers = self.settings.workers.clamp(1, files.len().max(1));
        info!(
            files = files.len(),
            workers,
            host = %self.connector.host(),
            "starting download pool"
        );

        let mut report = PoolReport::default();
        thread::scope(|scope| {
            let handles: Vec<_> = (0..workers)
                .map(|worker| {
                    let cursor = &cursor;
                    scope.spawn(move || self.work(worker, files, cursor))
                })
                .collect();
            for handle in handles {
                match handle.join() {
                    Ok(tally) => report.merge(tally),
                    Err(_) => report.failed.push(FailedFile {
                        name: String::new(),
                        message: "download worker panicked".to_string(),
                    }),
                }
            }
        });
        info!(
            downloaded = report.downloaded,
            skipped = report.skipped,
            failed = report.failed.len(),
            aborted = report.aborted,
            "download pool finished"
        );
        report
    }

    fn work(&self, worker: usize, files: &[RemoteFile], cursor: &Mutex<usize>) -> PoolReport {
        let mut tally = PoolReport::default();
        let mut connection: Option<Box<dyn Connection>> = None;
        loop {
            if self.ctx.is_aborted() {
                tally.aborted = true;
                break;
            }
            let Some((index, file)) = next(cursor, files) else {
                break;
            };
            debug!(worker, index, file = %file.name, "picked file");
            self.monitor.file_begin(index, file);

            let outcome = self.fetch_with_retry(&mut connection, file);
            match outcome {
                FetchOutcome::Done => {
                    tally.downloaded += 1;
                    self.monitor.file_done(index, file, &FileStatus::Ok);
                }
                FetchOutcome::Skipped => {
                    tally.skipped += 1;
                    self.monitor.file_done(index, file, &FileStatus::Ok);
                }
                FetchOutcome::Failed(message) => {
                    error!(worker, file = %file.name, "download failed: {message}");
                    self.monitor
                        .file_done(index, file, &FileStatus::Failed(message.clone()));
                    tally.failed.push(FailedFile {
                        name: file.name.clone(),
                        message,
                    });
                    break;
                }
                FetchOutcome::Aborted => {
                    warn!(worker, file = %file.name, "download aborted");
                    self.ctx.abort();
                    self.monitor.file_done(index, file, &FileStatus::Aborted);
                    tally.aborted = true;
                    break;
                }
            }
        }
        tally
    }

    fn fetch_with_retry(
        &self,
        connection: &mut Option<Box<dyn Connection>>,
        file: &RemoteFile,
    ) -> FetchOutcome {
        let retries = self.settings.retries;
        let mut attempt = 0;
        loop {
            let outcome = match self.ensure_connection(connection) {
                Ok(open) => self.engine.fetch(open.as_mut(), file),
                Err(err) if err.is_interrupted() => FetchOutcome::Aborted,
                Err(err) => return FetchOutcome::Failed(err.to_string()),
            };
            match outcome {
                FetchOutcome::Failed(message) if attempt < retries => {
                    attempt += 1;
                    warn!(
                        file = %file.name,
                        attempt,
                        retries,
                        "download failed: {message}; retrying"
                    );
                    *connection = None;
                    if !self.ctx.pause(self.settings.delay) {
                        return FetchOutcome::Aborted;
                    }
                }
                outcome => return outcome,
            }
        }
    }

    fn ensure_connection<'c>(
        &self,
        connection: &'c mut Option<Box<dyn Connection>>,
    ) -> Result<&'c mut Box<dyn Connection>, MirrorError> {
        if connection.is_none() {
            *connection = Some(self.open()?);
        }
        connection
            .as_mut()
            .ok_or_else(|| MirrorError::Connection {
                host: self.connector.host().to_string(),
                message: "connection unavailable".to_string(),
            })
    }

    fn open(&self) -> Result<Box<dyn Connection>, MirrorError> {
        let retries = self.settings.retries;
        let mut attempt = 0;
        loop {
            match self.connector.connect() {
                Ok(connection) => return Ok(connection),
                Err(err) if attempt < retries => {
                    attempt += 1;
                    warn!(
                        host = %self.connector.host(),
                        attempt,
                        retries,
                        "connection failed: {err}; retrying"
                    );
                    if !self.ctx.pause(self.settings.delay) {
                        return Err(MirrorError::Interrupted);
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }
}

fn next<'f>(cursor: &Mutex<usize>, files: &'f [RemoteFile]) -> Option<(usize, &'f RemoteFile)> {
    let mut guard = cursor.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    let index = *guard;
    let file = files.get(index)?;
    *guard += 1;
    Some((index, file))
}
