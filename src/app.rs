//! Batch orchestration: one databank at a time, dependencies first.

use std::collections::HashMap;
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use camino::Utf8PathBuf;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::ResolvedConfig;
use crate::context::RunContext;
use crate::descriptor::{DatabankDescriptor, DescriptorLoader};
use crate::domain::{ListOutcome, RunMode, RunStatus};
use crate::error::MirrorError;
use crate::install::{InstallReport, ProductionInstaller};
use crate::listing::{ListingEngine, write_listing};
use crate::pipeline::{PipelineConstructor, enqueue_pre_tasks};
use crate::pool::{PoolReport, WorkerPool};
use crate::progress::{ProgressEvent, ProgressSink};
use crate::remote::connector_for;
use crate::retrieval::RetrievalEngine;
use crate::scheduler::{KeyOutcome, TaskScheduler};
use crate::task::TaskEnv;

/// Poll interval of external high-speed transfers.
const TRANSFER_POLL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BankStatus {
    Ok,
    Error,
    Aborted,
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
pub struct BankReport {
    pub name: String,
    pub status: BankStatus,
    pub message: Option<String>,
    pub listed: Option<usize>,
    pub pool: Option<PoolReport>,
    pub tasks: Option<KeyOutcome>,
    pub install: Option<InstallReport>,
    pub info_output: Option<String>,
    pub elapsed_ms: u64,
}

impl BankReport {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            status: BankStatus::Ok,
            message: None,
            listed: None,
            pool: None,
            tasks: None,
            install: None,
            info_output: None,
            elapsed_ms: 0,
        }
    }

    fn fail(mut self, status: BankStatus, message: impl Into<String>) -> Self {
        self.status = status;
        self.message = Some(message.into());
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub status: RunStatus,
    pub mode: RunMode,
    pub banks: Vec<BankReport>,
}

pub struct App {
    config: ResolvedConfig,
    ctx: RunContext,
}

impl App {
    pub fn new(config: ResolvedConfig, ctx: RunContext) -> Self {
        Self { config, ctx }
    }

    pub fn run(&self, sink: &dyn ProgressSink) -> Result<RunReport, MirrorError> {
        self.ctx.start();
        let mut banks = Vec::new();
        let mut descriptors = Vec::new();
        for path in &self.config.descriptors {
            match DescriptorLoader::load(path) {
                Ok(descriptor) => descriptors.push(descriptor),
                Err(err) => {
                    error!(path = %path.display(), "{err}");
                    self.ctx.record_error();
                    banks.push(BankReport::new(&descriptor_label(path)).fail(BankStatus::Error, err.to_string()));
                }
            }
        }

        let order = match order_by_dependencies(&descriptors) {
            Ok(order) => order,
            Err(err) => {
                self.ctx.finish();
                return Err(err);
            }
        };

        let mut batch: Vec<String> = banks.iter().map(|bank| bank.name.clone()).collect();
        batch.extend(descriptors.iter().map(|descriptor| descriptor.name.clone()));
        let mut finished: HashMap<String, BankStatus> = HashMap::new();
        for index in order {
            let descriptor = &descriptors[index];
            let report = if self.ctx.is_aborted() {
                BankReport::new(&descriptor.name).fail(BankStatus::Aborted, "run aborted before start")
            } else if let Some(missing) = descriptor.depends.iter().find(|dep| !batch.contains(dep)) {
                let err = MirrorError::UnknownDependency(format!("{} needs {missing}", descriptor.name));
                error!(bank = %descriptor.name, "{err}");
                BankReport::new(&descriptor.name).fail(BankStatus::Error, err.to_string())
            } else if let Some(blocker) = descriptor
                .depends
                .iter()
                .find(|dep| finished.get(dep.as_str()) != Some(&BankStatus::Ok))
            {
                warn!(bank = %descriptor.name, dependency = %blocker, "dependency did not finish, skipping");
                BankReport::new(&descriptor.name)
                    .fail(BankStatus::Skipped, format!("dependency {blocker} did not finish"))
            } else {
                self.run_bank(descriptor, sink)
            };
            if report.status == BankStatus::Error {
                self.ctx.record_error();
            }
            finished.insert(descriptor.name.clone(), report.status);
            banks.push(report);
        }

        let status = self.ctx.status();
        self.notify(status, &banks);
        self.ctx.finish();
        Ok(RunReport {
            status,
            mode: self.config.mode,
            banks,
        })
    }

    fn run_bank(&self, descriptor: &DatabankDescriptor, sink: &dyn ProgressSink) -> BankReport {
        let started = Instant::now();
        sink.event(ProgressEvent::message(format!("phase=Start; bank {}", descriptor.name)));
        let mut report = match self.process_bank(descriptor, sink) {
            Ok(report) => report,
            Err(err) if err.is_interrupted() => {
                BankReport::new(&descriptor.name).fail(BankStatus::Aborted, err.to_string())
            }
            Err(err) => {
                error!(bank = %descriptor.name, "{err}");
                BankReport::new(&descriptor.name).fail(BankStatus::Error, err.to_string())
            }
        };
        report.elapsed_ms = started.elapsed().as_millis() as u64;
        sink.event(ProgressEvent {
            message: format!("phase=Done; bank {} status={:?}", descriptor.name, report.status),
            elapsed: Some(started.elapsed()),
        });
        report
    }

    fn process_bank(
        &self,
        descriptor: &DatabankDescriptor,
        sink: &dyn ProgressSink,
    ) -> Result<BankReport, MirrorError> {
        let mut report = BankReport::new(&descriptor.name);

        if let Some(minimal) = descriptor.install_only_descriptor() {
            if self.config.mode == RunMode::Info {
                return Ok(report);
            }
            let source = minimal
                .install_only
                .clone()
                .ok_or_else(|| MirrorError::Install("install-only payload missing".to_string()))?;
            sink.event(ProgressEvent::message(format!("phase=Install; {} (install only)", minimal.name)));
            report.install = Some(self.install(&minimal, source)?);
            return Ok(report);
        }

        let connector = connector_for(descriptor, TRANSFER_POLL)?;
        let scheduler = TaskScheduler::new(self.ctx.clone());
        sink.event(ProgressEvent::message(format!(
            "phase=List; {} on {}",
            descriptor.name,
            connector.host()
        )));
        let listing = ListingEngine::new(descriptor, connector.as_ref(), &self.ctx)
            .list_with_retry(self.config.protocol_retry, self.config.protocol_delay);
        let files = match listing {
            ListOutcome::Listed(files) => files,
            ListOutcome::Failed(message) => return Ok(report.fail(BankStatus::Error, message)),
            ListOutcome::Aborted => return Err(MirrorError::Interrupted),
        };
        report.listed = Some(files.len());

        if self.config.mode == RunMode::Info {
            let file_name = format!("{}.listing", descriptor.name);
            // A shared output names a directory once the batch has several banks.
            let path = match &self.config.info_output {
                Some(path) if self.config.descriptors.len() > 1 => path.join(file_name),
                Some(path) => path.clone(),
                None => descriptor.data_dir.join(&descriptor.name).join(file_name),
            };
            write_listing(&path, &descriptor.origin(), &files)?;
            info!(bank = %descriptor.name, files = files.len(), path = %path.display(), "listing written");
            report.info_output = Some(path.to_string_lossy().to_string());
            return Ok(report);
        }

        if files.is_empty() {
            info!(bank = %descriptor.name, "no file selected, nothing to do");
            return Ok(report);
        }

        // Queued only once there is file work for them to precede.
        let queued = enqueue_pre_tasks(descriptor, &scheduler)?;
        if queued > 0 {
            debug!(bank = %descriptor.name, queued, "global pre tasks queued");
        }

        let pipeline = PipelineConstructor::new(descriptor, &scheduler, files.len())?;
        let engine = RetrievalEngine::new(descriptor.offline_dir(), &self.ctx, sink);
        let env = TaskEnv {
            ctx: &self.ctx,
            tools: &self.config.tools,
        };

        sink.event(ProgressEvent::message(format!(
            "phase=Fetch; {} files for {}",
            files.len(),
            descriptor.name
        )));
        let pool_report = thread::scope(|scope| {
            scope.spawn(|| scheduler.run(&env));
            let pool = WorkerPool::new(
                connector.as_ref(),
                &engine,
                &pipeline,
                &self.ctx,
                self.config.pool,
            );
            let pool_report = pool.run(&files);
            while !scheduler.terminate() {
                thread::sleep(self.config.task_delay);
            }
            scheduler.close();
            pool_report
        });

        let pool_ok = pool_report.is_success();
        let pool_aborted = pool_report.aborted;
        report.pool = Some(pool_report);
        let outcome = scheduler.outcome(&descriptor.name);
        report.tasks = Some(outcome.clone());

        if pool_aborted || self.ctx.is_aborted() {
            return Err(MirrorError::Interrupted);
        }
        if !pool_ok {
            return Ok(report.fail(BankStatus::Error, "some files could not be retrieved"));
        }
        match outcome {
            KeyOutcome::Finished => {}
            KeyOutcome::Failed(errors) => {
                return Ok(report.fail(BankStatus::Error, errors.join("; ")));
            }
            KeyOutcome::Incomplete => {
                return Ok(report.fail(BankStatus::Error, "processing did not complete"));
            }
        }

        sink.event(ProgressEvent::message(format!("phase=Install; {}", descriptor.name)));
        report.install = Some(self.install(descriptor, descriptor.work_dir())?);
        Ok(report)
    }

    fn install(&self, descriptor: &DatabankDescriptor, source: PathBuf) -> Result<InstallReport, MirrorError> {
        let root = self
            .config
            .production_dir
            .clone()
            .ok_or_else(|| MirrorError::Install("no production_dir configured".to_string()))?;
        let source = Utf8PathBuf::from_path_buf(source)
            .map_err(|path| MirrorError::Install(format!("non-utf8 path {}", path.display())))?;
        ProductionInstaller::new(root).install(
            descriptor.bank_type,
            &descriptor.name,
            &source,
            descriptor.history_depth,
        )
    }

    fn notify(&self, status: RunStatus, banks: &[BankReport]) {
        let Some(notify) = &self.config.notify else {
            return;
        };
        if notify.on_error_only && status == RunStatus::Ok {
            return;
        }
        let failed: Vec<&str> = banks
            .iter()
            .filter(|bank| bank.status != BankStatus::Ok)
            .map(|bank| bank.name.as_str())
            .collect();
        info!(
            to = %notify.to.join(","),
            status = %status,
            banks = banks.len(),
            failed = %failed.join(","),
            "run notification"
        );
    }
}

fn descriptor_label(path: &std::path::Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string())
}

/// Batch order with every bank after the banks it depends on. Ties keep the
/// batch order. Dependencies outside the batch are left to the caller.
pub fn order_by_dependencies(descriptors: &[DatabankDescriptor]) -> Result<Vec<usize>, MirrorError> {
    let index: HashMap<&str, usize> = descriptors
        .iter()
        .enumerate()
        .map(|(i, descriptor)| (descriptor.name.as_str(), i))
        .collect();
    let mut placed = vec![false; descriptors.len()];
    let mut order = Vec::with_capacity(descriptors.len());
    while order.len() < descriptors.len() {
        let next = (0..descriptors.len()).find(|&i| {
            !placed[i]
                && descriptors[i]
                    .depends
                    .iter()
                    .all(|dep| index.get(dep.as_str()).is_none_or(|&j| placed[j]))
        });
        match next {
            Some(i) => {
                placed[i] = true;
                order.push(i);
            }
            None => {
                let stuck: Vec<&str> = (0..descriptors.len())
                    .filter(|&i| !placed[i])
                    .map(|i| descriptors[i].name.as_str())
                    .collect();
                return Err(MirrorError::DependencyCycle(stuck.join(", ")));
            }
        }
    }
    Ok(order)
}
