//! Turns finished downloads into queued processing tasks.
//!
//! Every completion is handled under one lock so the completed count, and
//! with it the single global-task round, does not depend on which worker
//! finished first.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use tracing::{debug, info, warn};

use crate::descriptor::DatabankDescriptor;
use crate::domain::RemoteFile;
use crate::error::MirrorError;
use crate::fs_util::zip_single_member;
use crate::pool::{FileStatus, LoaderMonitor};
use crate::retrieval::decompressed_name;
use crate::scheduler::TaskScheduler;
use crate::task::{BankInfo, Task, TaskKind, TaskParams, TaskSpec, dispatch, parse_specs};

/// Stripped from downloaded names to get the processed file, longest first.
const ARCHIVE_EXTS: &[&str] = &[".tar.gz", ".tgz", ".tar", ".gz", ".zip"];

#[derive(Default)]
struct PipelineState {
    completed: usize,
    index_outputs: Vec<PathBuf>,
    finalize_inputs: Vec<PathBuf>,
    archive_dirs: Vec<PathBuf>,
    sources: Vec<RemoteFile>,
    global_rounds: usize,
}

pub struct PipelineConstructor<'a> {
    bank: BankInfo,
    scheduler: &'a TaskScheduler,
    expected: usize,
    unit: Vec<(TaskKind, TaskParams)>,
    global: Vec<(TaskKind, TaskParams)>,
    state: Mutex<PipelineState>,
}

impl<'a> PipelineConstructor<'a> {
    pub fn new(
        descriptor: &DatabankDescriptor,
        scheduler: &'a TaskScheduler,
        expected: usize,
    ) -> Result<Self, MirrorError> {
        let unit = resolve(&parse_specs(&descriptor.unit_tasks)?)?;
        if let Some((kind, _)) = unit.iter().find(|(kind, _)| !kind.is_unit()) {
            return Err(MirrorError::InvalidTaskSpec(format!(
                "{kind} cannot run per file in {}",
                descriptor.name
            )));
        }
        let global = resolve(&parse_specs(&descriptor.effective_global_tasks())?)?;
        Ok(Self {
            bank: bank_info(descriptor),
            scheduler,
            expected,
            unit,
            global,
            state: Mutex::new(PipelineState::default()),
        })
    }

    pub fn bank(&self) -> &BankInfo {
        &self.bank
    }

    pub fn completed(&self) -> usize {
        self.lock().completed
    }

    /// Number of times the global tasks were queued; 0 or 1.
    pub fn global_rounds(&self) -> usize {
        self.lock().global_rounds
    }

    fn lock(&self) -> MutexGuard<'_, PipelineState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn enqueue(&self, task: Task) {
        self.scheduler.add_task(task, &self.bank.name);
    }

    fn enqueue_units(&self, state: &mut PipelineState, file: &RemoteFile) {
        let source = self.bank.offline_dir.join(&file.name);
        let task_path = self.bank.offline_dir.join(task_file_name(&file.name, &source));
        for (kind, params) in &self.unit {
            let task = Task::new(*kind, &self.bank, params.clone());
            let task = match kind {
                TaskKind::Decompress | TaskKind::Extract => {
                    task.with_input(&source).with_output(&task_path)
                }
                kind if kind.is_indexer() => {
                    let index_dir = self.bank.work_dir.join("index").join(file_stem(&task_path));
                    state.index_outputs.push(index_dir.clone());
                    task.with_input(&task_path).with_output(index_dir)
                }
                _ => task.with_input(&task_path),
            };
            self.enqueue(task);
        }
        if is_tar(&file.name) {
            state.archive_dirs.push(task_path.clone());
        }
        state.finalize_inputs.push(task_path);
    }

    fn enqueue_globals(&self, state: &PipelineState) {
        info!(bank = %self.bank.name, files = self.expected, "all files processed, queueing global tasks");
        self.enqueue(
            Task::new(TaskKind::Release, &self.bank, TaskParams::default())
                .with_sources(state.sources.clone()),
        );

        let has_both_taxonomy = self.global.iter().any(|(kind, _)| *kind == TaskKind::TaxonomyNucleic)
            && self.global.iter().any(|(kind, _)| *kind == TaskKind::TaxonomyProtein);
        let inputs = state.finalize_inputs.clone();
        for (kind, params) in &self.global {
            let base = Task::new(*kind, &self.bank, params.clone());
            match kind {
                TaskKind::Merge => {
                    if state.index_outputs.len() != self.expected {
                        debug!(
                            bank = %self.bank.name,
                            indexes = state.index_outputs.len(),
                            "index count differs from file count, skipping merge"
                        );
                        continue;
                    }
                    self.enqueue(
                        base.with_inputs(state.index_outputs.clone())
                            .with_output(self.bank.work_dir.join("index").join(&self.bank.name)),
                    );
                }
                TaskKind::Finalize => {
                    if inputs.len() == 1 && !has_both_taxonomy {
                        let mut params = params.clone();
                        params.set("check_ids", "true");
                        self.enqueue(
                            Task::new(*kind, &self.bank, params).with_inputs(inputs.clone()),
                        );
                        self.enqueue(
                            Task::new(TaskKind::Rename, &self.bank, TaskParams::default())
                                .with_inputs(inputs.clone()),
                        );
                    } else {
                        self.enqueue(base.with_inputs(inputs.clone()));
                    }
                }
                TaskKind::DicoIndex | TaskKind::IndexDict => {
                    let mut params = params.clone();
                    let base_dir = state.archive_dirs.first().unwrap_or(&self.bank.offline_dir);
                    let files = dictionary_files(params.list("file"), base_dir);
                    if !files.is_empty() {
                        params.set("file", files.join(":"));
                    }
                    self.enqueue(
                        Task::new(*kind, &self.bank, params)
                            .with_inputs(inputs.clone())
                            .with_output(self.bank.work_dir.join("index")),
                    );
                }
                TaskKind::Cleanup => self.enqueue(base),
                _ => self.enqueue(base.with_inputs(inputs.clone())),
            }
        }
        self.enqueue(Task::new(TaskKind::EndOfProcessing, &self.bank, TaskParams::default()));
    }
}

impl LoaderMonitor for PipelineConstructor<'_> {
    fn file_begin(&self, index: usize, file: &RemoteFile) {
        debug!(bank = %self.bank.name, index, file = %file.name, "retrieving");
    }

    fn file_done(&self, index: usize, file: &RemoteFile, status: &FileStatus) {
        match status {
            FileStatus::Ok => {}
            FileStatus::Failed(message) => {
                warn!(bank = %self.bank.name, index, file = %file.name, "not processed: {message}");
                return;
            }
            FileStatus::Aborted => {
                debug!(bank = %self.bank.name, index, file = %file.name, "not processed: aborted");
                return;
            }
        }

        let mut state = self.lock();
        self.enqueue_units(&mut state, file);
        state.sources.push(file.clone());
        state.completed += 1;
        if state.completed == self.expected && state.global_rounds == 0 {
            state.global_rounds += 1;
            self.enqueue_globals(&state);
        }
    }
}

/// Queues the global-pre tasks. Called before any file is retrieved.
pub fn enqueue_pre_tasks(
    descriptor: &DatabankDescriptor,
    scheduler: &TaskScheduler,
) -> Result<usize, MirrorError> {
    let specs = resolve(&parse_specs(&descriptor.global_pre_tasks)?)?;
    let bank = bank_info(descriptor);
    for (kind, params) in &specs {
        scheduler.add_task(Task::new(*kind, &bank, params.clone()), &bank.name);
    }
    Ok(specs.len())
}

pub fn bank_info(descriptor: &DatabankDescriptor) -> BankInfo {
    BankInfo {
        name: descriptor.name.clone(),
        description: descriptor.description.clone(),
        provider: descriptor.provider.clone(),
        bank_type: descriptor.bank_type,
        offline_dir: descriptor.offline_dir(),
        work_dir: descriptor.work_dir(),
    }
}

fn resolve(specs: &[TaskSpec]) -> Result<Vec<(TaskKind, TaskParams)>, MirrorError> {
    specs
        .iter()
        .map(|spec| {
            dispatch(&spec.name)
                .map(|kind| (kind, spec.params.clone()))
                .ok_or_else(|| MirrorError::InvalidTaskSpec(format!("unknown task {}", spec.name)))
        })
        .collect()
}

/// Name of the file the unit tasks work on. A single-member zip whose member
/// is not named after the archive yields the member name.
pub fn task_file_name(name: &str, local: &Path) -> String {
    if name.ends_with(".zip") {
        if let Some(member) = zip_single_member(local) {
            let stem = strip_archive_ext(name);
            if member != stem {
                debug!(archive = name, member = %member, "zip member name differs from archive");
                return member;
            }
        }
    }
    strip_archive_ext(name).to_string()
}

/// Archive extensions first, then the compression suffixes retrieval treats
/// as an already-decompressed sibling (`.Z`, `.bz2`).
fn strip_archive_ext(name: &str) -> &str {
    ARCHIVE_EXTS
        .iter()
        .find_map(|ext| name.strip_suffix(ext))
        .filter(|stem| !stem.is_empty())
        .or_else(|| decompressed_name(name))
        .unwrap_or(name)
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().to_string())
        .unwrap_or_default()
}

/// Relative `file=` entries point into the extracted archive when the bank
/// ships one, otherwise into the offline directory.
fn dictionary_files(files: Vec<&str>, base_dir: &Path) -> Vec<String> {
    files
        .into_iter()
        .map(|file| {
            let path = Path::new(file);
            if path.is_absolute() {
                file.to_string()
            } else {
                base_dir.join(path).to_string_lossy().to_string()
            }
        })
        .collect()
}

fn is_tar(name: &str) -> bool {
    name.ends_with(".tar.gz") || name.ends_with(".tgz") || name.ends_with(".tar")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_names_strip_archive_extensions() {
        let missing = Path::new("/nonexistent");
        assert_eq!(task_file_name("uniprot_sprot.dat.gz", missing), "uniprot_sprot.dat");
        assert_eq!(task_file_name("est.fasta.zip", missing), "est.fasta");
        assert_eq!(task_file_name("plain.fasta", missing), "plain.fasta");
        assert_eq!(task_file_name("taxdump.tar.gz", missing), "taxdump");
        assert_eq!(task_file_name("nr.Z", missing), "nr");
        assert_eq!(task_file_name("est.fasta.bz2", missing), "est.fasta");
        assert_eq!(task_file_name("x.tar.bz2", missing), "x.tar");
    }

    #[test]
    fn zip_member_overrides_archive_stem() {
        use std::io::Write;

        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("gb_release.zip");
        let mut writer = zip::ZipWriter::new(std::fs::File::create(&path).unwrap());
        writer
            .start_file("gbbct1.seq", zip::write::SimpleFileOptions::default())
            .unwrap();
        writer.write_all(b"LOCUS\n").unwrap();
        writer.finish().unwrap();
        assert_eq!(task_file_name("gb_release.zip", &path), "gbbct1.seq");
    }
}
