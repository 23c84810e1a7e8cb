//! Processing tasks built from descriptor task lists.
//!
//! Names in a task list are resolved with [`dispatch`], which keeps the
//! historical substring matching: the first registered identifier contained
//! in the name wins.

use std::fmt;
use std::path::PathBuf;

use serde::Serialize;
use tracing::{debug, warn};

use crate::context::RunContext;
use crate::domain::{BankType, RemoteFile};
use crate::error::MirrorError;

pub mod builtin;
pub mod external;
pub mod spec;

pub use external::ToolTable;
pub use spec::{TaskParams, TaskSpec, parse_specs};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    Decompress,
    Extract,
    Convert,
    IndexFasta,
    IndexEmbl,
    IndexGenbank,
    IndexDict,
    Script,
    Merge,
    Finalize,
    TaxonomyNucleic,
    TaxonomyProtein,
    Cleanup,
    Alias,
    Metadata,
    DicoIndex,
    Release,
    Rename,
    EndOfProcessing,
}

/// Identifiers accepted in task lists, in matching order.
const REGISTRY: &[(&str, TaskKind)] = &[
    ("decompress", TaskKind::Decompress),
    ("extract", TaskKind::Extract),
    ("convert", TaskKind::Convert),
    ("index_fasta", TaskKind::IndexFasta),
    ("index_embl", TaskKind::IndexEmbl),
    ("index_genbank", TaskKind::IndexGenbank),
    ("index_dict", TaskKind::IndexDict),
    ("script", TaskKind::Script),
    ("merge", TaskKind::Merge),
    ("finalize", TaskKind::Finalize),
    ("tax_nucleic", TaskKind::TaxonomyNucleic),
    ("tax_protein", TaskKind::TaxonomyProtein),
    ("cleanup", TaskKind::Cleanup),
    ("alias", TaskKind::Alias),
    ("metadata", TaskKind::Metadata),
    ("dicoindex", TaskKind::DicoIndex),
];

/// Maps a task-list name to its kind by substring containment.
pub fn dispatch(name: &str) -> Option<TaskKind> {
    let lowered = name.to_ascii_lowercase();
    REGISTRY
        .iter()
        .find(|(id, _)| lowered.contains(id))
        .map(|(_, kind)| *kind)
}

impl TaskKind {
    pub fn id(self) -> &'static str {
        match self {
            TaskKind::Release => "release",
            TaskKind::Rename => "rename",
            TaskKind::EndOfProcessing => "end",
            kind => REGISTRY
                .iter()
                .find(|(_, registered)| *registered == kind)
                .map(|(id, _)| *id)
                .unwrap_or("unknown"),
        }
    }

    /// Kinds that run once per downloaded file.
    pub fn is_unit(self) -> bool {
        matches!(
            self,
            TaskKind::Decompress
                | TaskKind::Extract
                | TaskKind::Convert
                | TaskKind::IndexFasta
                | TaskKind::IndexEmbl
                | TaskKind::IndexGenbank
                | TaskKind::IndexDict
                | TaskKind::Script
        )
    }

    pub fn is_indexer(self) -> bool {
        matches!(
            self,
            TaskKind::IndexFasta | TaskKind::IndexEmbl | TaskKind::IndexGenbank | TaskKind::IndexDict
        )
    }

    pub fn is_external(self) -> bool {
        matches!(
            self,
            TaskKind::Convert
                | TaskKind::IndexFasta
                | TaskKind::IndexEmbl
                | TaskKind::IndexGenbank
                | TaskKind::IndexDict
                | TaskKind::Script
                | TaskKind::Merge
                | TaskKind::Finalize
                | TaskKind::TaxonomyNucleic
                | TaskKind::TaxonomyProtein
                | TaskKind::DicoIndex
        )
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

/// Databank identity carried by every task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BankInfo {
    pub name: String,
    pub description: String,
    pub provider: String,
    pub bank_type: BankType,
    pub offline_dir: PathBuf,
    pub work_dir: PathBuf,
}

/// Services a task may use while executing.
pub struct TaskEnv<'a> {
    pub ctx: &'a RunContext,
    pub tools: &'a ToolTable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum TaskState {
    Pending,
    Succeeded,
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct Task {
    pub kind: TaskKind,
    pub bank: BankInfo,
    pub params: TaskParams,
    /// Files or directories the task reads.
    pub inputs: Vec<PathBuf>,
    /// File or directory the task produces.
    pub output: PathBuf,
    /// Listed files, used by the release record.
    pub sources: Vec<RemoteFile>,
    state: TaskState,
}

impl Task {
    pub fn new(kind: TaskKind, bank: &BankInfo, params: TaskParams) -> Self {
        Self {
            kind,
            bank: bank.clone(),
            params,
            inputs: Vec::new(),
            output: bank.work_dir.clone(),
            sources: Vec::new(),
            state: TaskState::Pending,
        }
    }

    pub fn with_input(mut self, input: impl Into<PathBuf>) -> Self {
        self.inputs.push(input.into());
        self
    }

    pub fn with_inputs(mut self, inputs: impl IntoIterator<Item = PathBuf>) -> Self {
        self.inputs.extend(inputs);
        self
    }

    pub fn with_output(mut self, output: impl Into<PathBuf>) -> Self {
        self.output = output.into();
        self
    }

    pub fn with_sources(mut self, sources: Vec<RemoteFile>) -> Self {
        self.sources = sources;
        self
    }

    pub fn label(&self) -> String {
        match self.inputs.first().and_then(|input| input.file_name()) {
            Some(name) => format!("{}({})", self.kind, name.to_string_lossy()),
            None => self.kind.to_string(),
        }
    }

    pub fn is_executed(&self) -> bool {
        self.state != TaskState::Pending
    }

    pub fn error(&self) -> Option<&str> {
        match &self.state {
            TaskState::Failed(message) => Some(message),
            _ => None,
        }
    }

    /// Runs the task once. Later calls return the first result.
    pub fn execute(&mut self, env: &TaskEnv<'_>) -> bool {
        if self.is_executed() {
            return self.error().is_none();
        }
        if env.ctx.is_aborted() {
            self.state = TaskState::Failed(MirrorError::Interrupted.to_string());
            return false;
        }
        debug!(bank = %self.bank.name, task = %self.label(), "executing task");
        let result = if self.kind.is_external() {
            external::run(self, env)
        } else {
            builtin::run(self, env)
        };
        match result {
            Ok(()) => {
                self.state = TaskState::Succeeded;
                true
            }
            Err(err) => {
                warn!(bank = %self.bank.name, task = %self.label(), "task failed: {err}");
                self.state = TaskState::Failed(err.to_string());
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_by_containment() {
        assert_eq!(dispatch("decompress"), Some(TaskKind::Decompress));
        assert_eq!(dispatch("my_index_fasta_v2"), Some(TaskKind::IndexFasta));
        assert_eq!(dispatch("FINALIZE"), Some(TaskKind::Finalize));
        assert_eq!(dispatch("nothing"), None);
    }

    #[test]
    fn first_registered_identifier_wins() {
        // Both "extract" and "script" occur; registry order decides.
        assert_eq!(dispatch("extract_script"), Some(TaskKind::Extract));
        assert_eq!(dispatch("script_extract"), Some(TaskKind::Extract));
    }

    #[test]
    fn ids_round_trip_through_dispatch() {
        for (id, kind) in REGISTRY {
            assert_eq!(dispatch(id), Some(*kind));
            assert_eq!(kind.id(), *id);
        }
    }
}
