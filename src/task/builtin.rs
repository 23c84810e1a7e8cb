use std::fs;
use std::path::{Component, Path, PathBuf};
use std::process::{Command, Stdio};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use tracing::{debug, info};

use crate::domain::BankType;
use crate::error::MirrorError;
use crate::fs_util;
use crate::task::{Task, TaskEnv, TaskKind};

pub(crate) fn run(task: &Task, env: &TaskEnv<'_>) -> Result<(), MirrorError> {
    match task.kind {
        TaskKind::Decompress => decompress(task, env),
        TaskKind::Extract => extract(task),
        TaskKind::Cleanup => cleanup(task),
        TaskKind::Alias => alias(task),
        TaskKind::Metadata => metadata(task),
        TaskKind::Release => release(task),
        TaskKind::Rename => rename(task),
        TaskKind::EndOfProcessing => {
            info!(bank = %task.bank.name, "processing complete");
            Ok(())
        }
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
        | TaskKind::DicoIndex => Err(task_error(task, "handled by an external tool")),
    }
}

fn task_error(task: &Task, message: impl Into<String>) -> MirrorError {
    MirrorError::Task {
        task: task.label(),
        message: message.into(),
    }
}

fn fs_err(err: impl ToString) -> MirrorError {
    MirrorError::Filesystem(err.to_string())
}

fn first_input(task: &Task) -> Result<&Path, MirrorError> {
    task.inputs
        .first()
        .map(PathBuf::as_path)
        .ok_or_else(|| task_error(task, "no input file"))
}

fn is_tar(name: &str) -> bool {
    name.ends_with(".tar.gz") || name.ends_with(".tgz") || name.ends_with(".tar")
}

/// Source archive into `task.output`. Done when the output exists and the
/// archive is gone, so reruns after `remove=true` succeed.
fn decompress(task: &Task, env: &TaskEnv<'_>) -> Result<(), MirrorError> {
    let source = first_input(task)?;
    let dest = task.output.as_path();
    if source == dest {
        debug!(file = %source.display(), "not compressed, nothing to do");
        return Ok(());
    }
    if !source.exists() {
        if dest.exists() {
            return Ok(());
        }
        return Err(task_error(task, format!("missing {}", source.display())));
    }

    let name = source.to_string_lossy();
    if is_tar(&name) {
        fs_util::extract_tar(source, dest)?;
    } else if name.ends_with(".zip") {
        let parent = dest.parent().ok_or_else(|| task_error(task, "invalid output path"))?;
        fs_util::extract_zip(source, parent)?;
    } else if name.ends_with(".gz") {
        fs_util::gunzip(source, dest)?;
    } else if name.ends_with(".Z") {
        decompress_with(task, env, "gzip", source, dest)?;
    } else if name.ends_with(".bz2") {
        decompress_with(task, env, "bzip2", source, dest)?;
    } else {
        return Err(task_error(task, format!("unknown compression: {}", source.display())));
    }

    if task.params.flag("remove") {
        fs::remove_file(source).map_err(fs_err)?;
    }
    Ok(())
}

/// `<program> -dc source` into a temporary sibling of `dest`.
fn decompress_with(
    task: &Task,
    env: &TaskEnv<'_>,
    program: &str,
    source: &Path,
    dest: &Path,
) -> Result<(), MirrorError> {
    let program = env.tools.resolve(program)?;
    let parent = dest.parent().ok_or_else(|| task_error(task, "invalid output path"))?;
    let temp = tempfile::Builder::new()
        .prefix("kira-mirror-decompress")
        .tempfile_in(parent)
        .map_err(fs_err)?;
    let stdout = temp.reopen().map_err(fs_err)?;
    let output = Command::new(&program)
        .arg("-dc")
        .arg(source)
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::piped())
        .output()
        .map_err(|err| task_error(task, format!("spawn {}: {err}", program.display())))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        return Err(task_error(task, stderr));
    }
    temp.persist(dest).map_err(fs_err)?;
    Ok(())
}

fn extract(task: &Task) -> Result<(), MirrorError> {
    let source = first_input(task)?;
    let dest = match task.params.get("dir") {
        Some(dir) => task.bank.offline_dir.join(safe_relative(task, dir)?),
        None => task.output.clone(),
    };
    let name = source.to_string_lossy();
    if is_tar(&name) {
        fs_util::extract_tar(source, &dest)
    } else if name.ends_with(".zip") {
        fs_util::extract_zip(source, &dest).map(|_| ())
    } else {
        Err(task_error(task, format!("not an archive: {}", source.display())))
    }
}

fn safe_relative<'p>(task: &Task, value: &'p str) -> Result<&'p Path, MirrorError> {
    let path = Path::new(value);
    let escapes = path
        .components()
        .any(|part| !matches!(part, Component::Normal(_) | Component::CurDir));
    if escapes {
        return Err(task_error(task, format!("path must stay inside the bank: {value}")));
    }
    Ok(path)
}

/// Removes files matching `pattern=<glob>:<glob>` under the offline directory,
/// or the work directory with `dir=work`.
fn cleanup(task: &Task) -> Result<(), MirrorError> {
    let root = match task.params.get("dir") {
        Some("work") => &task.bank.work_dir,
        _ => &task.bank.offline_dir,
    };
    let patterns = task.params.list("pattern");
    if patterns.is_empty() {
        return Err(task_error(task, "cleanup needs a pattern=<glob> parameter"));
    }
    let mut removed = 0usize;
    for pattern in patterns {
        safe_relative(task, pattern)?;
        let full = root.join(pattern);
        let entries = glob::glob(&full.to_string_lossy())
            .map_err(|err| task_error(task, format!("bad glob {pattern}: {err}")))?;
        for entry in entries {
            let path = entry.map_err(fs_err)?;
            if path.is_dir() {
                fs::remove_dir_all(&path).map_err(fs_err)?;
            } else {
                fs::remove_file(&path).map_err(fs_err)?;
            }
            removed += 1;
        }
    }
    info!(bank = %task.bank.name, removed, "cleanup done");
    Ok(())
}

fn alias_ext(bank_type: BankType) -> &'static str {
    match bank_type {
        BankType::Protein => "pal",
        BankType::Nucleic => "nal",
        BankType::Dictionary => "dal",
    }
}

/// Writes `<bank>.<pal|nal|dal>` listing the bank's volumes.
fn alias(task: &Task) -> Result<(), MirrorError> {
    let mut volumes: Vec<String> = task
        .params
        .list("dblist")
        .into_iter()
        .map(str::to_string)
        .collect();
    if volumes.is_empty() {
        volumes = task
            .inputs
            .iter()
            .filter_map(|input| input.file_stem())
            .map(|stem| stem.to_string_lossy().to_string())
            .collect();
    }
    if volumes.is_empty() {
        volumes.push(task.bank.name.clone());
    }
    let title = match task.params.get("title") {
        Some(title) => title.to_string(),
        None if !task.bank.description.is_empty() => task.bank.description.clone(),
        None => task.bank.name.clone(),
    };
    let path = task
        .bank
        .work_dir
        .join(format!("{}.{}", task.bank.name, alias_ext(task.bank.bank_type)));
    let content = format!("TITLE {title}\nDBLIST {}\n", volumes.join(" "));
    write_atomic(&path, content.as_bytes())
}

#[derive(Debug, Serialize)]
struct BankMetadata<'a> {
    name: &'a str,
    description: &'a str,
    provider: &'a str,
    bank_type: BankType,
    files: usize,
    generated_at: String,
}

fn metadata(task: &Task) -> Result<(), MirrorError> {
    let record = BankMetadata {
        name: &task.bank.name,
        description: &task.bank.description,
        provider: &task.bank.provider,
        bank_type: task.bank.bank_type,
        files: task.inputs.len(),
        generated_at: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
    };
    let content = serde_json::to_vec_pretty(&record).map_err(fs_err)?;
    write_atomic(&task.bank.work_dir.join(format!("{}.json", task.bank.name)), &content)
}

#[derive(Debug, Serialize)]
struct ReleaseFile<'a> {
    dir: &'a str,
    name: &'a str,
    size: u64,
    modified: String,
}

#[derive(Debug, Serialize)]
struct ReleaseRecord<'a> {
    bank: &'a str,
    release: String,
    recorded_at: String,
    files: Vec<ReleaseFile<'a>>,
}

pub const RELEASE_FILE: &str = "release.json";

/// Records the listed files. The release defaults to the newest file date.
fn release(task: &Task) -> Result<(), MirrorError> {
    let newest = task
        .sources
        .iter()
        .map(|file| file.modified)
        .max()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
    let record = ReleaseRecord {
        bank: &task.bank.name,
        release: task
            .params
            .get("release")
            .map(str::to_string)
            .unwrap_or_else(|| newest.format("%Y-%m-%d").to_string()),
        recorded_at: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        files: task
            .sources
            .iter()
            .map(|file| ReleaseFile {
                dir: &file.dir,
                name: &file.name,
                size: file.size,
                modified: file.modified.to_rfc3339_opts(SecondsFormat::Secs, true),
            })
            .collect(),
    };
    let content = serde_json::to_vec_pretty(&record).map_err(fs_err)?;
    write_atomic(&task.bank.work_dir.join(RELEASE_FILE), &content)
}

/// Renames the finalizer's `<stem>.*` outputs to `<bank>.*`.
fn rename(task: &Task) -> Result<(), MirrorError> {
    let input = first_input(task)?;
    let stem = input
        .file_stem()
        .map(|stem| stem.to_string_lossy().to_string())
        .ok_or_else(|| task_error(task, "input has no file name"))?;
    let canonical = task.params.get("volume").unwrap_or(&task.bank.name);
    if stem == canonical {
        return Ok(());
    }
    let work_dir = &task.bank.work_dir;
    let entries = fs::read_dir(work_dir).map_err(fs_err)?;
    let prefix = format!("{stem}.");
    let mut renamed = 0usize;
    for entry in entries {
        let entry = entry.map_err(fs_err)?;
        let name = entry.file_name().to_string_lossy().to_string();
        let Some(rest) = name.strip_prefix(&prefix) else {
            continue;
        };
        fs::rename(entry.path(), work_dir.join(format!("{canonical}.{rest}"))).map_err(fs_err)?;
        renamed += 1;
    }
    if renamed == 0 {
        return Err(task_error(task, format!("no finalized volume named {stem}.* in work dir")));
    }
    Ok(())
}

fn write_atomic(path: &Path, content: &[u8]) -> Result<(), MirrorError> {
    let parent = path
        .parent()
        .ok_or_else(|| MirrorError::Filesystem("invalid destination path".to_string()))?;
    fs::create_dir_all(parent).map_err(fs_err)?;
    let temp = tempfile::Builder::new()
        .prefix("kira-mirror-write")
        .tempfile_in(parent)
        .map_err(fs_err)?;
    fs::write(temp.path(), content).map_err(fs_err)?;
    temp.persist(path).map_err(fs_err)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use flate2::Compression;
    use flate2::write::GzEncoder;

    use super::*;
    use crate::context::RunContext;
    use crate::domain::RemoteFile;
    use crate::task::{BankInfo, TaskParams, ToolTable};

    fn bank(root: &Path, bank_type: BankType) -> BankInfo {
        let info = BankInfo {
            name: "sprot".to_string(),
            description: "UniProtKB/Swiss-Prot".to_string(),
            provider: "UniProt".to_string(),
            bank_type,
            offline_dir: root.join("offline"),
            work_dir: root.join("work"),
        };
        fs::create_dir_all(&info.offline_dir).unwrap();
        fs::create_dir_all(&info.work_dir).unwrap();
        info
    }

    fn execute(task: &mut Task) -> bool {
        let ctx = RunContext::new();
        let tools = ToolTable::default();
        task.execute(&TaskEnv { ctx: &ctx, tools: &tools })
    }

    #[test]
    fn decompress_gzip_and_remove() {
        let temp = tempfile::tempdir().unwrap();
        let info = bank(temp.path(), BankType::Protein);
        let gz = info.offline_dir.join("a.dat.gz");
        let mut encoder = GzEncoder::new(fs::File::create(&gz).unwrap(), Compression::default());
        encoder.write_all(b"ID   A\n//\n").unwrap();
        encoder.finish().unwrap();

        let dest = info.offline_dir.join("a.dat");
        let mut task = Task::new(TaskKind::Decompress, &info, TaskParams::parse("remove=true").unwrap())
            .with_input(&gz)
            .with_output(&dest);
        assert!(execute(&mut task));
        assert_eq!(fs::read(&dest).unwrap(), b"ID   A\n//\n");
        assert!(!gz.exists());

        let mut again = Task::new(TaskKind::Decompress, &info, TaskParams::default())
            .with_input(&gz)
            .with_output(&dest);
        assert!(execute(&mut again));
    }

    #[test]
    fn cleanup_stays_inside_the_bank() {
        let temp = tempfile::tempdir().unwrap();
        let info = bank(temp.path(), BankType::Protein);
        fs::write(info.offline_dir.join("x.tmp"), b"1").unwrap();
        fs::write(info.offline_dir.join("keep.dat"), b"1").unwrap();

        let mut task = Task::new(TaskKind::Cleanup, &info, TaskParams::parse("pattern=*.tmp").unwrap());
        assert!(execute(&mut task));
        assert!(!info.offline_dir.join("x.tmp").exists());
        assert!(info.offline_dir.join("keep.dat").exists());

        let mut escape = Task::new(TaskKind::Cleanup, &info, TaskParams::parse("pattern=../*").unwrap());
        assert!(!execute(&mut escape));
    }

    #[test]
    fn alias_lists_volumes() {
        let temp = tempfile::tempdir().unwrap();
        let info = bank(temp.path(), BankType::Nucleic);
        let mut task = Task::new(TaskKind::Alias, &info, TaskParams::default())
            .with_input(info.offline_dir.join("est_human.fasta"))
            .with_input(info.offline_dir.join("est_mouse.fasta"));
        assert!(execute(&mut task));
        let text = fs::read_to_string(info.work_dir.join("sprot.nal")).unwrap();
        assert_eq!(text, "TITLE UniProtKB/Swiss-Prot\nDBLIST est_human est_mouse\n");
    }

    #[test]
    fn release_uses_newest_file_date() {
        let temp = tempfile::tempdir().unwrap();
        let info = bank(temp.path(), BankType::Protein);
        let old = DateTime::from_timestamp(1_577_836_800, 0).unwrap();
        let new = DateTime::from_timestamp(1_592_179_200, 0).unwrap();
        let mut task = Task::new(TaskKind::Release, &info, TaskParams::default()).with_sources(vec![
            RemoteFile::new("/pub", "a.gz", 1, old),
            RemoteFile::new("/pub", "b.gz", 2, new),
        ]);
        assert!(execute(&mut task));
        let json: serde_json::Value =
            serde_json::from_slice(&fs::read(info.work_dir.join(RELEASE_FILE)).unwrap()).unwrap();
        assert_eq!(json["release"], "2020-06-15");
        assert_eq!(json["files"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn rename_to_bank_name() {
        let temp = tempfile::tempdir().unwrap();
        let info = bank(temp.path(), BankType::Protein);
        fs::write(info.work_dir.join("uniprot_sprot.phr"), b"x").unwrap();
        fs::write(info.work_dir.join("uniprot_sprot.psq"), b"x").unwrap();
        let mut task = Task::new(TaskKind::Rename, &info, TaskParams::default())
            .with_input(info.offline_dir.join("uniprot_sprot.dat"));
        assert!(execute(&mut task));
        assert!(info.work_dir.join("sprot.phr").exists());
        assert!(info.work_dir.join("sprot.psq").exists());
    }
}
