use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use assert_matches::assert_matches;
use chrono::Utc;
use flate2::Compression;
use flate2::write::GzEncoder;

use kira_mirror::context::RunContext;
use kira_mirror::descriptor::DescriptorLoader;
use kira_mirror::domain::{ListOutcome, RemoteEntry, RemoteFile};
use kira_mirror::error::MirrorError;
use kira_mirror::listing::ListingEngine;
use kira_mirror::pipeline::PipelineConstructor;
use kira_mirror::pool::{FileStatus, LoaderMonitor, PoolSettings, WorkerPool};
use kira_mirror::progress::{LogSink, TransferMeter};
use kira_mirror::remote::{Connection, Connector, LocalConnector};
use kira_mirror::retrieval::RetrievalEngine;
use kira_mirror::scheduler::{KeyOutcome, TaskScheduler};
use kira_mirror::task::{TaskEnv, TaskKind, ToolTable};

#[derive(Default)]
struct Recorder {
    done: Mutex<Vec<(String, FileStatus)>>,
}

impl LoaderMonitor for Recorder {
    fn file_begin(&self, _index: usize, _file: &RemoteFile) {}

    fn file_done(&self, _index: usize, file: &RemoteFile, status: &FileStatus) {
        self.done.lock().unwrap().push((file.name.clone(), status.clone()));
    }
}

/// Every transfer fails with the attempt number in its message.
#[derive(Default)]
struct FailingConnector {
    attempts: Arc<AtomicUsize>,
    connects: AtomicUsize,
}

struct FailingConnection {
    attempts: Arc<AtomicUsize>,
}

impl Connector for FailingConnector {
    fn connect(&self) -> Result<Box<dyn Connection>, MirrorError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FailingConnection {
            attempts: self.attempts.clone(),
        }))
    }

    fn host(&self) -> &str {
        "mock"
    }
}

impl Connection for FailingConnection {
    fn list(&mut self, _dir: &str) -> Result<Vec<RemoteEntry>, MirrorError> {
        Ok(Vec::new())
    }

    fn retrieve(
        &mut self,
        file: &RemoteFile,
        _target: &Path,
        _offset: u64,
        _meter: &mut TransferMeter<'_>,
    ) -> Result<(), MirrorError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        Err(MirrorError::Transfer {
            name: file.name.clone(),
            message: format!("attempt {attempt}"),
        })
    }
}

#[test]
fn retries_are_exhausted_then_reported() {
    let temp = tempfile::tempdir().unwrap();
    let ctx = RunContext::new();
    let engine = RetrievalEngine::new(temp.path(), &ctx, &LogSink);
    let connector = FailingConnector::default();
    let monitor = Recorder::default();
    let settings = PoolSettings {
        workers: 1,
        retries: 3,
        delay: Duration::from_millis(10),
    };
    let files = vec![RemoteFile::new("/pub", "a.gz", 10, Utc::now())];

    let report = WorkerPool::new(&connector, &engine, &monitor, &ctx, settings).run(&files);

    assert_eq!(connector.attempts.load(Ordering::SeqCst), 4);
    assert_eq!(connector.connects.load(Ordering::SeqCst), 4);
    assert_eq!(report.failed.len(), 1);
    assert!(report.failed[0].message.contains("attempt 4"));
    assert!(!report.is_success());
    let done = monitor.done.lock().unwrap();
    assert!(matches!(&done[0].1, FileStatus::Failed(message) if message.contains("attempt 4")));
}

#[test]
fn local_pool_retrieves_every_file() {
    let temp = tempfile::tempdir().unwrap();
    let remote = temp.path().join("remote");
    fs::create_dir_all(&remote).unwrap();
    let sizes = [("f1.dat", 4478usize), ("f2.dat", 421_780), ("f3.dat", 85948)];
    for (name, size) in sizes {
        fs::write(remote.join(name), vec![b'x'; size]).unwrap();
    }
    fs::write(remote.join("notes.txt"), b"skip me").unwrap();

    let text = format!(
        "db.name=local\ndb.type=n\nprotocol=local\ndata.dir={}\nlocal.dir={}\nlocal.files=f\\d\\.dat\n",
        temp.path().join("data").display(),
        remote.display()
    );
    let descriptor = DescriptorLoader::parse("local", &text).unwrap();
    let ctx = RunContext::new();
    let connector = LocalConnector;
    let ListOutcome::Listed(files) = ListingEngine::new(&descriptor, &connector, &ctx).list() else {
        panic!("listing failed");
    };
    assert_eq!(files.len(), 3);

    let engine = RetrievalEngine::new(descriptor.offline_dir(), &ctx, &LogSink);
    let monitor = Recorder::default();
    let settings = PoolSettings {
        workers: 2,
        retries: 3,
        delay: Duration::from_millis(1000),
    };
    let report = WorkerPool::new(&connector, &engine, &monitor, &ctx, settings).run(&files);

    assert!(report.is_success());
    assert_eq!(report.downloaded, 3);
    assert!(report.failed.is_empty());
    for (name, size) in sizes {
        let meta = fs::metadata(descriptor.offline_dir().join(name)).unwrap();
        assert_eq!(meta.len(), size as u64);
    }
    assert_eq!(monitor.done.lock().unwrap().len(), 3);

    let rerun = WorkerPool::new(&connector, &engine, &Recorder::default(), &ctx, settings).run(&files);
    assert_eq!(rerun.skipped, 3);
    assert_eq!(rerun.downloaded, 0);
}

#[test]
fn global_tasks_are_queued_once() {
    let temp = tempfile::tempdir().unwrap();
    let text = format!(
        "db.name=gated\ndb.type=p\ndata.dir={}\nremote.files=.*\ndb.global.tasks=metadata\n",
        temp.path().display()
    );
    let descriptor = DescriptorLoader::parse("gated", &text).unwrap();
    let ctx = RunContext::new();
    let scheduler = TaskScheduler::new(ctx.clone());
    let expected = 16;
    let pipeline = PipelineConstructor::new(&descriptor, &scheduler, expected).unwrap();
    let files: Vec<RemoteFile> = (0..expected)
        .map(|i| RemoteFile::new("/pub", format!("part{i:02}.dat"), 1, Utc::now()))
        .collect();

    // Interleave indexes so callbacks do not arrive in listing order.
    let order: Vec<usize> = (0..expected).map(|i| (i * 7) % expected).collect();
    thread::scope(|scope| {
        for index in order {
            let pipeline = &pipeline;
            let file = &files[index];
            scope.spawn(move || pipeline.file_done(index, file, &FileStatus::Ok));
        }
    });

    assert_eq!(pipeline.completed(), expected);
    assert_eq!(pipeline.global_rounds(), 1);
    let queued = scheduler.queued("gated");
    assert_eq!(queued.iter().filter(|kind| **kind == TaskKind::Release).count(), 1);
    assert_eq!(queued.iter().filter(|kind| **kind == TaskKind::Metadata).count(), 1);
    assert_eq!(queued.last(), Some(&TaskKind::EndOfProcessing));
}

#[test]
fn failed_files_hold_back_global_tasks() {
    let temp = tempfile::tempdir().unwrap();
    let text = format!(
        "db.name=gated\ndb.type=p\ndata.dir={}\nremote.files=.*\ndb.global.tasks=metadata\n",
        temp.path().display()
    );
    let descriptor = DescriptorLoader::parse("gated", &text).unwrap();
    let scheduler = TaskScheduler::new(RunContext::new());
    let pipeline = PipelineConstructor::new(&descriptor, &scheduler, 3).unwrap();
    let at = Utc::now();
    pipeline.file_done(0, &RemoteFile::new("/pub", "a.dat", 1, at), &FileStatus::Ok);
    pipeline.file_done(1, &RemoteFile::new("/pub", "b.dat", 1, at), &FileStatus::Failed("timeout".into()));
    pipeline.file_done(2, &RemoteFile::new("/pub", "c.dat", 1, at), &FileStatus::Ok);

    assert_eq!(pipeline.completed(), 2);
    assert_eq!(pipeline.global_rounds(), 0);
    assert!(!scheduler.queued("gated").contains(&TaskKind::Release));
}

#[test]
fn compressed_z_files_are_decompressed_by_the_pipeline() {
    let temp = tempfile::tempdir().unwrap();
    let text = format!(
        "db.name=nr\ndb.type=p\ndata.dir={}\nremote.files=.*\ndb.unit.tasks=decompress\ndb.global.tasks=metadata\n",
        temp.path().display()
    );
    let descriptor = DescriptorLoader::parse("nr", &text).unwrap();
    let offline = descriptor.offline_dir();
    fs::create_dir_all(&offline).unwrap();
    // gzip -d reads both gzip and compress formats; gzip data keeps the fixture small.
    let mut encoder = GzEncoder::new(fs::File::create(offline.join("nr.Z")).unwrap(), Compression::default());
    encoder.write_all(b">seq1\nMKV\n").unwrap();
    encoder.finish().unwrap();

    let ctx = RunContext::new();
    let scheduler = TaskScheduler::new(ctx.clone());
    let pipeline = PipelineConstructor::new(&descriptor, &scheduler, 1).unwrap();
    pipeline.file_done(0, &RemoteFile::new("/pub", "nr.Z", 1, Utc::now()), &FileStatus::Ok);
    scheduler.close();
    let tools = ToolTable::default();
    scheduler.run(&TaskEnv { ctx: &ctx, tools: &tools });

    assert_matches!(scheduler.outcome("nr"), KeyOutcome::Finished);
    assert_eq!(fs::read(offline.join("nr")).unwrap(), b">seq1\nMKV\n");
}
