use std::io::{BufRead, BufReader, Write};
use std::net::TcpListener;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::thread;

use assert_matches::assert_matches;
use chrono::Utc;

use kira_mirror::context::RunContext;
use kira_mirror::descriptor::DescriptorLoader;
use kira_mirror::domain::{EntryKind, ListOutcome, Protocol, RemoteEntry, RemoteFile};
use kira_mirror::error::MirrorError;
use kira_mirror::listing::ListingEngine;
use kira_mirror::progress::TransferMeter;
use kira_mirror::remote::{Connection, Connector, HttpConnector};

/// Lists a fixed directory whose entries carry no exact size.
#[derive(Default)]
struct RoundedSizes {
    queried: Arc<Mutex<Vec<String>>>,
    size: Option<u64>,
}

struct RoundedConnection {
    queried: Arc<Mutex<Vec<String>>>,
    size: Option<u64>,
}

impl Connector for RoundedSizes {
    fn connect(&self) -> Result<Box<dyn Connection>, MirrorError> {
        Ok(Box::new(RoundedConnection {
            queried: Arc::clone(&self.queried),
            size: self.size,
        }))
    }

    fn host(&self) -> &str {
        "rounded"
    }
}

impl Connection for RoundedConnection {
    fn list(&mut self, _dir: &str) -> Result<Vec<RemoteEntry>, MirrorError> {
        Ok(["nr.gz", "README"]
            .into_iter()
            .map(|name| RemoteEntry {
                name: name.to_string(),
                kind: EntryKind::File,
                size: None,
                modified: Utc::now(),
            })
            .collect())
    }

    fn file_size(&mut self, path: &str) -> Result<u64, MirrorError> {
        self.queried.lock().unwrap().push(path.to_string());
        self.size.ok_or_else(|| MirrorError::Listing {
            path: path.to_string(),
            message: "HEAD returned 503".to_string(),
        })
    }

    fn retrieve(
        &mut self,
        _file: &RemoteFile,
        _target: &Path,
        _offset: u64,
        _meter: &mut TransferMeter<'_>,
    ) -> Result<(), MirrorError> {
        Ok(())
    }
}

fn descriptor_text(data_dir: &Path) -> String {
    format!(
        "db.name=nr\ndb.type=p\ndata.dir={}\nremote.dir=/pub\nremote.files=nr\\.gz\n",
        data_dir.display()
    )
}

#[test]
fn exact_sizes_are_looked_up_for_selected_files_only() {
    let temp = tempfile::tempdir().unwrap();
    let descriptor = DescriptorLoader::parse("nr", &descriptor_text(temp.path())).unwrap();
    let connector = RoundedSizes {
        size: Some(1_288_490_188),
        ..RoundedSizes::default()
    };
    let ctx = RunContext::new();
    let outcome = ListingEngine::new(&descriptor, &connector, &ctx).list();

    let ListOutcome::Listed(files) = outcome else {
        panic!("listing failed: {outcome:?}");
    };
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].size, 1_288_490_188);
    assert_eq!(*connector.queried.lock().unwrap(), vec!["/pub/nr.gz".to_string()]);
}

#[test]
fn failed_size_lookup_fails_the_listing() {
    let temp = tempfile::tempdir().unwrap();
    let descriptor = DescriptorLoader::parse("nr", &descriptor_text(temp.path())).unwrap();
    let connector = RoundedSizes::default();
    let ctx = RunContext::new();
    let outcome = ListingEngine::new(&descriptor, &connector, &ctx).list();
    assert_matches!(outcome, ListOutcome::Failed(message) if message.contains("503"));
}

/// Answers `GET /pub/` with an autoindex page and every `HEAD` with
/// `head_response`. One request per connection.
fn autoindex_server(head_response: &'static str) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(mut stream) = stream else { continue };
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut request_line = String::new();
            reader.read_line(&mut request_line).unwrap();
            let mut line = String::new();
            while reader.read_line(&mut line).unwrap() > 2 {
                line.clear();
            }
            let response = if request_line.starts_with("HEAD") {
                head_response.to_string()
            } else {
                let body = "<pre><a href=\"nr.gz\">nr.gz</a>  2020-06-15 08:30  1.2G\n</pre>";
                format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                )
            };
            let _ = stream.write_all(response.as_bytes());
        }
    });
    port
}

fn http_descriptor(data_dir: &Path, port: u16) -> String {
    format!("protocol=http\nserver=127.0.0.1\nport={port}\n{}", descriptor_text(data_dir))
}

#[test]
fn http_listing_fails_when_head_is_refused() {
    let port = autoindex_server("HTTP/1.1 503 Service Unavailable\r\nContent-Length: 0\r\nConnection: close\r\n\r\n");
    let temp = tempfile::tempdir().unwrap();
    let descriptor = DescriptorLoader::parse("nr", &http_descriptor(temp.path(), port)).unwrap();
    let connector = HttpConnector::new(Protocol::Http, "127.0.0.1", port).unwrap();
    let ctx = RunContext::new();
    let outcome = ListingEngine::new(&descriptor, &connector, &ctx).list();
    assert_matches!(outcome, ListOutcome::Failed(_));
}

#[test]
fn http_listing_takes_the_exact_size_from_head() {
    let port = autoindex_server("HTTP/1.1 200 OK\r\nContent-Length: 1288490188\r\nConnection: close\r\n\r\n");
    let temp = tempfile::tempdir().unwrap();
    let descriptor = DescriptorLoader::parse("nr", &http_descriptor(temp.path(), port)).unwrap();
    let connector = HttpConnector::new(Protocol::Http, "127.0.0.1", port).unwrap();
    let ctx = RunContext::new();
    let ListOutcome::Listed(files) = ListingEngine::new(&descriptor, &connector, &ctx).list() else {
        panic!("listing failed");
    };
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].size, 1_288_490_188);
}
