//! Resolves a descriptor's path patterns and lists the files to mirror.

use std::collections::VecDeque;
use std::fs;
use std::io::Write;
use std::path::Path;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::context::RunContext;
use crate::descriptor::DatabankDescriptor;
use crate::domain::{EntryKind, ListOutcome, RemoteFile};
use crate::error::MirrorError;
use crate::filter::{DateMatcher, NameMatcher};
use crate::remote::local::stat_file;
use crate::remote::{Connection, Connector};

const REGEX_META: &[char] = &['*', '?', '+', '[', ']', '(', ')', '{', '}', '|', '^', '$', '\\'];

pub struct ListingEngine<'a> {
    descriptor: &'a DatabankDescriptor,
    connector: &'a dyn Connector,
    ctx: &'a RunContext,
}

impl<'a> ListingEngine<'a> {
    pub fn new(
        descriptor: &'a DatabankDescriptor,
        connector: &'a dyn Connector,
        ctx: &'a RunContext,
    ) -> Self {
        Self {
            descriptor,
            connector,
            ctx,
        }
    }

    pub fn list(&self) -> ListOutcome {
        match self.try_list() {
            Ok(files) => ListOutcome::Listed(files),
            Err(err) if err.is_interrupted() => ListOutcome::Aborted,
            Err(err) => ListOutcome::Failed(err.to_string()),
        }
    }

    /// Repeats failed listings `retries` times, `delay` apart.
    pub fn list_with_retry(&self, retries: u32, delay: Duration) -> ListOutcome {
        let mut attempt = 0;
        loop {
            match self.list() {
                ListOutcome::Failed(message) if attempt < retries => {
                    attempt += 1;
                    warn!(
                        bank = %self.descriptor.name,
                        attempt,
                        retries,
                        "listing failed: {message}; retrying"
                    );
                    if !self.ctx.pause(delay) {
                        return ListOutcome::Aborted;
                    }
                }
                outcome => return outcome,
            }
        }
    }

    fn try_list(&self) -> Result<Vec<RemoteFile>, MirrorError> {
        let date = self.descriptor.date_matcher();
        if self.descriptor.is_local() && self.descriptor.dirs.is_empty() {
            return self.explicit_files(date.as_ref());
        }

        let names = self.descriptor.name_matcher()?;
        let excluded = self.descriptor.excluded_dir_matcher()?;
        let mut connection = self.connector.connect()?;

        let mut dirs = Vec::new();
        for pattern in &self.descriptor.dirs {
            for dir in resolve_pattern(connection.as_mut(), pattern, self.ctx)? {
                if excluded.as_ref().is_some_and(|matcher| matcher.is_match(&dir)) {
                    debug!(dir = %dir, "excluded directory");
                    continue;
                }
                if !dirs.contains(&dir) {
                    dirs.push(dir);
                }
            }
        }

        let mut files = Vec::new();
        for dir in &dirs {
            if self.ctx.is_aborted() {
                return Err(MirrorError::Interrupted);
            }
            for entry in connection.list(dir)? {
                if entry.kind != EntryKind::File {
                    continue;
                }
                if date.as_ref().is_some_and(|matcher| !matcher.is_match(&entry.modified)) {
                    continue;
                }
                if !names.is_match(&entry.name) {
                    continue;
                }
                let mut file = RemoteFile::new(dir.clone(), entry.name, 0, entry.modified);
                file.size = match entry.size {
                    Some(size) => size,
                    None => connection.file_size(&file.path())?,
                };
                files.push(file);
            }
        }
        info!(
            bank = %self.descriptor.name,
            host = %self.connector.host(),
            dirs = dirs.len(),
            files = files.len(),
            "listing complete"
        );
        Ok(files)
    }

    /// Local mode without path patterns: the include list names the files.
    fn explicit_files(&self, date: Option<&DateMatcher>) -> Result<Vec<RemoteFile>, MirrorError> {
        let mut files = Vec::new();
        for path in &self.descriptor.files {
            if self.ctx.is_aborted() {
                return Err(MirrorError::Interrupted);
            }
            let file = stat_file(Path::new(path))?;
            if date.is_some_and(|matcher| !matcher.is_match(&file.modified)) {
                continue;
            }
            files.push(file);
        }
        Ok(files)
    }
}

/// Expands one path pattern breadth-first. Each segment is a name pattern
/// matched against the subdirectories of the prefix resolved so far; literal
/// segments are appended without listing.
pub fn resolve_pattern(
    connection: &mut dyn Connection,
    pattern: &str,
    ctx: &RunContext,
) -> Result<Vec<String>, MirrorError> {
    let segments: Vec<&str> = pattern.split('/').filter(|seg| !seg.is_empty()).collect();
    let root = if pattern.starts_with('/') { "/" } else { "" };

    let mut resolved = Vec::new();
    let mut worklist = VecDeque::from([(root.to_string(), 0usize)]);
    while let Some((prefix, depth)) = worklist.pop_front() {
        if ctx.is_aborted() {
            return Err(MirrorError::Interrupted);
        }
        let Some(segment) = segments.get(depth) else {
            resolved.push(if prefix.is_empty() { ".".to_string() } else { prefix });
            continue;
        };
        if is_literal(segment) {
            worklist.push_back((join(&prefix, segment), depth + 1));
            continue;
        }

        let matcher = NameMatcher::single(&anchor(segment))?;
        let listed = if prefix.is_empty() { "." } else { prefix.as_str() };
        for entry in connection.list(listed)? {
            if entry.kind == EntryKind::Directory && matcher.is_match(&entry.name) {
                worklist.push_back((join(&prefix, &entry.name), depth + 1));
            }
        }
    }
    Ok(resolved)
}

fn is_literal(segment: &str) -> bool {
    !segment.contains(REGEX_META)
}

/// Directory segments name whole directories.
fn anchor(segment: &str) -> String {
    format!("^(?:{segment})$")
}

fn join(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else if prefix.ends_with('/') {
        format!("{prefix}{name}")
    } else {
        format!("{prefix}/{name}")
    }
}

/// Writes one `origin<TAB>dir<TAB>name<TAB>size<TAB>epoch` line per file.
pub fn write_listing(path: &Path, origin: &str, files: &[RemoteFile]) -> Result<(), MirrorError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|err| MirrorError::Filesystem(err.to_string()))?;
    }
    let mut out = fs::File::create(path)
        .map_err(|err| MirrorError::Filesystem(format!("create {}: {err}", path.display())))?;
    for file in files {
        writeln!(
            out,
            "{origin}\t{}\t{}\t{}\t{}",
            file.dir,
            file.name,
            file.size,
            file.modified.timestamp()
        )
        .map_err(|err| MirrorError::Filesystem(err.to_string()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::LocalConnector;

    fn tree() -> tempfile::TempDir {
        let temp = tempfile::tempdir().unwrap();
        for dir in ["release-2020_01/data", "release-2021_01/data", "misc/data"] {
            fs::create_dir_all(temp.path().join(dir)).unwrap();
        }
        fs::write(temp.path().join("release-2020_01/data/a.gz"), b"a").unwrap();
        fs::write(temp.path().join("release-2021_01/data/b.gz"), b"bb").unwrap();
        fs::write(temp.path().join("misc/data/c.gz"), b"ccc").unwrap();
        temp
    }

    #[test]
    fn segments_expand_against_directories() {
        let temp = tree();
        let pattern = format!("{}/release-\\d+_01/data", temp.path().display());
        let mut connection = LocalConnector.connect().unwrap();
        let ctx = RunContext::new();
        let mut dirs = resolve_pattern(connection.as_mut(), &pattern, &ctx).unwrap();
        dirs.sort();
        assert_eq!(dirs.len(), 2);
        assert!(dirs[0].ends_with("release-2020_01/data"));
        assert!(dirs[1].ends_with("release-2021_01/data"));
    }

    #[test]
    fn abort_stops_expansion() {
        let temp = tree();
        let pattern = format!("{}/.*/data", temp.path().display());
        let mut connection = LocalConnector.connect().unwrap();
        let ctx = RunContext::new();
        ctx.abort();
        let err = resolve_pattern(connection.as_mut(), &pattern, &ctx).unwrap_err();
        assert!(err.is_interrupted());
    }

    #[test]
    fn side_file_format() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("info.txt");
        let at = chrono::DateTime::from_timestamp(1_592_179_200, 0).unwrap();
        let files = vec![RemoteFile::new("/pub/db", "a.gz", 4478, at)];
        write_listing(&path, "ftp://ftp.example.org", &files).unwrap();
        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            "ftp://ftp.example.org\t/pub/db\ta.gz\t4478\t1592179200\n"
        );
    }
}
