//! HTTP(S) connections. Directories are read from server autoindex pages.

use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, Utc};
use regex::Regex;
use reqwest::StatusCode;
use reqwest::blocking::Client;
use reqwest::header::{CONTENT_LENGTH, HeaderMap, HeaderValue, RANGE, USER_AGENT};
use tracing::debug;

use crate::domain::{EntryKind, Protocol, RemoteEntry, RemoteFile};
use crate::error::MirrorError;
use crate::progress::TransferMeter;
use crate::remote::{Connection, Connector, open_target};

#[derive(Clone)]
pub struct HttpConnector {
    client: Client,
    base_url: String,
    host: String,
}

impl HttpConnector {
    pub fn new(protocol: Protocol, host: &str, port: u16) -> Result<Self, MirrorError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("kira-mirror/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| MirrorError::Http(err.to_string()))?,
        );
        // No overall timeout: bodies can take hours on large banks.
        let client = Client::builder()
            .default_headers(headers)
            .connect_timeout(Duration::from_secs(30))
            .timeout(None::<Duration>)
            .build()
            .map_err(|err| MirrorError::Http(err.to_string()))?;
        let base_url = if port == protocol.default_port() {
            format!("{}://{}", protocol.scheme(), host)
        } else {
            format!("{}://{}:{}", protocol.scheme(), host, port)
        };
        Ok(Self {
            client,
            base_url,
            host: host.to_string(),
        })
    }
}

impl Connector for HttpConnector {
    fn connect(&self) -> Result<Box<dyn Connection>, MirrorError> {
        Ok(Box::new(HttpConnection {
            client: self.client.clone(),
            base_url: self.base_url.clone(),
        }))
    }

    fn host(&self) -> &str {
        &self.host
    }
}

pub struct HttpConnection {
    client: Client,
    base_url: String,
}

impl HttpConnection {
    fn url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }

    fn handle_status(
        response: reqwest::blocking::Response,
    ) -> Result<reqwest::blocking::Response, MirrorError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let message = response
            .text()
            .unwrap_or_else(|_| "HTTP request failed".to_string());
        Err(MirrorError::HttpStatus { status, message })
    }

}

impl Connection for HttpConnection {
    fn list(&mut self, dir: &str) -> Result<Vec<RemoteEntry>, MirrorError> {
        let dir_url = if dir.ends_with('/') {
            self.url(dir)
        } else {
            format!("{}/", self.url(dir))
        };
        let listing_error = |message: String| MirrorError::Listing {
            path: dir.to_string(),
            message,
        };
        let response = self
            .client
            .get(&dir_url)
            .send()
            .map_err(|err| listing_error(err.to_string()))?;
        let html = Self::handle_status(response)?
            .text()
            .map_err(|err| listing_error(err.to_string()))?;

        Ok(parse_index(&html)
            .into_iter()
            .map(|item| RemoteEntry {
                size: match item.kind {
                    EntryKind::File => item.size,
                    _ => Some(0),
                },
                name: item.name,
                kind: item.kind,
                modified: item.modified.unwrap_or(DateTime::<Utc>::UNIX_EPOCH),
            })
            .collect())
    }

    /// Autoindex pages round large sizes, so the exact one comes from `HEAD`.
    fn file_size(&mut self, path: &str) -> Result<u64, MirrorError> {
        let listing_error = |message: String| MirrorError::Listing {
            path: path.to_string(),
            message,
        };
        let response = self
            .client
            .head(self.url(path))
            .send()
            .map_err(|err| listing_error(err.to_string()))?;
        if !response.status().is_success() {
            return Err(listing_error(format!("HEAD returned {}", response.status())));
        }
        response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse().ok())
            .ok_or_else(|| listing_error("HEAD response without Content-Length".to_string()))
    }

    fn retrieve(
        &mut self,
        file: &RemoteFile,
        target: &Path,
        offset: u64,
        meter: &mut TransferMeter<'_>,
    ) -> Result<(), MirrorError> {
        let url = self.url(&file.path());
        let mut request = self.client.get(&url);
        if offset > 0 {
            request = request.header(RANGE, format!("bytes={offset}-"));
        }
        let response = request.send().map_err(|err| MirrorError::Transfer {
            name: file.name.clone(),
            message: err.to_string(),
        })?;
        let mut response = Self::handle_status(response)?;

        let offset = if offset > 0 && response.status() != StatusCode::PARTIAL_CONTENT {
            debug!(file = %file.name, "server ignored range request, restarting");
            meter.restart();
            0
        } else {
            offset
        };
        let mut output = open_target(target, offset)?;
        meter.copy(&mut response, &mut output)?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexItem {
    pub name: String,
    pub kind: EntryKind,
    pub size: Option<u64>,
    pub modified: Option<DateTime<Utc>>,
}

static LINK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)<a\s+[^>]*href="([^"]+)"[^>]*>.*?</a>(.*)"#).expect("static regex")
});
static TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]*>").expect("static regex"));
static DATE_SIZE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d{4}-\d{2}-\d{2} \d{2}:\d{2}|\d{2}-[A-Za-z]{3}-\d{4} \d{2}:\d{2})(?::\d{2})?\s+(\S+)?")
        .expect("static regex")
});

/// Extracts entries from an Apache or nginx autoindex page. Sizes written
/// with a unit suffix are not exact and come back as `None`.
pub fn parse_index(html: &str) -> Vec<IndexItem> {
    let mut items = Vec::new();
    for line in html.lines() {
        let Some(caps) = LINK.captures(line) else {
            continue;
        };
        let href = &caps[1];
        if href.starts_with('?')
            || href.starts_with('/')
            || href.starts_with('#')
            || href.starts_with("..")
            || href.contains("://")
        {
            continue;
        }
        let (name, kind) = match href.strip_suffix('/') {
            Some(dir) => (dir.to_string(), EntryKind::Directory),
            None => (href.to_string(), EntryKind::File),
        };
        let rest = TAG.replace_all(&caps[2], " ");
        let (modified, size) = match DATE_SIZE.captures(&rest) {
            Some(found) => (
                parse_index_date(&found[1]),
                found.get(2).and_then(|size| size.as_str().parse::<u64>().ok()),
            ),
            None => (None, None),
        };
        items.push(IndexItem {
            name,
            kind,
            size,
            modified,
        });
    }
    items
}

fn parse_index_date(value: &str) -> Option<DateTime<Utc>> {
    ["%Y-%m-%d %H:%M", "%d-%b-%Y %H:%M"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(value, format).ok())
        .map(|naive| naive.and_utc())
}
