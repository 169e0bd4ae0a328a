#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::{Read, Write};
use std::net::TcpListener;
use std::path::Path;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use camino::Utf8Path;

use openfda_bulk::app::{ProgressEvent, ProgressSink};
use openfda_bulk::catalog::Catalog;
use openfda_bulk::domain::Period;
use openfda_bulk::error::BulkError;
use openfda_bulk::fetcher::RemoteClient;
use openfda_bulk::orchestrator::OrchestratorSettings;
use openfda_bulk::store::Store;

pub const MIRROR: &str = "https://mirror.test/drug/event";

pub fn period(value: &str) -> Period {
    value.parse().unwrap()
}

/// 2014q1 with 7 archives, 2014q2 with 4, 2014q3 with 2.
pub fn small_catalog(root: &Utf8Path) -> Catalog {
    let counts = BTreeMap::from([
        (period("2014q1"), 7),
        (period("2014q2"), 4),
        (period("2014q3"), 2),
    ]);
    Catalog::new(counts, MIRROR, Store::new_with_root(root.to_path_buf()))
}

/// Production shape with no real waiting left to do.
pub fn fast_settings() -> OrchestratorSettings {
    OrchestratorSettings {
        fetch_backoff: Duration::from_secs(30),
        poll_interval: Duration::from_secs(30),
        max_wait: Duration::from_secs(60),
        ..OrchestratorSettings::default()
    }
}

/// Writes `body` for every URL except those scripted to fail.
pub struct MockRemote {
    body: Vec<u8>,
    failures: Mutex<HashMap<String, u32>>,
    requests: Mutex<Vec<String>>,
}

impl MockRemote {
    pub fn new() -> Self {
        Self {
            body: b"PK\x03\x04 archive".to_vec(),
            failures: Mutex::new(HashMap::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Every request for `filename` answers 503.
    pub fn fail_always(self, filename: &str) -> Self {
        self.fail_times(filename, u32::MAX)
    }

    pub fn fail_times(self, filename: &str, times: u32) -> Self {
        self.failures
            .lock()
            .unwrap()
            .insert(filename.to_string(), times);
        self
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }

    pub fn requests_for(&self, filename: &str) -> usize {
        self.requests()
            .iter()
            .filter(|url| url.ends_with(&format!("/{filename}")))
            .count()
    }
}

impl RemoteClient for MockRemote {
    fn download(&self, url: &str, destination: &Path) -> Result<u64, BulkError> {
        self.requests.lock().unwrap().push(url.to_string());
        let filename = url.rsplit('/').next().unwrap_or_default();
        if let Some(remaining) = self.failures.lock().unwrap().get_mut(filename) {
            if *remaining > 0 {
                if *remaining != u32::MAX {
                    *remaining -= 1;
                }
                return Err(BulkError::HttpStatus {
                    status: 503,
                    url: url.to_string(),
                });
            }
        }
        fs::write(destination, &self.body).map_err(|err| BulkError::Filesystem(err.to_string()))?;
        Ok(self.body.len() as u64)
    }
}

#[derive(Default)]
pub struct RecordingSink {
    messages: Mutex<Vec<String>>,
}

impl RecordingSink {
    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().unwrap().clone()
    }

    pub fn count_prefix(&self, prefix: &str) -> usize {
        self.messages()
            .iter()
            .filter(|message| message.starts_with(prefix))
            .count()
    }
}

impl ProgressSink for RecordingSink {
    fn event(&self, event: ProgressEvent) {
        self.messages.lock().unwrap().push(event.message);
    }
}

/// One-route HTTP/1.1 server answering every GET with `status` and `body`.
/// Returns the base URL; the server lives until the process exits.
pub fn serve(status: &'static str, body: Vec<u8>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().unwrap().port();
    thread::spawn(move || {
        for mut stream in listener.incoming().flatten() {
            let _ = stream.set_read_timeout(Some(Duration::from_secs(2)));
            let mut buf = [0u8; 8192];
            if stream.read(&mut buf).is_err() {
                continue;
            }
            let header = format!(
                "HTTP/1.1 {status}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                body.len()
            );
            let _ = stream.write_all(header.as_bytes());
            let _ = stream.write_all(&body);
        }
    });
    format!("http://127.0.0.1:{port}")
}

/// Like [`serve`], but answers the n-th request with the n-th raw response,
/// repeating the last one. Each response is written verbatim and the
/// connection closed, so a short body can be sent under a longer
/// `Content-Length`.
pub fn serve_script(responses: Vec<Vec<u8>>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().unwrap().port();
    thread::spawn(move || {
        for (served, mut stream) in listener.incoming().flatten().enumerate() {
            let _ = stream.set_read_timeout(Some(Duration::from_secs(2)));
            let mut buf = [0u8; 8192];
            if stream.read(&mut buf).is_err() {
                continue;
            }
            let response = &responses[served.min(responses.len() - 1)];
            let _ = stream.write_all(response);
        }
    });
    format!("http://127.0.0.1:{port}")
}
