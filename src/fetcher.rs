use std::fs;
use std::io::{self, Read, Write};
use std::path::Path;
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{ACCEPT, HeaderMap, HeaderValue, USER_AGENT};
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::domain::{AttemptResult, FileDescriptor};
use crate::error::BulkError;
use crate::store::PARTIAL_SUFFIX;

const COPY_BUFFER: usize = 64 * 1024;

/// Transport for a single GET of one remote file into one local path.
///
/// `destination` must hold either nothing or a complete body once the call
/// returns. [`Fetcher`] also removes it after any failed attempt.
pub trait RemoteClient: Send + Sync {
    fn download(&self, url: &str, destination: &Path) -> Result<u64, BulkError>;
}

impl<C: RemoteClient + ?Sized> RemoteClient for &C {
    fn download(&self, url: &str, destination: &Path) -> Result<u64, BulkError> {
        (**self).download(url, destination)
    }
}

#[derive(Clone)]
pub struct FdaHttpClient {
    client: Client,
}

impl FdaHttpClient {
    pub fn new(timeout: Duration) -> Result<Self, BulkError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("openfda-bulk/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| BulkError::Transport(err.to_string()))?,
        );
        headers.insert(ACCEPT, HeaderValue::from_static("application/zip, */*"));
        let client = Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()
            .map_err(|err| BulkError::Transport(err.to_string()))?;
        Ok(Self { client })
    }
}

impl RemoteClient for FdaHttpClient {
    fn download(&self, url: &str, destination: &Path) -> Result<u64, BulkError> {
        let mut response = self
            .client
            .get(url)
            .send()
            .map_err(|err| BulkError::Transport(err.to_string()))?;
        if !response.status().is_success() {
            return Err(BulkError::HttpStatus {
                status: response.status().as_u16(),
                url: url.to_string(),
            });
        }

        let parent = destination.parent().unwrap_or_else(|| Path::new("."));
        let mut staged = tempfile::Builder::new()
            .prefix(".")
            .suffix(PARTIAL_SUFFIX)
            .tempfile_in(parent)
            .map_err(|err| BulkError::Filesystem(format!("stage in {}: {err}", parent.display())))?;
        let mut buffer = vec![0u8; COPY_BUFFER];
        let mut written = 0u64;
        loop {
            let read = response
                .read(&mut buffer)
                .map_err(|err| BulkError::Transport(format!("read body of {url}: {err}")))?;
            if read == 0 {
                break;
            }
            staged
                .write_all(&buffer[..read])
                .map_err(|err| BulkError::Filesystem(err.to_string()))?;
            written += read as u64;
        }
        staged
            .flush()
            .map_err(|err| BulkError::Filesystem(err.to_string()))?;
        // only a fully read body ever lands on the final path
        staged
            .persist(destination)
            .map_err(|err| BulkError::Filesystem(format!("persist {}: {err}", destination.display())))?;
        Ok(written)
    }
}

/// Per-file retry loop around a [`RemoteClient`]. Errors never escape: the
/// outcome is always an [`AttemptResult`].
pub struct Fetcher<C: RemoteClient, K: Clock> {
    client: C,
    clock: K,
    backoff: Duration,
}

impl<C: RemoteClient, K: Clock> Fetcher<C, K> {
    pub fn new(client: C, clock: K, backoff: Duration) -> Self {
        Self {
            client,
            clock,
            backoff,
        }
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    pub fn fetch(&self, descriptor: &FileDescriptor, max_attempts: u32) -> AttemptResult {
        let mut last_error = None;
        for attempt in 1..=max_attempts {
            match self.attempt(descriptor) {
                Ok(bytes) => {
                    debug!(file = %descriptor.filename, attempt, bytes, "download finished");
                    return AttemptResult {
                        descriptor: descriptor.clone(),
                        succeeded: true,
                        attempts_used: attempt,
                        last_error: None,
                    };
                }
                Err(err) => {
                    warn!(
                        file = %descriptor.filename,
                        attempt,
                        max_attempts,
                        transient = err.is_transient(),
                        "download attempt failed: {err}"
                    );
                    last_error = Some(err.to_string());
                    if attempt < max_attempts {
                        self.clock.sleep(self.backoff);
                    }
                }
            }
        }

        AttemptResult {
            descriptor: descriptor.clone(),
            succeeded: false,
            attempts_used: max_attempts,
            last_error: last_error.or_else(|| Some("no download attempts allowed".to_string())),
        }
    }

    fn attempt(&self, descriptor: &FileDescriptor) -> Result<u64, BulkError> {
        let outcome = self.transfer(descriptor);
        if outcome.is_err() {
            discard(descriptor.local_path.as_std_path());
        }
        outcome
    }

    fn transfer(&self, descriptor: &FileDescriptor) -> Result<u64, BulkError> {
        let destination = descriptor.local_path.as_std_path();
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent)
                .map_err(|err| BulkError::Filesystem(format!("create {}: {err}", parent.display())))?;
        }
        self.client.download(&descriptor.url, destination)?;
        let size = fs::metadata(destination)
            .map(|meta| meta.len())
            .map_err(|err| BulkError::Filesystem(err.to_string()))?;
        if size == 0 {
            return Err(BulkError::EmptyDownload(descriptor.filename.clone()));
        }
        Ok(size)
    }
}

fn discard(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "removed partial download"),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => warn!(path = %path.display(), "could not remove partial download: {err}"),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use camino::Utf8PathBuf;

    use super::*;
    use crate::catalog::Catalog;
    use crate::clock::ManualClock;
    use crate::store::Store;

    struct Scripted {
        responses: Mutex<Vec<Result<&'static [u8], u16>>>,
        calls: Mutex<u32>,
    }

    impl Scripted {
        fn new(mut responses: Vec<Result<&'static [u8], u16>>) -> Self {
            responses.reverse();
            Self {
                responses: Mutex::new(responses),
                calls: Mutex::new(0),
            }
        }
    }

    impl RemoteClient for Scripted {
        fn download(&self, url: &str, destination: &Path) -> Result<u64, BulkError> {
            *self.calls.lock().unwrap() += 1;
            let next = self.responses.lock().unwrap().pop().unwrap_or(Err(503));
            match next {
                Ok(body) => {
                    fs::write(destination, body).unwrap();
                    Ok(body.len() as u64)
                }
                Err(status) => Err(BulkError::HttpStatus {
                    status,
                    url: url.to_string(),
                }),
            }
        }
    }

    fn descriptor(root: &Path) -> FileDescriptor {
        let root = Utf8PathBuf::from_path_buf(root.to_path_buf()).unwrap();
        let catalog = Catalog::drug_event(Store::new_with_root(root));
        catalog.descriptor("2014q1".parse().unwrap(), 1).unwrap()
    }

    #[test]
    fn succeeds_after_transient_failure() {
        let temp = tempfile::tempdir().unwrap();
        let descriptor = descriptor(temp.path());
        let clock = ManualClock::new();
        let fetcher = Fetcher::new(
            Scripted::new(vec![Err(502), Ok(b"PK")]),
            &clock,
            Duration::from_secs(30),
        );

        let result = fetcher.fetch(&descriptor, 3);
        assert!(result.succeeded);
        assert_eq!(result.attempts_used, 2);
        assert_eq!(clock.sleeps(), vec![Duration::from_secs(30)]);
        assert!(descriptor.local_path.as_std_path().is_file());
    }

    #[test]
    fn empty_body_counts_as_failure() {
        let temp = tempfile::tempdir().unwrap();
        let descriptor = descriptor(temp.path());
        let fetcher = Fetcher::new(
            Scripted::new(vec![Ok(b""), Ok(b"")]),
            ManualClock::new(),
            Duration::ZERO,
        );

        let result = fetcher.fetch(&descriptor, 2);
        assert!(!result.succeeded);
        assert_eq!(result.attempts_used, 2);
        assert!(result.last_error.unwrap().contains("empty"));
    }

    struct Interrupted;

    impl RemoteClient for Interrupted {
        fn download(&self, url: &str, destination: &Path) -> Result<u64, BulkError> {
            fs::write(destination, b"PK\x03").unwrap();
            Err(BulkError::Transport(format!("read body of {url}: connection reset")))
        }
    }

    #[test]
    fn interrupted_attempt_leaves_nothing_behind() {
        let temp = tempfile::tempdir().unwrap();
        let descriptor = descriptor(temp.path());
        let fetcher = Fetcher::new(Interrupted, ManualClock::new(), Duration::ZERO);

        let result = fetcher.fetch(&descriptor, 2);
        assert!(!result.succeeded);
        assert!(!descriptor.local_path.exists());
    }

    #[test]
    fn zero_attempts_makes_no_request() {
        let temp = tempfile::tempdir().unwrap();
        let descriptor = descriptor(temp.path());
        let fetcher = Fetcher::new(Scripted::new(vec![]), ManualClock::new(), Duration::ZERO);

        let result = fetcher.fetch(&descriptor, 0);
        assert!(!result.succeeded);
        assert_eq!(result.attempts_used, 0);
        assert_eq!(*fetcher.client().calls.lock().unwrap(), 0);
    }
}
