//! Concurrent download of the numbered archive sequence

pub mod transport;

pub use transport::FetchError;

use crate::{
    archive::{self, ArchiveFile, ArchiveIndex, ArchiveState, CompletionMarker},
    config::Config,
    progress::{ProgressReport, ProgressTracker, Work},
    Result,
};
use anyhow::Context;
use futures::StreamExt;
use std::{
    collections::{BTreeSet, VecDeque},
    io,
    path::Path,
    sync::Arc,
};
use tokio::{
    fs::File,
    io::{AsyncWriteExt, BufWriter},
    task::JoinSet,
};
use tokio_util::sync::CancellationToken;
use transport::Transport;

/// Download a set of archives, at most `config.fetch.concurrency` at a time
///
/// A failed download does not affect the other ones: every requested index
/// gets an [`ArchiveFile`] in the output, sorted by index, which tells how
/// far its download went.
pub async fn fetch_all(
    config: Arc<Config>,
    transport: Arc<dyn Transport>,
    indices: impl IntoIterator<Item = ArchiveIndex>,
    report: &ProgressReport,
    cancel: CancellationToken,
) -> Result<Vec<ArchiveFile>> {
    let raw_dir = &config.layout.raw_dir;
    tokio::fs::create_dir_all(raw_dir)
        .await
        .with_context(|| format!("creating archive directory {}", raw_dir.display()))?;

    // Track file downloads
    let mut queue = indices.into_iter().collect::<BTreeSet<_>>().into_iter().collect::<VecDeque<_>>();
    let archives = report.add("Downloading archives", Work::Steps(queue.len()));
    let bytes = report.add("Downloaded data", Work::Bytes(0));

    // Keep the worker pool full until we run out of archives
    let concurrency = config.fetch.concurrency.get();
    let mut downloads = JoinSet::new();
    let mut outcomes = Vec::with_capacity(queue.len());
    loop {
        while downloads.len() < concurrency && !cancel.is_cancelled() {
            let Some(index) = queue.pop_front() else {
                break;
            };
            log::trace!("Archive {index} is now downloading");
            downloads.spawn(fetch_one(
                config.clone(),
                transport.clone(),
                index,
                bytes.clone(),
                cancel.clone(),
            ));
        }
        let Some(outcome) = downloads.join_next().await else {
            break;
        };
        outcomes.push(outcome.context("collecting the outcome of one download")?);
        archives.make_progress(1);
    }
    archives.finish();
    bytes.finish();

    // Archives that are still queued were never started
    outcomes.extend(queue.into_iter().map(|index| ArchiveFile {
        index,
        path: raw_dir.join(index.file_name(&config.source)),
        state: ArchiveState::Pending,
    }));
    outcomes.sort_unstable_by_key(|archive| archive.index);
    Ok(outcomes)
}

/// Download one archive, retrying transient failures
async fn fetch_one(
    config: Arc<Config>,
    transport: Arc<dyn Transport>,
    index: ArchiveIndex,
    bytes: ProgressTracker,
    cancel: CancellationToken,
) -> ArchiveFile {
    let url = index.url(&config.source);
    let path = config.layout.raw_dir.join(index.file_name(&config.source));
    let policy = config.fetch.retry;
    let mut retry = 0;
    let state = loop {
        log::debug!("Downloading archive {index} from {url}");
        match download(&config, &*transport, index, &url, &path, &bytes, &cancel).await {
            Ok(size) => {
                log::info!("Downloaded {} ({size} bytes)", path.display());
                break ArchiveState::Complete { bytes: size };
            }
            Err(FetchError::Cancelled) => {
                log::warn!("Download of archive {index} was interrupted");
                break ArchiveState::Downloading;
            }
            Err(e) if e.is_retryable() && retry < policy.max_retries => {
                retry += 1;
                let delay = policy.delay(retry);
                log::warn!(
                    "Download of archive {index} failed ({e}), retry {retry}/{} in {delay:?}",
                    policy.max_retries
                );
                tokio::select! {
                    () = cancel.cancelled() => break ArchiveState::Downloading,
                    () = tokio::time::sleep(delay) => {}
                }
            }
            Err(e) => {
                log::error!("Failed to download {url}: {e}");
                break ArchiveState::Failed(e);
            }
        }
    };
    ArchiveFile { index, path, state }
}

/// Make one attempt at downloading an archive to `path`
///
/// Data is streamed to a partial file next to `path`, which only replaces
/// `path` once the download is complete. A completion marker is then written.
async fn download(
    config: &Config,
    transport: &dyn Transport,
    index: ArchiveIndex,
    url: &str,
    path: &Path,
    bytes: &ProgressTracker,
    cancel: &CancellationToken,
) -> Result<u64, FetchError> {
    // Start the download
    let response = tokio::select! {
        biased;
        () = cancel.cancelled() => return Err(FetchError::Cancelled),
        response = transport.get(url) => response?,
    };
    if let Some(length) = response.content_length {
        bytes.add_work(length);
    }

    // Stream the body to the partial file
    let part = archive::partial_path(path);
    let io_error = |source: io::Error| FetchError::Io {
        path: part.clone(),
        source,
    };
    let mut file = BufWriter::new(File::create(&part).await.map_err(io_error)?);
    let mut body = response.body;
    let stall_timeout = config.fetch.stall_timeout;
    let mut received = 0u64;
    loop {
        let next = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(FetchError::Cancelled),
            next = tokio::time::timeout(stall_timeout, body.next()) => next,
        };
        let chunk = match next {
            Ok(Some(chunk)) => chunk?,
            Ok(None) => break,
            Err(_elapsed) => {
                return Err(FetchError::Stalled {
                    url: url.into(),
                    timeout: stall_timeout,
                })
            }
        };
        file.write_all(&chunk).await.map_err(io_error)?;
        received += chunk.len() as u64;
        bytes.make_progress(chunk.len() as u64);
    }
    if let Some(expected) = response.content_length {
        if received != expected {
            return Err(FetchError::Truncated {
                url: url.into(),
                expected,
                received,
            });
        }
    }
    file.flush().await.map_err(io_error)?;
    file.get_ref().sync_all().await.map_err(io_error)?;
    drop(file);

    // Move the archive into place, then record its completion
    let marker_error = |source: io::Error| FetchError::Io {
        path: CompletionMarker::path(path),
        source,
    };
    CompletionMarker::remove(path).await.map_err(marker_error)?;
    tokio::fs::rename(&part, path).await.map_err(io_error)?;
    CompletionMarker {
        index,
        url: url.into(),
        bytes: received,
    }
    .save(path)
    .await
    .map_err(marker_error)?;
    Ok(received)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::{
        collections::HashMap,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Mutex,
        },
        time::Duration,
    };
    use transport::{Download, HttpTransport};
    use wiremock::{
        matchers::{method, path},
        Mock, MockServer, ResponseTemplate,
    };

    /// In-memory transport that keeps track of concurrent downloads
    #[derive(Default)]
    struct FakeTransport {
        /// Time that each response body takes to be delivered
        delay: Duration,

        /// Abnormal replies to successive requests to an URL, before it
        /// starts answering normally
        replies: Mutex<HashMap<String, VecDeque<Reply>>>,

        /// Number of requests per URL
        requests: Mutex<HashMap<String, usize>>,

        /// Download concurrency accounting
        counters: Arc<InFlight>,
    }
    //
    impl FakeTransport {
        fn with_delay(delay: Duration) -> Self {
            Self {
                delay,
                ..Self::default()
            }
        }

        fn fail(self, url: &str, statuses: impl IntoIterator<Item = u16>) -> Self {
            self.reply(url, statuses.into_iter().map(Reply::Status))
        }

        fn reply(self, url: &str, replies: impl IntoIterator<Item = Reply>) -> Self {
            self.replies
                .lock()
                .unwrap()
                .insert(url.to_owned(), replies.into_iter().collect());
            self
        }

        fn requests(&self, url: &str) -> usize {
            self.requests.lock().unwrap().get(url).copied().unwrap_or(0)
        }

        fn max_in_flight(&self) -> usize {
            self.counters.max.load(Ordering::SeqCst)
        }
    }
    //
    #[async_trait]
    impl Transport for FakeTransport {
        async fn get(&self, url: &str) -> Result<Download, FetchError> {
            *self.requests.lock().unwrap().entry(url.to_owned()).or_default() += 1;
            let reply = self
                .replies
                .lock()
                .unwrap()
                .get_mut(url)
                .and_then(VecDeque::pop_front);
            let content = Bytes::from(content_of(url));
            let length = content.len() as u64;
            match reply {
                Some(Reply::Status(status)) => {
                    return Err(FetchError::Status {
                        url: url.into(),
                        status,
                    })
                }
                Some(Reply::Stall) => {
                    let start = content.slice(..4);
                    let body = futures::stream::once(async move { Ok::<_, FetchError>(start) })
                        .chain(futures::stream::pending());
                    return Ok(Download {
                        content_length: Some(length),
                        body: body.boxed(),
                    });
                }
                Some(Reply::Truncate) => {
                    let body = futures::stream::once(async move { Ok::<_, FetchError>(content) });
                    return Ok(Download {
                        content_length: Some(length + 5),
                        body: body.boxed(),
                    });
                }
                Some(Reply::Trickle) => {
                    let body = futures::stream::iter(0..10_000).then(|_| async {
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        Ok::<_, FetchError>(Bytes::from_static(&[0; 10]))
                    });
                    return Ok(Download {
                        content_length: None,
                        body: body.boxed(),
                    });
                }
                None => {}
            }

            let guard = InFlightGuard::enter(self.counters.clone());
            let delay = self.delay;
            let body = futures::stream::once(async move {
                tokio::time::sleep(delay).await;
                drop(guard);
                Ok::<_, FetchError>(content)
            });
            Ok(Download {
                content_length: None,
                body: body.boxed(),
            })
        }
    }

    /// Abnormal ways of answering a request
    #[derive(Clone, Copy, Debug)]
    enum Reply {
        /// HTTP error status
        Status(u16),

        /// The body stops flowing after its first few bytes
        Stall,

        /// The body is shorter than announced
        Truncate,

        /// The body trickles in slowly, and would take nearly a minute
        Trickle,
    }

    #[derive(Debug, Default)]
    struct InFlight {
        current: AtomicUsize,
        max: AtomicUsize,
    }

    struct InFlightGuard(Arc<InFlight>);
    //
    impl InFlightGuard {
        fn enter(counters: Arc<InFlight>) -> Self {
            let current = counters.current.fetch_add(1, Ordering::SeqCst) + 1;
            counters.max.fetch_max(current, Ordering::SeqCst);
            Self(counters)
        }
    }
    //
    impl Drop for InFlightGuard {
        fn drop(&mut self) {
            self.0.current.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn content_of(url: &str) -> String {
        format!("contents of {url}")
    }

    fn url_of(index: u32) -> String {
        format!("mem://archives/Estabelecimentos{index}.zip")
    }

    fn indices(max_idx: u32) -> impl Iterator<Item = ArchiveIndex> {
        (0..max_idx).map(ArchiveIndex)
    }

    fn config(root: &Path, concurrency: usize, max_retries: u32) -> Arc<Config> {
        let mut config = Config::for_tests(root);
        config.fetch.concurrency = concurrency.try_into().unwrap();
        config.fetch.retry.max_retries = max_retries;
        Arc::new(config)
    }

    #[tokio::test]
    async fn concurrency_is_bounded() -> Result<()> {
        let root = tempfile::tempdir()?;
        let transport = Arc::new(FakeTransport::with_delay(Duration::from_millis(50)));
        let outcomes = fetch_all(
            config(root.path(), 3, 0),
            transport.clone(),
            indices(8),
            &ProgressReport::new(),
            CancellationToken::new(),
        )
        .await?;

        assert_eq!(transport.max_in_flight(), 3);
        assert_eq!(outcomes.len(), 8);
        for (idx, archive) in outcomes.iter().enumerate() {
            assert_eq!(archive.index, ArchiveIndex(idx as u32));
            assert!(archive.is_complete(), "{archive:?}");
            assert_eq!(
                std::fs::read_to_string(&archive.path)?,
                content_of(&url_of(idx as u32))
            );
        }
        Ok(())
    }

    #[tokio::test]
    async fn failures_are_isolated() -> Result<()> {
        let root = tempfile::tempdir()?;
        let transport = Arc::new(FakeTransport::default().fail(&url_of(3), [404]));
        let outcomes = fetch_all(
            config(root.path(), 2, 3),
            transport.clone(),
            indices(5),
            &ProgressReport::new(),
            CancellationToken::new(),
        )
        .await?;

        for archive in &outcomes {
            if archive.index == ArchiveIndex(3) {
                assert!(matches!(
                    archive.state,
                    ArchiveState::Failed(FetchError::Status { status: 404, .. })
                ));
                assert!(!archive.path.exists());
                assert!(!CompletionMarker::path(&archive.path).exists());
            } else {
                assert!(archive.is_complete(), "{archive:?}");
                let marker = CompletionMarker::load(&archive.path)?.expect("marker should exist");
                assert_eq!(marker.index, archive.index);
                assert_eq!(marker.bytes, std::fs::metadata(&archive.path)?.len());
            }
        }
        assert_eq!(transport.requests(&url_of(3)), 1, "404 should not be retried");
        Ok(())
    }

    #[tokio::test]
    async fn transient_failures_are_retried() -> Result<()> {
        let root = tempfile::tempdir()?;
        let transport = Arc::new(FakeTransport::default().fail(&url_of(0), [503, 502]));
        let outcomes = fetch_all(
            config(root.path(), 1, 3),
            transport.clone(),
            indices(1),
            &ProgressReport::new(),
            CancellationToken::new(),
        )
        .await?;
        assert!(outcomes[0].is_complete());
        assert_eq!(transport.requests(&url_of(0)), 3);
        Ok(())
    }

    #[tokio::test]
    async fn retries_are_bounded() -> Result<()> {
        let root = tempfile::tempdir()?;
        let transport = Arc::new(FakeTransport::default().fail(&url_of(0), [503; 10]));
        let outcomes = fetch_all(
            config(root.path(), 1, 2),
            transport.clone(),
            indices(1),
            &ProgressReport::new(),
            CancellationToken::new(),
        )
        .await?;
        assert!(matches!(
            outcomes[0].state,
            ArchiveState::Failed(FetchError::Status { status: 503, .. })
        ));
        assert_eq!(transport.requests(&url_of(0)), 3);
        Ok(())
    }

    #[tokio::test]
    async fn refetch_overwrites_existing_archives() -> Result<()> {
        let root = tempfile::tempdir()?;
        let config = config(root.path(), 1, 0);
        let existing = config.layout.raw_dir.join("Estabelecimentos0.zip");
        std::fs::create_dir_all(&config.layout.raw_dir)?;
        std::fs::write(&existing, "stale")?;
        std::fs::write(CompletionMarker::path(&existing), "not even json")?;

        let outcomes = fetch_all(
            config,
            Arc::new(FakeTransport::default()),
            indices(1),
            &ProgressReport::new(),
            CancellationToken::new(),
        )
        .await?;
        assert!(outcomes[0].is_complete());
        assert_eq!(std::fs::read_to_string(&existing)?, content_of(&url_of(0)));
        assert!(CompletionMarker::load(&existing)?.is_some());
        assert!(!archive::partial_path(&existing).exists());
        Ok(())
    }

    #[tokio::test]
    async fn cancelled_runs_start_nothing() -> Result<()> {
        let root = tempfile::tempdir()?;
        let cancel = CancellationToken::new();
        cancel.cancel();
        let transport = Arc::new(FakeTransport::default());
        let outcomes = fetch_all(
            config(root.path(), 2, 0),
            transport.clone(),
            indices(4),
            &ProgressReport::new(),
            cancel,
        )
        .await?;
        assert_eq!(outcomes.len(), 4);
        for archive in &outcomes {
            assert!(matches!(archive.state, ArchiveState::Pending));
            assert!(!archive.path.exists());
        }
        assert_eq!(transport.requests(&url_of(0)), 0);
        Ok(())
    }

    #[tokio::test]
    async fn stalled_downloads_time_out_and_are_retried() -> Result<()> {
        let root = tempfile::tempdir()?;
        let transport = Arc::new(
            FakeTransport::default()
                .reply(&url_of(0), [Reply::Stall])
                .reply(&url_of(1), [Reply::Stall, Reply::Stall]),
        );
        let mut config = Config::for_tests(root.path());
        config.fetch.stall_timeout = Duration::from_millis(50);
        config.fetch.retry.max_retries = 1;
        let outcomes = fetch_all(
            Arc::new(config),
            transport.clone(),
            indices(2),
            &ProgressReport::new(),
            CancellationToken::new(),
        )
        .await?;

        assert!(outcomes[0].is_complete(), "{:?}", outcomes[0]);
        assert_eq!(
            std::fs::read_to_string(&outcomes[0].path)?,
            content_of(&url_of(0))
        );
        assert!(matches!(
            outcomes[1].state,
            ArchiveState::Failed(FetchError::Stalled { .. })
        ));
        assert!(!outcomes[1].path.exists());
        assert_eq!(transport.requests(&url_of(0)), 2);
        assert_eq!(transport.requests(&url_of(1)), 2);
        Ok(())
    }

    #[tokio::test]
    async fn truncated_downloads_are_retried() -> Result<()> {
        let root = tempfile::tempdir()?;
        let transport = Arc::new(
            FakeTransport::default()
                .reply(&url_of(0), [Reply::Truncate])
                .reply(&url_of(1), [Reply::Truncate, Reply::Truncate]),
        );
        let outcomes = fetch_all(
            config(root.path(), 2, 1),
            transport.clone(),
            indices(2),
            &ProgressReport::new(),
            CancellationToken::new(),
        )
        .await?;

        assert!(outcomes[0].is_complete(), "{:?}", outcomes[0]);
        let ArchiveState::Failed(FetchError::Truncated {
            expected, received, ..
        }) = outcomes[1].state
        else {
            panic!("expected a truncated download, got {:?}", outcomes[1]);
        };
        assert_eq!(received, content_of(&url_of(1)).len() as u64);
        assert_eq!(expected, received + 5);
        assert!(!outcomes[1].path.exists());
        assert!(!CompletionMarker::path(&outcomes[1].path).exists());
        assert_eq!(transport.requests(&url_of(0)), 2);
        assert_eq!(transport.requests(&url_of(1)), 2);
        Ok(())
    }

    #[tokio::test]
    async fn interrupted_downloads_stay_partial() -> Result<()> {
        let root = tempfile::tempdir()?;
        let config = config(root.path(), 1, 0);
        let transport = Arc::new(FakeTransport::default().reply(&url_of(0), [Reply::Trickle]));
        let cancel = CancellationToken::new();
        tokio::spawn({
            let cancel = cancel.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                cancel.cancel();
            }
        });
        let outcomes = fetch_all(
            config.clone(),
            transport,
            indices(1),
            &ProgressReport::new(),
            cancel,
        )
        .await?;

        let archive = &outcomes[0];
        assert!(matches!(archive.state, ArchiveState::Downloading), "{archive:?}");
        assert!(!archive.path.exists());
        assert!(!CompletionMarker::path(&archive.path).exists());
        assert!(archive::partial_path(&archive.path).exists());
        assert!(archive::discover(&config.source, &config.layout.raw_dir)?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn http_transport_downloads_archives() -> Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/Estabelecimentos0.zip"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"PK fake zip".to_vec()))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/Estabelecimentos1.zip"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let root = tempfile::tempdir()?;
        let mut config = Config::for_tests(root.path());
        config.source.url_template = format!("{}/Estabelecimentos{{idx}}.zip", server.uri()).into();
        config.fetch.retry.max_retries = 0;
        let transport = Arc::new(HttpTransport::new(&config.fetch)?);
        let outcomes = fetch_all(
            Arc::new(config),
            transport,
            indices(2),
            &ProgressReport::new(),
            CancellationToken::new(),
        )
        .await?;

        assert!(matches!(
            outcomes[0].state,
            ArchiveState::Complete { bytes: 11 }
        ));
        assert_eq!(std::fs::read(&outcomes[0].path)?, b"PK fake zip");
        assert!(matches!(
            outcomes[1].state,
            ArchiveState::Failed(FetchError::Status { status: 404, .. })
        ));
        Ok(())
    }
}
