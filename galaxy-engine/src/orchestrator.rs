//! Orchestrator
//!
//! Owns the ordered task stream, the unordered download queue feeding N
//! workers, the ordered writer queue feeding the single writer, and the
//! free-segment pool. One event loop plays the three collector roles
//! (download scheduler, download-result handler, writer-result handler)
//! over channels; completed chunks park in a ready map until the head of
//! the task stream can consume them, which preserves in-file ordering
//! even though downloads finish out of order.

use crate::arena::SharedArena;
use crate::downloader::{
    DownloadJob, DownloadMessage, DownloadResult, FailReason, LinkTable, run_worker,
};
use crate::journal::ResumeJournal;
use crate::paths::TargetPaths;
use crate::plan::Plan;
use crate::progress::ProgressTracker;
use crate::task::{ChunkSource, Task};
use crate::writer::{WriterMessage, WriterOp, WriterResult, run_writer};
use crate::{Error, Result};
use galaxy_cdn::secure_link::{
    fetch_dependency_link, fetch_secure_link, fetch_secure_link_at,
};
use galaxy_cdn::{CdnClient, SecureLink};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A chunk may fail verification once; the second failure is fatal
const MAX_INTEGRITY_FAILURES: u32 = 2;

/// Minimum spacing between secure-link refreshes per product
const REFRESH_WINDOW: Duration = Duration::from_secs(10);

/// Re-acquires expired secure links, at most once per product per window
pub struct LinkRefresher {
    pub client: CdnClient,
    pub generation: u32,
    refreshed_at: HashMap<String, Instant>,
}

impl LinkRefresher {
    pub fn new(client: CdnClient, generation: u32) -> Self {
        Self {
            client,
            generation,
            refreshed_at: HashMap::new(),
        }
    }

    /// Refresh the link behind a table key. Within the rate window the task
    /// is simply resubmitted against the existing link.
    pub async fn refresh(&mut self, key: &str, links: &LinkTable) -> Result<()> {
        if let Some(last) = self.refreshed_at.get(key) {
            if last.elapsed() < REFRESH_WINDOW {
                return Ok(());
            }
        }
        // Installer URLs are plain downlinks; there is nothing to refresh.
        if key.starts_with("linux:") {
            return Ok(());
        }

        info!("refreshing secure link for {}", key);
        let link: SecureLink = if key == "redist" {
            fetch_dependency_link(&self.client).await?
        } else if let Some(product) = key.strip_suffix(":patch") {
            fetch_secure_link_at(&self.client, product, 2, "/patches/store").await?
        } else {
            fetch_secure_link(&self.client, key, self.generation).await?
        };
        links.insert(key, link);
        self.refreshed_at.insert(key.to_string(), Instant::now());
        Ok(())
    }
}

/// Everything `execute` needs besides the plan itself
pub struct Orchestrator {
    pub client: CdnClient,
    pub links: LinkTable,
    pub refresher: LinkRefresher,
    pub paths: TargetPaths,
    pub workers: usize,
    pub arena_size: u64,
    pub cancel: CancellationToken,
}

impl Orchestrator {
    /// Run a plan to completion.
    ///
    /// On success the journal has a record for every produced file; the
    /// caller persists the manifest and removes journal and cache.
    pub async fn execute(
        mut self,
        plan: Plan,
        progress: Arc<ProgressTracker>,
    ) -> Result<()> {
        if plan.tasks.is_empty() {
            debug!("nothing to do");
            return Ok(());
        }

        let journal = ResumeJournal::new(&self.paths.install_root);
        std::fs::create_dir_all(&self.paths.install_root)?;

        let mut arena = SharedArena::new(self.arena_size, plan.segment_size.max(1));
        let releaser = arena.releaser();
        let workers = self.workers.max(1);
        let max_inflight = workers * 2;
        debug!(
            "executing plan with {} workers, {} segments of {} bytes",
            workers,
            arena.segment_count(),
            arena.segment_size()
        );

        // Download side
        let (download_tx, download_rx) = mpsc::channel::<DownloadMessage>(workers * 4);
        let download_rx = Arc::new(tokio::sync::Mutex::new(download_rx));
        let (dl_result_tx, mut dl_result_rx) = mpsc::unbounded_channel::<DownloadResult>();
        let mut worker_handles = Vec::with_capacity(workers);
        for worker_id in 0..workers {
            worker_handles.push(tokio::spawn(run_worker(
                worker_id,
                self.client.clone(),
                self.links.clone(),
                Arc::clone(&download_rx),
                dl_result_tx.clone(),
            )));
        }
        drop(dl_result_tx);

        // Writer side
        let (writer_tx, writer_rx) = std::sync::mpsc::channel::<WriterMessage>();
        let (wr_result_tx, mut wr_result_rx) = mpsc::unbounded_channel::<WriterResult>();
        let writer_paths = self.paths.clone();
        let writer_handle =
            std::thread::spawn(move || run_writer(writer_paths, writer_rx, wr_result_tx));

        // Stream state
        let cancel = self.cancel.clone();
        let mut stream = plan.tasks;
        let mut pending_downloads: VecDeque<Task> =
            stream.iter().filter(|t| t.needs_download()).cloned().collect();
        let mut ready: HashMap<String, crate::arena::Segment> = HashMap::new();
        let mut inflight = 0usize;
        let mut writer_outstanding = 0usize;
        let mut integrity_failures: HashMap<String, u32> = HashMap::new();
        let mut run_error: Option<Error> = None;

        'run: loop {
            // Download scheduler: bind free segments to pending fetches.
            while run_error.is_none()
                && inflight < max_inflight
                && !pending_downloads.is_empty()
            {
                let Some(segment) = arena.try_acquire() else {
                    break;
                };
                let Some(task) = pending_downloads.pop_front() else {
                    releaser.release(segment);
                    break;
                };
                if download_tx
                    .send(DownloadMessage::Job(DownloadJob { task, segment }))
                    .await
                    .is_err()
                {
                    run_error = Some(Error::structural("download workers gone"));
                    break;
                }
                inflight += 1;
            }

            // Release the head of the stream when it is executable: file
            // tasks and local-reuse chunks always are, download-backed tasks
            // only once their segment sits in the ready map. One op is in
            // flight at a time so a failed local reuse can be refetched
            // before the file's remaining tasks are committed.
            while run_error.is_none() && writer_outstanding == 0 {
                let ready_segment = match stream.front() {
                    None => break,
                    Some(head) if head.needs_download() => {
                        let key = head
                            .ready_key()
                            .unwrap_or_else(|| unreachable!("download tasks carry keys"));
                        match ready.remove(&key) {
                            Some(segment) => Some(segment),
                            None => break,
                        }
                    }
                    Some(_) => None,
                };

                let op = match stream.pop_front() {
                    Some(Task::File(task)) => WriterOp::File(task),
                    Some(Task::Chunk(chunk)) => match (&chunk.source, ready_segment) {
                        (ChunkSource::Download, Some(segment)) => {
                            WriterOp::Segment { chunk, segment }
                        }
                        (ChunkSource::OldFile { .. }, _) => WriterOp::OldRange { chunk },
                        (ChunkSource::Cache, _) => WriterOp::CacheRead { chunk },
                        (ChunkSource::Download, None) => unreachable!("checked ready above"),
                    },
                    Some(Task::V1(task)) => {
                        let Some(segment) = ready_segment else {
                            unreachable!("checked ready above")
                        };
                        WriterOp::V1Segment { task, segment }
                    }
                    None => break,
                };
                if writer_tx.send(WriterMessage::Op(op)).is_err() {
                    run_error = Some(Error::WriterGone);
                    break;
                }
                writer_outstanding += 1;
            }

            // Termination: everything drained and acknowledged.
            if stream.is_empty()
                && pending_downloads.is_empty()
                && inflight == 0
                && writer_outstanding == 0
            {
                break 'run;
            }
            if run_error.is_some() && inflight == 0 && writer_outstanding == 0 {
                break 'run;
            }

            tokio::select! {
                () = cancel.cancelled(), if run_error.is_none() => {
                    warn!("cancellation requested, shutting down");
                    // Outstanding work is drained below; cache and journal
                    // stay on disk for the next run.
                    run_error = Some(Error::Cancelled);
                }
                result = dl_result_rx.recv() => {
                    let Some(result) = result else {
                        run_error = Some(Error::structural("download workers gone"));
                        continue;
                    };
                    inflight -= 1;
                    self.handle_download_result(
                        result,
                        &mut ready,
                        &mut pending_downloads,
                        &mut integrity_failures,
                        &releaser,
                        progress.as_ref(),
                        &mut run_error,
                    ).await;
                }
                result = wr_result_rx.recv() => {
                    let Some(result) = result else {
                        run_error = Some(Error::WriterGone);
                        continue;
                    };
                    writer_outstanding -= 1;
                    handle_writer_result(
                        result,
                        &journal,
                        &mut stream,
                        &mut pending_downloads,
                        &releaser,
                        progress.as_ref(),
                        &mut run_error,
                    );
                }
            }
        }

        // Orderly shutdown: terminate sentinels, then join.
        for _ in 0..workers {
            let _ = download_tx.try_send(DownloadMessage::Exit);
        }
        drop(download_tx);
        let _ = writer_tx.send(WriterMessage::Exit);
        drop(writer_tx);
        for handle in worker_handles {
            let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
        }
        let _ = writer_handle.join();

        match run_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_download_result(
        &mut self,
        result: DownloadResult,
        ready: &mut HashMap<String, crate::arena::Segment>,
        pending_downloads: &mut VecDeque<Task>,
        integrity_failures: &mut HashMap<String, u32>,
        releaser: &crate::arena::SegmentReleaser,
        progress: &ProgressTracker,
        run_error: &mut Option<Error>,
    ) {
        let DownloadResult {
            task,
            segment,
            outcome,
            downloaded,
        } = result;

        match outcome {
            Ok(_written) => {
                progress.add_downloaded(downloaded);
                if let Some(key) = task.ready_key() {
                    ready.insert(key, segment);
                } else {
                    releaser.release(segment);
                }
            }
            Err(reason) => {
                releaser.release(segment);
                if run_error.is_some() {
                    return;
                }
                let key = task.ready_key().unwrap_or_default();
                match reason {
                    FailReason::Unauthorized => {
                        let link_key = match &task {
                            Task::Chunk(c) => c.link_key.clone(),
                            Task::V1(v) => v.link_key.clone(),
                            Task::File(_) => String::new(),
                        };
                        if let Err(e) = self.refresher.refresh(&link_key, &self.links).await {
                            *run_error = Some(e);
                            return;
                        }
                        pending_downloads.push_front(task);
                    }
                    FailReason::Checksum => {
                        let failures = integrity_failures.entry(key.clone()).or_insert(0);
                        *failures += 1;
                        if *failures >= MAX_INTEGRITY_FAILURES {
                            *run_error = Some(Error::Integrity {
                                chunk: key,
                                path: match &task {
                                    Task::Chunk(c) => c.path.clone(),
                                    Task::V1(v) => v.path.clone(),
                                    Task::File(f) => f.path.clone(),
                                },
                            });
                            return;
                        }
                        warn!("integrity retry for {}", key);
                        pending_downloads.push_front(task);
                    }
                    FailReason::Connection | FailReason::Unknown => {
                        debug!("requeueing {} after {:?}", key, reason);
                        pending_downloads.push_front(task);
                    }
                }
            }
        }
    }
}

fn handle_writer_result(
    result: WriterResult,
    journal: &ResumeJournal,
    stream: &mut VecDeque<Task>,
    pending_downloads: &mut VecDeque<Task>,
    releaser: &crate::arena::SegmentReleaser,
    progress: &ProgressTracker,
    run_error: &mut Option<Error>,
) {
    if let Some(segment) = result.segment {
        releaser.release(segment);
    }
    if let Some(error) = result.error {
        if run_error.is_none() {
            *run_error = Some(error);
        }
        return;
    }
    if result.written > 0 {
        progress.add_written(result.written);
    }
    if let Some(entry) = result.journal {
        if let Err(e) = journal.record(&entry) {
            if run_error.is_none() {
                *run_error = Some(e);
            }
            return;
        }
        progress.file_done();
    }
    if let Some(refetch) = result.redownload {
        // The reuse source went stale; put the chunk back at the head of the
        // stream and fetch it for real.
        stream.push_front(Task::Chunk(refetch.clone()));
        pending_downloads.push_front(Task::Chunk(refetch));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::Diff;
    use crate::plan::build_plan;
    use flate2::Compression;
    use flate2::write::ZlibEncoder;
    use galaxy_cdn::secure_link::Endpoint;
    use galaxy_manifest::FileEntry;
    use galaxy_manifest::v2::{Chunk, DepotFile};
    use std::collections::HashSet;
    use std::io::Write;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct TestChunk {
        payload: Vec<u8>,
        compressed: Vec<u8>,
        manifest: Chunk,
    }

    fn make_chunk(payload: &[u8]) -> TestChunk {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(payload).unwrap();
        let compressed = encoder.finish().unwrap();
        TestChunk {
            manifest: Chunk {
                compressed_md5: hex::encode(md5::compute(&compressed).0),
                md5: hex::encode(md5::compute(payload).0),
                size: payload.len() as u64,
                compressed_size: compressed.len() as u64,
            },
            payload: payload.to_vec(),
            compressed,
        }
    }

    async fn mount_chunk(server: &MockServer, chunk: &TestChunk) {
        let cdn_path = format!(
            "/{}/{}/{}",
            &chunk.manifest.compressed_md5[0..2],
            &chunk.manifest.compressed_md5[2..4],
            chunk.manifest.compressed_md5
        );
        Mock::given(method("GET"))
            .and(path(cdn_path))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(chunk.compressed.clone()))
            .mount(server)
            .await;
    }

    fn depot_file(path: &str, chunks: &[&TestChunk], executable: bool) -> DepotFile {
        let mut file_md5 = md5::Context::new();
        for chunk in chunks {
            file_md5.consume(&chunk.payload);
        }
        DepotFile {
            path: path.to_string(),
            chunks: chunks.iter().map(|c| c.manifest.clone()).collect(),
            flags: if executable {
                vec!["executable".to_string()]
            } else {
                Vec::new()
            },
            md5: Some(format!("{:x}", file_md5.finalize())),
            sha256: None,
            product_id: "1000".to_string(),
        }
    }

    fn orchestrator_for(server_uri: &str, paths: &TargetPaths) -> Orchestrator {
        let links = LinkTable::new();
        links.insert(
            "1000",
            galaxy_cdn::SecureLink::new(
                "1000",
                Endpoint {
                    endpoint_name: "test".into(),
                    url_format: String::new(),
                    url: server_uri.to_string(),
                    parameters: HashMap::new(),
                    supports_generation: vec![2],
                    priority: 0,
                },
            ),
        );
        let client = CdnClient::builder()
            .max_retries(1)
            .initial_backoff_ms(1)
            .build()
            .unwrap();
        Orchestrator {
            refresher: LinkRefresher::new(client.clone(), 2),
            client,
            links,
            paths: paths.clone(),
            workers: 2,
            arena_size: 1024 * 1024,
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn test_fresh_install_single_chunk_executable() {
        let server = MockServer::start().await;
        let chunk = make_chunk(b"the game binary");
        mount_chunk(&server, &chunk).await;

        let dir = tempfile::tempdir().unwrap();
        let paths = TargetPaths::new(dir.path().join("game"), dir.path().join("support"));

        let file = depot_file("bin/game.exe", &[&chunk], true);
        let expected_md5 = file.md5.clone().unwrap();
        let diff = Diff {
            new: vec![FileEntry::V2(file)],
            ..Diff::default()
        };
        let plan = build_plan(&diff, &[], &HashSet::new(), &paths);
        let (progress, _rx) = ProgressTracker::new(plan.download_size, plan.disk_size, 1);

        orchestrator_for(&server.uri(), &paths)
            .execute(plan, progress.clone())
            .await
            .unwrap();

        let written = std::fs::read(dir.path().join("game/bin/game.exe")).unwrap();
        assert_eq!(written, b"the game binary");
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(dir.path().join("game/bin/game.exe"))
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(mode & 0o111, 0o111);
        }

        // Journal records the file with its composite checksum
        let journal = ResumeJournal::new(dir.path().join("game"));
        let entries = journal.load().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].path, "bin/game.exe");
        assert_eq!(entries[0].checksum, expected_md5);
        assert_eq!(progress.snapshot().files_done, 1);
    }

    #[tokio::test]
    async fn test_shared_chunk_single_fetch() {
        let server = MockServer::start().await;
        let a = make_chunk(b"chunk-a-payload");
        let b = make_chunk(b"chunk-b-payload");
        let c = make_chunk(b"chunk-c-payload");
        for chunk in [&a, &b, &c] {
            mount_chunk(&server, chunk).await;
        }

        let dir = tempfile::tempdir().unwrap();
        let paths = TargetPaths::new(dir.path().join("game"), dir.path().join("support"));

        let diff = Diff {
            new: vec![
                FileEntry::V2(depot_file("x.bin", &[&a, &b], false)),
                FileEntry::V2(depot_file("y.bin", &[&b, &c], false)),
            ],
            ..Diff::default()
        };
        let plan = build_plan(&diff, &[], &HashSet::new(), &paths);
        assert_eq!(plan.download_tasks().len(), 3);
        let (progress, _rx) = ProgressTracker::new(plan.download_size, plan.disk_size, 2);

        orchestrator_for(&server.uri(), &paths)
            .execute(plan, progress)
            .await
            .unwrap();

        let x = std::fs::read(dir.path().join("game/x.bin")).unwrap();
        let y = std::fs::read(dir.path().join("game/y.bin")).unwrap();
        assert_eq!(x, b"chunk-a-payloadchunk-b-payload".to_vec());
        assert_eq!(y, b"chunk-b-payloadchunk-c-payload".to_vec());

        // The shared chunk's cache entry was deleted after its last consumer
        let cache = crate::cache::ChunkCache::new(dir.path().join("game"));
        assert!(cache.existing_entries().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_update_reuses_old_bytes() {
        // Old file [A,B,C]; new file [A,C,D]: exactly one fetch (D)
        let server = MockServer::start().await;
        let a = make_chunk(b"AAAAAAAA");
        let b = make_chunk(b"BBBBBBBB");
        let c = make_chunk(b"CCCCCCCC");
        let d = make_chunk(b"DDDDDDDD");
        mount_chunk(&server, &d).await;

        let dir = tempfile::tempdir().unwrap();
        let paths = TargetPaths::new(dir.path().join("game"), dir.path().join("support"));
        std::fs::create_dir_all(dir.path().join("game/bin")).unwrap();
        std::fs::write(
            dir.path().join("game/bin/foo.dat"),
            b"AAAAAAAABBBBBBBBCCCCCCCC",
        )
        .unwrap();

        let old = depot_file("bin/foo.dat", &[&a, &b, &c], false);
        let new = depot_file("bin/foo.dat", &[&a, &c, &d], false);
        let file_diff = crate::diff::FileDiff::compare(&new, &old);
        let diff = Diff {
            changed: vec![crate::diff::ChangedFile::Partial(file_diff)],
            ..Diff::default()
        };
        let plan = build_plan(&diff, &[], &HashSet::new(), &paths);
        assert_eq!(plan.download_tasks().len(), 1);
        let (progress, _rx) = ProgressTracker::new(plan.download_size, plan.disk_size, 1);

        orchestrator_for(&server.uri(), &paths)
            .execute(plan, progress)
            .await
            .unwrap();

        let written = std::fs::read(dir.path().join("game/bin/foo.dat")).unwrap();
        assert_eq!(written, b"AAAAAAAACCCCCCCCDDDDDDDD".to_vec());
        assert!(!dir.path().join("game/bin/foo.dat.tmp").exists());
    }

    #[tokio::test]
    async fn test_persistent_checksum_failure_is_fatal() {
        let server = MockServer::start().await;
        let chunk = make_chunk(b"payload");
        // Serve corrupted bytes for this chunk's address
        let cdn_path = format!(
            "/{}/{}/{}",
            &chunk.manifest.compressed_md5[0..2],
            &chunk.manifest.compressed_md5[2..4],
            chunk.manifest.compressed_md5
        );
        Mock::given(method("GET"))
            .and(path(cdn_path))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"garbage".to_vec()))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let paths = TargetPaths::new(dir.path().join("game"), dir.path().join("support"));
        let diff = Diff {
            new: vec![FileEntry::V2(depot_file("f.bin", &[&chunk], false))],
            ..Diff::default()
        };
        let plan = build_plan(&diff, &[], &HashSet::new(), &paths);
        let (progress, _rx) = ProgressTracker::new(plan.download_size, plan.disk_size, 1);

        let err = orchestrator_for(&server.uri(), &paths)
            .execute(plan, progress)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Integrity { .. }));
    }

    #[tokio::test]
    async fn test_empty_plan_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let paths = TargetPaths::new(dir.path().join("game"), dir.path().join("support"));
        let plan = Plan::default();
        let (progress, _rx) = ProgressTracker::new(0, 0, 0);
        orchestrator_for("http://unused.invalid", &paths)
            .execute(plan, progress)
            .await
            .unwrap();
        assert!(!dir.path().join("game").exists());
    }
}
