//! Downloader pool
//!
//! N workers pull chunk jobs from a shared queue. A job arrives bound to an
//! arena segment; the worker fetches the bytes (whole Gen-2 chunk blob, or a
//! byte range of a Gen-1 / installer blob), verifies the compressed checksum
//! or byte count, decompresses Gen-2 chunks in place and posts the filled
//! segment to the result queue. Workers never touch the filesystem.

use crate::arena::Segment;
use crate::task::{Task, V1Task};
use crate::zip::local_header_size;
use galaxy_cdn::{CdnClient, SecureLink};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::io::Read;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Shared secure-link table; workers read, only the orchestrator writes
/// (on 401 refresh)
#[derive(Debug, Clone, Default)]
pub struct LinkTable {
    inner: Arc<RwLock<HashMap<String, SecureLink>>>,
}

impl LinkTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current link for a table key
    pub fn get(&self, key: &str) -> Option<SecureLink> {
        self.inner.read().get(key).cloned()
    }

    /// Install or replace a link
    pub fn insert(&self, key: impl Into<String>, link: SecureLink) {
        self.inner.write().insert(key.into(), link);
    }
}

/// Message consumed by a downloader worker
#[derive(Debug)]
pub enum DownloadMessage {
    Job(DownloadJob),
    /// Terminate sentinel
    Exit,
}

/// A download task bound to its arena segment
#[derive(Debug)]
pub struct DownloadJob {
    pub task: Task,
    pub segment: Segment,
}

/// Why a download failed (drives the orchestrator's retry policy)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailReason {
    /// Verification mismatch; resubmitted once, then fatal
    Checksum,
    /// Transient network failure after in-place retries
    Connection,
    /// Secure link expired; orchestrator refreshes and resubmits
    Unauthorized,
    Unknown,
}

/// Result posted by a worker
#[derive(Debug)]
pub struct DownloadResult {
    pub task: Task,
    pub segment: Segment,
    /// Bytes now held by the segment, or the failure class
    pub outcome: std::result::Result<u64, FailReason>,
    /// Compressed bytes fetched (progress accounting)
    pub downloaded: u64,
}

/// Worker loop. The queue receiver is shared: whichever worker grabs the
/// lock first takes the next job.
pub async fn run_worker(
    worker_id: usize,
    client: CdnClient,
    links: LinkTable,
    queue: Arc<tokio::sync::Mutex<mpsc::Receiver<DownloadMessage>>>,
    results: mpsc::UnboundedSender<DownloadResult>,
) {
    debug!("downloader {} up", worker_id);
    loop {
        let message = {
            let mut rx = queue.lock().await;
            rx.recv().await
        };
        let Some(DownloadMessage::Job(job)) = message else {
            break;
        };

        let mut segment = job.segment;
        segment.buffer().clear();
        let mut downloaded = 0u64;
        let outcome = match &job.task {
            Task::Chunk(chunk) => {
                fetch_v2_chunk(&client, &links, chunk, &mut segment, &mut downloaded).await
            }
            Task::V1(v1) => fetch_v1_range(&client, &links, v1, &mut segment, &mut downloaded).await,
            Task::File(_) => Err(FailReason::Unknown),
        };

        if results
            .send(DownloadResult {
                task: job.task,
                segment,
                outcome,
                downloaded,
            })
            .is_err()
        {
            break;
        }
    }
    debug!("downloader {} down", worker_id);
}

/// Fetch a Gen-2 chunk blob, verify its compressed MD5 and inflate it into
/// the segment
async fn fetch_v2_chunk(
    client: &CdnClient,
    links: &LinkTable,
    chunk: &crate::task::ChunkTask,
    segment: &mut Segment,
    downloaded: &mut u64,
) -> std::result::Result<u64, FailReason> {
    let Some(link) = links.get(&chunk.link_key) else {
        return Err(FailReason::Unauthorized);
    };
    let url = link.chunk_url(&chunk.compressed_md5);

    let compressed = fetch_body(client, &url, chunk.compressed_size as usize).await?;
    *downloaded = compressed.len() as u64;

    let compressed_sum = hex::encode(md5::compute(&compressed).0);
    if compressed_sum != chunk.compressed_md5 {
        warn!(
            "chunk {} compressed checksum mismatch ({})",
            chunk.compressed_md5, compressed_sum
        );
        return Err(FailReason::Checksum);
    }

    let buffer = segment.buffer();
    let mut decoder = flate2::read::ZlibDecoder::new(compressed.as_slice());
    if decoder.read_to_end(buffer).is_err() {
        return Err(FailReason::Checksum);
    }

    if buffer.len() as u64 != chunk.size
        || hex::encode(md5::compute(buffer.as_slice()).0) != chunk.md5
    {
        return Err(FailReason::Checksum);
    }
    Ok(chunk.size)
}

/// Fetch a byte range of a Gen-1 `main.bin` or installer blob into the
/// segment, resolving the ZIP local header first when required
async fn fetch_v1_range(
    client: &CdnClient,
    links: &LinkTable,
    task: &V1Task,
    segment: &mut Segment,
    downloaded: &mut u64,
) -> std::result::Result<u64, FailReason> {
    let Some(link) = links.get(&task.link_key) else {
        return Err(FailReason::Unauthorized);
    };
    let url = if task.link_key.starts_with("linux:") {
        link.raw_url()
    } else {
        link.main_bin_url()
    };

    let mut offset = task.offset;
    if task.resolve_zip_header {
        let header = fetch_range_body(client, &url, offset, 30).await?;
        let header_size = local_header_size(&header).map_err(|_| FailReason::Checksum)?;
        offset += header_size;
    }

    let body = fetch_range_body(client, &url, offset, task.size).await?;
    *downloaded = body.len() as u64;
    if body.len() as u64 != task.size {
        return Err(FailReason::Checksum);
    }
    segment.buffer().extend_from_slice(&body);
    Ok(task.size)
}

async fn fetch_body(
    client: &CdnClient,
    url: &str,
    size_hint: usize,
) -> std::result::Result<Vec<u8>, FailReason> {
    let response = client.get(url).await.map_err(classify)?;
    let mut body = Vec::with_capacity(size_hint);
    stream_into(response, &mut body).await?;
    Ok(body)
}

async fn fetch_range_body(
    client: &CdnClient,
    url: &str,
    offset: u64,
    size: u64,
) -> std::result::Result<Vec<u8>, FailReason> {
    let response = client.get_range(url, offset, size).await.map_err(classify)?;
    let mut body = Vec::with_capacity(size as usize);
    stream_into(response, &mut body).await?;
    Ok(body)
}

async fn stream_into(
    mut response: reqwest::Response,
    body: &mut Vec<u8>,
) -> std::result::Result<(), FailReason> {
    loop {
        match response.chunk().await {
            Ok(Some(bytes)) => body.extend_from_slice(&bytes),
            Ok(None) => return Ok(()),
            Err(_) => return Err(FailReason::Connection),
        }
    }
}

fn classify(error: galaxy_cdn::Error) -> FailReason {
    if error.is_unauthorized() {
        FailReason::Unauthorized
    } else {
        FailReason::Connection
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::SharedArena;
    use crate::task::{ChunkSource, ChunkTask};
    use flate2::Compression;
    use flate2::write::ZlibEncoder;
    use galaxy_cdn::secure_link::Endpoint;
    use std::io::Write;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn link_for(server_uri: &str) -> SecureLink {
        SecureLink::new(
            "1000",
            Endpoint {
                endpoint_name: "test".into(),
                url_format: String::new(),
                url: server_uri.to_string(),
                parameters: HashMap::new(),
                supports_generation: vec![2],
                priority: 0,
            },
        )
    }

    fn compress(data: &[u8]) -> Vec<u8> {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    #[tokio::test]
    async fn test_chunk_fetch_verify_inflate() {
        let payload = b"chunk payload bytes".to_vec();
        let compressed = compress(&payload);
        let compressed_md5 = hex::encode(md5::compute(&compressed).0);
        let md5sum = hex::encode(md5::compute(&payload).0);

        let server = MockServer::start().await;
        let chunk_path = format!(
            "/{}/{}/{}",
            &compressed_md5[0..2],
            &compressed_md5[2..4],
            compressed_md5
        );
        Mock::given(method("GET"))
            .and(path(chunk_path))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(compressed.clone()))
            .mount(&server)
            .await;

        let links = LinkTable::new();
        links.insert("1000", link_for(&server.uri()));

        let task = ChunkTask {
            product_id: "1000".into(),
            link_key: "1000".into(),
            path: "f".into(),
            index: 0,
            compressed_md5,
            md5: md5sum,
            size: payload.len() as u64,
            compressed_size: compressed.len() as u64,
            source: ChunkSource::Download,
            offload_to_cache: false,
            cleanup: false,
        };

        let mut arena = SharedArena::new(1024, 1024);
        let mut segment = arena.acquire().await.unwrap();
        let client = CdnClient::new().unwrap();
        let mut downloaded = 0;
        let written = fetch_v2_chunk(&client, &links, &task, &mut segment, &mut downloaded)
            .await
            .unwrap();
        assert_eq!(written, payload.len() as u64);
        assert_eq!(segment.data(), payload.as_slice());
        assert_eq!(downloaded, compressed.len() as u64);
    }

    #[tokio::test]
    async fn test_chunk_checksum_mismatch() {
        let compressed = compress(b"payload");
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(compressed))
            .mount(&server)
            .await;

        let links = LinkTable::new();
        links.insert("1000", link_for(&server.uri()));

        let task = ChunkTask {
            product_id: "1000".into(),
            link_key: "1000".into(),
            path: "f".into(),
            index: 0,
            compressed_md5: "00000000000000000000000000000000".into(),
            md5: "00000000000000000000000000000000".into(),
            size: 7,
            compressed_size: 7,
            source: ChunkSource::Download,
            offload_to_cache: false,
            cleanup: false,
        };

        let mut arena = SharedArena::new(64, 64);
        let mut segment = arena.acquire().await.unwrap();
        let client = CdnClient::new().unwrap();
        let mut downloaded = 0;
        let err = fetch_v2_chunk(&client, &links, &task, &mut segment, &mut downloaded)
            .await
            .unwrap_err();
        assert_eq!(err, FailReason::Checksum);
    }

    #[tokio::test]
    async fn test_missing_link_reports_unauthorized() {
        let links = LinkTable::new();
        let task = ChunkTask {
            product_id: "1000".into(),
            link_key: "1000".into(),
            path: "f".into(),
            index: 0,
            compressed_md5: "aa".into(),
            md5: "bb".into(),
            size: 1,
            compressed_size: 1,
            source: ChunkSource::Download,
            offload_to_cache: false,
            cleanup: false,
        };
        let mut arena = SharedArena::new(64, 64);
        let mut segment = arena.acquire().await.unwrap();
        let client = CdnClient::new().unwrap();
        let mut downloaded = 0;
        let err = fetch_v2_chunk(&client, &links, &task, &mut segment, &mut downloaded)
            .await
            .unwrap_err();
        assert_eq!(err, FailReason::Unauthorized);
    }
}
