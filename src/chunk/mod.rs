//! Result chunk download and decoding.
//!
//! A result set is an inline first chunk plus any number of remote chunks. Remote chunks are
//! fetched by a bounded pool of workers and handed to the consumer strictly in index order.

mod arrow;
mod fetch;
mod json;
mod stream;

use std::collections::{HashMap, VecDeque};
use std::io::{self, Read};
use std::sync::{Arc, Mutex, MutexGuard};

use arrow_array::RecordBatch;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::{Buf, Bytes};
use flate2::read::GzDecoder;
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::error::{SnowflakeError, codes, sql_state};
use crate::query::response::ChunkDescriptor;
use crate::row::{RowSchema, SnowflakeRow};
use crate::rows::SnowflakeArrowBatch;
use crate::{Error, Result};

pub use arrow::TimestampResolution;
pub(crate) use fetch::{ChunkFetcher, HttpChunkFetcher};
pub(crate) use json::JsonRows;
pub use stream::SnowflakeRowStream;

const MAX_CHUNK_ERROR_RETRIES: usize = 5;
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChunkFormat {
    Json,
    Arrow,
}

/// Turns chunk bytes into rows or raw batches for one result set.
#[derive(Clone)]
pub(crate) struct ChunkDecoder {
    format: ChunkFormat,
    schema: Arc<RowSchema>,
    custom_json: bool,
    raw_batches: Option<TimestampResolution>,
}

impl ChunkDecoder {
    pub(crate) fn new(
        format: ChunkFormat,
        schema: Arc<RowSchema>,
        custom_json: bool,
        raw_batches: Option<TimestampResolution>,
    ) -> Self {
        Self {
            format,
            schema,
            custom_json,
            raw_batches,
        }
    }

    pub(crate) fn schema(&self) -> &Arc<RowSchema> {
        &self.schema
    }

    pub(crate) fn is_raw(&self) -> bool {
        self.raw_batches.is_some()
    }

    /// Decodes one downloaded chunk, gunzipping it first when it starts with the gzip magic.
    pub(crate) fn decode(&self, bytes: Bytes, row_hint: usize) -> Result<ChunkData> {
        if bytes.starts_with(&GZIP_MAGIC) {
            self.decode_reader(GzDecoder::new(bytes.reader()), row_hint)
        } else {
            self.decode_reader(bytes.reader(), row_hint)
        }
    }

    fn decode_reader<R: Read>(&self, reader: R, row_hint: usize) -> Result<ChunkData> {
        match self.format {
            ChunkFormat::Json => {
                // remote JSON chunks are bare comma-separated rows
                let bracketed = Read::chain(&b"["[..], reader).chain(&b"]"[..]);
                let rows = if self.custom_json {
                    json::decode_chunk(bracketed, row_hint, self.schema.columns.len())?
                } else {
                    serde_json::from_reader(bracketed).map_err(json_chunk_error)?
                };
                Ok(self.from_json_rows(rows))
            }
            ChunkFormat::Arrow => self.from_batches(arrow::read_batches(reader)?),
        }
    }

    pub(crate) fn from_json_rows(&self, rows: JsonRows) -> ChunkData {
        ChunkData::Rows(
            rows.into_iter()
                .map(|cells| SnowflakeRow::json(cells, Arc::clone(&self.schema)))
                .collect(),
        )
    }

    pub(crate) fn from_batches(&self, batches: Vec<RecordBatch>) -> Result<ChunkData> {
        match self.raw_batches {
            Some(resolution) => {
                let mut out = VecDeque::with_capacity(batches.len());
                for batch in &batches {
                    let converted = arrow::convert_timestamps(batch, &self.schema, resolution)?;
                    out.push_back(SnowflakeArrowBatch::new(converted));
                }
                Ok(ChunkData::Batches(out))
            }
            None => {
                let mut rows = VecDeque::new();
                for batch in &batches {
                    rows.extend(arrow::batch_to_rows(batch, &self.schema)?);
                }
                Ok(ChunkData::Rows(rows))
            }
        }
    }

    /// The chunk that arrives inline with the query response.
    pub(crate) fn initial(&self, row_set: Option<JsonRows>, row_set_base64: Option<&str>) -> Result<ChunkData> {
        match self.format {
            ChunkFormat::Json => Ok(self.from_json_rows(row_set.unwrap_or_default())),
            ChunkFormat::Arrow => match row_set_base64.filter(|s| !s.is_empty()) {
                Some(encoded) => {
                    let bytes = STANDARD.decode(encoded)?;
                    self.from_batches(arrow::read_batches(bytes.as_slice())?)
                }
                None => Ok(self.empty()),
            },
        }
    }

    pub(crate) fn empty(&self) -> ChunkData {
        if self.is_raw() {
            ChunkData::Batches(VecDeque::new())
        } else {
            ChunkData::Rows(VecDeque::new())
        }
    }
}

fn json_chunk_error(err: serde_json::Error) -> Error {
    if err.is_io() {
        Error::IO(io::Error::from(err))
    } else {
        Error::CorruptChunk(err.to_string())
    }
}

/// Downloads a chunk and decodes it off the async worker threads.
async fn fetch_and_decode(
    fetcher: &dyn ChunkFetcher,
    decoder: &ChunkDecoder,
    descriptor: &ChunkDescriptor,
) -> Result<ChunkData> {
    let bytes = fetcher.fetch(descriptor).await?;
    let decoder = decoder.clone();
    let row_hint = usize::try_from(descriptor.row_count).unwrap_or_default();
    tokio::task::spawn_blocking(move || decoder.decode(bytes, row_hint)).await?
}

pub(crate) enum ChunkData {
    Rows(VecDeque<SnowflakeRow>),
    Batches(VecDeque<SnowflakeArrowBatch>),
}

#[derive(Default)]
struct DownloadState {
    ready: HashMap<usize, ChunkData>,
    queue: VecDeque<usize>,
    error: Option<SnowflakeError>,
    error_retries: usize,
}

struct Shared {
    state: Mutex<DownloadState>,
    notify: Notify,
    fetcher: Arc<dyn ChunkFetcher>,
    decoder: ChunkDecoder,
    chunks: Vec<ChunkDescriptor>,
    query_id: String,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, DownloadState> {
        match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    async fn download(&self, index: usize) -> Result<ChunkData> {
        fetch_and_decode(self.fetcher.as_ref(), &self.decoder, &self.chunks[index]).await
    }

    fn chunk_error(&self, index: usize, reason: impl ToString) -> SnowflakeError {
        SnowflakeError::new(
            codes::FAILED_TO_GET_CHUNK,
            sql_state::CONNECTION_FAILURE,
            "failed to get chunk {}: {}",
        )
        .with_args([index.to_string(), reason.to_string()])
        .with_query_id(Some(self.query_id.clone()))
    }
}

/// Downloads one chunk at a time until one succeeds, the queue is drained or the
/// downloader has failed.
async fn worker(shared: Arc<Shared>) {
    loop {
        let index = {
            let mut state = shared.lock();
            if state.error.is_some() {
                return;
            }
            match state.queue.pop_front() {
                Some(index) => index,
                None => return,
            }
        };
        debug!(query_id = %shared.query_id, index, "downloading chunk");
        let result = shared.download(index).await;

        let mut state = shared.lock();
        match result {
            Ok(data) => {
                state.ready.insert(index, data);
                drop(state);
                shared.notify.notify_waiters();
                return;
            }
            Err(err) => {
                state.error_retries += 1;
                if state.error_retries > MAX_CHUNK_ERROR_RETRIES {
                    warn!(query_id = %shared.query_id, index, error = %err, "giving up on chunk");
                    state.error = Some(shared.chunk_error(index, err));
                    drop(state);
                    shared.notify.notify_waiters();
                    return;
                }
                warn!(
                    query_id = %shared.query_id,
                    index,
                    retries = state.error_retries,
                    error = %err,
                    "chunk download failed, re-queueing"
                );
                state.queue.push_front(index);
            }
        }
    }
}

/// Ordered reader over the chunks of one result set.
pub(crate) struct ChunkDownloader {
    shared: Arc<Shared>,
    current: ChunkData,
    next_index: usize,
    workers: JoinSet<()>,
    failed: Option<SnowflakeError>,
}

impl ChunkDownloader {
    /// Seeds the inline chunk and launches `min(max_workers, chunks)` workers.
    pub(crate) fn start(
        fetcher: Arc<dyn ChunkFetcher>,
        decoder: ChunkDecoder,
        chunks: Vec<ChunkDescriptor>,
        initial: ChunkData,
        max_workers: usize,
        query_id: String,
    ) -> Self {
        let state = DownloadState {
            queue: (0..chunks.len()).collect(),
            ..Default::default()
        };
        let worker_count = max_workers.max(1).min(chunks.len());
        debug!(%query_id, chunks = chunks.len(), worker_count, "starting chunk downloader");
        let shared = Arc::new(Shared {
            state: Mutex::new(state),
            notify: Notify::new(),
            fetcher,
            decoder,
            chunks,
            query_id,
        });
        let mut downloader = Self {
            shared,
            current: initial,
            next_index: 0,
            workers: JoinSet::new(),
            failed: None,
        };
        for _ in 0..worker_count {
            downloader.spawn_worker();
        }
        downloader
    }

    pub(crate) fn schema(&self) -> &Arc<RowSchema> {
        self.shared.decoder.schema()
    }

    pub(crate) fn is_raw(&self) -> bool {
        self.shared.decoder.is_raw()
    }

    fn spawn_worker(&mut self) {
        self.workers.spawn(worker(Arc::clone(&self.shared)));
    }

    pub(crate) async fn next_row(&mut self) -> Result<Option<SnowflakeRow>> {
        self.check_failed()?;
        if self.is_raw() {
            return Err(SnowflakeError::new(
                codes::ROWS_IN_ARROW_BATCHES,
                sql_state::FEATURE_NOT_SUPPORTED,
                "rows were requested as arrow batches, use next_batch",
            )
            .into());
        }
        loop {
            if let ChunkData::Rows(rows) = &mut self.current {
                if let Some(row) = rows.pop_front() {
                    return Ok(Some(row));
                }
            }
            if !self.advance_checked().await? {
                return Ok(None);
            }
        }
    }

    pub(crate) async fn next_batch(&mut self) -> Result<Option<SnowflakeArrowBatch>> {
        self.check_failed()?;
        if !self.is_raw() {
            return Err(SnowflakeError::new(
                codes::NON_ARROW_RESPONSE_IN_ARROW_BATCHES,
                sql_state::FEATURE_NOT_SUPPORTED,
                "arrow batches were not requested for this result",
            )
            .into());
        }
        loop {
            if let ChunkData::Batches(batches) = &mut self.current {
                if let Some(batch) = batches.pop_front() {
                    return Ok(Some(batch));
                }
            }
            if !self.advance_checked().await? {
                return Ok(None);
            }
        }
    }

    fn check_failed(&self) -> Result<()> {
        match &self.failed {
            Some(err) => Err(err.clone().into()),
            None => Ok(()),
        }
    }

    /// Like [`Self::advance`], but the first error sticks.
    async fn advance_checked(&mut self) -> Result<bool> {
        match self.advance().await {
            Ok(more) => Ok(more),
            Err(err) => {
                let err = err.into_snowflake_error(codes::FAILED_TO_GET_CHUNK);
                self.failed = Some(err.clone());
                self.close();
                Err(err.into())
            }
        }
    }

    /// Replaces the current chunk with the next one in order. `false` once all are consumed.
    async fn advance(&mut self) -> Result<bool> {
        if self.next_index >= self.shared.chunks.len() {
            return Ok(false);
        }
        loop {
            let shared = Arc::clone(&self.shared);
            let notified = shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = shared.lock();
                if let Some(err) = &state.error {
                    return Err(err.clone().into());
                }
                if let Some(data) = state.ready.remove(&self.next_index) {
                    let refill = !state.queue.is_empty();
                    drop(state);
                    self.current = data;
                    self.next_index += 1;
                    if refill {
                        self.spawn_worker();
                    }
                    return Ok(true);
                }
            }

            self.reap()?;
            if self.workers.is_empty() {
                let state = shared.lock();
                if state.error.is_some() || state.ready.contains_key(&self.next_index) {
                    continue;
                }
                if state.queue.is_empty() {
                    return Err(shared
                        .chunk_error(self.next_index, "no worker left to download it")
                        .into());
                }
                drop(state);
                self.spawn_worker();
            }
            notified.await;
        }
    }

    fn reap(&mut self) -> Result<()> {
        while let Some(joined) = self.workers.try_join_next() {
            if let Err(err) = joined {
                if err.is_panic() {
                    let failed = self.shared.chunk_error(self.next_index, err);
                    self.shared.lock().error = Some(failed.clone());
                    return Err(failed.into());
                }
            }
        }
        Ok(())
    }

    /// Stops the workers and drops any downloaded chunks.
    pub(crate) fn close(&mut self) {
        self.workers.abort_all();
        let mut state = self.shared.lock();
        state.queue.clear();
        state.ready.clear();
        drop(state);
        self.current = self.shared.decoder.empty();
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::{Offset, Utc};
    use flate2::Compression;
    use flate2::write::GzEncoder;

    use super::*;
    use crate::row::{SnowflakeColumn, SnowflakeColumnType};

    fn schema() -> Arc<RowSchema> {
        Arc::new(RowSchema::new(
            vec![SnowflakeColumn {
                name: "N".to_string(),
                index: 0,
                column_type: SnowflakeColumnType::new("text", true),
            }],
            Utc.fix(),
            false,
        ))
    }

    fn decoder(custom_json: bool) -> ChunkDecoder {
        ChunkDecoder::new(ChunkFormat::Json, schema(), custom_json, None)
    }

    fn descriptors(n: usize) -> Vec<ChunkDescriptor> {
        (0..n)
            .map(|i| ChunkDescriptor {
                url: format!("chunk-{i}"),
                row_count: 2,
                ..Default::default()
            })
            .collect()
    }

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    /// Serves `chunk-i` as two rows, finishing later chunks first.
    struct ReversedFetcher {
        chunks: usize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    #[async_trait]
    impl ChunkFetcher for ReversedFetcher {
        async fn fetch(&self, descriptor: &ChunkDescriptor) -> Result<Bytes> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            let index: usize = descriptor.url.trim_start_matches("chunk-").parse().unwrap();
            let delay = (self.chunks - index) as u64 * 5;
            tokio::time::sleep(Duration::from_millis(delay)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            let body = format!(r#"["{index}-a"],["{index}-b"]"#);
            Ok(Bytes::from(gzip(body.as_bytes())))
        }
    }

    struct FailingFetcher {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ChunkFetcher for FailingFetcher {
        async fn fetch(&self, _descriptor: &ChunkDescriptor) -> Result<Bytes> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::ChunkDownload("boom".to_string()))
        }
    }

    #[test]
    fn decodes_plain_and_gzipped_chunks() {
        for custom in [false, true] {
            let decoder = decoder(custom);
            let body = br#"["a"],[null]"#;
            for bytes in [Bytes::from_static(body), Bytes::from(gzip(body))] {
                let ChunkData::Rows(rows) = decoder.decode(bytes, 2).unwrap() else {
                    panic!("expected rows");
                };
                assert_eq!(rows.len(), 2);
                assert_eq!(rows[0].get_at::<String>(0).unwrap(), "a");
                assert_eq!(rows[1].get_at::<Option<String>>(0).unwrap(), None);
            }
        }
    }

    #[test]
    fn empty_chunk_has_no_rows() {
        let ChunkData::Rows(rows) = decoder(true).decode(Bytes::new(), 0).unwrap() else {
            panic!("expected rows");
        };
        assert!(rows.is_empty());
    }

    #[test]
    fn malformed_chunk_is_corrupt() {
        for custom in [false, true] {
            let err = decoder(custom)
                .decode(Bytes::from_static(b"[\"a\"],[1]"), 2)
                .err()
                .unwrap();
            assert!(matches!(err, Error::CorruptChunk(_)), "{err:?}");
        }
    }

    #[tokio::test]
    async fn rows_arrive_in_chunk_order_with_bounded_workers() {
        let fetcher = Arc::new(ReversedFetcher {
            chunks: 6,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        });
        let decoder = decoder(true);
        let initial = decoder.from_json_rows(vec![vec![Some("inline".to_string())]]);
        let mut downloader =
            ChunkDownloader::start(fetcher.clone(), decoder, descriptors(6), initial, 2, "q".into());

        let mut seen = Vec::new();
        while let Some(row) = downloader.next_row().await.unwrap() {
            seen.push(row.get_at::<String>(0).unwrap());
        }

        let mut expected = vec!["inline".to_string()];
        for i in 0..6 {
            expected.push(format!("{i}-a"));
            expected.push(format!("{i}-b"));
        }
        assert_eq!(seen, expected);
        assert!(fetcher.max_in_flight.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn failure_is_surfaced_after_retries_and_sticks() {
        let fetcher = Arc::new(FailingFetcher {
            calls: AtomicUsize::new(0),
        });
        let decoder = decoder(false);
        let initial = decoder.empty();
        let mut downloader =
            ChunkDownloader::start(fetcher.clone(), decoder, descriptors(1), initial, 4, "q1".into());

        let first = downloader.next_row().await.err().unwrap();
        let Error::Snowflake(first) = first else {
            panic!("expected a structured error");
        };
        assert_eq!(first.number, codes::FAILED_TO_GET_CHUNK);
        assert_eq!(first.query_id.as_deref(), Some("q1"));
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), MAX_CHUNK_ERROR_RETRIES + 1);

        let Error::Snowflake(second) = downloader.next_row().await.err().unwrap() else {
            panic!("expected a structured error");
        };
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn rows_are_refused_in_batch_mode() {
        let decoder = ChunkDecoder::new(
            ChunkFormat::Arrow,
            schema(),
            false,
            Some(TimestampResolution::default()),
        );
        let initial = decoder.empty();
        let fetcher = Arc::new(FailingFetcher {
            calls: AtomicUsize::new(0),
        });
        let mut downloader = ChunkDownloader::start(fetcher, decoder, Vec::new(), initial, 1, "q".into());
        let Error::Snowflake(err) = downloader.next_row().await.err().unwrap() else {
            panic!("expected a structured error");
        };
        assert_eq!(err.number, codes::ROWS_IN_ARROW_BATCHES);
        assert!(downloader.next_batch().await.unwrap().is_none());
    }
}
