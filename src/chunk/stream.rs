use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::codes;
use crate::query::response::ChunkDescriptor;
use crate::row::{RowSchema, SnowflakeColumn, SnowflakeRow};
use crate::{Error, Result};

use super::{ChunkData, ChunkDecoder, ChunkFetcher, fetch_and_decode};

/// Rows of a JSON result, produced one chunk at a time by a single background task.
///
/// At most one decoded row waits in the channel, so the producer never runs far ahead of the
/// consumer. A download or decode failure is delivered in place of the next row and ends the
/// stream. Dropping the stream stops the producer.
pub struct SnowflakeRowStream {
    rx: mpsc::Receiver<Result<SnowflakeRow>>,
    task: JoinHandle<()>,
    query_id: String,
    schema: Arc<RowSchema>,
}

impl SnowflakeRowStream {
    pub(crate) fn start(
        fetcher: Arc<dyn ChunkFetcher>,
        decoder: ChunkDecoder,
        initial: ChunkData,
        chunks: Vec<ChunkDescriptor>,
        query_id: String,
    ) -> Self {
        let (tx, rx) = mpsc::channel(1);
        let schema = Arc::clone(decoder.schema());
        let task = tokio::spawn(produce(tx, fetcher, decoder, initial, chunks, query_id.clone()));
        Self {
            rx,
            task,
            query_id,
            schema,
        }
    }

    /// The next row, `None` at the end of the result or after an error was delivered.
    pub async fn next(&mut self) -> Option<Result<SnowflakeRow>> {
        self.rx.recv().await
    }

    pub fn query_id(&self) -> &str {
        &self.query_id
    }

    pub fn columns(&self) -> &[SnowflakeColumn] {
        &self.schema.columns
    }
}

impl Drop for SnowflakeRowStream {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn produce(
    tx: mpsc::Sender<Result<SnowflakeRow>>,
    fetcher: Arc<dyn ChunkFetcher>,
    decoder: ChunkDecoder,
    initial: ChunkData,
    chunks: Vec<ChunkDescriptor>,
    query_id: String,
) {
    if !send_rows(&tx, initial).await {
        return;
    }
    for (index, descriptor) in chunks.iter().enumerate() {
        debug!(%query_id, index, "streaming chunk");
        let data = match fetch_and_decode(fetcher.as_ref(), &decoder, descriptor).await {
            Ok(data) => data,
            Err(err) => {
                let err = err.into_snowflake_error(codes::FAILED_TO_GET_CHUNK);
                let err = err.with_query_id(Some(query_id.clone()));
                let _ = tx.send(Err(Error::Snowflake(err))).await;
                return;
            }
        };
        if !send_rows(&tx, data).await {
            return;
        }
    }
}

/// Returns `false` once the receiver is gone.
async fn send_rows(tx: &mpsc::Sender<Result<SnowflakeRow>>, data: ChunkData) -> bool {
    let ChunkData::Rows(rows) = data else {
        return true;
    };
    for row in rows {
        if tx.send(Ok(row)).await.is_err() {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use bytes::Bytes;
    use chrono::{Offset, Utc};

    use super::*;
    use crate::chunk::ChunkFormat;
    use crate::row::SnowflakeColumnType;

    struct Served {
        fail_at: Option<usize>,
    }

    #[async_trait]
    impl ChunkFetcher for Served {
        async fn fetch(&self, descriptor: &ChunkDescriptor) -> Result<Bytes> {
            let index: usize = descriptor.url.parse().unwrap();
            if self.fail_at == Some(index) {
                return Err(Error::ChunkDownload("gone".to_string()));
            }
            Ok(Bytes::from(format!(r#"["{index}"]"#)))
        }
    }

    fn start(fail_at: Option<usize>) -> SnowflakeRowStream {
        let schema = Arc::new(RowSchema::new(
            vec![SnowflakeColumn {
                name: "C".to_string(),
                index: 0,
                column_type: SnowflakeColumnType::new("text", false),
            }],
            Utc.fix(),
            false,
        ));
        let decoder = ChunkDecoder::new(ChunkFormat::Json, schema, true, None);
        let initial = decoder.from_json_rows(vec![vec![Some("inline".to_string())]]);
        let chunks = (0..3)
            .map(|i| ChunkDescriptor {
                url: i.to_string(),
                row_count: 1,
                ..Default::default()
            })
            .collect();
        SnowflakeRowStream::start(Arc::new(Served { fail_at }), decoder, initial, chunks, "q".into())
    }

    #[tokio::test]
    async fn streams_every_chunk_in_order() {
        let mut stream = start(None);
        assert_eq!(stream.columns()[0].name, "C");

        let mut seen = Vec::new();
        while let Some(row) = stream.next().await {
            seen.push(row.unwrap().get_at::<String>(0).unwrap());
        }
        assert_eq!(seen, ["inline", "0", "1", "2"]);
    }

    #[tokio::test]
    async fn error_ends_the_stream_after_partial_delivery() {
        let mut stream = start(Some(1));
        assert_eq!(stream.next().await.unwrap().unwrap().get_at::<String>(0).unwrap(), "inline");
        assert_eq!(stream.next().await.unwrap().unwrap().get_at::<String>(0).unwrap(), "0");

        let Some(Err(Error::Snowflake(err))) = stream.next().await else {
            panic!("expected a chunk error");
        };
        assert_eq!(err.number, codes::FAILED_TO_GET_CHUNK);
        assert_eq!(err.query_id.as_deref(), Some("q"));
        assert!(stream.next().await.is_none());
    }
}
