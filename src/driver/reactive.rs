//! Reactive Streams
//!
//! tokio-stream 기반 비동기 레코드 스트림
//!
//! # Example
//!
//! ```ignore
//! use futures::StreamExt;
//!
//! let result = session.run("MATCH (a:Person) RETURN a.name AS name").await?;
//! let mut stream = result.into_stream()?;
//!
//! while let Some(record) = stream.next().await {
//!     println!("{}", record?.get_string("name")?);
//! }
//! ```

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;

use super::error::{DriverError, DriverResult};
use super::record::Record;
use super::result::SharedCursor;

// ============================================================================
// RecordStream - 비동기 레코드 스트림
// ============================================================================

/// 비동기 레코드 스트림
///
/// 레코드를 도착 순서대로 내보내며, 에러 항목 이후에는 종료됩니다.
pub struct RecordStream {
    inner: Pin<Box<dyn Stream<Item = DriverResult<Record>> + Send>>,
    keys: Vec<String>,
}

impl std::fmt::Debug for RecordStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordStream")
            .field("keys", &self.keys)
            .finish()
    }
}

impl RecordStream {
    /// 결과 커서에서 생성
    pub(crate) fn from_cursor(keys: Vec<String>, cursor: SharedCursor) -> Self {
        let inner = futures::stream::unfold(Some(cursor), |state| async move {
            let cursor = state?;
            let item = cursor.lock().await.next_item().await;
            match item {
                Some(Ok(record)) => Some((Ok(record), Some(cursor))),
                Some(Err(err)) => Some((Err(err), None)),
                None => None,
            }
        });
        Self {
            inner: Box::pin(inner),
            keys,
        }
    }

    /// 레코드 벡터에서 생성
    pub fn from_records(records: Vec<Record>) -> Self {
        let keys = records.first().map(|r| r.keys().to_vec()).unwrap_or_default();
        Self {
            inner: Box::pin(tokio_stream::iter(records.into_iter().map(Ok))),
            keys,
        }
    }

    /// 키 목록
    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    /// 모든 레코드 수집 (첫 에러에서 중단)
    pub async fn try_collect(self) -> DriverResult<Vec<Record>> {
        use tokio_stream::StreamExt;

        let mut records = Vec::new();
        let mut stream = self.inner;

        while let Some(result) = stream.next().await {
            records.push(result?);
        }

        Ok(records)
    }

    /// 단일 레코드 (정확히 1개)
    pub async fn single(self) -> DriverResult<Record> {
        let mut records = self.try_collect().await?;
        if records.len() != 1 {
            return Err(DriverError::result_consumed(format!(
                "Expected a single record, got {}",
                records.len()
            )));
        }
        Ok(records.remove(0))
    }
}

impl Stream for RecordStream {
    type Item = DriverResult<Record>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;
    use crate::driver::types::Value;

    fn create_test_records(count: usize) -> Vec<Record> {
        let keys: Vec<String> = vec!["id".into()];
        (0..count)
            .map(|i| Record::new(keys.clone(), vec![Value::Integer(i as i64)]))
            .collect()
    }

    #[tokio::test]
    async fn test_record_stream_from_records() {
        let stream = RecordStream::from_records(create_test_records(3));
        assert_eq!(stream.keys(), &["id"]);

        let records = stream.try_collect().await.unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[2].get_int("id").unwrap(), 2);
    }

    #[tokio::test]
    async fn test_record_stream_combinators() {
        let ids: Vec<i64> = RecordStream::from_records(create_test_records(10))
            .filter_map(|r| async move { r.ok() })
            .map(|r| r.get_int("id").unwrap())
            .filter(|id| futures::future::ready(id % 2 == 0))
            .take(3)
            .collect()
            .await;

        assert_eq!(ids, vec![0, 2, 4]);
    }

    #[tokio::test]
    async fn test_record_stream_single() {
        let record = RecordStream::from_records(create_test_records(1)).single().await.unwrap();
        assert_eq!(record.get_int("id").unwrap(), 0);

        assert!(RecordStream::from_records(create_test_records(2)).single().await.is_err());
        assert!(RecordStream::from_records(Vec::new()).single().await.is_err());
    }
}
