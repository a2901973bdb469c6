//! Query Result
//!
//! 쿼리 결과. 서버 이벤트 스트림을 지연 소비하며, 두 가지 소비 방식을 제공합니다.
//!
//! - Pull: [`QueryResult::records`], [`QueryResult::next`] 로 버퍼링하여 읽기
//! - Push: [`QueryResult::subscribe`] 로 콜백 전달
//!
//! 한 결과에 두 방식을 섞어 쓸 수 없습니다.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use parking_lot::{Mutex as SyncMutex, RwLock};
use tokio::sync::Mutex;

use super::connection::{EventStream, QueryStream, StreamEvent};
use super::error::{DriverError, DriverResult};
use super::reactive::RecordStream;
use super::record::Record;
use super::session::{Bookmark, Query};

// ============================================================================
// ResultSummary - 결과 요약
// ============================================================================

/// 결과 요약
#[derive(Debug, Clone, Default)]
pub struct ResultSummary {
    /// 쿼리
    pub query: Option<Query>,
    /// 쿼리 타입
    pub query_type: QueryType,
    /// 카운터
    pub counters: Counters,
    /// 첫 응답까지 걸린 시간
    pub result_available_after: Duration,
    /// 전체 소비까지 걸린 시간
    pub result_consumed_after: Duration,
    /// 데이터베이스
    pub database: Option<String>,
    /// 서버 에이전트
    pub server: Option<String>,
    /// 알림
    pub notifications: Vec<Notification>,
    /// auto-commit 쿼리의 북마크
    pub bookmark: Option<Bookmark>,
}

/// 쿼리 타입
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueryType {
    /// 읽기 전용
    #[default]
    ReadOnly,
    /// 읽기/쓰기
    ReadWrite,
    /// 쓰기 전용
    WriteOnly,
    /// 스키마 변경
    SchemaWrite,
}

/// 업데이트 카운터
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Counters {
    /// 생성된 노드 수
    pub nodes_created: i64,
    /// 삭제된 노드 수
    pub nodes_deleted: i64,
    /// 생성된 관계 수
    pub relationships_created: i64,
    /// 삭제된 관계 수
    pub relationships_deleted: i64,
    /// 설정된 속성 수
    pub properties_set: i64,
    /// 추가된 레이블 수
    pub labels_added: i64,
    /// 제거된 레이블 수
    pub labels_removed: i64,
    /// 추가된 인덱스 수
    pub indexes_added: i64,
    /// 제거된 인덱스 수
    pub indexes_removed: i64,
    /// 추가된 제약조건 수
    pub constraints_added: i64,
    /// 제거된 제약조건 수
    pub constraints_removed: i64,
}

impl Counters {
    /// 데이터 변경 여부
    pub fn contains_updates(&self) -> bool {
        self.nodes_created > 0
            || self.nodes_deleted > 0
            || self.relationships_created > 0
            || self.relationships_deleted > 0
            || self.properties_set > 0
            || self.labels_added > 0
            || self.labels_removed > 0
    }

    /// 스키마 변경 여부
    pub fn contains_system_updates(&self) -> bool {
        self.indexes_added > 0
            || self.indexes_removed > 0
            || self.constraints_added > 0
            || self.constraints_removed > 0
    }
}

/// 서버 알림
#[derive(Debug, Clone)]
pub struct Notification {
    /// 코드
    pub code: String,
    /// 제목
    pub title: String,
    /// 설명
    pub description: String,
    /// 심각도
    pub severity: String,
    /// 쿼리 내 위치
    pub position: Option<InputPosition>,
}

/// 입력 위치
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputPosition {
    /// 오프셋
    pub offset: i64,
    /// 라인
    pub line: i64,
    /// 컬럼
    pub column: i64,
}

// ============================================================================
// ResultCursor - 스트림 커서 (내부)
// ============================================================================

/// 스트림 종료 상태
#[derive(Debug, Clone)]
enum Outcome {
    Completed(ResultSummary),
    Failed(DriverError),
    Discarded,
}

/// 트랜잭션이 공유하는 스트림 실패 기록
pub(crate) type FailureSlot = Arc<SyncMutex<Option<DriverError>>>;

/// 커서가 종료 이벤트를 알릴 곳
#[derive(Debug, Clone, Default)]
pub(crate) struct CursorHooks {
    /// 스트림 실패 시 에러가 기록되는 곳
    pub(crate) failure: Option<FailureSlot>,
    /// auto-commit 북마크 저장소
    pub(crate) bookmark: Option<Arc<RwLock<Option<Bookmark>>>>,
}

/// 네트워크 이벤트 스트림 위의 커서
pub(crate) struct ResultCursor {
    query: Query,
    keys: Arc<[String]>,
    events: Option<EventStream>,
    /// 수신했지만 아직 소비자에게 넘기지 않은 레코드
    pending: VecDeque<Record>,
    outcome: Option<Outcome>,
    hooks: CursorHooks,
    started: Instant,
}

pub(crate) type SharedCursor = Arc<Mutex<ResultCursor>>;

impl ResultCursor {
    pub(crate) fn new(query: Query, stream: QueryStream, hooks: CursorHooks) -> Self {
        Self {
            query,
            keys: stream.keys.into(),
            events: Some(stream.events),
            pending: VecDeque::new(),
            outcome: None,
            hooks,
            started: Instant::now(),
        }
    }

    /// 종료 여부 (더 이상 네트워크 읽기 없음)
    pub(crate) fn is_terminated(&self) -> bool {
        self.events.is_none()
    }

    /// 다음 레코드. 버퍼를 먼저 비우고, 그 다음 네트워크에서 읽습니다.
    async fn next_record(&mut self) -> Option<DriverResult<Record>> {
        if let Some(record) = self.pending.pop_front() {
            return Some(Ok(record));
        }
        self.read_event().await
    }

    /// 네트워크에서 이벤트 하나를 읽습니다.
    async fn read_event(&mut self) -> Option<DriverResult<Record>> {
        loop {
            let events = self.events.as_mut()?;
            match events.next().await {
                Some(Ok(StreamEvent::Record(values))) => {
                    return Some(Ok(Record::new(self.keys.clone(), values)));
                }
                Some(Ok(StreamEvent::Summary(summary))) => {
                    self.complete(summary);
                }
                Some(Err(err)) => {
                    self.fail(err.clone());
                    return Some(Err(err));
                }
                None => {
                    self.fail(DriverError::protocol("Result stream ended without a summary"));
                }
            }
        }
    }

    fn complete(&mut self, mut summary: ResultSummary) {
        self.events = None;
        if summary.query.is_none() {
            summary.query = Some(self.query.clone());
        }
        if summary.result_consumed_after.is_zero() {
            summary.result_consumed_after = self.started.elapsed();
        }
        if let (Some(bookmark), Some(sink)) = (&summary.bookmark, &self.hooks.bookmark) {
            *sink.write() = Some(bookmark.clone());
        }
        self.outcome = Some(Outcome::Completed(summary));
    }

    fn fail(&mut self, err: DriverError) {
        self.events = None;
        if let Some(slot) = &self.hooks.failure {
            slot.lock().get_or_insert_with(|| err.clone());
        }
        self.outcome = Some(Outcome::Failed(err));
    }

    /// 남은 레코드를 모두 버퍼로 읽어 들입니다.
    ///
    /// 같은 연결로 다음 요청을 보내기 전에 호출됩니다.
    pub(crate) async fn buffer_all(&mut self) -> DriverResult<()> {
        while let Some(item) = self.read_event().await {
            match item {
                Ok(record) => self.pending.push_back(record),
                Err(err) => return Err(err),
            }
        }
        self.terminal_status()
    }

    /// 읽지 않은 스트림을 버립니다. 이미 받은 레코드는 유지됩니다.
    pub(crate) fn discard(&mut self) {
        if self.events.take().is_some() {
            self.outcome = Some(Outcome::Discarded);
        }
    }

    fn terminal_status(&self) -> DriverResult<()> {
        match &self.outcome {
            Some(Outcome::Completed(_)) => Ok(()),
            Some(Outcome::Failed(err)) => Err(err.clone()),
            Some(Outcome::Discarded) => Err(discarded_error()),
            None => Err(DriverError::Internal("Result stream still open".into())),
        }
    }

    fn summary(&self) -> DriverResult<ResultSummary> {
        match &self.outcome {
            Some(Outcome::Completed(summary)) => Ok(summary.clone()),
            _ => self.terminal_status().map(|_| ResultSummary::default()),
        }
    }
}

fn discarded_error() -> DriverError {
    DriverError::result_consumed("Result was discarded before it was fully read")
}

// ============================================================================
// Subscriber - Push 방식 콜백
// ============================================================================

type NextCallback = Box<dyn FnMut(Record) + Send>;
type CompletedCallback = Box<dyn FnOnce(ResultSummary) + Send>;
type ErrorCallback = Box<dyn FnOnce(DriverError) + Send>;

/// Push 방식 결과 구독자. 세 콜백 모두 선택 사항입니다.
#[derive(Default)]
pub struct Subscriber {
    on_next: Option<NextCallback>,
    on_completed: Option<CompletedCallback>,
    on_error: Option<ErrorCallback>,
}

impl Subscriber {
    /// 빈 구독자 생성
    pub fn new() -> Self {
        Self::default()
    }

    /// 레코드 콜백
    pub fn on_next(mut self, f: impl FnMut(Record) + Send + 'static) -> Self {
        self.on_next = Some(Box::new(f));
        self
    }

    /// 완료 콜백
    pub fn on_completed(mut self, f: impl FnOnce(ResultSummary) + Send + 'static) -> Self {
        self.on_completed = Some(Box::new(f));
        self
    }

    /// 에러 콜백
    pub fn on_error(mut self, f: impl FnOnce(DriverError) + Send + 'static) -> Self {
        self.on_error = Some(Box::new(f));
        self
    }
}

impl std::fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscriber")
            .field("on_next", &self.on_next.is_some())
            .field("on_completed", &self.on_completed.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

/// 구독 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    /// 레코드 전달 중
    Streaming,
    /// 정상 완료
    Completed,
    /// 에러로 종료
    Errored,
}

impl SubscriptionState {
    /// 종료 여부
    pub fn is_terminated(&self) -> bool {
        !matches!(self, Self::Streaming)
    }
}

/// 구독 상태 기계. 종료 후에는 어떤 콜백도 호출하지 않습니다.
struct Subscription {
    subscriber: Subscriber,
    state: SubscriptionState,
}

impl Subscription {
    fn new(subscriber: Subscriber) -> Self {
        Self {
            subscriber,
            state: SubscriptionState::Streaming,
        }
    }

    fn next(&mut self, record: Record) {
        if self.state != SubscriptionState::Streaming {
            return;
        }
        if let Some(on_next) = self.subscriber.on_next.as_mut() {
            on_next(record);
        }
    }

    fn complete(&mut self, summary: ResultSummary) {
        if self.state != SubscriptionState::Streaming {
            return;
        }
        self.state = SubscriptionState::Completed;
        if let Some(on_completed) = self.subscriber.on_completed.take() {
            on_completed(summary);
        }
    }

    fn error(&mut self, err: DriverError) {
        if self.state != SubscriptionState::Streaming {
            return;
        }
        self.state = SubscriptionState::Errored;
        if let Some(on_error) = self.subscriber.on_error.take() {
            on_error(err);
        }
    }
}

// ============================================================================
// QueryResult - 쿼리 결과
// ============================================================================

/// 소비 방식
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Consumption {
    Untouched,
    Pull,
}

/// 쿼리 결과
pub struct QueryResult {
    keys: Arc<[String]>,
    cursor: SharedCursor,
    /// Pull 방식으로 받은 레코드 (수신 순서)
    fetched: Vec<Record>,
    /// `next()` 위치
    position: usize,
    consumption: Consumption,
}

impl QueryResult {
    pub(crate) fn new(cursor: ResultCursor) -> (Self, SharedCursor) {
        let keys = cursor.keys.clone();
        let cursor = Arc::new(Mutex::new(cursor));
        let result = Self {
            keys,
            cursor: cursor.clone(),
            fetched: Vec::new(),
            position: 0,
            consumption: Consumption::Untouched,
        };
        (result, cursor)
    }

    /// 컬럼 키
    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    /// 모든 레코드 (Pull)
    ///
    /// 처음 호출 시 스트림을 끝까지 읽어 버퍼링하고, 이후 호출은 같은 버퍼를
    /// 네트워크 읽기 없이 반환합니다.
    pub async fn records(&mut self) -> DriverResult<&[Record]> {
        self.consumption = Consumption::Pull;
        {
            let mut cursor = self.cursor.lock().await;
            let status = cursor.buffer_all().await;
            self.fetched.extend(cursor.pending.drain(..));
            status?;
        }
        Ok(&self.fetched)
    }

    /// 다음 레코드 (Pull, 점진적)
    pub async fn next(&mut self) -> Option<DriverResult<Record>> {
        self.consumption = Consumption::Pull;
        if let Some(record) = self.fetched.get(self.position) {
            self.position += 1;
            return Some(Ok(record.clone()));
        }

        let mut cursor = self.cursor.lock().await;
        match cursor.next_record().await {
            Some(Ok(record)) => {
                self.fetched.push(record.clone());
                self.position += 1;
                Some(Ok(record))
            }
            Some(Err(err)) => Some(Err(err)),
            None => match cursor.terminal_status() {
                Ok(()) => None,
                Err(err) => Some(Err(err)),
            },
        }
    }

    /// 정확히 한 개의 레코드
    pub async fn single(&mut self) -> DriverResult<Record> {
        let records = self.records().await?;
        match records {
            [record] => Ok(record.clone()),
            _ => Err(DriverError::result_consumed(format!(
                "Expected a single record, got {}",
                records.len()
            ))),
        }
    }

    /// 스트림을 끝까지 읽고 요약 반환 (레코드는 버퍼에 남음)
    pub async fn consume(&mut self) -> DriverResult<ResultSummary> {
        self.records().await?;
        self.cursor.lock().await.summary()
    }

    /// 결과 요약. `consume` 과 같습니다.
    pub async fn summary(&mut self) -> DriverResult<ResultSummary> {
        self.consume().await
    }

    /// 콜백으로 결과를 전달받습니다 (Push).
    ///
    /// 모든 레코드를 도착 순서대로 `on_next` 로 전달한 뒤, `on_completed` 또는
    /// `on_error` 중 정확히 하나를 한 번 호출합니다. Pull 방식으로 이미 읽은
    /// 결과에는 콜백 없이 `ResultConsumed` 에러를 반환합니다.
    pub async fn subscribe(self, subscriber: Subscriber) -> DriverResult<SubscriptionState> {
        self.ensure_untouched()?;

        let mut subscription = Subscription::new(subscriber);
        let mut cursor = self.cursor.lock().await;
        while !subscription.state.is_terminated() {
            match cursor.next_record().await {
                Some(Ok(record)) => subscription.next(record),
                Some(Err(err)) => subscription.error(err),
                None => match cursor.summary() {
                    Ok(summary) => subscription.complete(summary),
                    Err(err) => subscription.error(err),
                },
            }
        }
        Ok(subscription.state)
    }

    /// 비동기 레코드 스트림으로 변환합니다 (Push).
    pub fn into_stream(self) -> DriverResult<RecordStream> {
        self.ensure_untouched()?;
        Ok(RecordStream::from_cursor(self.keys.to_vec(), self.cursor))
    }

    fn ensure_untouched(&self) -> DriverResult<()> {
        match self.consumption {
            Consumption::Untouched => Ok(()),
            Consumption::Pull => Err(DriverError::result_consumed(
                "Result already consumed in pull mode",
            )),
        }
    }
}

impl ResultCursor {
    /// 스트림 방식 소비용 다음 항목. 종료 상태의 에러도 전달합니다.
    pub(crate) async fn next_item(&mut self) -> Option<DriverResult<Record>> {
        if let Some(item) = self.next_record().await {
            return Some(item);
        }
        if matches!(self.outcome, Some(Outcome::Discarded)) {
            // 한 번만 알림
            self.outcome = Some(Outcome::Failed(discarded_error()));
            return Some(Err(discarded_error()));
        }
        None
    }
}

impl std::fmt::Debug for QueryResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryResult")
            .field("keys", &self.keys)
            .field("fetched", &self.fetched.len())
            .field("consumption", &self.consumption)
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
