//! Session Management
//!
//! 세션 관리. 세션은 연결 하나를 지연 획득하여 수명 동안 유지하고,
//! auto-commit 쿼리, 명시적 트랜잭션, 재시도되는 관리 트랜잭션을 제공합니다.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex as SyncMutex, RwLock};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn};

use super::connection::{Connection, ConnectionProvider, RunOptions};
use super::driver::{DriverConfig, DEFAULT_FETCH_SIZE};
use super::error::{DriverError, DriverResult};
use super::result::{CursorHooks, FailureSlot, QueryResult, ResultCursor, SharedCursor};
use super::retry::RetryExecutor;
use super::transaction::{
    rollback_for_close, ManagedTransaction, SharedTx, Transaction, TransactionConfig, TxInner,
};
use super::types::Value;

// ============================================================================
// AccessMode - 접근 모드
// ============================================================================

/// 접근 모드
///
/// 기본값은 `Write` 입니다. 세션 설정과 요청 옵션 모두 이 기본값을 씁니다.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccessMode {
    /// 읽기
    Read,
    /// 쓰기
    #[default]
    Write,
}

// ============================================================================
// Bookmark - 북마크
// ============================================================================

/// 인과적 일관성 북마크
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Bookmark {
    /// 북마크 값
    value: String,
}

impl Bookmark {
    /// 새 북마크 생성
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
        }
    }

    /// 북마크 값
    pub fn value(&self) -> &str {
        &self.value
    }

    /// 빈 북마크 여부
    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }

    /// 여러 북마크 중 가장 최신
    pub fn latest(bookmarks: &[Bookmark]) -> Option<Bookmark> {
        bookmarks.iter().rev().find(|b| !b.is_empty()).cloned()
    }
}

impl std::fmt::Display for Bookmark {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.value)
    }
}

impl From<String> for Bookmark {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl From<&str> for Bookmark {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

// ============================================================================
// SessionConfig - 세션 설정
// ============================================================================

/// 세션 설정
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// 데이터베이스 이름
    pub database: Option<String>,
    /// Fetch Size. `None` 이면 드라이버 설정을 따릅니다.
    pub fetch_size: Option<usize>,
    /// 기본 접근 모드 (auto-commit, begin_transaction)
    pub default_access_mode: AccessMode,
    /// 초기 북마크
    pub bookmarks: Vec<Bookmark>,
    /// 임퍼손트 사용자
    pub impersonated_user: Option<String>,
}

impl SessionConfig {
    /// 새 설정 생성
    pub fn new() -> Self {
        Self::default()
    }

    /// 빌더 시작
    pub fn builder() -> SessionConfigBuilder {
        SessionConfigBuilder::new()
    }

    /// 데이터베이스 설정
    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    /// Fetch Size 설정
    pub fn with_fetch_size(mut self, size: usize) -> Self {
        self.fetch_size = Some(size);
        self
    }

    /// 접근 모드 설정
    pub fn with_access_mode(mut self, mode: AccessMode) -> Self {
        self.default_access_mode = mode;
        self
    }

    /// 북마크 설정
    pub fn with_bookmarks(mut self, bookmarks: Vec<Bookmark>) -> Self {
        self.bookmarks = bookmarks;
        self
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            database: None,
            fetch_size: None,
            default_access_mode: AccessMode::default(),
            bookmarks: Vec::new(),
            impersonated_user: None,
        }
    }
}

// ============================================================================
// SessionConfigBuilder - 세션 설정 빌더
// ============================================================================

/// 세션 설정 빌더
#[derive(Debug, Default)]
pub struct SessionConfigBuilder {
    config: SessionConfig,
}

impl SessionConfigBuilder {
    /// 새 빌더 생성
    pub fn new() -> Self {
        Self::default()
    }

    /// 데이터베이스 설정
    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.config.database = Some(database.into());
        self
    }

    /// Fetch Size 설정
    pub fn with_fetch_size(mut self, size: usize) -> Self {
        self.config.fetch_size = Some(size);
        self
    }

    /// 읽기 모드로 설정
    pub fn with_read_access(mut self) -> Self {
        self.config.default_access_mode = AccessMode::Read;
        self
    }

    /// 쓰기 모드로 설정
    pub fn with_write_access(mut self) -> Self {
        self.config.default_access_mode = AccessMode::Write;
        self
    }

    /// 북마크 설정
    pub fn with_bookmarks(mut self, bookmarks: Vec<Bookmark>) -> Self {
        self.config.bookmarks = bookmarks;
        self
    }

    /// 북마크 추가
    pub fn with_bookmark(mut self, bookmark: Bookmark) -> Self {
        self.config.bookmarks.push(bookmark);
        self
    }

    /// 임퍼손트 사용자 설정
    pub fn with_impersonated_user(mut self, user: impl Into<String>) -> Self {
        self.config.impersonated_user = Some(user.into());
        self
    }

    /// 빌드
    pub fn build(self) -> SessionConfig {
        self.config
    }
}

// ============================================================================
// Query - 쿼리
// ============================================================================

/// 쿼리
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    /// 쿼리 텍스트
    pub text: String,
    /// 파라미터
    pub parameters: HashMap<String, Value>,
}

impl Query {
    /// 새 쿼리 생성
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            parameters: HashMap::new(),
        }
    }

    /// 파라미터 추가
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    /// 파라미터들 추가
    pub fn with_params(mut self, params: HashMap<String, Value>) -> Self {
        self.parameters.extend(params);
        self
    }
}

impl From<&str> for Query {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for Query {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

// ============================================================================
// SessionContext - 세션과 트랜잭션이 공유하는 부분 (내부)
// ============================================================================

pub(crate) struct SessionContext {
    pub(crate) provider: Arc<dyn ConnectionProvider>,
    config: SessionConfig,
    acquisition_timeout: Duration,
    last_bookmark: Arc<RwLock<Option<Bookmark>>>,
    open: RwLock<bool>,
    /// 명시적/관리 트랜잭션이 세션 잠금을 쥐고 있는지
    tx_open: AtomicBool,
    active_tx: SyncMutex<Weak<Mutex<TxInner>>>,
}

impl SessionContext {
    pub(crate) fn is_open(&self) -> bool {
        *self.open.read()
    }

    /// 요청에 실을 북마크: 초기 북마크 + 마지막 북마크
    fn bookmarks(&self) -> Vec<Bookmark> {
        let mut bookmarks = self.config.bookmarks.clone();
        if let Some(bookmark) = self.last_bookmark.read().clone() {
            bookmarks.push(bookmark);
        }
        bookmarks
    }

    pub(crate) fn run_options(&self, mode: AccessMode, bookmarks: Vec<Bookmark>) -> RunOptions {
        RunOptions {
            database: self.config.database.clone(),
            mode,
            bookmarks,
            fetch_size: self.config.fetch_size.unwrap_or(DEFAULT_FETCH_SIZE),
            impersonated_user: self.config.impersonated_user.clone(),
        }
    }

    pub(crate) fn record_bookmark(&self, bookmark: Bookmark) {
        *self.last_bookmark.write() = Some(bookmark);
    }

    fn register_transaction(&self, tx: &SharedTx) {
        self.tx_open.store(true, Ordering::SeqCst);
        *self.active_tx.lock() = Arc::downgrade(tx);
    }

    pub(crate) fn clear_transaction(&self) {
        self.tx_open.store(false, Ordering::SeqCst);
        *self.active_tx.lock() = Weak::new();
    }
}

// ============================================================================
// SessionState - 세션 잠금 아래의 상태 (내부)
// ============================================================================

/// 세션이 쥔 연결과 그 위의 진행 중 작업
#[derive(Default)]
pub(crate) struct SessionState {
    pub(crate) connection: Option<Box<dyn Connection>>,
    mode: AccessMode,
    /// 연결에서 아직 다 읽지 않은 마지막 결과
    pub(crate) pending: Option<SharedCursor>,
    /// 버려진 트랜잭션의 롤백이 아직 전송되지 않음
    pub(crate) rollback_pending: bool,
    /// auto-commit 결과 스트림의 실패
    stream_failure: FailureSlot,
}

impl SessionState {
    /// 요청을 보낼 준비가 된 연결
    ///
    /// 미뤄진 롤백을 보내거나 이전 결과를 버퍼링한 뒤, 필요하면 연결을
    /// 새로 획득합니다.
    async fn acquire(
        &mut self,
        ctx: &SessionContext,
        mode: AccessMode,
    ) -> DriverResult<&mut Box<dyn Connection>> {
        if self.rollback_pending {
            self.rollback_quietly().await;
        } else if let Err(err) = self.flush_pending().await {
            debug!(error = %err, "Previous result failed while buffering");
        }
        self.drop_broken_connection().await;

        let reusable = match &self.connection {
            Some(connection) => connection.is_open() && self.mode == mode,
            None => false,
        };
        if !reusable {
            if let Some(connection) = self.connection.take() {
                if connection.is_open() {
                    ctx.provider.release(connection);
                }
            }
            let acquired =
                tokio::time::timeout(ctx.acquisition_timeout, ctx.provider.acquire(mode)).await;
            let connection = match acquired {
                Ok(connection) => connection?,
                Err(_) => {
                    return Err(DriverError::timeout(format!(
                        "Connection acquisition timed out after {:?}",
                        ctx.acquisition_timeout
                    )))
                }
            };
            debug!(?mode, "Connection acquired");
            self.connection = Some(connection);
            self.mode = mode;
        }

        self.held()
    }

    /// 현재 쥔 연결
    pub(crate) fn held(&mut self) -> DriverResult<&mut Box<dyn Connection>> {
        self.connection
            .as_mut()
            .ok_or_else(|| DriverError::connection("No connection held by the session"))
    }

    /// 이전 결과를 끝까지 버퍼링 (한 연결에 요청은 하나씩)
    pub(crate) async fn flush_pending(&mut self) -> DriverResult<()> {
        match self.pending.take() {
            Some(cursor) => cursor.lock().await.buffer_all().await,
            None => Ok(()),
        }
    }

    /// auto-commit 스트림이 연결을 못 쓰게 만드는 에러로 끝났으면 연결을 버립니다.
    async fn drop_broken_connection(&mut self) {
        let failure = self.stream_failure.lock().take();
        if let Some(err) = failure {
            if err.invalidates_connection() {
                warn!(error = %err, "Result stream broke the connection");
                self.invalidate().await;
            }
        }
    }

    /// 동기 경로용. 깨진 연결이면 닫지 않고 그냥 버립니다.
    pub(crate) fn take_reusable_connection(&mut self) -> Option<Box<dyn Connection>> {
        let broken = self
            .stream_failure
            .lock()
            .take()
            .is_some_and(|err| err.invalidates_connection());
        let connection = self.connection.take()?;
        if broken {
            None
        } else {
            Some(connection)
        }
    }

    async fn discard_pending(&mut self) {
        if let Some(cursor) = self.pending.take() {
            cursor.lock().await.discard();
        }
    }

    /// Best-effort 롤백. 실패는 로그만 남깁니다.
    pub(crate) async fn rollback_quietly(&mut self) {
        self.discard_pending().await;
        self.rollback_pending = false;

        let Some(connection) = self.connection.as_mut() else {
            return;
        };
        if let Err(err) = connection.rollback().await {
            warn!(error = %err, "Rollback failed, ignoring");
            if err.invalidates_connection() {
                self.invalidate().await;
            }
        }
    }

    /// 깨진 연결을 닫고 버립니다. 다음 작업에서 새로 획득합니다.
    pub(crate) async fn invalidate(&mut self) {
        self.discard_pending().await;
        self.rollback_pending = false;
        if let Some(mut connection) = self.connection.take() {
            debug!("Invalidating connection");
            if let Err(err) = connection.close().await {
                debug!(error = %err, "Closing invalidated connection failed");
            }
        }
    }

    /// 연결을 제공자에게 돌려줍니다.
    pub(crate) async fn release(&mut self, ctx: &SessionContext) {
        if self.rollback_pending {
            self.rollback_quietly().await;
        } else {
            self.discard_pending().await;
        }
        self.drop_broken_connection().await;
        if let Some(connection) = self.connection.take() {
            debug!("Releasing connection");
            ctx.provider.release(connection);
        }
    }
}

// ============================================================================
// Session - 세션
// ============================================================================

/// 데이터베이스 세션
///
/// 동시에 한 작업만 허용합니다. 다른 작업이 진행 중이면 `ConcurrentAccess`,
/// 트랜잭션이 열려 있으면 `TransactionAlreadyOpen` 으로 즉시 실패합니다.
pub struct Session {
    ctx: Arc<SessionContext>,
    state: Arc<Mutex<SessionState>>,
    retry: RetryExecutor,
}

impl Session {
    /// 새 세션 생성
    pub fn new(
        provider: Arc<dyn ConnectionProvider>,
        driver_config: &DriverConfig,
        mut config: SessionConfig,
    ) -> Self {
        config.fetch_size.get_or_insert(driver_config.fetch_size);
        let ctx = SessionContext {
            provider,
            config,
            acquisition_timeout: driver_config.connection_acquisition_timeout,
            last_bookmark: Arc::new(RwLock::new(None)),
            open: RwLock::new(true),
            tx_open: AtomicBool::new(false),
            active_tx: SyncMutex::new(Weak::new()),
        };
        Self {
            ctx: Arc::new(ctx),
            state: Arc::new(Mutex::new(SessionState::default())),
            retry: RetryExecutor::new(driver_config.retry_policy()),
        }
    }

    /// 쿼리 실행 (auto-commit)
    pub async fn run(
        &self,
        query: impl Into<Query>,
        params: Option<HashMap<String, Value>>,
    ) -> DriverResult<QueryResult> {
        self.ensure_open()?;

        let mut query = query.into();
        if let Some(p) = params {
            query = query.with_params(p);
        }

        let mut state = self.lock_state()?;
        let mode = self.ctx.config.default_access_mode;
        let options = self.ctx.run_options(mode, self.ctx.bookmarks());

        let sent = match state.acquire(&self.ctx, mode).await {
            Ok(connection) => connection.run(&query, &options).await,
            Err(err) => Err(err),
        };

        match sent {
            Ok(stream) => {
                let hooks = CursorHooks {
                    failure: Some(state.stream_failure.clone()),
                    bookmark: Some(self.ctx.last_bookmark.clone()),
                };
                let (result, cursor) = QueryResult::new(ResultCursor::new(query, stream, hooks));
                state.pending = Some(cursor);
                Ok(result)
            }
            Err(err) => {
                if err.invalidates_connection() {
                    state.invalidate().await;
                }
                Err(err)
            }
        }
    }

    /// 트랜잭션 시작
    pub async fn begin_transaction(
        &self,
        config: Option<TransactionConfig>,
    ) -> DriverResult<Transaction> {
        self.begin(self.ctx.config.default_access_mode, config.unwrap_or_default())
            .await
    }

    /// 읽기 트랜잭션 함수
    pub async fn read_transaction<F, Fut, T>(&self, work: F) -> DriverResult<T>
    where
        F: FnMut(ManagedTransaction) -> Fut,
        Fut: Future<Output = DriverResult<T>>,
    {
        self.execute_transaction(AccessMode::Read, TransactionConfig::default(), work)
            .await
    }

    /// 쓰기 트랜잭션 함수
    pub async fn write_transaction<F, Fut, T>(&self, work: F) -> DriverResult<T>
    where
        F: FnMut(ManagedTransaction) -> Fut,
        Fut: Future<Output = DriverResult<T>>,
    {
        self.execute_transaction(AccessMode::Write, TransactionConfig::default(), work)
            .await
    }

    /// 트랜잭션 함수 실행 (재시도 포함)
    ///
    /// 시도마다 새 트랜잭션을 열고 `work` 를 실행한 뒤 커밋합니다. 실패하면
    /// 롤백하고, 일시적 에러이면 시간 예산 안에서 다시 시도합니다.
    pub async fn execute_transaction<F, Fut, T>(
        &self,
        mode: AccessMode,
        config: TransactionConfig,
        mut work: F,
    ) -> DriverResult<T>
    where
        F: FnMut(ManagedTransaction) -> Fut,
        Fut: Future<Output = DriverResult<T>>,
    {
        self.ensure_open()?;

        let mut retry = self.retry.start();
        loop {
            match self.attempt(mode, &config, &mut work).await {
                Ok(value) => return Ok(value),
                Err(err) => self.retry.backoff(&mut retry, err).await?,
            }
        }
    }

    /// 한 번의 시도
    async fn attempt<F, Fut, T>(
        &self,
        mode: AccessMode,
        config: &TransactionConfig,
        work: &mut F,
    ) -> DriverResult<T>
    where
        F: FnMut(ManagedTransaction) -> Fut,
        Fut: Future<Output = DriverResult<T>>,
    {
        let tx = self.begin(mode, config.clone()).await?;

        let outcome = match work(tx.managed()).await {
            Ok(value) => tx.commit().await.map(|_| value),
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    debug!(error = %rollback_err, "Rollback after failed work skipped");
                }
                Err(err)
            }
        };

        match outcome {
            // 스트림 실패로 끝난 경우 원래 에러로 분류
            Err(err @ DriverError::TransactionTerminated(_)) => {
                Err(tx.failure_cause().await.unwrap_or(err))
            }
            other => other,
        }
    }

    async fn begin(&self, mode: AccessMode, config: TransactionConfig) -> DriverResult<Transaction> {
        self.ensure_open()?;

        let mut state = self.lock_state()?;
        let options = self.ctx.run_options(mode, self.ctx.bookmarks());

        let begun = match state.acquire(&self.ctx, mode).await {
            Ok(connection) => connection.begin(&options, &config).await,
            Err(err) => Err(err),
        };
        if let Err(err) = begun {
            if err.invalidates_connection() {
                state.invalidate().await;
            }
            return Err(err);
        }

        debug!(?mode, "Transaction started");
        let tx = Transaction::new(state, self.ctx.clone(), config, mode);
        self.ctx.register_transaction(tx.shared());
        Ok(tx)
    }

    /// 세션 상태 잠금 (대기하지 않음)
    fn lock_state(&self) -> DriverResult<OwnedMutexGuard<SessionState>> {
        self.state.clone().try_lock_owned().map_err(|_| {
            if self.ctx.tx_open.load(Ordering::SeqCst) {
                DriverError::TransactionAlreadyOpen
            } else {
                DriverError::ConcurrentAccess
            }
        })
    }

    /// 마지막 북마크
    pub fn last_bookmark(&self) -> Option<Bookmark> {
        self.ctx.last_bookmark.read().clone()
    }

    /// 모든 북마크
    pub fn last_bookmarks(&self) -> Vec<Bookmark> {
        self.ctx.bookmarks()
    }

    /// 세션 닫기
    ///
    /// 열린 트랜잭션을 롤백하고, 읽지 않은 결과를 버리고, 연결을 돌려주며,
    /// 진행 중인 재시도 루프를 취소합니다. 여러 번 호출해도 안전합니다.
    pub async fn close(&self) -> DriverResult<()> {
        {
            let mut open = self.ctx.open.write();
            if !*open {
                return Ok(());
            }
            *open = false;
        }
        self.retry.cancel();

        let active = self.ctx.active_tx.lock().upgrade();
        if let Some(tx) = active {
            rollback_for_close(tx).await;
        }

        if let Ok(mut state) = self.state.clone().try_lock_owned() {
            state.release(&self.ctx).await;
        }
        debug!("Session closed");
        Ok(())
    }

    /// 열린 상태 여부
    pub fn is_open(&self) -> bool {
        self.ctx.is_open()
    }

    /// 열린 상태 확인
    fn ensure_open(&self) -> DriverResult<()> {
        if self.ctx.is_open() {
            Ok(())
        } else {
            Err(DriverError::SessionClosed)
        }
    }

    /// 세션 설정
    pub fn config(&self) -> &SessionConfig {
        &self.ctx.config
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        // 남은 트랜잭션은 자신이 버려질 때 연결을 돌려줌
        *self.ctx.open.write() = false;
        self.retry.cancel();
        if let Ok(mut state) = self.state.try_lock() {
            if let Some(connection) = state.take_reusable_connection() {
                self.ctx.provider.release(connection);
            }
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("database", &self.ctx.config.database)
            .field("open", &self.ctx.is_open())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
