//! Transaction API
//!
//! 트랜잭션 관리. 한 트랜잭션은 세션 상태의 잠금을 소유하므로, 세션당 활성
//! 트랜잭션은 최대 하나입니다.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn};

use super::connection::QueryStream;
use super::error::{DriverError, DriverResult};
use super::result::{CursorHooks, FailureSlot, QueryResult, ResultCursor};
use super::session::{AccessMode, Bookmark, Query, SessionContext, SessionState};
use super::types::Value;

// ============================================================================
// TransactionConfig - 트랜잭션 설정
// ============================================================================

/// 트랜잭션 설정
#[derive(Debug, Clone, Default)]
pub struct TransactionConfig {
    /// 타임아웃
    pub timeout: Option<Duration>,
    /// 메타데이터
    pub metadata: HashMap<String, Value>,
}

impl TransactionConfig {
    /// 새 설정 생성
    pub fn new() -> Self {
        Self::default()
    }

    /// 타임아웃 설정
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// 메타데이터 추가
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

// ============================================================================
// TransactionState - 트랜잭션 상태
// ============================================================================

/// 트랜잭션 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// 활성 상태
    Active,
    /// 커밋됨
    Committed,
    /// 롤백됨
    RolledBack,
    /// 실패
    Failed,
}

impl TransactionState {
    /// 완료 상태 여부
    pub fn is_terminated(&self) -> bool {
        !matches!(self, Self::Active)
    }
}

impl std::fmt::Display for TransactionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Active => "active",
            Self::Committed => "committed",
            Self::RolledBack => "rolled back",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

// ============================================================================
// TxInner - 트랜잭션 본체 (내부)
// ============================================================================

pub(crate) struct TxInner {
    /// 세션 상태 잠금. 종료 상태에 도달하면 해제됩니다.
    session: Option<OwnedMutexGuard<SessionState>>,
    ctx: Arc<SessionContext>,
    state: TransactionState,
    queries: Vec<Query>,
    config: TransactionConfig,
    mode: AccessMode,
    /// 이 트랜잭션의 결과 스트림이 실패하면 기록됩니다.
    stream_failure: FailureSlot,
    /// Failed 로 만든 에러
    cause: Option<DriverError>,
}

impl TxInner {
    fn session_mut(&mut self) -> DriverResult<&mut SessionState> {
        self.session
            .as_deref_mut()
            .ok_or_else(|| DriverError::Internal("Transaction lost its session".into()))
    }

    /// 활성 상태 확인. 결과 스트림 실패를 여기서 반영합니다.
    async fn check_active(&mut self) -> DriverResult<()> {
        self.apply_stream_failure().await;
        match self.state {
            TransactionState::Active => Ok(()),
            state => Err(DriverError::TransactionTerminated(state)),
        }
    }

    /// 결과 스트림이 실패했으면 Failed 로 전이합니다.
    async fn apply_stream_failure(&mut self) {
        if self.state != TransactionState::Active {
            return;
        }
        let failure = self.stream_failure.lock().clone();
        if let Some(err) = failure {
            self.abort(err).await;
        }
    }

    async fn run(&mut self, query: Query) -> DriverResult<QueryResult> {
        self.check_active().await?;

        match self.send(&query).await {
            Ok(stream) => {
                let hooks = CursorHooks {
                    failure: Some(self.stream_failure.clone()),
                    bookmark: None,
                };
                let (result, cursor) =
                    QueryResult::new(ResultCursor::new(query.clone(), stream, hooks));
                self.session_mut()?.pending = Some(cursor);
                self.queries.push(query);
                Ok(result)
            }
            Err(err) => {
                self.abort(err.clone()).await;
                Err(err)
            }
        }
    }

    async fn send(&mut self, query: &Query) -> DriverResult<QueryStream> {
        let options = self.ctx.run_options(self.mode, Vec::new());
        let session = self.session_mut()?;
        session.flush_pending().await?;
        session.held()?.run(query, &options).await
    }

    async fn commit(&mut self) -> DriverResult<()> {
        self.check_active().await?;

        match self.send_commit().await {
            Ok(bookmark) => {
                self.state = TransactionState::Committed;
                debug!(queries = self.queries.len(), "Transaction committed");
                if let Some(bookmark) = bookmark {
                    self.ctx.record_bookmark(bookmark);
                }
                self.finish().await;
                Ok(())
            }
            Err(err) => {
                self.abort(err.clone()).await;
                Err(err)
            }
        }
    }

    async fn send_commit(&mut self) -> DriverResult<Option<Bookmark>> {
        let session = self.session_mut()?;
        session.flush_pending().await?;
        session.held()?.commit().await
    }

    async fn rollback(&mut self) -> DriverResult<()> {
        // 실패한 스트림이 있으면 RolledBack 이 아니라 Failed 로 끝남
        self.apply_stream_failure().await;
        match self.state {
            TransactionState::Active => {
                if let Some(session) = self.session.as_deref_mut() {
                    session.rollback_quietly().await;
                }
                self.state = TransactionState::RolledBack;
                debug!(queries = self.queries.len(), "Transaction rolled back");
                self.finish().await;
                Ok(())
            }
            // 실패 시점에 이미 롤백됨
            TransactionState::Failed => Ok(()),
            state => Err(DriverError::TransactionTerminated(state)),
        }
    }

    /// Failed 로 전이하고 best-effort 롤백 후 세션을 놓아 줍니다.
    async fn abort(&mut self, err: DriverError) {
        self.state = TransactionState::Failed;
        if let Some(session) = self.session.as_deref_mut() {
            if err.invalidates_connection() {
                session.invalidate().await;
            } else {
                session.rollback_quietly().await;
            }
        }
        debug!(error = %err, "Transaction failed");
        self.cause = Some(err);
        self.finish().await;
    }

    /// 세션 잠금 해제
    async fn finish(&mut self) {
        // 잠금 해제 전에 표시를 지워야 다음 트랜잭션의 표시를 덮지 않음
        self.ctx.clear_transaction();
        if let Some(mut session) = self.session.take() {
            session.pending = None;
            if !self.ctx.is_open() {
                session.release(&self.ctx).await;
            }
        }
    }

    fn effective_state(&self) -> TransactionState {
        if self.state == TransactionState::Active && self.stream_failure.lock().is_some() {
            TransactionState::Failed
        } else {
            self.state
        }
    }
}

impl Drop for TxInner {
    fn drop(&mut self) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        self.ctx.clear_transaction();
        if self.state == TransactionState::Active {
            debug!("Transaction dropped while active, rollback deferred");
            session.rollback_pending = true;
        }
        if !self.ctx.is_open() {
            session.pending = None;
            session.rollback_pending = false;
            if let Some(connection) = session.take_reusable_connection() {
                self.ctx.provider.release(connection);
            }
        }
    }
}

pub(crate) type SharedTx = Arc<Mutex<TxInner>>;

// ============================================================================
// Transaction - 명시적 트랜잭션
// ============================================================================

/// 명시적 트랜잭션
///
/// 커밋하거나 롤백하지 않고 버리면, 세션이 다음 작업 전에 롤백을 보냅니다.
pub struct Transaction {
    inner: SharedTx,
}

impl Transaction {
    pub(crate) fn new(
        session: OwnedMutexGuard<SessionState>,
        ctx: Arc<SessionContext>,
        config: TransactionConfig,
        mode: AccessMode,
    ) -> Self {
        let inner = TxInner {
            session: Some(session),
            ctx,
            state: TransactionState::Active,
            queries: Vec::new(),
            config,
            mode,
            stream_failure: FailureSlot::default(),
            cause: None,
        };
        Self {
            inner: Arc::new(Mutex::new(inner)),
        }
    }

    pub(crate) fn shared(&self) -> &SharedTx {
        &self.inner
    }

    /// 쿼리 실행
    pub async fn run(
        &self,
        query: impl Into<Query>,
        params: Option<HashMap<String, Value>>,
    ) -> DriverResult<QueryResult> {
        let mut query = query.into();
        if let Some(p) = params {
            query = query.with_params(p);
        }
        self.inner.lock().await.run(query).await
    }

    /// 커밋
    ///
    /// 아직 읽지 않은 결과는 커밋 전에 버퍼링되어 이후에도 읽을 수 있습니다.
    pub async fn commit(&self) -> DriverResult<()> {
        self.inner.lock().await.commit().await
    }

    /// 롤백. 네트워크 실패는 로그로 남기고 무시합니다.
    pub async fn rollback(&self) -> DriverResult<()> {
        self.inner.lock().await.rollback().await
    }

    /// 트랜잭션 닫기 (활성 상태면 롤백)
    pub async fn close(&self) -> DriverResult<()> {
        let mut inner = self.inner.lock().await;
        inner.apply_stream_failure().await;
        if inner.state.is_terminated() {
            return Ok(());
        }
        inner.rollback().await
    }

    /// 트랜잭션 상태
    pub async fn state(&self) -> TransactionState {
        self.inner.lock().await.effective_state()
    }

    /// 실행한 쿼리들 (순서대로)
    pub async fn queries(&self) -> Vec<Query> {
        self.inner.lock().await.queries.clone()
    }

    /// 설정
    pub async fn config(&self) -> TransactionConfig {
        self.inner.lock().await.config.clone()
    }

    /// 접근 모드
    pub async fn access_mode(&self) -> AccessMode {
        self.inner.lock().await.mode
    }

    /// 관리 트랜잭션 핸들
    pub(crate) fn managed(&self) -> ManagedTransaction {
        ManagedTransaction {
            inner: self.inner.clone(),
        }
    }

    /// 트랜잭션을 실패시킨 에러
    pub(crate) async fn failure_cause(&self) -> Option<DriverError> {
        let inner = self.inner.lock().await;
        inner
            .cause
            .clone()
            .or_else(|| inner.stream_failure.lock().clone())
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.try_lock().map(|inner| inner.effective_state()).ok();
        f.debug_struct("Transaction").field("state", &state).finish()
    }
}

/// 세션이 닫힐 때 열린 트랜잭션을 롤백합니다.
pub(crate) async fn rollback_for_close(tx: SharedTx) {
    let mut inner = tx.lock().await;
    if inner.state == TransactionState::Active {
        if let Err(err) = inner.rollback().await {
            warn!(error = %err, "Rollback on session close failed");
        }
    }
}

// ============================================================================
// ManagedTransaction - 관리 트랜잭션
// ============================================================================

/// 트랜잭션 함수에 전달되는 핸들
///
/// 쿼리만 실행할 수 있습니다. 커밋과 롤백은 재시도 실행기가 담당합니다.
#[derive(Clone)]
pub struct ManagedTransaction {
    inner: SharedTx,
}

impl ManagedTransaction {
    /// 쿼리 실행
    pub async fn run(
        &self,
        query: impl Into<Query>,
        params: Option<HashMap<String, Value>>,
    ) -> DriverResult<QueryResult> {
        let mut query = query.into();
        if let Some(p) = params {
            query = query.with_params(p);
        }
        self.inner.lock().await.run(query).await
    }
}

impl std::fmt::Debug for ManagedTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedTransaction").finish_non_exhaustive()
    }
}

// ============================================================================
// Tests
// ============================================================================
