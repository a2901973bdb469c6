//! Retrying Executor
//!
//! 관리 트랜잭션 재시도. 일시적(Transient) 에러만 재시도하며, 지수 백오프와
//! 지터를 적용하고 전체 시간 예산을 넘기면 `RetryExhausted` 로 실패합니다.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::classify::ErrorClassification;
use super::error::{DriverError, DriverResult};

// ============================================================================
// RetryPolicy - 재시도 정책
// ============================================================================

/// 재시도 정책
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// 전체 재시도 시간 예산
    pub max_retry_time: Duration,
    /// 첫 대기 시간
    pub initial_delay: Duration,
    /// 대기 시간 배수
    pub multiplier: f64,
    /// 지터 비율 (0.2 = ±20%)
    pub jitter: f64,
    /// 최대 대기 시간
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retry_time: Duration::from_secs(30),
            initial_delay: Duration::from_secs(1),
            multiplier: 2.0,
            jitter: 0.2,
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// 시간 예산으로 생성
    pub fn new(max_retry_time: Duration) -> Self {
        Self {
            max_retry_time,
            ..Self::default()
        }
    }

    /// 첫 대기 시간 설정
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// 배수 설정
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// 지터 비율 설정
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    /// 최대 대기 시간 설정
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// `failures` 번째 실패 후 대기 시간. `remaining` 을 넘지 않습니다.
    pub fn delay_for(&self, failures: u32, remaining: Duration) -> Duration {
        let exponent = failures.saturating_sub(1).min(i32::MAX as u32) as i32;
        let base = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = base.min(self.max_delay.as_secs_f64());

        let jitter = self.jitter.clamp(0.0, 1.0);
        let factor = if jitter > 0.0 {
            1.0 + rand::thread_rng().gen_range(-jitter..=jitter)
        } else {
            1.0
        };

        let delay = Duration::try_from_secs_f64(capped * factor).unwrap_or(self.max_delay);
        delay.min(self.max_delay).min(remaining)
    }
}

// ============================================================================
// RetryContext - 재시도 진행 상태
// ============================================================================

/// 한 번의 재시도 루프 상태
#[derive(Debug, Clone)]
pub struct RetryContext {
    start: Instant,
    max_retry_time: Duration,
    attempts: u32,
    last_error: Option<DriverError>,
}

impl RetryContext {
    fn new(max_retry_time: Duration) -> Self {
        Self {
            start: Instant::now(),
            max_retry_time,
            attempts: 0,
            last_error: None,
        }
    }

    /// 시작 시각
    pub fn start(&self) -> Instant {
        self.start
    }

    /// 마감 시각. 시간 예산이 표현 가능한 범위를 넘으면 `None` (마감 없음).
    pub fn deadline(&self) -> Option<Instant> {
        self.start.checked_add(self.max_retry_time)
    }

    /// 끝난 시도 횟수
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// 마지막 에러
    pub fn last_error(&self) -> Option<&DriverError> {
        self.last_error.as_ref()
    }

    /// 경과 시간
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// 마감까지 남은 시간
    pub fn remaining(&self) -> Duration {
        match self.deadline() {
            Some(deadline) => deadline.saturating_duration_since(Instant::now()),
            None => Duration::MAX,
        }
    }
}

// ============================================================================
// RetryExecutor - 재시도 실행기
// ============================================================================

/// 재시도 실행기
///
/// 취소 토큰이 취소되면 진행 중인 시도가 끝난 뒤, 또는 대기 중 즉시
/// `Cancelled` 로 실패합니다.
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    policy: RetryPolicy,
    cancel: CancellationToken,
}

impl RetryExecutor {
    /// 새 실행기 생성
    pub fn new(policy: RetryPolicy) -> Self {
        Self::with_cancellation(policy, CancellationToken::new())
    }

    /// 외부 취소 토큰과 함께 생성
    pub fn with_cancellation(policy: RetryPolicy, cancel: CancellationToken) -> Self {
        Self { policy, cancel }
    }

    /// 정책
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// 취소
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// 취소 여부
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// 새 재시도 루프 시작
    pub fn start(&self) -> RetryContext {
        RetryContext::new(self.policy.max_retry_time)
    }

    /// 실패한 시도 처리
    ///
    /// 재시도해야 하면 백오프 만큼 기다린 뒤 `Ok(())`, 아니면 최종 에러를
    /// 반환합니다. 마감은 매 시도 후 다시 확인합니다.
    pub async fn backoff(&self, ctx: &mut RetryContext, err: DriverError) -> DriverResult<()> {
        ctx.attempts += 1;

        if self.cancel.is_cancelled() {
            return Err(DriverError::cancelled("Retry loop cancelled", Some(err)));
        }

        let classification = err.classification();
        if classification != ErrorClassification::Transient {
            debug!(attempt = ctx.attempts, %classification, error = %err, "Not retrying");
            return Err(err);
        }

        let remaining = ctx.remaining();
        if remaining.is_zero() {
            warn!(attempts = ctx.attempts, error = %err, "Retry time exhausted");
            return Err(DriverError::RetryExhausted {
                attempts: ctx.attempts,
                elapsed: ctx.elapsed(),
                source: Box::new(err),
            });
        }

        let delay = self.policy.delay_for(ctx.attempts, remaining);
        warn!(attempt = ctx.attempts, ?delay, error = %err, "Transient failure, retrying");
        ctx.last_error = Some(err);

        tokio::select! {
            _ = self.cancel.cancelled() => {
                Err(DriverError::cancelled("Retry loop cancelled", ctx.last_error.take()))
            }
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }

    /// `attempt` 를 성공하거나 최종 실패할 때까지 반복합니다.
    ///
    /// `attempt` 는 1부터 시작하는 시도 번호를 받습니다.
    pub async fn run<F, Fut, T>(&self, mut attempt: F) -> DriverResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = DriverResult<T>>,
    {
        let mut ctx = self.start();
        loop {
            match attempt(ctx.attempts + 1).await {
                Ok(value) => return Ok(value),
                Err(err) => self.backoff(&mut ctx, err).await?,
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use super::*;

    fn deadlock() -> DriverError {
        DriverError::server(
            "Neo.TransientError.Transaction.DeadlockDetected",
            "Deadlock detected",
        )
    }

    #[test]
    fn test_default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retry_time, Duration::from_secs(30));
        assert_eq!(policy.initial_delay, Duration::from_secs(1));
        assert_eq!(policy.multiplier, 2.0);
        assert_eq!(policy.jitter, 0.2);
        assert_eq!(policy.max_delay, Duration::from_secs(5));
    }

    #[test]
    fn test_delay_grows_and_caps() {
        let policy = RetryPolicy::default().with_jitter(0.0);
        let plenty = Duration::from_secs(60);

        assert_eq!(policy.delay_for(1, plenty), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2, plenty), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3, plenty), Duration::from_secs(4));
        assert_eq!(policy.delay_for(4, plenty), Duration::from_secs(5));
        assert_eq!(policy.delay_for(40, plenty), Duration::from_secs(5));
    }

    #[test]
    fn test_delay_jitter_bounds() {
        let policy = RetryPolicy::default();
        for _ in 0..100 {
            let delay = policy.delay_for(2, Duration::from_secs(60));
            assert!(delay >= Duration::from_millis(1600));
            assert!(delay <= Duration::from_millis(2400));
        }
    }

    #[test]
    fn test_delay_clamped_to_remaining() {
        let policy = RetryPolicy::default();
        let delay = policy.delay_for(3, Duration::from_millis(300));
        assert_eq!(delay, Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_then_success() {
        let executor = RetryExecutor::new(RetryPolicy::default());
        let calls = Arc::new(AtomicU32::new(0));

        let value = executor
            .run(|_| {
                let calls = calls.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 3 {
                        Err(deadlock())
                    } else {
                        Ok(42)
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(value, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_error_is_not_retried() {
        let executor = RetryExecutor::new(RetryPolicy::default());
        let calls = Arc::new(AtomicU32::new(0));

        let err = executor
            .run(|_| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(DriverError::server(
                        "Neo.ClientError.Statement.SyntaxError",
                        "Invalid input",
                    ))
                }
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(err.code(), Some("Neo.ClientError.Statement.SyntaxError"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausts_after_deadline() {
        let executor = RetryExecutor::new(RetryPolicy::new(Duration::from_secs(10)));
        let start = Instant::now();

        let err = executor
            .run(|_| async { Err::<(), _>(deadlock()) })
            .await
            .unwrap_err();

        assert!(start.elapsed() >= Duration::from_secs(10));
        match err {
            DriverError::RetryExhausted {
                attempts, source, ..
            } => {
                assert!(attempts >= 2);
                assert_eq!(
                    source.code(),
                    Some("Neo.TransientError.Transaction.DeadlockDetected")
                );
            }
            other => panic!("Expected RetryExhausted, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_budget_has_no_deadline() {
        let executor = RetryExecutor::new(RetryPolicy::new(Duration::MAX));
        let ctx = executor.start();
        assert!(ctx.deadline().is_none());
        assert_eq!(ctx.remaining(), Duration::MAX);

        let calls = Arc::new(AtomicU32::new(0));
        let value = executor
            .run(|_| {
                let calls = calls.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(deadlock())
                    } else {
                        Ok("done")
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(value, "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_budget_runs_once() {
        let executor = RetryExecutor::new(RetryPolicy::new(Duration::ZERO));
        let calls = Arc::new(AtomicU32::new(0));

        let err = executor
            .run(|_| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(deadlock())
                }
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(err, DriverError::RetryExhausted { attempts: 1, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_backoff() {
        let executor = RetryExecutor::new(RetryPolicy::default());
        let canceller = executor.clone();

        let (result, _) = tokio::join!(
            executor.run(|_| async { Err::<(), _>(deadlock()) }),
            async move {
                tokio::time::sleep(Duration::from_millis(500)).await;
                canceller.cancel();
            }
        );

        match result.unwrap_err() {
            DriverError::Cancelled { last_error, .. } => {
                let last = last_error.expect("last error kept");
                assert!(last.is_retryable());
            }
            other => panic!("Expected Cancelled, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_attempt_numbers() {
        let executor = RetryExecutor::new(RetryPolicy::default().with_initial_delay(Duration::ZERO));
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));

        executor
            .run(|n| {
                let seen = seen.clone();
                async move {
                    seen.lock().push(n);
                    if n < 3 {
                        Err(DriverError::service_unavailable("No servers"))
                    } else {
                        Ok(())
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(*seen.lock(), [1, 2, 3]);
    }
}
