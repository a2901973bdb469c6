//! Driver
//!
//! 드라이버 인스턴스 및 설정

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::debug;

use super::connection::ConnectionProvider;
use super::error::{DriverError, DriverResult};
use super::retry::RetryPolicy;
use super::session::{Session, SessionConfig};

/// 기본 Fetch Size
pub(crate) const DEFAULT_FETCH_SIZE: usize = 1000;

// ============================================================================
// DriverConfig - 드라이버 설정
// ============================================================================

/// 드라이버 설정
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// 연결 획득 타임아웃
    pub connection_acquisition_timeout: Duration,
    /// 최대 트랜잭션 재시도 시간
    pub max_transaction_retry_time: Duration,
    /// 첫 재시도 대기 시간
    pub retry_initial_delay: Duration,
    /// 재시도 대기 배수
    pub retry_delay_multiplier: f64,
    /// 재시도 대기 지터 비율
    pub retry_delay_jitter: f64,
    /// 최대 재시도 대기 시간
    pub retry_max_delay: Duration,
    /// 기본 Fetch Size
    pub fetch_size: usize,
}

impl DriverConfig {
    /// 새 설정 생성
    pub fn new() -> Self {
        Self::default()
    }

    /// 빌더 시작
    pub fn builder() -> DriverConfigBuilder {
        DriverConfigBuilder {
            config: Self::default(),
        }
    }

    /// 관리 트랜잭션 재시도 정책
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_transaction_retry_time)
            .with_initial_delay(self.retry_initial_delay)
            .with_multiplier(self.retry_delay_multiplier)
            .with_jitter(self.retry_delay_jitter)
            .with_max_delay(self.retry_max_delay)
    }
}

impl Default for DriverConfig {
    fn default() -> Self {
        let retry = RetryPolicy::default();
        Self {
            connection_acquisition_timeout: Duration::from_secs(60),
            max_transaction_retry_time: retry.max_retry_time,
            retry_initial_delay: retry.initial_delay,
            retry_delay_multiplier: retry.multiplier,
            retry_delay_jitter: retry.jitter,
            retry_max_delay: retry.max_delay,
            fetch_size: DEFAULT_FETCH_SIZE,
        }
    }
}

// ============================================================================
// DriverConfigBuilder - 설정 빌더
// ============================================================================

/// 드라이버 설정 빌더
#[derive(Debug)]
pub struct DriverConfigBuilder {
    config: DriverConfig,
}

impl DriverConfigBuilder {
    /// 연결 획득 타임아웃 설정
    pub fn with_connection_acquisition_timeout(mut self, timeout: Duration) -> Self {
        self.config.connection_acquisition_timeout = timeout;
        self
    }

    /// 최대 트랜잭션 재시도 시간 설정
    pub fn with_max_transaction_retry_time(mut self, time: Duration) -> Self {
        self.config.max_transaction_retry_time = time;
        self
    }

    /// 재시도 백오프 설정
    pub fn with_retry_backoff(mut self, initial: Duration, multiplier: f64, max: Duration) -> Self {
        self.config.retry_initial_delay = initial;
        self.config.retry_delay_multiplier = multiplier;
        self.config.retry_max_delay = max;
        self
    }

    /// 재시도 지터 설정
    pub fn with_retry_jitter(mut self, jitter: f64) -> Self {
        self.config.retry_delay_jitter = jitter;
        self
    }

    /// Fetch Size 설정
    pub fn with_fetch_size(mut self, size: usize) -> Self {
        self.config.fetch_size = size;
        self
    }

    /// 빌드
    pub fn build(self) -> DriverConfig {
        self.config
    }
}

// ============================================================================
// Driver - 드라이버
// ============================================================================

/// 그래프 데이터베이스 드라이버
///
/// 연결 제공자와 설정을 들고 세션을 만듭니다.
pub struct Driver {
    /// 설정
    config: DriverConfig,
    /// 연결 제공자
    provider: Arc<dyn ConnectionProvider>,
    /// 열린 상태
    open: Arc<RwLock<bool>>,
}

impl Driver {
    /// 새 드라이버 생성
    pub fn new(provider: Arc<dyn ConnectionProvider>, config: DriverConfig) -> Self {
        Self {
            config,
            provider,
            open: Arc::new(RwLock::new(true)),
        }
    }

    /// 세션 생성
    ///
    /// 세션 설정에 Fetch Size 가 없으면 드라이버 설정의 값을 씁니다.
    pub fn session(&self, config: SessionConfig) -> DriverResult<Session> {
        self.ensure_open()?;
        Ok(Session::new(self.provider.clone(), &self.config, config))
    }

    /// 기본 설정으로 세션 생성
    pub fn default_session(&self) -> DriverResult<Session> {
        self.session(SessionConfig::default())
    }

    /// 드라이버 설정
    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    /// 열린 상태 여부
    pub fn is_open(&self) -> bool {
        *self.open.read()
    }

    /// 드라이버 종료. 이후 세션 생성은 실패합니다.
    pub async fn close(&self) -> DriverResult<()> {
        let mut open = self.open.write();
        if *open {
            *open = false;
            debug!("Driver closed");
        }
        Ok(())
    }

    /// 열린 상태 확인
    fn ensure_open(&self) -> DriverResult<()> {
        if *self.open.read() {
            Ok(())
        } else {
            Err(DriverError::DriverClosed)
        }
    }
}

impl fmt::Debug for Driver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Driver")
            .field("config", &self.config)
            .field("open", &*self.open.read())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::testing::FakeServer;

    #[test]
    fn test_driver_config_defaults() {
        let config = DriverConfig::default();
        assert_eq!(config.connection_acquisition_timeout, Duration::from_secs(60));
        assert_eq!(config.max_transaction_retry_time, Duration::from_secs(30));
        assert_eq!(config.fetch_size, 1000);
        assert_eq!(config.retry_policy(), RetryPolicy::default());
    }

    #[test]
    fn test_driver_config_builder() {
        let config = DriverConfig::builder()
            .with_connection_acquisition_timeout(Duration::from_secs(10))
            .with_max_transaction_retry_time(Duration::from_secs(15))
            .with_retry_backoff(Duration::from_millis(100), 3.0, Duration::from_secs(2))
            .with_retry_jitter(0.0)
            .with_fetch_size(200)
            .build();

        assert_eq!(config.connection_acquisition_timeout, Duration::from_secs(10));
        assert_eq!(config.fetch_size, 200);

        let policy = config.retry_policy();
        assert_eq!(policy.max_retry_time, Duration::from_secs(15));
        assert_eq!(policy.initial_delay, Duration::from_millis(100));
        assert_eq!(policy.multiplier, 3.0);
        assert_eq!(policy.max_delay, Duration::from_secs(2));
        assert_eq!(policy.jitter, 0.0);
    }

    #[tokio::test]
    async fn test_driver_sessions() {
        let server = FakeServer::new();
        let driver = Driver::new(
            server.provider(),
            DriverConfig::builder().with_fetch_size(50).build(),
        );

        let session = driver.default_session().unwrap();
        assert_eq!(session.config().fetch_size, Some(50));
        session.run("RETURN 1 AS n", None).await.unwrap();

        let custom = driver
            .session(SessionConfig::new().with_fetch_size(10).with_database("neo4j"))
            .unwrap();
        assert_eq!(custom.config().fetch_size, Some(10));
        assert_eq!(custom.config().database.as_deref(), Some("neo4j"));

        // 드라이버 기본값과 같은 값도 명시하면 그대로 유지
        let explicit = driver
            .session(SessionConfig::new().with_fetch_size(DEFAULT_FETCH_SIZE))
            .unwrap();
        assert_eq!(explicit.config().fetch_size, Some(DEFAULT_FETCH_SIZE));
    }

    #[tokio::test]
    async fn test_closed_driver_refuses_sessions() {
        let driver = Driver::new(FakeServer::new().provider(), DriverConfig::default());
        driver.close().await.unwrap();
        driver.close().await.unwrap();

        assert!(!driver.is_open());
        assert!(matches!(
            driver.default_session().unwrap_err(),
            DriverError::DriverClosed
        ));
    }
}
