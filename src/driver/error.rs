//! Driver Error Types
//!
//! 드라이버 에러 정의

use std::fmt;
use std::io;
use std::time::Duration;

use thiserror::Error;

use super::classify::{classify, ErrorClassification};
use super::transaction::TransactionState;

// ============================================================================
// DriverError - 드라이버 에러
// ============================================================================

/// 드라이버 에러
#[derive(Error, Debug, Clone)]
pub enum DriverError {
    /// 연결 에러 (거부, 리셋, 끊김)
    #[error("Connection error: {0}")]
    Connection(String),

    /// 인증 에러
    #[error("Authentication error: {0}")]
    Authentication(String),

    /// 프로토콜 에러
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// 서버 에러
    #[error("Server error: {code} - {message}")]
    Server {
        /// 에러 코드
        code: String,
        /// 에러 메시지
        message: String,
    },

    /// 타임아웃 에러
    #[error("Timeout: {0}")]
    Timeout(String),

    /// 서비스 불가
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    /// 닫힌 세션 사용
    #[error("Session is closed")]
    SessionClosed,

    /// 닫힌 드라이버 사용
    #[error("Driver is closed")]
    DriverClosed,

    /// 종료된 트랜잭션 사용
    #[error("Transaction has been terminated ({0})")]
    TransactionTerminated(TransactionState),

    /// 이미 열린 트랜잭션 존재
    #[error("A transaction is already open in this session")]
    TransactionAlreadyOpen,

    /// 세션 동시 접근
    #[error("Session is already in use by another operation")]
    ConcurrentAccess,

    /// 이미 소비되었거나 폐기된 결과
    #[error("Result consumed: {0}")]
    ResultConsumed(String),

    /// 재시도 시간 초과
    #[error("Retries exhausted after {attempts} attempt(s) in {elapsed:?}: {source}")]
    RetryExhausted {
        /// 시도 횟수
        attempts: u32,
        /// 경과 시간
        elapsed: Duration,
        /// 마지막 실패
        #[source]
        source: Box<DriverError>,
    },

    /// 세션 종료로 인한 취소
    #[error("Operation cancelled: {reason}")]
    Cancelled {
        /// 취소 사유
        reason: String,
        /// 취소 전 마지막 실패
        last_error: Option<Box<DriverError>>,
    },

    /// 설정 에러
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// 타입 변환 에러
    #[error("Type conversion error: {0}")]
    TypeConversion(String),

    /// 내부 에러
    #[error("Internal error: {0}")]
    Internal(String),
}

impl DriverError {
    /// 연결 에러 생성
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    /// 인증 에러 생성
    pub fn authentication(msg: impl Into<String>) -> Self {
        Self::Authentication(msg.into())
    }

    /// 프로토콜 에러 생성
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// 서버 에러 생성
    pub fn server(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Server {
            code: code.into(),
            message: message.into(),
        }
    }

    /// 타임아웃 에러 생성
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// 서비스 불가 에러 생성
    pub fn service_unavailable(msg: impl Into<String>) -> Self {
        Self::ServiceUnavailable(msg.into())
    }

    /// 결과 소비 에러 생성
    pub fn result_consumed(msg: impl Into<String>) -> Self {
        Self::ResultConsumed(msg.into())
    }

    /// 설정 에러 생성
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// 타입 변환 에러 생성
    pub fn type_conversion(msg: impl Into<String>) -> Self {
        Self::TypeConversion(msg.into())
    }

    /// 취소 에러 생성
    pub fn cancelled(reason: impl Into<String>, last_error: Option<DriverError>) -> Self {
        Self::Cancelled {
            reason: reason.into(),
            last_error: last_error.map(Box::new),
        }
    }

    /// 에러 분류
    pub fn classification(&self) -> ErrorClassification {
        classify(self)
    }

    /// 재시도 가능 여부
    pub fn is_retryable(&self) -> bool {
        self.classification() == ErrorClassification::Transient
    }

    /// 클라이언트 에러 여부
    pub fn is_client_error(&self) -> bool {
        self.classification() == ErrorClassification::Client
    }

    /// 치명적 에러 여부
    pub fn is_fatal(&self) -> bool {
        self.classification() == ErrorClassification::Fatal
    }

    /// 네트워크 수준 에러 여부
    pub fn is_connectivity_error(&self) -> bool {
        matches!(
            self,
            Self::Connection(_) | Self::Timeout(_) | Self::ServiceUnavailable(_)
        )
    }

    /// 연결을 더 이상 사용할 수 없는 에러인지
    pub(crate) fn invalidates_connection(&self) -> bool {
        self.is_connectivity_error() || self.is_fatal()
    }

    /// 서버 에러 코드
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Server { code, .. } => Some(code),
            Self::RetryExhausted { source, .. } => source.code(),
            _ => None,
        }
    }
}

impl From<io::Error> for DriverError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut => DriverError::Timeout(err.to_string()),
            _ => DriverError::Connection(err.to_string()),
        }
    }
}

// ============================================================================
// Result Type
// ============================================================================

/// 드라이버 결과 타입
pub type DriverResult<T> = Result<T, DriverError>;

// ============================================================================
// ServerFailure - 서버 실패 응답
// ============================================================================

/// 서버가 보고한 실패
///
/// 에러 코드는 "Neo.{Classification}.{Category}.{Title}" 형식을 따릅니다.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerFailure {
    /// 에러 코드
    pub code: String,
    /// 에러 메시지
    pub message: String,
}

impl ServerFailure {
    /// 새 실패 생성
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    /// 클라이언트 에러 여부
    pub fn is_client_error(&self) -> bool {
        self.code.starts_with("Neo.ClientError")
    }

    /// 데이터베이스 에러 여부
    pub fn is_database_error(&self) -> bool {
        self.code.starts_with("Neo.DatabaseError")
    }

    /// 트랜지언트 에러 여부
    pub fn is_transient_error(&self) -> bool {
        self.code.starts_with("Neo.TransientError")
    }

    /// 보안 에러 여부 (인증/권한)
    pub fn is_security_error(&self) -> bool {
        self.code.starts_with("Neo.ClientError.Security")
    }
}

impl fmt::Display for ServerFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for ServerFailure {}

impl From<ServerFailure> for DriverError {
    fn from(failure: ServerFailure) -> Self {
        DriverError::Server {
            code: failure.code,
            message: failure.message,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
