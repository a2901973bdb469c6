//! Driver Module
//!
//! 세션, 트랜잭션, 결과 스트림, 관리 트랜잭션 재시도
//!
//! # Components
//!
//! - 드라이버 (Driver, DriverConfig)
//! - 세션 관리 (Session, SessionConfig, Bookmark)
//! - 트랜잭션 API (Transaction, ManagedTransaction, TransactionConfig)
//! - 결과 (QueryResult, Subscriber, RecordStream)
//! - 재시도 (RetryPolicy, RetryExecutor) 및 오류 분류
//!
//! # Example
//!
//! ```ignore
//! use bolt_session::driver::{Driver, DriverConfig, SessionConfig};
//!
//! let driver = Driver::new(provider, DriverConfig::default());
//! let session = driver.session(SessionConfig::default())?;
//!
//! // 쿼리 실행
//! let mut result = session.run("MATCH (n) RETURN n LIMIT 10", None).await?;
//! for record in result.records().await? {
//!     println!("{:?}", record);
//! }
//!
//! // 트랜잭션
//! let tx = session.begin_transaction(None).await?;
//! tx.run("CREATE (n:Person {name: $name})", Some(params!{"name" => "Alice"})).await?;
//! tx.commit().await?;
//!
//! session.close().await?;
//! driver.close().await?;
//! ```

mod classify;
mod connection;
mod driver;
mod error;
pub mod reactive;
mod record;
mod result;
mod retry;
mod session;
#[cfg(test)]
pub(crate) mod testing;
mod transaction;
mod types;

// Re-exports
pub use classify::{classify, classify_code, ErrorClassification};
pub use connection::{Connection, ConnectionProvider, EventStream, QueryStream, RunOptions, StreamEvent};
pub use driver::{Driver, DriverConfig, DriverConfigBuilder};
pub use error::{DriverError, DriverResult, ServerFailure};
pub use reactive::RecordStream;
pub use record::Record;
pub use result::{
    Counters, InputPosition, Notification, QueryResult, QueryType, ResultSummary, Subscriber,
    SubscriptionState,
};
pub use retry::{RetryContext, RetryExecutor, RetryPolicy};
pub use session::{AccessMode, Bookmark, Query, Session, SessionConfig, SessionConfigBuilder};
pub use transaction::{ManagedTransaction, Transaction, TransactionConfig, TransactionState};
pub use types::{Node, Path, Relationship, Value};

/// 파라미터 맵 생성 매크로
#[macro_export]
macro_rules! params {
    () => {
        std::collections::HashMap::new()
    };
    ($($key:expr => $value:expr),+ $(,)?) => {{
        let mut map = std::collections::HashMap::new();
        $(
            map.insert($key.into(), $crate::driver::Value::from($value));
        )+
        map
    }};
}
