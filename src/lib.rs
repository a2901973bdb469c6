//! # Bolt Session
//!
//! Session, transaction and result-handling core of a graph database driver.
//! The wire protocol lives behind the [`Connection`] and [`ConnectionProvider`]
//! traits; this crate decides what gets sent on them and when.
//!
//! ## Features
//!
//! - **Sessions** - one logical unit of work at a time, causal chaining via bookmarks
//! - **Explicit transactions** - run, commit, rollback, deferred rollback on drop
//! - **Transaction functions** - automatic retry of transient failures with bounded backoff
//! - **Results** - pull (`next`, `records`, `single`) or push (`subscribe`, `into_stream`)
//! - **Error classification** - transient, client and fatal errors
//!
//! ## Basic Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use bolt_session::{ConnectionProvider, Driver, DriverConfig, SessionConfig};
//!
//! # async fn example(provider: Arc<dyn ConnectionProvider>) -> Result<(), Box<dyn std::error::Error>> {
//! let driver = Driver::new(provider, DriverConfig::default());
//! let session = driver.session(SessionConfig::default())?;
//!
//! let mut result = session
//!     .run("CREATE (a:Person {name: $name})", Some(bolt_session::params!{"name" => "Alice"}))
//!     .await?;
//! let summary = result.consume().await?;
//! println!("created {} nodes", summary.counters.nodes_created);
//!
//! session.close().await?;
//! driver.close().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Transactions
//!
//! ```rust,no_run
//! # use bolt_session::Session;
//! # async fn example(session: Session) -> Result<(), Box<dyn std::error::Error>> {
//! let tx = session.begin_transaction(None).await?;
//! tx.run("CREATE (n:Node {id: 1})", None).await?;
//! tx.run("CREATE (n:Node {id: 2})", None).await?;
//! tx.commit().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Transaction Functions
//!
//! The work closure may run more than once; transient failures are retried
//! until the configured retry time is spent.
//!
//! ```rust,no_run
//! # use bolt_session::Session;
//! # async fn example(session: Session) -> Result<(), Box<dyn std::error::Error>> {
//! let count = session
//!     .read_transaction(|tx| async move {
//!         let mut result = tx.run("MATCH (n) RETURN count(n) AS c", None).await?;
//!         let record = result.single().await?;
//!         record.get_int("c")
//!     })
//!     .await?;
//! # let _ = count;
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`driver`] - Driver, session, transaction, result and retry types

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod driver;

// Re-exports for convenience
pub use driver::{
    AccessMode, Bookmark, Connection, ConnectionProvider, Driver, DriverConfig,
    DriverConfigBuilder, DriverError, DriverResult, ErrorClassification, ManagedTransaction,
    Query, QueryResult, Record, RecordStream, ResultSummary, RetryPolicy, Session,
    SessionConfig, SessionConfigBuilder, Subscriber, SubscriptionState, Transaction,
    TransactionConfig, TransactionState, Value,
};

/// Config alias for convenience
pub type Config = DriverConfig;
