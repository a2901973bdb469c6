//! Connection contracts.
//!
//! The session core never speaks the wire protocol itself. It drives a
//! [`Connection`] handed out by a [`ConnectionProvider`]; both are supplied by
//! the transport layer (a Bolt client, a pool, or a test double).

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use super::error::DriverResult;
use super::result::ResultSummary;
use super::session::{AccessMode, Bookmark, Query};
use super::transaction::TransactionConfig;
use super::types::Value;

/// One item of a query's response stream.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// A row, values in key order.
    Record(Vec<Value>),
    /// Terminal success. Nothing follows it.
    Summary(ResultSummary),
}

/// Response events of a single query. An `Err` item is terminal.
pub type EventStream = Pin<Box<dyn Stream<Item = DriverResult<StreamEvent>> + Send>>;

/// Server reply to a RUN: the column keys and the event stream that follows.
pub struct QueryStream {
    /// Column keys, in RETURN order.
    pub keys: Vec<String>,
    /// Records followed by a summary, or an error.
    pub events: EventStream,
}

impl QueryStream {
    /// Build a stream from already known events.
    pub fn from_events(keys: Vec<String>, events: Vec<DriverResult<StreamEvent>>) -> Self {
        Self {
            keys,
            events: Box::pin(tokio_stream::iter(events)),
        }
    }
}

impl std::fmt::Debug for QueryStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryStream").field("keys", &self.keys).finish()
    }
}

/// Per-request routing and consistency metadata.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Target database, `None` for the server default.
    pub database: Option<String>,
    /// Access mode, passed through for routing.
    pub mode: AccessMode,
    /// Bookmarks the server must have applied before running.
    pub bookmarks: Vec<Bookmark>,
    /// Records per PULL batch.
    pub fetch_size: usize,
    /// User to impersonate.
    pub impersonated_user: Option<String>,
}

/// A single logical channel to the server.
///
/// At most one query is in flight at a time: the session drains the previous
/// [`QueryStream`] before issuing the next request.
#[async_trait]
pub trait Connection: Send {
    /// Send a query and return its response stream.
    ///
    /// Outside an explicit transaction this is an auto-commit query.
    async fn run(&mut self, query: &Query, options: &RunOptions) -> DriverResult<QueryStream>;

    /// Open a transaction.
    async fn begin(&mut self, options: &RunOptions, config: &TransactionConfig) -> DriverResult<()>;

    /// Commit the open transaction, returning its bookmark if the server sent one.
    async fn commit(&mut self) -> DriverResult<Option<Bookmark>>;

    /// Roll back the open transaction.
    async fn rollback(&mut self) -> DriverResult<()>;

    /// Close the channel.
    async fn close(&mut self) -> DriverResult<()>;

    /// Whether the channel can still carry requests.
    fn is_open(&self) -> bool {
        true
    }
}

/// Source of ready, authenticated connections.
#[async_trait]
pub trait ConnectionProvider: Send + Sync {
    /// Acquire a connection suitable for `mode`.
    ///
    /// Fails with `ServiceUnavailable` when no server can be reached.
    async fn acquire(&self, mode: AccessMode) -> DriverResult<Box<dyn Connection>>;

    /// Hand a healthy connection back.
    ///
    /// A released connection may still carry an unfinished transaction; the
    /// provider resets it before reuse.
    fn release(&self, connection: Box<dyn Connection>) {
        drop(connection);
    }
}
