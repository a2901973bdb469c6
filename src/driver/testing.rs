//! In-memory Connection for tests
//!
//! 스크립트로 실패를 주입할 수 있는 메모리 서버. Person 노드의 이름만
//! 저장하며, 트랜잭션 안의 쓰기는 커밋 전까지 다른 연결에 보이지 않습니다.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::connection::{Connection, ConnectionProvider, QueryStream, RunOptions, StreamEvent};
use super::driver::DriverConfig;
use super::error::{DriverError, DriverResult};
use super::result::{Counters, QueryType, ResultSummary};
use super::session::{AccessMode, Bookmark, Query, Session, SessionConfig};
use super::transaction::TransactionConfig;
use super::types::Value;

const CREATE_PERSON: &str = "CREATE (a:Person {name: $name})";
const COUNT_PERSON: &str = "MATCH (a:Person {name: $name}) RETURN count(a) AS count";
const LIST_PEOPLE: &str = "MATCH (a:Person) RETURN a.name AS name ORDER BY a.name";

/// 실패 주입 지점
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FailurePoint {
    Acquire,
    Begin,
    Run,
    /// 결과 스트림 도중 (레코드 뒤, 요약 대신)
    Stream,
    Commit,
}

#[derive(Default)]
struct ServerState {
    people: Vec<String>,
    once: VecDeque<(FailurePoint, DriverError)>,
    always: Vec<(FailurePoint, DriverError)>,
    calls: HashMap<&'static str, usize>,
    acquired_modes: Vec<AccessMode>,
    last_begin: Option<(Vec<Bookmark>, TransactionConfig)>,
    commits: u64,
}

impl ServerState {
    fn call(&mut self, name: &'static str) {
        *self.calls.entry(name).or_default() += 1;
    }

    fn injected(&mut self, point: FailurePoint) -> Option<DriverError> {
        if let Some(index) = self.once.iter().position(|(p, _)| *p == point) {
            return self.once.remove(index).map(|(_, err)| err);
        }
        self.always
            .iter()
            .find(|(p, _)| *p == point)
            .map(|(_, err)| err.clone())
    }

    fn next_bookmark(&mut self) -> Bookmark {
        self.commits += 1;
        Bookmark::new(format!("fake:bookmark:{}", self.commits))
    }
}

/// 테스트용 메모리 서버
#[derive(Clone, Default)]
pub(crate) struct FakeServer {
    state: Arc<Mutex<ServerState>>,
}

impl FakeServer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn provider(&self) -> Arc<dyn ConnectionProvider> {
        Arc::new(FakeProvider {
            state: self.state.clone(),
        })
    }

    pub(crate) fn session(&self) -> Session {
        self.session_with(DriverConfig::default())
    }

    pub(crate) fn session_with(&self, config: DriverConfig) -> Session {
        Session::new(self.provider(), &config, SessionConfig::default())
    }

    pub(crate) fn session_with_config(&self, config: SessionConfig) -> Session {
        Session::new(self.provider(), &DriverConfig::default(), config)
    }

    pub(crate) fn create_person(name: &str) -> Query {
        Query::new(CREATE_PERSON).with_param("name", name)
    }

    pub(crate) fn count_person(name: &str) -> Query {
        Query::new(COUNT_PERSON).with_param("name", name)
    }

    pub(crate) fn list_people() -> Query {
        Query::new(LIST_PEOPLE)
    }

    pub(crate) fn seed_people(&self, names: &[&str]) {
        self.state
            .lock()
            .people
            .extend(names.iter().map(|n| n.to_string()));
    }

    pub(crate) fn committed_people(&self) -> Vec<String> {
        self.state.lock().people.clone()
    }

    pub(crate) fn fail_once(&self, point: FailurePoint, err: DriverError) {
        self.state.lock().once.push_back((point, err));
    }

    pub(crate) fn fail_always(&self, point: FailurePoint, err: DriverError) {
        self.state.lock().always.push((point, err));
    }

    pub(crate) fn calls(&self, name: &str) -> usize {
        self.state.lock().calls.get(name).copied().unwrap_or(0)
    }

    pub(crate) fn acquired_modes(&self) -> Vec<AccessMode> {
        self.state.lock().acquired_modes.clone()
    }

    pub(crate) fn last_begin_bookmarks(&self) -> Vec<Bookmark> {
        self.state
            .lock()
            .last_begin
            .as_ref()
            .map(|(bookmarks, _)| bookmarks.clone())
            .unwrap_or_default()
    }

    pub(crate) fn last_begin_config(&self) -> Option<TransactionConfig> {
        self.state
            .lock()
            .last_begin
            .as_ref()
            .map(|(_, config)| config.clone())
    }
}

struct FakeProvider {
    state: Arc<Mutex<ServerState>>,
}

#[async_trait]
impl ConnectionProvider for FakeProvider {
    async fn acquire(&self, mode: AccessMode) -> DriverResult<Box<dyn Connection>> {
        let mut state = self.state.lock();
        state.call("acquire");
        if let Some(err) = state.injected(FailurePoint::Acquire) {
            return Err(err);
        }
        state.acquired_modes.push(mode);
        Ok(Box::new(FakeConnection {
            state: self.state.clone(),
            tx_writes: None,
            open: true,
        }))
    }

    fn release(&self, connection: Box<dyn Connection>) {
        self.state.lock().call("release");
        drop(connection);
    }
}

struct FakeConnection {
    state: Arc<Mutex<ServerState>>,
    /// 열린 트랜잭션의 아직 커밋되지 않은 쓰기
    tx_writes: Option<Vec<String>>,
    open: bool,
}

impl FakeConnection {
    fn fail(&mut self, err: DriverError) -> DriverError {
        if err.is_connectivity_error() {
            self.open = false;
            self.tx_writes = None;
        }
        err
    }

    fn param_name(query: &Query) -> DriverResult<String> {
        match query.parameters.get("name") {
            Some(Value::String(name)) => Ok(name.clone()),
            _ => Err(DriverError::server(
                "Neo.ClientError.Statement.ParameterMissing",
                "Expected parameter: $name",
            )),
        }
    }

    fn visible_people(&self, state: &ServerState) -> Vec<String> {
        let mut people = state.people.clone();
        if let Some(writes) = &self.tx_writes {
            people.extend(writes.iter().cloned());
        }
        people
    }

    fn execute(&mut self, query: &Query) -> DriverResult<(Vec<String>, Vec<Vec<Value>>, ResultSummary)> {
        let mut summary = ResultSummary::default();
        match query.text.as_str() {
            CREATE_PERSON => {
                let name = Self::param_name(query)?;
                match self.tx_writes.as_mut() {
                    Some(writes) => writes.push(name),
                    None => {
                        let mut state = self.state.lock();
                        state.people.push(name);
                        summary.bookmark = Some(state.next_bookmark());
                    }
                }
                summary.query_type = QueryType::WriteOnly;
                summary.counters = Counters {
                    nodes_created: 1,
                    labels_added: 1,
                    properties_set: 1,
                    ..Default::default()
                };
                Ok((Vec::new(), Vec::new(), summary))
            }
            COUNT_PERSON => {
                let name = Self::param_name(query)?;
                let state = self.state.lock();
                let count = self
                    .visible_people(&state)
                    .iter()
                    .filter(|n| **n == name)
                    .count();
                Ok((
                    vec!["count".into()],
                    vec![vec![Value::Integer(count as i64)]],
                    summary,
                ))
            }
            LIST_PEOPLE => {
                let state = self.state.lock();
                let mut people = self.visible_people(&state);
                people.sort();
                let rows = people.into_iter().map(|n| vec![Value::String(n)]).collect();
                Ok((vec!["name".into()], rows, summary))
            }
            _ => Ok((vec!["n".into()], vec![vec![Value::Integer(1)]], summary)),
        }
    }
}

#[async_trait]
impl Connection for FakeConnection {
    async fn run(&mut self, query: &Query, _options: &RunOptions) -> DriverResult<QueryStream> {
        let (run_failure, stream_failure) = {
            let mut state = self.state.lock();
            state.call("run");
            match state.injected(FailurePoint::Run) {
                Some(err) => (Some(err), None),
                None => (None, state.injected(FailurePoint::Stream)),
            }
        };
        if let Some(err) = run_failure {
            return Err(self.fail(err));
        }

        let (keys, rows, summary) = self.execute(query)?;
        let mut events: Vec<DriverResult<StreamEvent>> =
            rows.into_iter().map(|row| Ok(StreamEvent::Record(row))).collect();
        match stream_failure {
            Some(err) => events.push(Err(self.fail(err))),
            None => events.push(Ok(StreamEvent::Summary(summary))),
        }
        Ok(QueryStream::from_events(keys, events))
    }

    async fn begin(&mut self, options: &RunOptions, config: &TransactionConfig) -> DriverResult<()> {
        let failure = {
            let mut state = self.state.lock();
            state.call("begin");
            state.last_begin = Some((options.bookmarks.clone(), config.clone()));
            state.injected(FailurePoint::Begin)
        };
        if let Some(err) = failure {
            return Err(self.fail(err));
        }
        self.tx_writes = Some(Vec::new());
        Ok(())
    }

    async fn commit(&mut self) -> DriverResult<Option<Bookmark>> {
        let writes = self.tx_writes.take().unwrap_or_default();
        let mut state = self.state.lock();
        state.call("commit");
        if let Some(err) = state.injected(FailurePoint::Commit) {
            drop(state);
            return Err(self.fail(err));
        }
        state.people.extend(writes);
        Ok(Some(state.next_bookmark()))
    }

    async fn rollback(&mut self) -> DriverResult<()> {
        self.state.lock().call("rollback");
        self.tx_writes = None;
        Ok(())
    }

    async fn close(&mut self) -> DriverResult<()> {
        self.state.lock().call("close");
        self.open = false;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }
}
