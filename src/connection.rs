//! Per-connection protocol state machine.
//!
//! One [`Connection`] wraps one wire connection and drives the libpq-style
//! non-blocking protocol under readiness events: connect and reset are
//! polled, sends are flushed until the buffer drains, input is consumed until
//! the first result arrives. At most one query is queued at any time.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error};

use crate::error::Error;
use crate::plan::PlanCache;
use crate::query::{Query, QueryKind};
use crate::wire::{
    ConnectionOptions, PollingStatus, ResultStatus, SocketFd, TransactionStatus, WireConnection,
    WireFactory, WireResult,
};

/// Lifecycle of one pooled connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected yet, or the connection was lost.
    Dead,
    /// Asynchronous connect in progress.
    Connecting,
    /// Reconnecting to the server.
    Resetting,
    /// Connected, nothing in flight.
    Idle,
    /// Waiting for the server to finish executing a query.
    Executing,
}

/// Invoked exactly once when the queued query finishes: success flag, the
/// first result when one was produced, and the failure when there was one.
pub type QueryCompletionCallback =
    Box<dyn FnOnce(bool, Option<Box<dyn WireResult>>, Option<Error>) + Send>;

/// Optional single observer of state transitions, for instrumentation.
pub type StateChangeCallback = Arc<dyn Fn(ConnectionState) + Send + Sync>;

struct Inner {
    wire: Option<Box<dyn WireConnection>>,
    state: ConnectionState,
    writing: bool,
    queued: Option<(Query, QueryCompletionCallback)>,
    plan_cache: PlanCache,
    last_error: String,
    state_change: Option<StateChangeCallback>,
}

/// Work that must run after the state lock is dropped. Completion callbacks
/// re-enter the pool and may dispatch the next query on this same thread, so
/// they can never run under the lock.
enum AfterUnlock {
    Finish {
        callback: QueryCompletionCallback,
        succeeded: bool,
        result: Option<Box<dyn WireResult>>,
        failure: Option<Error>,
    },
    StateChanged(StateChangeCallback, ConnectionState),
}

pub struct Connection {
    options: ConnectionOptions,
    factory: Arc<dyn WireFactory>,
    inner: Mutex<Inner>,
}

impl Connection {
    #[must_use]
    pub fn new(
        options: ConnectionOptions,
        factory: Arc<dyn WireFactory>,
        plan_cache_size: usize,
    ) -> Self {
        Connection {
            options,
            factory,
            inner: Mutex::new(Inner {
                wire: None,
                state: ConnectionState::Dead,
                writing: true,
                queued: None,
                plan_cache: PlanCache::new(plan_cache_size),
                last_error: String::new(),
                state_change: None,
            }),
        }
    }

    /// Queue a query and start moving it. On a dead connection this begins an
    /// asynchronous (re)connect first; the query is sent once the connection
    /// reaches `Idle`.
    ///
    /// # Errors
    /// Fails when a query is already queued, or when starting the connect
    /// fails outright.
    pub fn execute_query(
        &self,
        query: Query,
        callback: QueryCompletionCallback,
    ) -> Result<(), Error> {
        let mut pending = Vec::new();
        let outcome = {
            let mut inner = self.inner.lock();
            if inner.queued.is_some() {
                return Err(Error::Connection(
                    "a query is already queued on this connection".to_string(),
                ));
            }

            inner.queued = Some((query, callback));
            inner.last_error.clear();

            match inner.state {
                ConnectionState::Dead => self.begin_connect(&mut inner, &mut pending),
                ConnectionState::Idle => {
                    Self::begin_query(&mut inner, &mut pending);
                    Ok(())
                }
                ConnectionState::Connecting | ConnectionState::Resetting => Ok(()),
                ConnectionState::Executing => {
                    // Executing implies a queued query, which we just ruled out.
                    debug_assert!(false, "executing without a queued query");
                    Ok(())
                }
            }
        };
        Self::run_deferred(pending);
        outcome
    }

    /// Drive the state machine from a readiness event.
    pub fn socket_ready(&self, readable: bool, writable: bool) {
        let mut pending = Vec::new();
        {
            let mut inner = self.inner.lock();
            match inner.state {
                ConnectionState::Idle | ConnectionState::Dead => {
                    error!("socket ready event with no request in progress");
                }
                ConnectionState::Connecting => {
                    let status = match inner.wire.as_mut() {
                        Some(wire) => wire.poll_connect(),
                        None => PollingStatus::Failed,
                    };
                    self.process_polling_status(&mut inner, status, &mut pending);
                }
                ConnectionState::Resetting => {
                    let status = match inner.wire.as_mut() {
                        Some(wire) => wire.poll_reset(),
                        None => PollingStatus::Failed,
                    };
                    self.process_polling_status(&mut inner, status, &mut pending);
                }
                ConnectionState::Executing => {
                    if writable
                        && let Some(wire) = inner.wire.as_mut()
                        && wire.flush()
                    {
                        debug!("send buffer flushed");
                        inner.writing = false;
                    }

                    if readable {
                        let complete = match inner.wire.as_mut() {
                            Some(wire) => wire.consume_input(),
                            None => false,
                        };
                        if complete {
                            Self::query_completed(&mut inner, &mut pending);
                        }
                    }
                }
            }
        }
        Self::run_deferred(pending);
    }

    /// Request cancellation of the in-flight query. Only meaningful while
    /// executing; the query may still complete successfully.
    pub fn cancel_query(&self) {
        let mut inner = self.inner.lock();
        if inner.state == ConnectionState::Executing
            && let Some(wire) = inner.wire.as_mut()
        {
            wire.cancel();
        }
    }

    /// Begin an asynchronous reset of the wire session. Server-side prepared
    /// statements do not survive, so the plan cache is cleared here.
    pub fn begin_reset(&self) {
        let mut pending = Vec::new();
        {
            let mut inner = self.inner.lock();
            debug!("resetting connection");
            inner.writing = true;
            inner.plan_cache.clear();
            let failed = match inner.wire.as_mut() {
                Some(wire) => wire.reset_start().err(),
                None => Some(Error::Connection("no wire connection to reset".to_string())),
            };
            match failed {
                None => inner.state = ConnectionState::Resetting,
                Some(err) => Self::mark_as_dead(&mut inner, &err.to_string(), &mut pending),
            }
        }
        Self::run_deferred(pending);
    }

    /// Synchronous connect for the blocking query path.
    ///
    /// # Errors
    /// Propagates the factory's connect failure; the connection stays `Dead`.
    pub fn ensure_connected_blocking(&self) -> Result<(), Error> {
        let mut inner = self.inner.lock();
        if inner.state != ConnectionState::Dead {
            return Ok(());
        }

        debug!("blocking connect");
        inner.plan_cache.clear();
        match self.factory.connect_blocking(&self.options) {
            Ok(wire) => {
                inner.wire = Some(wire);
                inner.state = ConnectionState::Idle;
                Ok(())
            }
            Err(err) => {
                inner.last_error = err.to_string();
                Err(err)
            }
        }
    }

    /// Execute a query synchronously on this connection, bypassing the event
    /// loop. Classification matches the asynchronous path, including the COPY
    /// rejection that kills the connection.
    ///
    /// # Errors
    /// Connect, send and server-side failures.
    pub fn execute_blocking(&self, query: &Query) -> Result<Box<dyn WireResult>, Error> {
        self.ensure_connected_blocking()?;

        let mut pending = Vec::new();
        let outcome = {
            let mut inner = self.inner.lock();
            let Some(wire) = inner.wire.as_mut() else {
                return Err(Error::Connection("not connected".to_string()));
            };

            let binary = query.flags().binary;
            let result = match query.kind() {
                QueryKind::Raw { sql } => wire.exec_raw(sql),
                QueryKind::Parameterized { sql, params } => {
                    wire.exec_parameterized(sql, params, binary)
                }
                QueryKind::Prepare {
                    statement,
                    sql,
                    num_params,
                } => wire.exec_prepare(statement, sql, *num_params),
                QueryKind::Prepared { statement, params } => {
                    wire.exec_prepared(statement, params, binary)
                }
            };

            match result {
                Ok(result) => match Self::classify_result(result.as_ref(), wire.as_ref()) {
                    Disposition::Success => Ok(result),
                    Disposition::Failure { message, kill } => {
                        inner.last_error.clone_from(&message);
                        if kill {
                            Self::mark_as_dead(&mut inner, &message, &mut pending);
                        }
                        Err(Error::Query(message))
                    }
                },
                Err(err) => {
                    inner.last_error = err.to_string();
                    Err(err)
                }
            }
        };
        Self::run_deferred(pending);
        outcome
    }

    pub fn set_state_change_callback(&self, callback: StateChangeCallback) {
        self.inner.lock().state_change = Some(callback);
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    /// Connect or reset still in progress.
    #[must_use]
    pub fn is_connecting(&self) -> bool {
        matches!(
            self.inner.lock().state,
            ConnectionState::Connecting | ConnectionState::Resetting
        )
    }

    /// Whether the wire library is waiting for the socket to become writable.
    #[must_use]
    pub fn is_writing(&self) -> bool {
        self.inner.lock().writing
    }

    #[must_use]
    pub fn has_queued_query(&self) -> bool {
        self.inner.lock().queued.is_some()
    }

    #[must_use]
    pub fn in_transaction(&self) -> bool {
        self.transaction_status().in_transaction()
    }

    #[must_use]
    pub fn transaction_status(&self) -> TransactionStatus {
        self.inner
            .lock()
            .wire
            .as_ref()
            .map_or(TransactionStatus::Unknown, |wire| {
                wire.transaction_status()
            })
    }

    /// Current socket descriptor, `-1` when not connected. The wire library
    /// may swap sockets mid-connect (e.g. SSL fallback), so awaiters compare
    /// this against their subscription on every event.
    #[must_use]
    pub fn socket(&self) -> SocketFd {
        self.inner.lock().wire.as_ref().map_or(-1, |wire| wire.socket())
    }

    #[must_use]
    pub fn last_error(&self) -> String {
        self.inner.lock().last_error.clone()
    }

    /// Run `f` against this connection's plan cache.
    pub fn with_plan_cache<R>(&self, f: impl FnOnce(&mut PlanCache) -> R) -> R {
        f(&mut self.inner.lock().plan_cache)
    }

    fn begin_connect(&self, inner: &mut Inner, pending: &mut Vec<AfterUnlock>) -> Result<(), Error> {
        inner.writing = true;
        inner.plan_cache.clear();

        if inner.wire.is_none() {
            debug!("starting async connect");
            match self.factory.connect_start(&self.options) {
                Ok(wire) => {
                    inner.wire = Some(wire);
                    inner.state = ConnectionState::Connecting;
                    Ok(())
                }
                Err(err) => {
                    inner.queued = None;
                    inner.last_error = err.to_string();
                    Err(err)
                }
            }
        } else {
            debug!("starting async reset");
            let reset = inner
                .wire
                .as_mut()
                .map_or(Ok(()), |wire| wire.reset_start());
            match reset {
                Ok(()) => {
                    inner.state = ConnectionState::Resetting;
                    Ok(())
                }
                Err(err) => {
                    inner.queued = None;
                    let message = err.to_string();
                    Self::mark_as_dead(inner, &message, pending);
                    Err(err)
                }
            }
        }
    }

    fn begin_query(inner: &mut Inner, pending: &mut Vec<AfterUnlock>) {
        debug!("sending queued query");
        let send_outcome = {
            let Inner { queued, wire, .. } = inner;
            let (Some((query, _)), Some(wire)) = (queued.as_ref(), wire.as_mut()) else {
                return;
            };
            let binary = query.flags().binary;
            match query.kind() {
                QueryKind::Raw { sql } => wire.send_raw(sql),
                QueryKind::Parameterized { sql, params } => {
                    wire.send_parameterized(sql, params, binary)
                }
                QueryKind::Prepare {
                    statement,
                    sql,
                    num_params,
                } => wire.send_prepare(statement, sql, *num_params),
                QueryKind::Prepared { statement, params } => {
                    wire.send_prepared(statement, params, binary)
                }
            }
        };

        match send_outcome {
            Ok(()) => {
                inner.last_error.clear();
                inner.writing = true;
                inner.state = ConnectionState::Executing;
            }
            Err(err) => {
                inner.last_error = err.to_string();
                Self::finish_query(inner, false, None, Some(err), pending);
            }
        }
    }

    fn finish_query(
        inner: &mut Inner,
        succeeded: bool,
        result: Option<Box<dyn WireResult>>,
        failure: Option<Error>,
        pending: &mut Vec<AfterUnlock>,
    ) {
        let Some((_query, callback)) = inner.queued.take() else {
            return;
        };
        pending.push(AfterUnlock::Finish {
            callback,
            succeeded,
            result,
            failure,
        });
    }

    fn query_completed(inner: &mut Inner, pending: &mut Vec<AfterUnlock>) {
        debug!("query completed");
        inner.state = ConnectionState::Idle;

        let result = inner.wire.as_mut().and_then(|wire| wire.get_result());
        match result {
            None => {
                let message = inner
                    .wire
                    .as_ref()
                    .map_or_else(String::new, |wire| wire.error_message());
                inner.last_error.clone_from(&message);
                Self::finish_query(inner, false, None, Some(Error::Query(message)), pending);
            }
            Some(result) => {
                let disposition = match inner.wire.as_ref() {
                    Some(wire) => Self::classify_result(result.as_ref(), wire.as_ref()),
                    None => Disposition::Failure {
                        message: "connection lost".to_string(),
                        kill: false,
                    },
                };
                match disposition {
                    Disposition::Success => {
                        Self::finish_query(inner, true, Some(result), None, pending);
                    }
                    Disposition::Failure { message, kill } => {
                        inner.last_error.clone_from(&message);
                        if kill {
                            Self::mark_as_dead(inner, &message, pending);
                        }
                        Self::finish_query(
                            inner,
                            false,
                            Some(result),
                            Some(Error::Query(message)),
                            pending,
                        );
                    }
                }
            }
        }
    }

    fn classify_result(result: &dyn WireResult, wire: &dyn WireConnection) -> Disposition {
        match result.status() {
            ResultStatus::CommandOk | ResultStatus::TuplesOk => Disposition::Success,
            ResultStatus::CopyIn | ResultStatus::CopyOut => Disposition::Failure {
                // There is no way to cancel a COPY other than killing the
                // connection.
                message: "Row COPY not supported".to_string(),
                kill: true,
            },
            ResultStatus::EmptyQuery => Disposition::Failure {
                message: "Empty query".to_string(),
                kill: false,
            },
            ResultStatus::FatalError | ResultStatus::BadResponse => {
                let mut message = result.error_message();
                if message.is_empty() {
                    message = wire.error_message();
                }
                Disposition::Failure {
                    message,
                    kill: false,
                }
            }
            ResultStatus::Other => Disposition::Failure {
                message: "unexpected result status".to_string(),
                kill: false,
            },
        }
    }

    fn process_polling_status(
        &self,
        inner: &mut Inner,
        status: PollingStatus,
        pending: &mut Vec<AfterUnlock>,
    ) {
        match status {
            PollingStatus::Ok => Self::connection_ok(inner, pending),
            PollingStatus::Failed => Self::connection_died(inner, pending),
            PollingStatus::Reading => inner.writing = false,
            PollingStatus::Writing => inner.writing = true,
        }
    }

    fn connection_ok(inner: &mut Inner, pending: &mut Vec<AfterUnlock>) {
        debug!("connection established");
        inner.state = ConnectionState::Idle;
        if let Some(observer) = inner.state_change.as_ref() {
            pending.push(AfterUnlock::StateChanged(
                Arc::clone(observer),
                ConnectionState::Idle,
            ));
        }

        if inner.queued.is_some() {
            Self::begin_query(inner, pending);
        }
    }

    fn connection_died(inner: &mut Inner, pending: &mut Vec<AfterUnlock>) {
        let message = inner
            .wire
            .as_ref()
            .map_or_else(|| "connection failed".to_string(), |wire| wire.error_message());
        Self::mark_as_dead(inner, &message, pending);
        let failure = Some(Error::Connection(message));
        Self::finish_query(inner, false, None, failure, pending);
    }

    fn mark_as_dead(inner: &mut Inner, reason: &str, pending: &mut Vec<AfterUnlock>) {
        debug!(reason, "connection marked dead");
        inner.state = ConnectionState::Dead;
        inner.last_error = reason.to_string();
        if let Some(observer) = inner.state_change.as_ref() {
            pending.push(AfterUnlock::StateChanged(
                Arc::clone(observer),
                ConnectionState::Dead,
            ));
        }
    }

    fn run_deferred(pending: Vec<AfterUnlock>) {
        for action in pending {
            match action {
                AfterUnlock::Finish {
                    callback,
                    succeeded,
                    result,
                    failure,
                } => callback(succeeded, result, failure),
                AfterUnlock::StateChanged(observer, state) => observer(state),
            }
        }
    }
}

enum Disposition {
    Success,
    Failure { message: String, kill: bool },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::ScriptedFactory;

    type Outcome = Arc<Mutex<Option<(bool, Option<String>)>>>;

    fn recording_callback(outcome: &Outcome) -> QueryCompletionCallback {
        let outcome = Arc::clone(outcome);
        Box::new(move |succeeded, _result, failure| {
            *outcome.lock() = Some((succeeded, failure.map(|err| err.to_string())));
        })
    }

    fn drive(connection: &Connection) {
        for _ in 0..10 {
            connection.socket_ready(true, true);
            if matches!(
                connection.state(),
                ConnectionState::Idle | ConnectionState::Dead
            ) && !connection.has_queued_query()
            {
                break;
            }
        }
    }

    #[test]
    fn connects_lazily_and_runs_the_queued_query() {
        let factory = Arc::new(ScriptedFactory::new());
        let log = factory.log();
        let connection = Connection::new(
            ConnectionOptions::new(),
            Arc::clone(&factory) as Arc<dyn WireFactory>,
            30,
        );

        let outcome: Outcome = Arc::new(Mutex::new(None));
        connection
            .execute_query(Query::raw("SELECT 1"), recording_callback(&outcome))
            .unwrap();
        assert_eq!(connection.state(), ConnectionState::Connecting);

        drive(&connection);
        assert_eq!(connection.state(), ConnectionState::Idle);
        let (succeeded, failure) = outcome.lock().take().unwrap();
        assert!(succeeded);
        assert!(failure.is_none());
        assert_eq!(log.commands().len(), 1);
    }

    #[test]
    fn rejects_a_second_queued_query() {
        let factory = Arc::new(ScriptedFactory::new());
        let connection = Connection::new(
            ConnectionOptions::new(),
            Arc::clone(&factory) as Arc<dyn WireFactory>,
            30,
        );

        let outcome: Outcome = Arc::new(Mutex::new(None));
        connection
            .execute_query(Query::raw("SELECT 1"), recording_callback(&outcome))
            .unwrap();
        let err = connection
            .execute_query(Query::raw("SELECT 2"), recording_callback(&outcome))
            .unwrap_err();
        assert!(matches!(err, Error::Connection(_)));
    }

    #[test]
    fn copy_failure_kills_the_connection() {
        let factory = Arc::new(ScriptedFactory::new());
        factory.respond_with("COPY", crate::wire::ResultStatus::CopyIn, "");
        let connection = Connection::new(
            ConnectionOptions::new(),
            Arc::clone(&factory) as Arc<dyn WireFactory>,
            30,
        );

        let observed = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&observed);
        connection.set_state_change_callback(Arc::new(move |state| {
            sink.lock().push(state);
        }));

        let outcome: Outcome = Arc::new(Mutex::new(None));
        connection
            .execute_query(
                Query::raw("COPY t FROM STDIN"),
                recording_callback(&outcome),
            )
            .unwrap();
        drive(&connection);

        let (succeeded, failure) = outcome.lock().take().unwrap();
        assert!(!succeeded);
        assert_eq!(failure.unwrap(), "Query error: Row COPY not supported");
        assert_eq!(connection.state(), ConnectionState::Dead);
        assert!(observed.lock().contains(&ConnectionState::Dead));
    }

    #[test]
    fn empty_query_fails_but_stays_idle() {
        let factory = Arc::new(ScriptedFactory::new());
        factory.respond_with("SELECT nothing", crate::wire::ResultStatus::EmptyQuery, "");
        let connection = Connection::new(
            ConnectionOptions::new(),
            Arc::clone(&factory) as Arc<dyn WireFactory>,
            30,
        );

        let outcome: Outcome = Arc::new(Mutex::new(None));
        connection
            .execute_query(Query::raw("SELECT nothing"), recording_callback(&outcome))
            .unwrap();
        drive(&connection);

        let (succeeded, failure) = outcome.lock().take().unwrap();
        assert!(!succeeded);
        assert_eq!(failure.unwrap(), "Query error: Empty query");
        assert_eq!(connection.state(), ConnectionState::Idle);
    }

    #[test]
    fn connect_failure_surfaces_a_connection_error() {
        let factory = Arc::new(ScriptedFactory::new());
        factory.set_fail_connect(true);
        let connection = Connection::new(
            ConnectionOptions::new(),
            Arc::clone(&factory) as Arc<dyn WireFactory>,
            30,
        );

        let outcome: Outcome = Arc::new(Mutex::new(None));
        connection
            .execute_query(Query::raw("SELECT 1"), recording_callback(&outcome))
            .unwrap();
        drive(&connection);

        let (succeeded, failure) = outcome.lock().take().unwrap();
        assert!(!succeeded);
        assert!(failure.unwrap().starts_with("Connection error"));
        assert_eq!(connection.state(), ConnectionState::Dead);
    }

    #[test]
    fn dead_connection_reconnects_on_next_query() {
        let factory = Arc::new(ScriptedFactory::new());
        factory.respond_with("COPY", crate::wire::ResultStatus::CopyIn, "");
        let connection = Connection::new(
            ConnectionOptions::new(),
            Arc::clone(&factory) as Arc<dyn WireFactory>,
            30,
        );

        let outcome: Outcome = Arc::new(Mutex::new(None));
        connection
            .execute_query(
                Query::raw("COPY t FROM STDIN"),
                recording_callback(&outcome),
            )
            .unwrap();
        drive(&connection);
        assert_eq!(connection.state(), ConnectionState::Dead);

        // A fresh query on the dead connection triggers an async reset.
        connection
            .execute_query(Query::raw("SELECT 1"), recording_callback(&outcome))
            .unwrap();
        assert_eq!(connection.state(), ConnectionState::Resetting);
        drive(&connection);

        let (succeeded, _) = outcome.lock().take().unwrap();
        assert!(succeeded);
        assert_eq!(connection.state(), ConnectionState::Idle);
    }

    #[test]
    fn reset_clears_the_plan_cache() {
        let factory = Arc::new(ScriptedFactory::new());
        let connection = Connection::new(
            ConnectionOptions::new(),
            Arc::clone(&factory) as Arc<dyn WireFactory>,
            30,
        );
        connection.ensure_connected_blocking().unwrap();

        connection.with_plan_cache(|cache| {
            cache.assign("SELECT 1").unwrap();
        });
        assert_eq!(connection.with_plan_cache(|cache| cache.len()), 1);

        connection.begin_reset();
        assert_eq!(connection.state(), ConnectionState::Resetting);
        assert_eq!(connection.with_plan_cache(|cache| cache.len()), 0);
    }

    #[test]
    fn blocking_execution_classifies_results() {
        let factory = Arc::new(ScriptedFactory::new());
        factory.respond_with("broken", crate::wire::ResultStatus::FatalError, "boom");
        let connection = Connection::new(
            ConnectionOptions::new(),
            Arc::clone(&factory) as Arc<dyn WireFactory>,
            30,
        );

        let result = connection.execute_blocking(&Query::raw("SELECT 1")).unwrap();
        assert_eq!(result.status(), ResultStatus::CommandOk);

        let err = connection
            .execute_blocking(&Query::raw("SELECT broken"))
            .unwrap_err();
        assert_eq!(err.to_string(), "Query error: boom");
        assert_eq!(connection.state(), ConnectionState::Idle);
    }
}
