//! One-shot bridge between a submitted query and a suspended caller.
//!
//! A [`QueryAwait`] owns the event-loop subscription for a single in-flight
//! query: it forwards readiness events to the connection's state machine,
//! re-attaches when the wire library swaps sockets mid-connect, and keeps
//! WRITE interest armed only while the wire is actually flushing (a loop
//! would otherwise spin on spurious writable events). On completion it
//! detaches and resolves the caller's wait-handle.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::debug;

use crate::connection::Connection;
use crate::error::Error;
use crate::event_loop::{EventLoop, Interest, ReadinessHandler, Registration};
use crate::query::Query;
use crate::wire::{SocketFd, WireResult};

/// Pool-side completion callback, invoked with the success flag before the
/// caller's suspension resolves.
pub type CompletionCallback = Box<dyn FnOnce(bool) + Send>;

/// Runs exactly once when the awaiter completes terminally (bookkeeping such
/// as the handle's running-query counter).
pub type TerminalHook = Box<dyn FnOnce() + Send>;

/// The value a successful query resolves to. Row decoding is out of scope
/// here; callers downcast the wire result through
/// [`WireResult::as_any`].
pub struct QueryResult {
    result: Option<Box<dyn WireResult>>,
}

impl std::fmt::Debug for QueryResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryResult")
            .field("result", &self.result.is_some())
            .finish()
    }
}

impl QueryResult {
    pub(crate) fn from_wire(result: Option<Box<dyn WireResult>>) -> Self {
        QueryResult { result }
    }

    #[must_use]
    pub fn wire(&self) -> Option<&dyn WireResult> {
        self.result.as_deref()
    }

    #[must_use]
    pub fn into_wire(self) -> Option<Box<dyn WireResult>> {
        self.result
    }
}

struct AwaitState {
    query: Option<Query>,
    connection: Option<Arc<Connection>>,
    registration: Option<Box<dyn Registration>>,
    socket: SocketFd,
    writing: bool,
    completed: bool,
    succeeded: bool,
    result: Option<Box<dyn WireResult>>,
    failure: Option<Error>,
    callback: Option<CompletionCallback>,
    terminal_hook: Option<TerminalHook>,
    waker: Option<oneshot::Sender<Result<QueryResult, Error>>>,
}

pub struct QueryAwait {
    event_loop: Arc<dyn EventLoop>,
    state: Mutex<AwaitState>,
}

impl QueryAwait {
    #[must_use]
    pub fn new(query: Query, event_loop: Arc<dyn EventLoop>) -> Arc<Self> {
        Arc::new(QueryAwait {
            event_loop,
            state: Mutex::new(AwaitState {
                query: Some(query),
                connection: None,
                registration: None,
                socket: -1,
                writing: true,
                completed: false,
                succeeded: false,
                result: None,
                failure: None,
                callback: None,
                terminal_hook: None,
                waker: None,
            }),
        })
    }

    /// Install the caller-facing wait-handle. If the query already completed
    /// (e.g. canceled while queued) the handle resolves immediately.
    #[must_use]
    pub fn wait_handle(self: &Arc<Self>) -> WaitHandle {
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.state.lock();
            if state.completed {
                let _ = tx.send(Self::take_outcome(&mut state));
            } else {
                state.waker = Some(tx);
            }
        }
        WaitHandle {
            awaiter: Arc::clone(self),
            rx,
        }
    }

    /// Bind this awaiter to the connection that will carry its query. Happens
    /// exactly once, when the pool picks a connection.
    pub fn assign(&self, connection: Arc<Connection>) {
        let mut state = self.state.lock();
        assert!(
            state.connection.is_none(),
            "awaiter is already assigned to a connection"
        );
        state.connection = Some(connection);
    }

    #[must_use]
    pub fn has_connection(&self) -> bool {
        self.state.lock().connection.is_some()
    }

    /// Take the query out for inspection or replacement (auto-prepare swaps
    /// the original parameterized form for `Prepare`/`Prepared` variants).
    #[must_use]
    pub fn take_query(&self) -> Option<Query> {
        self.state.lock().query.take()
    }

    pub fn put_query(&self, query: Query) {
        self.state.lock().query = Some(query);
    }

    /// Bookkeeping to run at terminal completion, on whichever path it
    /// happens (success, failure, or local cancel).
    pub fn set_terminal_hook(&self, hook: TerminalHook) {
        self.state.lock().terminal_hook = Some(hook);
    }

    /// Send the query on the assigned connection and subscribe to its socket.
    pub fn begin(self: &Arc<Self>, callback: CompletionCallback) {
        debug!("beginning query");
        let (connection, query) = {
            let mut state = self.state.lock();
            if state.completed {
                // Canceled between queue pop and dispatch; let the pool run
                // its completion path so the connection is handed back.
                drop(state);
                callback(false);
                return;
            }
            state.callback = Some(callback);
            let connection = state
                .connection
                .clone()
                .expect("awaiter must be assigned before begin");
            let query = state.query.take().expect("awaiter has no query to begin");
            (connection, query)
        };

        let this = Arc::clone(self);
        let completion = Box::new(
            move |succeeded: bool, result: Option<Box<dyn WireResult>>, failure: Option<Error>| {
                this.query_completed(succeeded, result, failure);
            },
        );

        if let Err(err) = connection.execute_query(query, completion) {
            // Rejected before anything was sent; fail locally.
            self.query_completed(false, None, Some(err));
            return;
        }

        self.attach();
    }

    /// Cancel the query. If it has not been sent yet this completes
    /// immediately with [`Error::Canceled`]; otherwise a wire-level cancel is
    /// requested and the query may still complete successfully.
    pub fn cancel(&self) {
        let unsent = self.state.lock().query.is_some();
        if unsent {
            self.query_completed(false, None, Some(Error::Canceled));
        } else {
            let connection = self.state.lock().connection.clone();
            if let Some(connection) = connection {
                connection.cancel_query();
            }
        }
    }

    /// Fail the query locally, e.g. when dispatch raced with connection
    /// eviction.
    pub(crate) fn fail(&self, failure: Error) {
        self.query_completed(false, None, Some(failure));
    }

    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.state.lock().completed
    }

    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.state.lock().succeeded
    }

    fn socket_ready(&self, readable: bool, writable: bool) {
        if self.state.lock().completed {
            return;
        }

        let Some(connection) = self.state.lock().connection.clone() else {
            return;
        };

        // May re-enter query_completed below us.
        connection.socket_ready(readable, writable);

        let mut state = self.state.lock();
        if state.completed || state.registration.is_none() {
            return;
        }

        let fd = connection.socket();
        if connection.is_connecting() && fd != state.socket {
            // The wire library may retry a failed connect on a fresh socket
            // (e.g. falling back from SSL), so follow it.
            debug!(fd, "socket changed during connect, reattaching");
            if let Some(registration) = state.registration.as_ref() {
                registration.change_fd(fd);
                registration.rearm(Interest::READ | Interest::WRITE | Interest::PERSIST);
            }
            state.socket = fd;
            state.writing = true;
        } else if connection.is_writing() != state.writing {
            state.writing = connection.is_writing();
            let interest = if state.writing {
                Interest::READ | Interest::WRITE | Interest::PERSIST
            } else {
                Interest::READ | Interest::PERSIST
            };
            if let Some(registration) = state.registration.as_ref() {
                registration.rearm(interest);
            }
        }
    }

    fn query_completed(
        &self,
        succeeded: bool,
        result: Option<Box<dyn WireResult>>,
        failure: Option<Error>,
    ) {
        debug!(succeeded, "query completed");
        let callback = {
            let mut state = self.state.lock();
            if state.completed {
                return;
            }

            // The server cannot initiate traffic after answering, and a later
            // query on this connection uses a different awaiter; drop the
            // subscription before anything else.
            Self::detach(&self.event_loop, &mut state);

            state.succeeded = succeeded;
            state.result = result;
            state.failure = failure;
            state.callback.take()
        };

        if let Some(callback) = callback {
            callback(succeeded);
        }

        let (hook, resolution) = {
            let mut state = self.state.lock();
            if state.callback.is_some() {
                // The pool re-armed this awaiter (auto-prepare follow-up);
                // completion belongs to the re-issued query.
                debug!("awaiter re-armed, deferring completion");
                return;
            }

            state.completed = true;
            let hook = state.terminal_hook.take();
            let resolution = state
                .waker
                .take()
                .map(|waker| (waker, Self::take_outcome(&mut state)));
            (hook, resolution)
        };

        if let Some(hook) = hook {
            hook();
        }
        if let Some((waker, outcome)) = resolution {
            let _ = waker.send(outcome);
        }
    }

    fn take_outcome(state: &mut AwaitState) -> Result<QueryResult, Error> {
        if state.succeeded {
            Ok(QueryResult {
                result: state.result.take(),
            })
        } else {
            Err(state
                .failure
                .take()
                .unwrap_or_else(|| Error::Query("query failed".to_string())))
        }
    }

    fn attach(self: &Arc<Self>) {
        let this = Arc::clone(self);
        if self.event_loop.is_loop_thread() {
            this.register_now();
        } else {
            self.event_loop
                .schedule(Box::new(move || this.register_now()));
        }
    }

    fn register_now(self: Arc<Self>) {
        let connection = {
            let state = self.state.lock();
            if state.completed {
                return;
            }
            state.connection.clone()
        };
        let Some(connection) = connection else {
            return;
        };

        let fd = connection.socket();
        debug!(fd, "attaching socket handler");
        let handler: Arc<dyn ReadinessHandler> = Arc::clone(&self) as Arc<dyn ReadinessHandler>;
        let registration = self.event_loop.register(
            fd,
            Interest::READ | Interest::WRITE | Interest::PERSIST,
            handler,
        );

        let mut state = self.state.lock();
        if state.completed {
            registration.unregister();
            return;
        }
        state.registration = Some(registration);
        state.socket = fd;
        state.writing = true;
    }

    fn detach(event_loop: &Arc<dyn EventLoop>, state: &mut AwaitState) {
        if let Some(registration) = state.registration.take() {
            debug_assert!(
                event_loop.is_loop_thread(),
                "socket handlers must be detached on the loop thread"
            );
            debug!("detaching socket handler");
            registration.unregister();
        }
    }
}

impl ReadinessHandler for QueryAwait {
    fn ready(&self, readable: bool, writable: bool) {
        self.socket_ready(readable, writable);
    }
}

impl Drop for QueryAwait {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if let Some(registration) = state.registration.take() {
            registration.unregister();
        }
    }
}

/// The caller-facing suspension primitive returned by asynchronous
/// submission.
#[must_use = "await the wait-handle to observe the query outcome"]
pub struct WaitHandle {
    awaiter: Arc<QueryAwait>,
    rx: oneshot::Receiver<Result<QueryResult, Error>>,
}

impl std::fmt::Debug for WaitHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WaitHandle").finish_non_exhaustive()
    }
}

impl WaitHandle {
    /// Suspend until the query resolves.
    ///
    /// # Errors
    /// The failure recorded by the awaiter: a server-side
    /// [`Error::Query`], an [`Error::Connection`], or [`Error::Canceled`].
    pub async fn wait(self) -> Result<QueryResult, Error> {
        match self.rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(Error::Connection(
                "query dropped before completion".to_string(),
            )),
        }
    }

    /// Cancel the underlying query; see [`QueryAwait::cancel`].
    pub fn cancel(&self) {
        self.awaiter.cancel();
    }
}
