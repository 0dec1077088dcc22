//! Caller-facing, request-scoped pool handle.
//!
//! A [`PoolHandle`] carries the transaction state that pins a connection to
//! one logical session. Dropping the handle releases it; release of a handle
//! that still owns an open transaction triggers the assignment manager's
//! rollback path.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;
use tracing::warn;

use super::{ConnectionId, Pool};
use crate::awaiter::{QueryAwait, QueryResult, WaitHandle};
use crate::connection::Connection;
use crate::error::Error;
use crate::plan::PlanInfo;
use crate::query::{Query, QueryFlags, WireParam};
use crate::value::QueryParams;

/// Bound on the per-handle intra-transaction queue.
pub(crate) const TRANSACTION_QUEUE_SIZE: usize = 10;

/// Transaction affinity of one handle: the pinned connection (when inside an
/// implicit transaction), whether one of its queries is executing, and the
/// queries serialised behind it.
pub(crate) struct TransactionState {
    pub(crate) connection_id: Option<ConnectionId>,
    pub(crate) executing: bool,
    /// Pinned by an explicit `bind_connection` rather than a transaction;
    /// completion must not unpin it.
    pub(crate) bound: bool,
    pending: VecDeque<Arc<QueryAwait>>,
}

impl TransactionState {
    fn new() -> Self {
        TransactionState {
            connection_id: None,
            executing: false,
            bound: false,
            pending: VecDeque::new(),
        }
    }

    pub(crate) fn push_pending(&mut self, awaiter: Arc<QueryAwait>) -> Result<(), Error> {
        if self.pending.len() >= TRANSACTION_QUEUE_SIZE {
            return Err(Error::TransactionQueueFull);
        }
        self.pending.push_back(awaiter);
        Ok(())
    }

    pub(crate) fn pop_pending(&mut self) -> Option<Arc<QueryAwait>> {
        self.pending.pop_front()
    }

    pub(crate) fn drain_pending(&mut self) -> Vec<Arc<QueryAwait>> {
        self.pending.drain(..).collect()
    }
}

/// State shared between the caller-facing handle, queued work items and the
/// assignment manager. Queue items refer to the handle through this shared
/// state, which stays valid until release has drained everything that names
/// it.
pub(crate) struct HandleState {
    pub(crate) pool: Arc<Pool>,
    pub(crate) txn: Mutex<TransactionState>,
    pub(crate) running_queries: AtomicUsize,
    released: AtomicBool,
}

impl HandleState {
    pub(crate) fn new(pool: Arc<Pool>) -> Arc<Self> {
        Arc::new(HandleState {
            pool,
            txn: Mutex::new(TransactionState::new()),
            running_queries: AtomicUsize::new(0),
            released: AtomicBool::new(false),
        })
    }

    pub(crate) fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    pub(crate) fn release(self: &Arc<Self>) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }

        if !std::thread::panicking() {
            assert_eq!(
                self.running_queries.load(Ordering::SeqCst),
                0,
                "pool handle released while queries are still running"
            );
        }

        let pool = Arc::clone(&self.pool);
        pool.handle_released(self);
    }
}

/// Request-scoped facade over a shared [`Pool`].
pub struct PoolHandle {
    shared: Arc<HandleState>,
}

impl PoolHandle {
    pub(crate) fn new(shared: Arc<HandleState>) -> Self {
        PoolHandle { shared }
    }

    /// Submit a query asynchronously. Placeholders are rewritten, parameters
    /// bound, and the query queued on the pool; the returned wait-handle
    /// resolves when the query completes.
    ///
    /// # Errors
    /// Synchronous failures: `Parse`, `ParameterCountMismatch`,
    /// `MissingParameter`, `QueueFull`, `TransactionQueueFull`,
    /// `HandleReleased`. Server-side failures surface from the wait-handle.
    pub fn async_query(
        &self,
        sql: &str,
        params: impl Into<QueryParams>,
        flags: QueryFlags,
    ) -> Result<WaitHandle, Error> {
        if self.shared.is_released() {
            return Err(Error::HandleReleased);
        }

        let plan = PlanInfo::new(sql)?;
        let wire_params = plan.map_parameters(&params.into())?;
        let query =
            Query::parameterized(plan.rewritten().to_string(), wire_params).with_flags(flags);

        let awaiter = self.shared.pool.enqueue(query, &self.shared)?;
        Ok(awaiter.wait_handle())
    }

    /// Execute a query synchronously on a directly acquired connection,
    /// bypassing the event loop. The connection is returned to the pool on
    /// every path, including failures.
    ///
    /// # Errors
    /// As [`async_query`](Self::async_query), plus wire-level failures.
    pub fn sync_query(
        &self,
        sql: &str,
        params: impl Into<QueryParams>,
        flags: QueryFlags,
    ) -> Result<QueryResult, Error> {
        if self.shared.is_released() {
            return Err(Error::HandleReleased);
        }

        let plan = PlanInfo::new(sql)?;
        let wire_params = plan.map_parameters(&params.into())?;

        let pool = &self.shared.pool;
        let cid = pool
            .acquire_connection(&self.shared)
            .ok_or_else(|| Error::Connection("no idle connection available".to_string()))?;
        let Some(connection) = pool.connection(cid) else {
            return Err(Error::Connection("connection no longer exists".to_string()));
        };

        let outcome = Self::sync_execute(&connection, &plan, wire_params, flags);
        pool.finish_sync(cid, &self.shared);
        outcome
    }

    fn sync_execute(
        connection: &Arc<Connection>,
        plan: &PlanInfo,
        params: Vec<WireParam>,
        flags: QueryFlags,
    ) -> Result<QueryResult, Error> {
        if flags.cache_plan {
            let sql = plan.rewritten();
            let cached = connection.with_plan_cache(|cache| cache.lookup(sql));
            let entry = match cached {
                Some(entry) => entry,
                None => {
                    let entry = connection.with_plan_cache(|cache| cache.assign(sql))?;
                    let prepare = Query::prepare(
                        entry.statement_name.clone(),
                        entry.plan_info.rewritten().to_string(),
                        params.len(),
                    );
                    if let Err(err) = connection.execute_blocking(&prepare) {
                        warn!(error = %err, "statement prepare failed, dropping plan");
                        connection.with_plan_cache(|cache| cache.forget(sql));
                        return Err(err);
                    }
                    entry
                }
            };

            let query =
                Query::prepared(entry.statement_name.clone(), params).with_flags(flags);
            connection
                .execute_blocking(&query)
                .map(|result| QueryResult::from_wire(Some(result)))
        } else {
            let query =
                Query::parameterized(plan.rewritten().to_string(), params).with_flags(flags);
            connection
                .execute_blocking(&query)
                .map(|result| QueryResult::from_wire(Some(result)))
        }
    }

    /// Acquire and hold a dedicated connection for this handle even outside a
    /// transaction (e.g. for `LISTEN`-style sessions). Released together with
    /// the handle.
    ///
    /// # Errors
    /// `HandleReleased`, or `Connection` when no idle connection is
    /// available.
    pub fn bind_connection(&self) -> Result<(), Error> {
        if self.shared.is_released() {
            return Err(Error::HandleReleased);
        }
        self.shared.pool.bind_handle_connection(&self.shared)
    }

    /// Release the handle. Idempotent; runs the assignment manager's release
    /// hook, which rolls back any abandoned transaction. A handle with
    /// running queries must not be released.
    pub fn release(&self) {
        self.shared.release();
    }

    #[must_use]
    pub fn is_released(&self) -> bool {
        self.shared.is_released()
    }

    /// The connection currently pinned to this handle, when inside a
    /// transaction or bound explicitly.
    #[must_use]
    pub fn pinned_connection(&self) -> Option<ConnectionId> {
        self.shared.txn.lock().connection_id
    }
}

impl Drop for PoolHandle {
    fn drop(&mut self) {
        self.shared.release();
    }
}
