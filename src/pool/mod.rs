//! Connection pool and scheduler.
//!
//! The pool owns a fixed set of connections, a bounded queue of waiting
//! queries, and the auto-prepare interlock that transparently upgrades
//! plan-cached parameterized queries to server-side prepared statements.
//! Dispatch is FIFO; completion hands the connection back through the
//! assignment manager, which decides between the shared idle queue and
//! transaction pinning.

pub mod config;
pub mod registry;

mod assignment;
mod handle;

pub use config::{PoolOptions, PoolOptionsBuilder};
pub use handle::PoolHandle;
pub use registry::{PersistentPoolStorage, create_pool, remove_persistent_pool};

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use self::assignment::{AssignmentManager, TransactionLifetimeManager};
use self::handle::HandleState;
use crate::awaiter::QueryAwait;
use crate::connection::Connection;
use crate::error::Error;
use crate::event_loop::EventLoop;
use crate::query::{Query, QueryKind};
use crate::wire::{ConnectionOptions, WireFactory};

/// Connections live in the pool's map and everything else names them by id,
/// so evicting one can never dangle a borrow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u32);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

struct QueueItem {
    awaiter: Arc<QueryAwait>,
    handle: Arc<HandleState>,
}

struct PoolState {
    next_connection_id: u32,
    queue: VecDeque<QueueItem>,
    idle: VecDeque<ConnectionId>,
    connections: HashMap<ConnectionId, Arc<Connection>>,
    /// Awaiters whose `Prepare` is in flight, by connection.
    preparing: HashMap<ConnectionId, (Arc<QueryAwait>, Arc<HandleState>)>,
    /// The original parameterized query to re-issue once its prepare lands.
    pending_prepare: HashMap<ConnectionId, Query>,
}

/// A shared pool of backend connections multiplexing caller queries.
pub struct Pool {
    conn_options: ConnectionOptions,
    options: PoolOptions,
    factory: Arc<dyn WireFactory>,
    event_loop: Arc<dyn EventLoop>,
    assignment: Box<dyn AssignmentManager>,
    state: Mutex<PoolState>,
}

impl Pool {
    /// Create a pool with `options.pool_size` connections. Connections start
    /// `Dead` and connect lazily on first dispatch.
    ///
    /// # Errors
    /// `Error::Configuration` when any option is out of range.
    pub fn new(
        conn_options: ConnectionOptions,
        options: PoolOptions,
        factory: Arc<dyn WireFactory>,
        event_loop: Arc<dyn EventLoop>,
    ) -> Result<Arc<Self>, Error> {
        options.validate()?;

        let pool = Arc::new(Pool {
            conn_options,
            options,
            factory,
            event_loop,
            assignment: Box::new(TransactionLifetimeManager::new()),
            state: Mutex::new(PoolState {
                next_connection_id: 0,
                queue: VecDeque::new(),
                idle: VecDeque::new(),
                connections: HashMap::new(),
                preparing: HashMap::new(),
                pending_prepare: HashMap::new(),
            }),
        });

        for _ in 0..pool.options.pool_size {
            pool.add_connection();
        }

        Ok(pool)
    }

    /// Open a caller-facing handle onto this pool.
    #[must_use]
    pub fn handle(self: &Arc<Self>) -> PoolHandle {
        let shared = HandleState::new(Arc::clone(self));
        self.assignment.notify_handle_created(&shared);
        PoolHandle::new(shared)
    }

    #[must_use]
    pub fn options(&self) -> &PoolOptions {
        &self.options
    }

    #[must_use]
    pub fn connection_options(&self) -> &ConnectionOptions {
        &self.conn_options
    }

    /// Number of connections currently in the shared idle queue.
    #[must_use]
    pub fn idle_count(&self) -> usize {
        self.state.lock().idle.len()
    }

    /// Number of queries waiting in the shared queue.
    #[must_use]
    pub fn queued_count(&self) -> usize {
        self.state.lock().queue.len()
    }

    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.state.lock().connections.len()
    }

    /// Add one connection to the pool.
    pub fn add_connection(self: &Arc<Self>) -> ConnectionId {
        let connection = Arc::new(Connection::new(
            self.conn_options.clone(),
            Arc::clone(&self.factory),
            self.options.plan_cache_size,
        ));

        let cid = {
            let mut state = self.state.lock();
            let cid = ConnectionId(state.next_connection_id);
            state.next_connection_id += 1;
            state.connections.insert(cid, connection);
            state.idle.push_back(cid);
            cid
        };
        self.assignment.notify_connection_added(cid);
        debug!(%cid, "connection added");
        cid
    }

    /// Evict a connection. Queued work keeps its place; dispatch skips ids
    /// that no longer resolve.
    pub fn remove_connection(self: &Arc<Self>, cid: ConnectionId) {
        {
            let mut state = self.state.lock();
            state.connections.remove(&cid);
            state.idle.retain(|&idle_cid| idle_cid != cid);
            state.preparing.remove(&cid);
            state.pending_prepare.remove(&cid);
        }
        self.assignment.notify_connection_removed(cid);
        debug!(%cid, "connection removed");
    }

    /// Look up a connection by id, e.g. for instrumentation.
    #[must_use]
    pub fn connection(&self, cid: ConnectionId) -> Option<Arc<Connection>> {
        self.state.lock().connections.get(&cid).cloned()
    }

    /// Ids of all live connections, in id order.
    #[must_use]
    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        let state = self.state.lock();
        let mut ids: Vec<ConnectionId> = state.connections.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub(crate) fn event_loop(&self) -> Arc<dyn EventLoop> {
        Arc::clone(&self.event_loop)
    }

    /// Queue a query for execution.
    ///
    /// # Errors
    /// `QueueFull` when the shared queue is at capacity,
    /// `TransactionQueueFull` when the handle's intra-transaction queue is.
    pub(crate) fn enqueue(
        self: &Arc<Self>,
        query: Query,
        handle: &Arc<HandleState>,
    ) -> Result<Arc<QueryAwait>, Error> {
        {
            let state = self.state.lock();
            if state.queue.len() >= self.options.queue_size {
                return Err(Error::QueueFull);
            }
        }

        let awaiter = QueryAwait::new(query, Arc::clone(&self.event_loop));
        handle
            .running_queries
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let accounting = Arc::clone(handle);
        awaiter.set_terminal_hook(Box::new(move || {
            accounting
                .running_queries
                .fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
        }));

        let absorbed = match self.assignment.enqueue(self, Arc::clone(&awaiter), handle) {
            Ok(absorbed) => absorbed,
            Err(err) => {
                handle
                    .running_queries
                    .fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
                return Err(err);
            }
        };

        if !absorbed {
            let mut state = self.state.lock();
            state.queue.push_back(QueueItem {
                awaiter: Arc::clone(&awaiter),
                handle: Arc::clone(handle),
            });
        }

        self.try_execute_next();
        Ok(awaiter)
    }

    /// Re-queue an awaiter drained from a handle's transaction queue.
    pub(crate) fn requeue(self: &Arc<Self>, awaiter: Arc<QueryAwait>, handle: Arc<HandleState>) {
        self.state
            .lock()
            .queue
            .push_back(QueueItem { awaiter, handle });
    }

    /// Dispatch one waiting query if an idle connection is available.
    pub(crate) fn try_execute_next(self: &Arc<Self>) {
        let item = {
            let mut state = self.state.lock();
            if state.idle.is_empty() {
                return;
            }

            // Skip waiters that were canceled while queued.
            loop {
                match state.queue.pop_front() {
                    Some(item) if item.awaiter.is_completed() => {}
                    Some(item) => break item,
                    None => return,
                }
            }
        };

        let cid = match self.assignment.assign_connection(&item.handle) {
            Some(cid) => Some(cid),
            None => self.pop_idle(),
        };

        let Some(cid) = cid else {
            // Raced out of idle connections; keep the waiter's place.
            self.state.lock().queue.push_front(item);
            return;
        };

        self.execute(cid, item.awaiter, item.handle);
    }

    /// Pop an idle connection id, skipping ids whose connection has been
    /// removed since it was queued.
    fn pop_idle(&self) -> Option<ConnectionId> {
        let mut state = self.state.lock();
        while let Some(cid) = state.idle.pop_front() {
            if state.connections.contains_key(&cid) {
                return Some(cid);
            }
        }
        None
    }

    /// Execute a query on a specific connection, applying the auto-prepare
    /// upgrade when the query asks for plan caching.
    pub(crate) fn execute(
        self: &Arc<Self>,
        cid: ConnectionId,
        awaiter: Arc<QueryAwait>,
        handle: Arc<HandleState>,
    ) {
        let Some(connection) = self.connection(cid) else {
            warn!(%cid, "dispatch raced with connection eviction");
            awaiter.fail(Error::Connection("connection no longer exists".to_string()));
            return;
        };

        if let Some(query) = awaiter.take_query() {
            let query = self.apply_auto_prepare(cid, &connection, query, &awaiter, &handle);
            awaiter.put_query(query);
        }

        if !awaiter.has_connection() {
            awaiter.assign(Arc::clone(&connection));
        }

        let pool = Arc::downgrade(self);
        let completion_handle = Arc::clone(&handle);
        awaiter.begin(Box::new(move |_succeeded| {
            if let Some(pool) = pool.upgrade() {
                pool.query_completed(cid, &completion_handle);
            }
        }));
    }

    /// Upgrade a plan-cached parameterized query: on a cache hit substitute
    /// the `Prepared` form, on a miss issue a `Prepare` first and stash the
    /// original for the follow-up execution.
    fn apply_auto_prepare(
        self: &Arc<Self>,
        cid: ConnectionId,
        connection: &Arc<Connection>,
        query: Query,
        awaiter: &Arc<QueryAwait>,
        handle: &Arc<HandleState>,
    ) -> Query {
        let flags = query.flags();
        if !flags.cache_plan {
            return query;
        }
        let (sql, params) = match query.into_kind() {
            QueryKind::Parameterized { sql, params } => (sql, params),
            other => return Query::from_parts(other, flags),
        };

        if let Some(plan) = connection.with_plan_cache(|cache| cache.lookup(&sql)) {
            debug!(%cid, statement = %plan.statement_name, "plan cache hit");
            return Query::prepared(plan.statement_name.clone(), params).with_flags(flags);
        }

        match connection.with_plan_cache(|cache| cache.assign(&sql)) {
            Ok(plan) => {
                debug!(%cid, statement = %plan.statement_name, "preparing new plan");
                let prepare = Query::prepare(
                    plan.statement_name.clone(),
                    plan.plan_info.rewritten().to_string(),
                    params.len(),
                )
                .with_flags(flags);

                let mut state = self.state.lock();
                state
                    .preparing
                    .insert(cid, (Arc::clone(awaiter), Arc::clone(handle)));
                state
                    .pending_prepare
                    .insert(cid, Query::parameterized(sql, params).with_flags(flags));
                prepare
            }
            Err(err) => {
                // The SQL could not be analysed for caching; run it as-is.
                warn!(%cid, error = %err, "plan analysis failed, skipping cache");
                Query::parameterized(sql, params).with_flags(flags)
            }
        }
    }

    /// Completion path: finish the auto-prepare interlock, let the assignment
    /// manager pin or release the connection, then make progress on the
    /// queues.
    fn query_completed(self: &Arc<Self>, cid: ConnectionId, handle: &Arc<HandleState>) {
        debug!(%cid, "query completed");

        if self.finish_prepare_interlock(cid) {
            return;
        }

        let release = self.assignment.notify_finish_assignment(self, handle, cid);
        if release {
            self.push_idle(cid);
        } else if let Some((next_awaiter, next_handle)) = self.assignment.assign_query(cid) {
            self.execute(cid, next_awaiter, next_handle);
        }

        self.try_execute_next();
    }

    /// Handle the completion of an auto-prepare `Prepare`. Returns `true`
    /// when the connection stays busy with the follow-up execution.
    fn finish_prepare_interlock(self: &Arc<Self>, cid: ConnectionId) -> bool {
        let (entry, original) = {
            let mut state = self.state.lock();
            let entry = state.preparing.remove(&cid);
            let original = state.pending_prepare.remove(&cid);
            (entry, original)
        };

        let (Some((awaiter, handle)), Some(original)) = (entry, original) else {
            return false;
        };

        if awaiter.succeeded() {
            debug!(%cid, "statement prepared, issuing execution");
            awaiter.put_query(original);
            self.execute(cid, awaiter, handle);
            return true;
        }

        // The prepare failed; the failure reaches the caller through the
        // awaiter, and the plan must not be offered again.
        if let Some(sql) = original.sql() {
            if let Some(connection) = self.connection(cid) {
                warn!(%cid, "statement prepare failed, dropping plan");
                connection.with_plan_cache(|cache| cache.forget(sql));
            }
        }
        false
    }

    /// Sync-path completion: run the assignment hooks for a query that was
    /// executed outside the event loop.
    pub(crate) fn finish_sync(self: &Arc<Self>, cid: ConnectionId, handle: &Arc<HandleState>) {
        let release = self.assignment.notify_finish_assignment(self, handle, cid);
        if release {
            self.push_idle(cid);
        }
        self.try_execute_next();
    }

    /// Return a connection to the shared idle queue and drain one waiter.
    pub(crate) fn release_connection(self: &Arc<Self>, cid: ConnectionId) {
        self.push_idle(cid);
        self.try_execute_next();
    }

    fn push_idle(&self, cid: ConnectionId) {
        let occupied = self
            .connection(cid)
            .is_some_and(|connection| connection.has_queued_query());

        let mut state = self.state.lock();
        if !state.connections.contains_key(&cid) || occupied || state.idle.contains(&cid) {
            return;
        }
        state.idle.push_back(cid);
    }

    /// Pinned connection for the handle if any, otherwise an idle one.
    pub(crate) fn acquire_connection(
        self: &Arc<Self>,
        handle: &Arc<HandleState>,
    ) -> Option<ConnectionId> {
        self.assignment
            .assign_connection(handle)
            .or_else(|| self.pop_idle())
    }

    /// Pin an idle connection to the handle outside any transaction.
    pub(crate) fn bind_handle_connection(
        self: &Arc<Self>,
        handle: &Arc<HandleState>,
    ) -> Result<(), Error> {
        if self.assignment.assign_connection(handle).is_some() {
            return Ok(());
        }

        let cid = self
            .pop_idle()
            .ok_or_else(|| Error::Connection("no idle connection available".to_string()))?;
        self.assignment.bind(cid, handle);
        debug!(%cid, "connection bound to handle");
        Ok(())
    }

    pub(crate) fn handle_released(self: &Arc<Self>, handle: &Arc<HandleState>) {
        self.assignment.notify_handle_released(self, handle);
    }
}
