//! Connection assignment policy.
//!
//! A connection that finishes a query while the server still reports an open
//! transaction must not return to the shared idle pool: it belongs to the
//! handle that submitted the query until COMMIT/ROLLBACK or handle release.
//! [`TransactionLifetimeManager`] implements that policy behind the
//! [`AssignmentManager`] trait, which is the seam where other policies
//! (fairness, affinity) would plug in.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::handle::HandleState;
use super::{ConnectionId, Pool};
use crate::awaiter::QueryAwait;
use crate::error::Error;
use crate::query::Query;

/// Hooks the pool calls around enqueueing, dispatch and completion.
pub(crate) trait AssignmentManager: Send + Sync {
    /// Try to absorb a freshly enqueued query. Returns `true` when the
    /// manager took responsibility (the shared queue must not see it).
    fn enqueue(
        &self,
        pool: &Arc<Pool>,
        awaiter: Arc<QueryAwait>,
        handle: &Arc<HandleState>,
    ) -> Result<bool, Error>;

    /// Connection already assigned to this handle, if any.
    fn assign_connection(&self, handle: &Arc<HandleState>) -> Option<ConnectionId>;

    /// Next queued query that must run on this connection, if any.
    fn assign_query(&self, cid: ConnectionId)
    -> Option<(Arc<QueryAwait>, Arc<HandleState>)>;

    /// A query on `cid` submitted through `handle` has completed. Returns
    /// whether the connection may go back to the shared idle pool.
    fn notify_finish_assignment(
        &self,
        pool: &Arc<Pool>,
        handle: &Arc<HandleState>,
        cid: ConnectionId,
    ) -> bool;

    fn notify_handle_created(&self, handle: &Arc<HandleState>);

    fn notify_handle_released(&self, pool: &Arc<Pool>, handle: &Arc<HandleState>);

    fn notify_connection_added(&self, cid: ConnectionId);

    fn notify_connection_removed(&self, cid: ConnectionId);

    /// Pin `cid` to `handle` outside of any transaction (dedicated-connection
    /// sessions).
    fn bind(&self, cid: ConnectionId, handle: &Arc<HandleState>);
}

#[derive(Default)]
struct PinState {
    handle: Option<Arc<HandleState>>,
    rolling_back: bool,
}

/// The transaction-affinity policy: pin on entering a transaction, serialise
/// intra-transaction queries, roll back on abandonment.
#[derive(Default)]
pub(crate) struct TransactionLifetimeManager {
    connections: Mutex<HashMap<ConnectionId, PinState>>,
}

impl TransactionLifetimeManager {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn pinned_handle(&self, cid: ConnectionId) -> Option<Arc<HandleState>> {
        self.connections
            .lock()
            .get(&cid)
            .and_then(|state| state.handle.clone())
    }

    fn take_rolling_back(&self, cid: ConnectionId) -> bool {
        let mut connections = self.connections.lock();
        match connections.get_mut(&cid) {
            Some(state) if state.rolling_back => {
                state.rolling_back = false;
                true
            }
            _ => false,
        }
    }

    fn begin_transaction(&self, cid: ConnectionId, handle: &Arc<HandleState>) {
        debug!(%cid, "pinning connection to handle");
        {
            let mut txn = handle.txn.lock();
            debug_assert!(txn.connection_id.is_none(), "handle is already pinned");
            txn.connection_id = Some(cid);
        }
        if let Some(state) = self.connections.lock().get_mut(&cid) {
            state.handle = Some(Arc::clone(handle));
        }
    }

    fn finish_transaction(&self, pool: &Arc<Pool>, cid: ConnectionId, handle: &Arc<HandleState>) {
        debug!(%cid, "unpinning connection from handle");
        if let Some(state) = self.connections.lock().get_mut(&cid) {
            state.handle = None;
        }

        let (drained, executing) = {
            let mut txn = handle.txn.lock();
            txn.connection_id = None;
            txn.bound = false;
            (txn.drain_pending(), txn.executing)
        };

        // Queries submitted after COMMIT/ROLLBACK belong to the shared queue.
        for awaiter in drained {
            pool.requeue(awaiter, Arc::clone(handle));
        }

        let in_transaction = pool
            .connection(cid)
            .is_some_and(|connection| connection.in_transaction());
        if in_transaction {
            if executing {
                // The completion path picks this up once the in-flight query
                // finishes.
                if let Some(state) = self.connections.lock().get_mut(&cid) {
                    state.rolling_back = true;
                }
            } else {
                self.rollback(pool, cid);
            }
        }
    }

    fn rollback(&self, pool: &Arc<Pool>, cid: ConnectionId) {
        debug!(%cid, "rolling back abandoned transaction");
        let Some(connection) = pool.connection(cid) else {
            return;
        };

        let awaiter = QueryAwait::new(Query::raw("rollback"), pool.event_loop());
        awaiter.assign(Arc::clone(&connection));

        let pool_weak = Arc::downgrade(pool);
        let callback = Box::new(move |succeeded: bool| {
            if !succeeded {
                // The session is in an unknown state; a reset is the only way
                // back to a usable connection.
                warn!(%cid, "rollback failed, resetting connection");
                connection.begin_reset();
            }
            if let Some(pool) = pool_weak.upgrade() {
                pool.release_connection(cid);
            }
        });

        let event_loop = pool.event_loop();
        if event_loop.is_loop_thread() {
            awaiter.begin(callback);
        } else {
            event_loop.schedule(Box::new(move || awaiter.begin(callback)));
        }
    }
}

impl AssignmentManager for TransactionLifetimeManager {
    fn enqueue(
        &self,
        pool: &Arc<Pool>,
        awaiter: Arc<QueryAwait>,
        handle: &Arc<HandleState>,
    ) -> Result<bool, Error> {
        let dispatch = {
            let mut txn = handle.txn.lock();
            let Some(cid) = txn.connection_id else {
                return Ok(false);
            };

            if txn.executing {
                debug!(%cid, "queueing query behind the open transaction");
                txn.push_pending(Arc::clone(&awaiter))?;
                None
            } else {
                txn.executing = true;
                Some(cid)
            }
        };

        if let Some(cid) = dispatch {
            debug!(%cid, "dispatching query on pinned connection");
            pool.execute(cid, awaiter, Arc::clone(handle));
        }
        Ok(true)
    }

    fn assign_connection(&self, handle: &Arc<HandleState>) -> Option<ConnectionId> {
        handle.txn.lock().connection_id
    }

    fn assign_query(
        &self,
        cid: ConnectionId,
    ) -> Option<(Arc<QueryAwait>, Arc<HandleState>)> {
        let handle = self.pinned_handle(cid)?;
        let awaiter = {
            let mut txn = handle.txn.lock();
            debug_assert_eq!(txn.connection_id, Some(cid));
            debug_assert!(!txn.executing);
            let awaiter = txn.pop_pending()?;
            txn.executing = true;
            awaiter
        };
        debug!(%cid, "assigning queued transactional query");
        Some((awaiter, handle))
    }

    fn notify_finish_assignment(
        &self,
        pool: &Arc<Pool>,
        handle: &Arc<HandleState>,
        cid: ConnectionId,
    ) -> bool {
        let in_transaction = pool
            .connection(cid)
            .is_some_and(|connection| connection.in_transaction());

        let (assigned, bound) = {
            let mut txn = handle.txn.lock();
            let assigned = txn.connection_id.is_some();
            txn.executing = false;
            (assigned, txn.bound)
        };

        // An explicitly bound connection stays with its handle regardless of
        // transaction state.
        if assigned && bound {
            return false;
        }

        // A handle released mid-query left its rollback to this completion.
        if self.take_rolling_back(cid) {
            if in_transaction {
                self.rollback(pool, cid);
                return false;
            }
            return true;
        }

        if in_transaction && !assigned {
            if handle.is_released() {
                // The caller walked away before the pinning completion ran;
                // never pin a released handle.
                self.rollback(pool, cid);
                return false;
            }
            self.begin_transaction(cid, handle);
        } else if !in_transaction && assigned {
            self.finish_transaction(pool, cid, handle);
        }

        !in_transaction
    }

    fn notify_handle_created(&self, _handle: &Arc<HandleState>) {}

    fn notify_handle_released(&self, pool: &Arc<Pool>, handle: &Arc<HandleState>) {
        let cid = handle.txn.lock().connection_id;
        let Some(cid) = cid else {
            return;
        };

        debug!(%cid, "dropping transaction of released handle");
        self.finish_transaction(pool, cid, handle);

        let in_transaction = pool
            .connection(cid)
            .is_some_and(|connection| connection.in_transaction());
        if !in_transaction {
            pool.release_connection(cid);
        }
    }

    fn notify_connection_added(&self, cid: ConnectionId) {
        self.connections.lock().insert(cid, PinState::default());
    }

    fn notify_connection_removed(&self, cid: ConnectionId) {
        self.connections.lock().remove(&cid);
    }

    fn bind(&self, cid: ConnectionId, handle: &Arc<HandleState>) {
        self.begin_transaction(cid, handle);
        handle.txn.lock().bound = true;
    }
}
