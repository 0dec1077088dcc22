/*!
 * Enigma Pool - an asynchronous PostgreSQL client front-end
 *
 * This crate multiplexes many concurrent SQL requests over a small, bounded
 * set of long-lived wire connections. It provides:
 *
 * - Placeholder rewriting from `?` / `:name` to PostgreSQL's `$N`, with
 *   whitelisted edge bytes so literals, casts and array syntax survive
 * - A per-connection LRU plan cache with transparent auto-prepare
 * - A libpq-style per-connection state machine driven by readiness events
 *   from an external event loop
 * - A pooled scheduler with a bounded waiting queue
 * - Transaction affinity: a connection that enters an implicit transaction
 *   is pinned to its handle until COMMIT/ROLLBACK or release, with rollback
 *   on abandonment
 * - A process-wide registry for persistent pools
 *
 * The concrete wire codec and event loop are supplied by the caller through
 * the [`wire`] and [`event_loop`] traits; [`testkit`] contains scripted
 * implementations for tests.
 *
 * # Example
 *
 * ```rust
 * use enigma_pool::prelude::*;
 * use std::sync::Arc;
 *
 * # fn demo() -> Result<(), enigma_pool::Error> {
 * let factory = Arc::new(ScriptedFactory::new());
 * let event_loop = SimLoop::new();
 *
 * let conn_opts: ConnectionOptions =
 *     [("host", "localhost"), ("dbname", "app")].into_iter().collect();
 * let options = PoolOptionsBuilder::new().pool_size(2).build()?;
 *
 * let pool = Pool::new(conn_opts, options, factory, event_loop.clone())?;
 * let handle = pool.handle();
 *
 * let wait = handle.async_query(
 *     "SELECT * FROM t WHERE id = ?",
 *     vec![ParamValue::Int(1)],
 *     QueryFlags::new().cache_plan(),
 * )?;
 *
 * // The external event loop drives the query to completion.
 * event_loop.tick();
 * event_loop.tick();
 * # let _ = wait;
 * # Ok(())
 * # }
 * ```
 */

#![forbid(unsafe_code)]

pub mod awaiter;
pub mod connection;
pub mod error;
pub mod event_loop;
pub mod plan;
pub mod pool;
pub mod query;
pub mod testkit;
pub mod value;
pub mod wire;

/// Convenient imports for common functionality.
pub mod prelude {
    pub use crate::awaiter::{QueryResult, WaitHandle};
    pub use crate::connection::{Connection, ConnectionState};
    pub use crate::error::Error;
    pub use crate::event_loop::{EventLoop, Interest, ReadinessHandler, Registration};
    pub use crate::plan::{PlaceholderKind, PlanCache, PlanInfo};
    pub use crate::pool::{
        ConnectionId, PersistentPoolStorage, Pool, PoolHandle, PoolOptions, PoolOptionsBuilder,
        create_pool, remove_persistent_pool,
    };
    pub use crate::query::{Query, QueryFlags};
    pub use crate::testkit::{ScriptedFactory, SentCommand, SimLoop, WireLog};
    pub use crate::value::{ParamValue, QueryParams};
    pub use crate::wire::{
        ConnectionOptions, PollingStatus, ResultStatus, TransactionStatus, WireConnection,
        WireFactory, WireResult,
    };
}

pub use awaiter::{QueryAwait, QueryResult, WaitHandle};
pub use connection::{Connection, ConnectionState};
pub use error::Error;
pub use plan::{CachedPlan, PlaceholderKind, PlanCache, PlanInfo};
pub use pool::{
    ConnectionId, PersistentPoolStorage, Pool, PoolHandle, PoolOptions, PoolOptionsBuilder,
    create_pool, remove_persistent_pool,
};
pub use query::{Query, QueryFlags, WireParam};
pub use value::{ParamValue, QueryParams};
pub use wire::{ConnectionOptions, TransactionStatus};
