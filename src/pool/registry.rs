//! Process-wide registry of persistent pools.
//!
//! Pools created with `persistent = true` are registered under the
//! deterministic fingerprint of their connection options and shared by every
//! later `create_pool` call with the same options. Non-persistent pools are
//! never registered and die with their last handle.

use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use tracing::debug;

use super::{Pool, PoolHandle, PoolOptions};
use crate::error::Error;
use crate::event_loop::EventLoop;
use crate::wire::{ConnectionOptions, WireFactory};

/// Read-mostly map from connection-option fingerprint to a shared pool.
#[derive(Default)]
pub struct PersistentPoolStorage {
    pools: RwLock<HashMap<String, Arc<Pool>>>,
}

impl PersistentPoolStorage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the registered pool for these options, creating and installing
    /// one when absent.
    ///
    /// # Errors
    /// Propagates pool construction failures.
    pub fn get_or_create(
        &self,
        conn_options: ConnectionOptions,
        options: PoolOptions,
        factory: Arc<dyn WireFactory>,
        event_loop: Arc<dyn EventLoop>,
    ) -> Result<Arc<Pool>, Error> {
        let key = conn_options.fingerprint();

        if let Some(pool) = self.pools.read().get(&key) {
            return Ok(Arc::clone(pool));
        }

        let mut pools = self.pools.write();
        // Double-check under the write lock; another thread may have won.
        if let Some(pool) = pools.get(&key) {
            return Ok(Arc::clone(pool));
        }

        debug!(fingerprint = %key, "registering persistent pool");
        let pool = Pool::new(conn_options, options, factory, event_loop)?;
        pools.insert(key, Arc::clone(&pool));
        Ok(pool)
    }

    #[must_use]
    pub fn get(&self, conn_options: &ConnectionOptions) -> Option<Arc<Pool>> {
        self.pools.read().get(&conn_options.fingerprint()).cloned()
    }

    /// Explicitly drop a registered pool. Returns whether one was present.
    pub fn remove(&self, conn_options: &ConnectionOptions) -> bool {
        self.pools
            .write()
            .remove(&conn_options.fingerprint())
            .is_some()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.pools.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pools.read().is_empty()
    }
}

static GLOBAL_POOLS: Lazy<PersistentPoolStorage> = Lazy::new(PersistentPoolStorage::new);

/// Create a pool handle, consulting the process-wide registry when the
/// options ask for a persistent pool.
///
/// # Errors
/// `Error::Configuration` for out-of-range pool options.
pub fn create_pool(
    conn_options: ConnectionOptions,
    options: PoolOptions,
    factory: Arc<dyn WireFactory>,
    event_loop: Arc<dyn EventLoop>,
) -> Result<PoolHandle, Error> {
    let pool = if options.persistent {
        GLOBAL_POOLS.get_or_create(conn_options, options, factory, event_loop)?
    } else {
        Pool::new(conn_options, options, factory, event_loop)?
    };
    Ok(pool.handle())
}

/// Drop a pool from the process-wide registry. Handles that are still open
/// keep their pool alive until they are released.
pub fn remove_persistent_pool(conn_options: &ConnectionOptions) -> bool {
    GLOBAL_POOLS.remove(conn_options)
}
