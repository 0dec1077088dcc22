use std::collections::HashMap;

use crate::error::Error;
use crate::plan::{DEFAULT_PLAN_CACHE_SIZE, MAX_PLAN_CACHE_SIZE};

/// Number of connections kept alive per pool.
pub const DEFAULT_POOL_SIZE: usize = 1;
pub const MAX_POOL_SIZE: usize = 100;

/// Capacity of the shared waiting queue.
pub const DEFAULT_QUEUE_SIZE: usize = 50;
pub const MAX_QUEUE_SIZE: usize = 1000;

/// Options for configuring a pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolOptions {
    pub pool_size: usize,
    pub queue_size: usize,
    pub plan_cache_size: usize,
    /// Persistent pools are registered process-wide and shared across
    /// handles with the same connection-option fingerprint.
    pub persistent: bool,
}

impl Default for PoolOptions {
    fn default() -> Self {
        PoolOptions {
            pool_size: DEFAULT_POOL_SIZE,
            queue_size: DEFAULT_QUEUE_SIZE,
            plan_cache_size: DEFAULT_PLAN_CACHE_SIZE,
            persistent: false,
        }
    }
}

impl PoolOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse the recognised keys (`pool_size`, `queue_size`,
    /// `plan_cache_size`, `persistent`) from a string map; unrecognised keys
    /// are ignored.
    ///
    /// # Errors
    /// Returns `Error::Configuration` for unparsable or out-of-range values.
    pub fn from_map(options: &HashMap<String, String>) -> Result<Self, Error> {
        let mut opts = PoolOptions::default();
        if let Some(value) = options.get("pool_size") {
            opts.pool_size = parse_usize("pool_size", value)?;
        }
        if let Some(value) = options.get("queue_size") {
            opts.queue_size = parse_usize("queue_size", value)?;
        }
        if let Some(value) = options.get("plan_cache_size") {
            opts.plan_cache_size = parse_usize("plan_cache_size", value)?;
        }
        if let Some(value) = options.get("persistent") {
            opts.persistent = matches!(value.as_str(), "1" | "true" | "on" | "yes");
        }
        opts.validate()?;
        Ok(opts)
    }

    /// Check every limit against its compile-time maximum.
    ///
    /// # Errors
    /// Returns `Error::Configuration` naming the offending option.
    pub fn validate(&self) -> Result<(), Error> {
        check_range("pool_size", self.pool_size, MAX_POOL_SIZE)?;
        check_range("queue_size", self.queue_size, MAX_QUEUE_SIZE)?;
        check_range("plan_cache_size", self.plan_cache_size, MAX_PLAN_CACHE_SIZE)?;
        Ok(())
    }
}

/// Fluent builder for pool options.
#[derive(Debug, Clone, Default)]
pub struct PoolOptionsBuilder {
    opts: PoolOptions,
}

impl PoolOptionsBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn pool_size(mut self, pool_size: usize) -> Self {
        self.opts.pool_size = pool_size;
        self
    }

    #[must_use]
    pub fn queue_size(mut self, queue_size: usize) -> Self {
        self.opts.queue_size = queue_size;
        self
    }

    #[must_use]
    pub fn plan_cache_size(mut self, plan_cache_size: usize) -> Self {
        self.opts.plan_cache_size = plan_cache_size;
        self
    }

    #[must_use]
    pub fn persistent(mut self, persistent: bool) -> Self {
        self.opts.persistent = persistent;
        self
    }

    /// Validate and finish.
    ///
    /// # Errors
    /// Returns `Error::Configuration` when any limit is out of range.
    pub fn build(self) -> Result<PoolOptions, Error> {
        self.opts.validate()?;
        Ok(self.opts)
    }
}

fn parse_usize(key: &str, value: &str) -> Result<usize, Error> {
    value
        .parse()
        .map_err(|_| Error::Configuration(format!("{key} is not a valid integer: {value}")))
}

fn check_range(key: &str, value: usize, max: usize) -> Result<(), Error> {
    if value == 0 || value > max {
        return Err(Error::Configuration(format!(
            "{key} must be between 1 and {max}, got {value}"
        )));
    }
    Ok(())
}
