use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;

use super::PlanInfo;
use crate::error::Error;

/// Default number of plans kept per connection.
pub const DEFAULT_PLAN_CACHE_SIZE: usize = 30;
/// Hard upper bound on the configurable cache capacity.
pub const MAX_PLAN_CACHE_SIZE: usize = 1000;

const PLAN_NAME_PREFIX: &str = "EnigmaPlan_";

/// A server-side prepared statement bound to one wire session.
#[derive(Debug)]
pub struct CachedPlan {
    /// Server-assigned statement name, unique within the owning connection.
    pub statement_name: String,
    pub plan_info: PlanInfo,
}

/// Bounded LRU from original SQL text to its cached plan.
///
/// Statement names are only meaningful on the wire session that prepared
/// them, so each connection owns its own cache and clears it on reset (the
/// server has forgotten every statement by then).
pub struct PlanCache {
    plans: LruCache<String, Arc<CachedPlan>>,
    next_plan_id: u64,
}

impl PlanCache {
    /// Capacity is clamped to at least one slot; range validation happens at
    /// pool construction.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        PlanCache {
            plans: LruCache::new(capacity),
            next_plan_id: 0,
        }
    }

    /// Look up a plan, marking it most recently used.
    pub fn lookup(&mut self, sql: &str) -> Option<Arc<CachedPlan>> {
        self.plans.get(sql).cloned()
    }

    /// Analyse `sql`, give it a fresh statement name and cache it, evicting
    /// the least recently used plan when at capacity.
    ///
    /// # Errors
    /// Propagates the placeholder rewriter's parse error.
    pub fn assign(&mut self, sql: &str) -> Result<Arc<CachedPlan>, Error> {
        let plan_info = PlanInfo::new(sql)?;
        let statement_name = format!("{PLAN_NAME_PREFIX}{}", self.next_plan_id);
        self.next_plan_id += 1;

        let plan = Arc::new(CachedPlan {
            statement_name,
            plan_info,
        });
        self.plans.put(sql.to_string(), Arc::clone(&plan));
        Ok(plan)
    }

    /// Drop one plan, e.g. after its server-side prepare failed.
    pub fn forget(&mut self, sql: &str) {
        self.plans.pop(sql);
    }

    /// Drop everything; invoked when the wire session is reset.
    pub fn clear(&mut self) {
        self.plans.clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.plans.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.plans.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assigns_monotonic_statement_names() {
        let mut cache = PlanCache::new(10);
        let a = cache.assign("SELECT 1").unwrap();
        let b = cache.assign("SELECT 2").unwrap();
        assert_eq!(a.statement_name, "EnigmaPlan_0");
        assert_eq!(b.statement_name, "EnigmaPlan_1");
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn lookup_returns_cached_plan() {
        let mut cache = PlanCache::new(10);
        let assigned = cache.assign("SELECT * FROM t WHERE a = ?").unwrap();
        let found = cache.lookup("SELECT * FROM t WHERE a = ?").unwrap();
        assert_eq!(found.statement_name, assigned.statement_name);
        assert!(cache.lookup("SELECT * FROM other").is_none());
    }

    #[test]
    fn capacity_bound_evicts_least_recently_used() {
        let mut cache = PlanCache::new(2);
        cache.assign("SELECT 1").unwrap();
        cache.assign("SELECT 2").unwrap();
        // Touch the first entry so the second becomes the eviction victim.
        cache.lookup("SELECT 1").unwrap();
        cache.assign("SELECT 3").unwrap();

        assert_eq!(cache.len(), 2);
        assert!(cache.lookup("SELECT 1").is_some());
        assert!(cache.lookup("SELECT 2").is_none());
        assert!(cache.lookup("SELECT 3").is_some());
    }

    #[test]
    fn forget_and_clear() {
        let mut cache = PlanCache::new(5);
        cache.assign("SELECT 1").unwrap();
        cache.assign("SELECT 2").unwrap();
        cache.forget("SELECT 1");
        assert!(cache.lookup("SELECT 1").is_none());
        cache.clear();
        assert!(cache.is_empty());
        assert!(cache.lookup("SELECT 2").is_none());
    }

    #[test]
    fn parse_failure_is_propagated() {
        let mut cache = PlanCache::new(5);
        assert!(cache.assign("SELECT ? WHERE a = :a").is_err());
        assert!(cache.is_empty());
    }
}
