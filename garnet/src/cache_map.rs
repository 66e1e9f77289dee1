use std::sync::{
    Weak,
    atomic::{AtomicUsize, Ordering},
};

use dashmap::DashMap;

use crate::{Method, MethodId};

/// Something holding a cached lookup result that must forget it when the
/// method is shadowed.
pub trait CacheSite: Send + Sync {
    fn remove_cached_method(&self);
}

/// Registrations between two sweeps of methods whose sites all died.
const SWEEP_INTERVAL: usize = 256;

/// Global map from a method to the call sites that cached it. Holds sites
/// weakly and methods only by id, so it never keeps either alive.
pub struct CacheMap {
    sites: DashMap<MethodId, Vec<Weak<dyn CacheSite>>, ahash::RandomState>,
    added: AtomicUsize,
}

impl CacheMap {
    pub fn new() -> Self {
        Self {
            sites: DashMap::with_hasher(ahash::RandomState::new()),
            added: AtomicUsize::new(0),
        }
    }

    pub fn add(&self, method: &Method, site: Weak<dyn CacheSite>) {
        {
            let mut entry = self.sites.entry(method.id()).or_default();
            entry.retain(|existing| existing.strong_count() > 0 && !existing.ptr_eq(&site));
            entry.push(site);
        }
        // The shard lock above must be released before sweeping.
        if self.added.fetch_add(1, Ordering::Relaxed) % SWEEP_INTERVAL == SWEEP_INTERVAL - 1 {
            self.purge();
        }
    }

    /// Flushes every site that cached `method`.
    pub fn remove(&self, method: &Method) {
        let Some((_, sites)) = self.sites.remove(&method.id()) else {
            return;
        };
        let mut flushed = 0;
        for site in sites.iter().filter_map(Weak::upgrade) {
            site.remove_cached_method();
            flushed += 1;
        }
        log::trace!("flushed {flushed} call sites caching {}", method.name());
    }

    pub fn site_count(&self, method: &Method) -> usize {
        self.sites
            .get(&method.id())
            .map_or(0, |sites| sites.iter().filter(|s| s.strong_count() > 0).count())
    }

    /// Drops entries whose sites are all gone.
    pub fn purge(&self) {
        let before = self.sites.len();
        self.sites.retain(|_, sites| {
            sites.retain(|site| site.strong_count() > 0);
            !sites.is_empty()
        });
        log::trace!("cache map sweep dropped {} methods", before.saturating_sub(self.sites.len()));
    }

    pub fn len(&self) -> usize {
        self.sites.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }
}

impl Default for CacheMap {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CacheMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheMap").field("methods", &self.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{SymbolTable, Value, Visibility, testing::constant_method};
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    #[derive(Default)]
    struct CountingSite(AtomicUsize);

    impl CacheSite for CountingSite {
        fn remove_cached_method(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn method() -> Method {
        let symbols = SymbolTable::new();
        Method::new(
            symbols.intern("foo"),
            constant_method(Value::Nil),
            Visibility::Public,
            Weak::new(),
        )
    }

    #[test]
    fn remove_flushes_registered_sites_once() {
        let map = CacheMap::new();
        let method = method();
        let site = Arc::new(CountingSite::default());
        let weak: Weak<dyn CacheSite> = Arc::downgrade(&site) as Weak<dyn CacheSite>;
        map.add(&method, weak.clone());
        map.add(&method, weak);
        assert_eq!(map.site_count(&method), 1);

        map.remove(&method);
        assert_eq!(site.0.load(Ordering::SeqCst), 1);
        map.remove(&method);
        assert_eq!(site.0.load(Ordering::SeqCst), 1);
        assert!(map.is_empty());
    }

    #[test]
    fn dead_sites_are_not_retained() {
        let map = CacheMap::new();
        let method = method();
        {
            let site = Arc::new(CountingSite::default());
            map.add(&method, Arc::downgrade(&site) as Weak<dyn CacheSite>);
        }
        assert_eq!(map.site_count(&method), 0);
        map.purge();
        assert!(map.is_empty());
    }

    #[test]
    fn methods_with_only_dead_sites_are_swept_while_adding() {
        let map = CacheMap::new();
        let live = Arc::new(CountingSite::default());
        let kept = method();
        map.add(&kept, Arc::downgrade(&live) as Weak<dyn CacheSite>);
        for _ in 0..SWEEP_INTERVAL * 4 {
            let site = Arc::new(CountingSite::default());
            map.add(&method(), Arc::downgrade(&site) as Weak<dyn CacheSite>);
        }
        assert!(map.len() <= SWEEP_INTERVAL);
        assert_eq!(map.site_count(&kept), 1);

        map.remove(&kept);
        assert_eq!(live.0.load(Ordering::SeqCst), 1);
    }
}
