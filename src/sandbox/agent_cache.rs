use std::{
    fmt::Display,
    future::Future,
    sync::Arc,
    time::{Duration, Instant},
};

use arc_swap::ArcSwap;
use data_model::SandboxDirectories;
use tokio::sync::watch;
use tracing::{debug, warn};

use super::pending_sync::PendingSyncTracker;
use crate::metrics::sandbox_syncer::Metrics;

/// Progress of one agent query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryState {
    Pending,
    Success(SandboxDirectories),
    Error(String),
}

impl QueryState {
    pub fn is_pending(&self) -> bool {
        matches!(self, QueryState::Pending)
    }
}

/// Shared view of a query's outcome. Every clone observes the same query and
/// waiting on a completed query returns immediately.
#[derive(Debug, Clone)]
pub struct QueryHandle {
    state_rx: watch::Receiver<QueryState>,
}

/// Completes the query behind a `QueryHandle`.
pub struct QueryResolver {
    state_tx: watch::Sender<QueryState>,
}

impl QueryHandle {
    pub fn pending() -> (QueryHandle, QueryResolver) {
        let (state_tx, state_rx) = watch::channel(QueryState::Pending);
        (QueryHandle { state_rx }, QueryResolver { state_tx })
    }

    pub fn state(&self) -> QueryState {
        self.state_rx.borrow().clone()
    }

    pub fn is_pending(&self) -> bool {
        self.state_rx.borrow().is_pending()
    }

    /// Waits for the query to complete. A query whose resolver was dropped
    /// without completing resolves as an error.
    pub async fn wait(&self) -> QueryState {
        let mut state_rx = self.state_rx.clone();
        match state_rx.wait_for(|state| !state.is_pending()).await {
            Ok(state) => state.clone(),
            Err(_) => QueryState::Error("query abandoned before completing".to_string()),
        }
    }

    /// True when both handles observe the same query.
    pub fn same_query(&self, other: &QueryHandle) -> bool {
        self.state_rx.same_channel(&other.state_rx)
    }
}

impl QueryResolver {
    pub fn resolve<E: Display>(self, result: Result<SandboxDirectories, E>) {
        let state = match result {
            Ok(directories) => QueryState::Success(directories),
            Err(err) => QueryState::Error(err.to_string()),
        };
        self.state_tx.send_replace(state);
    }
}

/// Result of `AgentQueryCache::lookup_or_dispatch` and `AgentQueryCache::refresh`.
#[derive(Debug, Clone)]
pub enum CacheLookup {
    /// A live entry existed. Its query may still be running.
    Cached(QueryHandle),
    /// A new query was started for the host.
    Dispatched(QueryHandle),
}

impl CacheLookup {
    pub fn handle(&self) -> &QueryHandle {
        match self {
            CacheLookup::Cached(handle) | CacheLookup::Dispatched(handle) => handle,
        }
    }

    pub fn into_handle(self) -> QueryHandle {
        match self {
            CacheLookup::Cached(handle) | CacheLookup::Dispatched(handle) => handle,
        }
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    handle: QueryHandle,
    seq: u64,
    inserted_at: Instant,
}

/// Immutable FIFO of per-host entries. `order` maps insertion sequence to
/// hostname so the oldest entry is the minimum key.
#[derive(Debug, Clone, Default)]
struct FifoCache {
    entries: im::HashMap<String, CacheEntry>,
    order: im::OrdMap<u64, String>,
    next_seq: u64,
}

impl FifoCache {
    fn live_entry(&self, hostname: &str, ttl: Option<Duration>, now: Instant) -> Option<&CacheEntry> {
        let entry = self.entries.get(hostname)?;
        match ttl {
            Some(ttl) if now.saturating_duration_since(entry.inserted_at) >= ttl => None,
            _ => Some(entry),
        }
    }

    /// Inserts `hostname` as the newest entry and returns the hosts evicted
    /// to stay within `capacity`.
    fn insert(
        &mut self,
        hostname: String,
        handle: QueryHandle,
        now: Instant,
        capacity: usize,
    ) -> Vec<String> {
        if let Some(expired) = self.entries.remove(&hostname) {
            self.order.remove(&expired.seq);
        }

        let mut evicted = Vec::new();
        while self.entries.len() >= capacity {
            let Some((seq, oldest)) = self.order.get_min().cloned() else {
                break;
            };
            self.order.remove(&seq);
            self.entries.remove(&oldest);
            evicted.push(oldest);
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.order.insert(seq, hostname.clone());
        self.entries.insert(
            hostname,
            CacheEntry {
                handle,
                seq,
                inserted_at: now,
            },
        );
        evicted
    }
}

/// Bounded hostname -> query cache that deduplicates concurrent queries to
/// the same agent.
///
/// Readers never block. Inserts swap in a new immutable map, so a lookup
/// either sees an entry or races to install its own and exactly one query
/// is started per host. When full, the oldest insertion is evicted and its
/// host is handed back to the pending-sync tracker so it gets queried
/// again.
pub struct AgentQueryCache {
    cache: ArcSwap<FifoCache>,
    capacity: usize,
    ttl: Option<Duration>,
    pending_sync: PendingSyncTracker,
    metrics: Arc<Metrics>,
}

impl AgentQueryCache {
    pub fn new(
        capacity: usize,
        ttl: Option<Duration>,
        pending_sync: PendingSyncTracker,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            cache: ArcSwap::from_pointee(FifoCache::default()),
            capacity: capacity.max(1),
            ttl,
            pending_sync,
            metrics,
        }
    }

    /// Returns the live entry for `hostname`, or installs a new one and
    /// spawns the future produced by `dispatch` to complete it. `dispatch`
    /// is only called when a new entry was installed.
    pub fn lookup_or_dispatch<F, Fut, E>(&self, hostname: &str, dispatch: F) -> CacheLookup
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<SandboxDirectories, E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        self.dispatch_unless(hostname, dispatch, |_| true)
    }

    /// Like `lookup_or_dispatch`, but only a query that is still running is
    /// reused. A completed entry, successful or not, is replaced by a fresh
    /// query. The replaced host is not handed to the pending-sync tracker.
    pub fn refresh<F, Fut, E>(&self, hostname: &str, dispatch: F) -> CacheLookup
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<SandboxDirectories, E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        self.dispatch_unless(hostname, dispatch, |entry| entry.handle.is_pending())
    }

    fn dispatch_unless<F, Fut, E, R>(&self, hostname: &str, dispatch: F, reuse: R) -> CacheLookup
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<SandboxDirectories, E>> + Send + 'static,
        E: Display + Send + 'static,
        R: Fn(&CacheEntry) -> bool,
    {
        let now = Instant::now();
        if let Some(entry) = self
            .cache
            .load()
            .live_entry(hostname, self.ttl, now)
            .filter(|entry| reuse(*entry))
        {
            return CacheLookup::Cached(entry.handle.clone());
        }

        let (handle, resolver) = QueryHandle::pending();
        let mut existing = None;
        let mut evicted = Vec::new();
        self.cache.rcu(|current| {
            evicted.clear();
            existing = current
                .live_entry(hostname, self.ttl, now)
                .filter(|entry| reuse(*entry))
                .map(|entry| entry.handle.clone());
            if existing.is_some() {
                return Arc::clone(current);
            }
            let mut next = FifoCache::clone(current);
            evicted = next.insert(hostname.to_string(), handle.clone(), now, self.capacity);
            Arc::new(next)
        });

        if let Some(existing) = existing {
            return CacheLookup::Cached(existing);
        }

        for host in evicted {
            debug!(hostname = %host, "evicted agent query, host pending sync");
            self.metrics.agent_cache_evictions.add(1, &[]);
            self.pending_sync.add(&host);
        }

        let query = dispatch();
        let hostname = hostname.to_string();
        tokio::spawn(async move {
            let result = query.await;
            if let Err(err) = &result {
                warn!(hostname = %hostname, "agent query failed: {}", err);
            }
            resolver.resolve(result);
        });
        CacheLookup::Dispatched(handle)
    }

    /// State of the cached query for `hostname`, expired or not.
    pub fn state(&self, hostname: &str) -> Option<QueryState> {
        self.cache
            .load()
            .entries
            .get(hostname)
            .map(|entry| entry.handle.state())
    }

    pub fn contains(&self, hostname: &str) -> bool {
        self.cache.load().entries.contains_key(hostname)
    }

    pub fn len(&self) -> usize {
        self.cache.load().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
