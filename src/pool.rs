//! Generic keyed pool of reusable transport resources.
//!
//! Used by the SSH adapter for multiplexed sessions; generic over a
//! [`ResourceFactory`] so any connection-shaped resource can be pooled.
//! Resources are borrowed with [`Pool::acquire`] and must be given back with
//! [`Pool::release`]; a dropped lease is returned through a fallback channel
//! so a panicking caller cannot leak a connection.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Error, ErrorKind};

#[async_trait]
pub trait ResourceFactory: Send + Sync + 'static {
    type Key: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static;
    type Resource: Send + Sync + 'static;

    async fn create(&self, key: &Self::Key) -> Result<Self::Resource, Error>;
    async fn test(&self, resource: &Self::Resource) -> bool;
    async fn destroy(&self, resource: Self::Resource);
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub min: usize,
    pub max: usize,
    pub idle_timeout: Duration,
    pub acquire_timeout: Duration,
    pub test_on_borrow: bool,
    pub test_on_return: bool,
    pub test_idle_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            min: 0,
            max: 4,
            idle_timeout: Duration::from_secs(300),
            acquire_timeout: Duration::from_secs(30),
            test_on_borrow: true,
            test_on_return: false,
            test_idle_interval: Duration::from_secs(30),
        }
    }
}

struct IdleEntry<R> {
    resource: R,
    since: Instant,
}

struct Shard<R> {
    idle: VecDeque<IdleEntry<R>>,
    /// idle + borrowed + mid-creation
    live: usize,
    /// FIFO queue of blocked acquirers
    waiters: VecDeque<oneshot::Sender<()>>,
    /// per-key override of the pool-wide config
    cfg: Option<PoolConfig>,
}

impl<R> Default for Shard<R> {
    fn default() -> Self {
        Shard {
            idle: VecDeque::new(),
            live: 0,
            waiters: VecDeque::new(),
            cfg: None,
        }
    }
}

struct PoolInner<F: ResourceFactory> {
    factory: F,
    cfg: PoolConfig,
    shards: Mutex<HashMap<F::Key, Shard<F::Resource>>>,
    shutdown: CancellationToken,
    returns: mpsc::UnboundedSender<(F::Key, F::Resource)>,
}

/// A borrowed resource. Give it back with [`Pool::release`]; dropping it
/// also returns it, via the pool's fallback channel.
pub struct Lease<F: ResourceFactory> {
    resource: Option<F::Resource>,
    key: F::Key,
    returns: mpsc::UnboundedSender<(F::Key, F::Resource)>,
}

impl<F: ResourceFactory> std::ops::Deref for Lease<F> {
    type Target = F::Resource;

    fn deref(&self) -> &Self::Target {
        self.resource.as_ref().expect("lease already released")
    }
}

impl<F: ResourceFactory> Drop for Lease<F> {
    fn drop(&mut self) {
        if let Some(resource) = self.resource.take() {
            let _ = self.returns.send((self.key.clone(), resource));
        }
    }
}

pub struct Pool<F: ResourceFactory> {
    inner: Arc<PoolInner<F>>,
}

impl<F: ResourceFactory> Clone for Pool<F> {
    fn clone(&self) -> Self {
        Pool {
            inner: self.inner.clone(),
        }
    }
}

impl<F: ResourceFactory> Pool<F> {
    pub fn new(factory: F, cfg: PoolConfig) -> Self {
        let (returns_tx, returns_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(PoolInner {
            factory,
            cfg,
            shards: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
            returns: returns_tx,
        });
        let pool = Pool { inner };
        pool.spawn_return_drain(returns_rx);
        pool.spawn_idle_reaper();
        pool
    }

    /// Set per-key sizing for a key (used when a target declares its own
    /// pool parameters). First writer wins; later identical bindings keep
    /// the existing settings.
    pub async fn configure_key(&self, key: &F::Key, cfg: PoolConfig) {
        let mut shards = self.inner.shards.lock().await;
        let shard = shards.entry(key.clone()).or_default();
        if shard.cfg.is_none() {
            shard.cfg = Some(cfg);
        }
    }

    async fn key_config(&self, key: &F::Key) -> PoolConfig {
        let shards = self.inner.shards.lock().await;
        shards
            .get(key)
            .and_then(|s| s.cfg.clone())
            .unwrap_or_else(|| self.inner.cfg.clone())
    }

    /// Borrow a healthy resource for `key`, creating one if under `max`,
    /// otherwise waiting (FIFO) up to `acquire_timeout` for a return.
    pub async fn acquire(&self, key: &F::Key) -> Result<Lease<F>, Error> {
        let cfg = self.key_config(key).await;
        let deadline = Instant::now() + cfg.acquire_timeout;
        loop {
            if self.inner.shutdown.is_cancelled() {
                return Err(Error::new(ErrorKind::Cancelled, "pool is shut down"));
            }

            let action = {
                let mut shards = self.inner.shards.lock().await;
                let shard = shards.entry(key.clone()).or_default();
                if let Some(entry) = shard.idle.pop_front() {
                    Acquired::Idle(entry.resource)
                } else if shard.live < cfg.max {
                    shard.live += 1;
                    Acquired::Create
                } else {
                    let (tx, rx) = oneshot::channel();
                    shard.waiters.push_back(tx);
                    Acquired::Wait(rx)
                }
            };

            match action {
                Acquired::Idle(resource) => {
                    if self.inner.cfg.test_on_borrow
                        && !self.inner.factory.test(&resource).await
                    {
                        debug!(key = ?key, "idle resource failed borrow test, destroying");
                        self.destroy_counted(key, resource).await;
                        continue;
                    }
                    return Ok(self.lease(key, resource));
                }
                Acquired::Create => match self.inner.factory.create(key).await {
                    Ok(resource) => return Ok(self.lease(key, resource)),
                    Err(e) => {
                        self.forget(key).await;
                        return Err(e);
                    }
                },
                Acquired::Wait(rx) => {
                    tokio::select! {
                        _ = rx => continue,
                        _ = tokio::time::sleep_until(deadline.into()) => {
                            return Err(Error::timeout(self.inner.cfg.acquire_timeout));
                        }
                        _ = self.inner.shutdown.cancelled() => {
                            return Err(Error::new(ErrorKind::Cancelled, "pool is shut down"));
                        }
                    }
                }
            }
        }
    }

    /// Return a borrowed resource to the idle set.
    pub async fn release(&self, mut lease: Lease<F>) {
        let key = lease.key.clone();
        if let Some(resource) = lease.resource.take() {
            self.put_back(&key, resource).await;
        }
    }

    async fn put_back(&self, key: &F::Key, resource: F::Resource) {
        if self.inner.shutdown.is_cancelled() {
            self.destroy_counted(key, resource).await;
            return;
        }
        if self.inner.cfg.test_on_return && !self.inner.factory.test(&resource).await {
            debug!(key = ?key, "resource failed return test, destroying");
            self.destroy_counted(key, resource).await;
            return;
        }
        let mut shards = self.inner.shards.lock().await;
        if let Some(shard) = shards.get_mut(key) {
            shard.idle.push_back(IdleEntry {
                resource,
                since: Instant::now(),
            });
            Self::wake_one(shard);
        }
    }

    fn lease(&self, key: &F::Key, resource: F::Resource) -> Lease<F> {
        Lease {
            resource: Some(resource),
            key: key.clone(),
            returns: self.inner.returns.clone(),
        }
    }

    /// Destroy a resource that is counted in `live`, then wake one waiter
    /// (a creation slot just opened).
    async fn destroy_counted(&self, key: &F::Key, resource: F::Resource) {
        self.inner.factory.destroy(resource).await;
        self.forget(key).await;
    }

    /// Drop a live slot without a resource in hand (failed creation).
    async fn forget(&self, key: &F::Key) {
        let mut shards = self.inner.shards.lock().await;
        if let Some(shard) = shards.get_mut(key) {
            shard.live = shard.live.saturating_sub(1);
            Self::wake_one(shard);
        }
    }

    fn wake_one(shard: &mut Shard<F::Resource>) {
        while let Some(tx) = shard.waiters.pop_front() {
            if tx.send(()).is_ok() {
                break;
            }
        }
    }

    /// Number of live resources for a key (idle + borrowed).
    pub async fn live_count(&self, key: &F::Key) -> usize {
        self.inner
            .shards
            .lock()
            .await
            .get(key)
            .map(|s| s.live)
            .unwrap_or(0)
    }

    /// Pre-create resources up to `min` for a key (used at binding time).
    pub async fn warm(&self, key: &F::Key) -> Result<(), Error> {
        let min = self.key_config(key).await.min;
        for _ in 0..min {
            let create = {
                let mut shards = self.inner.shards.lock().await;
                let shard = shards.entry(key.clone()).or_default();
                if shard.live < min {
                    shard.live += 1;
                    true
                } else {
                    false
                }
            };
            if !create {
                break;
            }
            match self.inner.factory.create(key).await {
                Ok(resource) => self.put_back_warm(key, resource).await,
                Err(e) => {
                    self.forget(key).await;
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    async fn put_back_warm(&self, key: &F::Key, resource: F::Resource) {
        let mut shards = self.inner.shards.lock().await;
        if let Some(shard) = shards.get_mut(key) {
            shard.idle.push_back(IdleEntry {
                resource,
                since: Instant::now(),
            });
        }
    }

    /// Drain the pool: reject pending and future waiters, destroy idle
    /// resources, and wait up to `grace` for borrowed ones to come back.
    pub async fn shutdown(&self, grace: Duration) {
        self.inner.shutdown.cancel();

        let idle: Vec<(F::Key, Vec<F::Resource>)> = {
            let mut shards = self.inner.shards.lock().await;
            shards
                .iter_mut()
                .map(|(key, shard)| {
                    shard.waiters.clear();
                    let resources: Vec<_> =
                        shard.idle.drain(..).map(|e| e.resource).collect();
                    (key.clone(), resources)
                })
                .collect()
        };
        for (key, resources) in idle {
            for resource in resources {
                self.inner.factory.destroy(resource).await;
                let mut shards = self.inner.shards.lock().await;
                if let Some(shard) = shards.get_mut(&key) {
                    shard.live = shard.live.saturating_sub(1);
                }
            }
        }

        // in-use leases return through put_back, which destroys under
        // shutdown; poll until drained or the hard deadline passes
        let deadline = Instant::now() + grace;
        loop {
            let remaining: usize = {
                let shards = self.inner.shards.lock().await;
                shards.values().map(|s| s.live).sum()
            };
            if remaining == 0 {
                return;
            }
            if Instant::now() >= deadline {
                warn!(remaining, "pool shutdown deadline passed with resources in use");
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    fn spawn_return_drain(&self, mut rx: mpsc::UnboundedReceiver<(F::Key, F::Resource)>) {
        let pool = self.clone();
        let _ = tokio::spawn(async move {
            while let Some((key, resource)) = rx.recv().await {
                pool.put_back(&key, resource).await;
            }
        });
    }

    fn spawn_idle_reaper(&self) {
        let pool = self.clone();
        let _ = tokio::spawn(async move {
            let interval = pool.inner.cfg.test_idle_interval;
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = pool.inner.shutdown.cancelled() => return,
                }
                pool.reap_idle().await;
            }
        });
    }

    async fn reap_idle(&self) {
        // take every idle entry out under the lock, then test/destroy
        // without holding it; the entries stay counted in `live` so a
        // concurrent acquire cannot overshoot `max` while they are out
        let candidates: Vec<(F::Key, IdleEntry<F::Resource>)> = {
            let mut shards = self.inner.shards.lock().await;
            let mut out = Vec::new();
            for (key, shard) in shards.iter_mut() {
                out.extend(shard.idle.drain(..).map(|e| (key.clone(), e)));
            }
            out
        };

        for (key, entry) in candidates {
            let cfg = self.key_config(&key).await;
            let over_min = self.live_count(&key).await > cfg.min;
            let expired = entry.since.elapsed() >= cfg.idle_timeout;
            let keep = if expired && over_min {
                false
            } else {
                self.inner.factory.test(&entry.resource).await
            };
            if keep {
                let mut shards = self.inner.shards.lock().await;
                if let Some(shard) = shards.get_mut(&key) {
                    shard.idle.push_back(entry);
                    Self::wake_one(shard);
                }
            } else {
                debug!(key = ?key, "evicting idle resource");
                self.destroy_counted(&key, entry.resource).await;
            }
        }
    }
}

enum Acquired<R> {
    Idle(R),
    Create,
    Wait(oneshot::Receiver<()>),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingFactory {
        created: AtomicUsize,
        destroyed: AtomicUsize,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        healthy: std::sync::atomic::AtomicBool,
    }

    impl CountingFactory {
        fn new() -> Self {
            CountingFactory {
                created: AtomicUsize::new(0),
                destroyed: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                healthy: std::sync::atomic::AtomicBool::new(true),
            }
        }
    }

    #[derive(Debug)]
    struct Conn(usize);

    #[async_trait]
    impl ResourceFactory for Arc<CountingFactory> {
        type Key = String;
        type Resource = Conn;

        async fn create(&self, _key: &String) -> Result<Conn, Error> {
            let id = self.created.fetch_add(1, Ordering::SeqCst);
            let live = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(live, Ordering::SeqCst);
            Ok(Conn(id))
        }

        async fn test(&self, _resource: &Conn) -> bool {
            self.healthy.load(Ordering::SeqCst)
        }

        async fn destroy(&self, _resource: Conn) {
            let _ = self.in_flight.fetch_sub(1, Ordering::SeqCst);
            let _ = self.destroyed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn quick_config(max: usize) -> PoolConfig {
        PoolConfig {
            min: 0,
            max,
            idle_timeout: Duration::from_secs(60),
            acquire_timeout: Duration::from_millis(500),
            test_on_borrow: true,
            test_on_return: false,
            test_idle_interval: Duration::from_secs(60),
        }
    }

    #[tokio::test]
    async fn at_most_max_resources_live_under_contention() {
        let factory = Arc::new(CountingFactory::new());
        let pool = Pool::new(factory.clone(), quick_config(3));
        let key = "host".to_string();

        let mut handles = Vec::new();
        for _ in 0..12 {
            let pool = pool.clone();
            let key = key.clone();
            handles.push(tokio::spawn(async move {
                let lease = pool.acquire(&key).await.unwrap();
                tokio::time::sleep(Duration::from_millis(5)).await;
                pool.release(lease).await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert!(factory.peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(pool.live_count(&key).await, factory.created.load(Ordering::SeqCst) - factory.destroyed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn acquire_times_out_when_exhausted() {
        let factory = Arc::new(CountingFactory::new());
        let pool = Pool::new(factory, quick_config(1));
        let key = "host".to_string();

        let held = pool.acquire(&key).await.unwrap();
        let err = pool.acquire(&key).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Timeout);
        pool.release(held).await;
    }

    #[tokio::test]
    async fn shutdown_destroys_everything_and_rejects_acquires() {
        let factory = Arc::new(CountingFactory::new());
        let pool = Pool::new(factory.clone(), quick_config(2));
        let key = "host".to_string();

        let a = pool.acquire(&key).await.unwrap();
        let b = pool.acquire(&key).await.unwrap();
        pool.release(a).await;

        let pool2 = pool.clone();
        let key2 = key.clone();
        let returner = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            pool2.release(b).await;
        });

        pool.shutdown(Duration::from_secs(1)).await;
        returner.await.unwrap();

        assert_eq!(
            factory.created.load(Ordering::SeqCst),
            factory.destroyed.load(Ordering::SeqCst)
        );
        let err = pool.acquire(&key).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Cancelled);
    }

    #[tokio::test]
    async fn unhealthy_idle_resource_is_replaced_on_borrow() {
        let factory = Arc::new(CountingFactory::new());
        let pool = Pool::new(factory.clone(), quick_config(2));
        let key = "host".to_string();

        let lease = pool.acquire(&key).await.unwrap();
        pool.release(lease).await;

        factory.healthy.store(false, Ordering::SeqCst);
        // borrow test fails, the stale resource is destroyed, a new one is
        // created in its place
        factory.healthy.store(true, Ordering::SeqCst);
        let lease = pool.acquire(&key).await.unwrap();
        pool.release(lease).await;
        assert!(factory.created.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn dropped_lease_returns_to_pool() {
        let factory = Arc::new(CountingFactory::new());
        let pool = Pool::new(factory.clone(), quick_config(1));
        let key = "host".to_string();

        {
            let _lease = pool.acquire(&key).await.unwrap();
            // dropped without release
        }
        // the return drain task puts it back; the next acquire reuses it
        tokio::time::sleep(Duration::from_millis(20)).await;
        let lease = pool.acquire(&key).await.unwrap();
        assert_eq!(factory.created.load(Ordering::SeqCst), 1);
        pool.release(lease).await;
    }
}
