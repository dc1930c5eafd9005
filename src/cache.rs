use std::{fmt::Debug, hash::Hash, num::NonZeroUsize, sync::Arc, time::Instant};

use ahash::RandomState;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::{
    cell::Handle,
    config::Config,
    entry::Entry,
    error::Error,
    factory::{Factory, Poolable},
};

type Map<K, V> = std::collections::HashMap<K, Arc<Entry<V>>, RandomState>;

struct Inner<K, V> {
    entries: Map<K, Arc<Entry<V>>>,
    last_swept: Instant,
}

/// The top-level registry mapping keys to [`Entry`] sub-pools.
///
/// Mirrors the teacher connection pool's `Pool<T, K>`: a `Clone`-able handle around
/// shared state, generic over an entry-bearing key and a [`Poolable`] value, with a
/// background sweep spawned lazily from whichever call notices it is overdue rather
/// than a dedicated timer task running from construction.
pub struct PoolCache<K, V> {
    inner: Arc<RwLock<Inner<K, V>>>,
    config: Config,
    shutdown: CancellationToken,
}

impl<K, V> PoolCache<K, V>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    V: Poolable,
{
    pub fn new(config: Config) -> Self {
        PoolCache {
            inner: Arc::new(RwLock::new(Inner {
                entries: Map::default(),
                last_swept: Instant::now(),
            })),
            config,
            shutdown: CancellationToken::new(),
        }
    }

    fn check_shutdown(&self) -> Result<(), Error> {
        if self.shutdown.is_cancelled() {
            Err(Error::Shutdown)
        } else {
            Ok(())
        }
    }

    /// Finds or installs the entry for `key`, acquiring a cell from it, and
    /// reports whether the entry already existed.
    pub async fn add_and_acquire(
        &self,
        ctx: &CancellationToken,
        key: K,
        factory: Arc<dyn Factory<V>>,
        cap: NonZeroUsize,
    ) -> Result<(Handle<V>, bool), Error> {
        self.check_shutdown()?;
        let cap = cap.get();

        let mut inner = self.inner.write().await;
        self.maybe_spawn_sweep(&mut inner);

        if let Some(entry) = inner.entries.get(&key).cloned() {
            drop(inner);
            let handle = entry.get_value(ctx).await?;
            return Ok((handle, true));
        }

        let entry = Entry::new(factory.clone(), cap);
        inner.entries.insert(key.clone(), entry.clone());
        drop(inner);

        trace!(?key, cap, "installed new pool entry");
        match entry.get_value(ctx).await {
            Ok(handle) => Ok((handle, false)),
            Err(err) => Err(err),
        }
    }

    /// Looks up an existing entry and acquires a cell from it; never installs
    /// a new entry. Returns `Ok(None)` if no entry exists for `key`.
    pub async fn get(&self, ctx: &CancellationToken, key: &K) -> Result<Option<Handle<V>>, Error> {
        self.check_shutdown()?;

        let inner = self.inner.read().await;
        let Some(entry) = inner.entries.get(key).cloned() else {
            return Ok(None);
        };
        drop(inner);

        Ok(Some(entry.get_value(ctx).await?))
    }

    /// Hot-swaps the factory and/or cap for an existing key's entry without
    /// disturbing cells currently checked out. Returns `Ok(false)` if no entry
    /// exists for `key`.
    pub async fn update_if_exists(
        &self,
        key: &K,
        factory: Arc<dyn Factory<V>>,
        cap: NonZeroUsize,
    ) -> Result<bool, Error> {
        self.check_shutdown()?;

        let inner = self.inner.read().await;
        let Some(entry) = inner.entries.get(key).cloned() else {
            return Ok(false);
        };
        drop(inner);

        entry.reconfigure(factory, cap.get()).await?;
        Ok(true)
    }

    /// Read-locked snapshot of every key currently installed.
    pub async fn keys(&self) -> Vec<K> {
        self.inner.read().await.entries.keys().cloned().collect()
    }

    /// Closes every cell owned by every entry and makes all subsequent
    /// operations fail with [`Error::Shutdown`]. Idle cells are closed
    /// directly; cells currently in use are closed by the [`Cell`](crate::cell::Cell)
    /// drop safety net once their holders release them.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();

        let inner = self.inner.write().await;
        for entry in inner.entries.values() {
            entry.close_idle();
        }
    }

    /// Schedules the background sweep if `sweep_interval` has elapsed since the
    /// last one. Spawned with the write lock already held by the caller but
    /// released before the spawned task can possibly contend on it again.
    fn maybe_spawn_sweep(&self, inner: &mut Inner<K, V>) {
        let now = Instant::now();
        if now.duration_since(inner.last_swept) < self.config.sweep_interval {
            return;
        }
        inner.last_swept = now;

        let cache = self.inner.clone();
        let idle_ttl = self.config.idle_ttl;
        tokio::spawn(async move {
            trace!("running pool cache sweep");
            let mut inner = cache.write().await;
            let mut dead = Vec::new();
            for (key, entry) in inner.entries.iter() {
                if entry.cleanup_values(idle_ttl) {
                    dead.push(key.clone());
                }
            }
            for key in dead {
                if let Some(entry) = inner.entries.remove(&key) {
                    trace!(?key, "removing fully idle pool entry");
                    entry.close_idle();
                }
            }
        });
    }
}

impl<K, V> Clone for PoolCache<K, V> {
    fn clone(&self) -> Self {
        PoolCache {
            inner: self.inner.clone(),
            config: self.config,
            shutdown: self.shutdown.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use async_trait::async_trait;

    use super::*;
    use crate::error::BoxError;

    struct Widget {
        id: usize,
        closes: Arc<AtomicUsize>,
    }

    impl Poolable for Widget {
        fn close(&mut self) -> Result<(), BoxError> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct CountingFactory {
        created: Arc<AtomicUsize>,
        closes: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Factory<Widget> for CountingFactory {
        async fn create(&self) -> Result<Widget, BoxError> {
            let id = self.created.fetch_add(1, Ordering::SeqCst);
            Ok(Widget {
                id,
                closes: self.closes.clone(),
            })
        }
    }

    struct FailingFactory;

    #[async_trait]
    impl Factory<Widget> for FailingFactory {
        async fn create(&self) -> Result<Widget, BoxError> {
            Err("factory is down".into())
        }
    }

    fn cap(n: usize) -> NonZeroUsize {
        NonZeroUsize::new(n).unwrap()
    }

    #[tokio::test]
    async fn s1_cap_respected_and_fourth_acquire_blocks_until_release() {
        let cache: PoolCache<&'static str, Widget> = PoolCache::new(Config::new());
        let ctx = CancellationToken::new();
        let created = Arc::new(AtomicUsize::new(0));
        let factory = Arc::new(CountingFactory {
            created: created.clone(),
            closes: Arc::new(AtomicUsize::new(0)),
        });

        let (h1, pre1) = cache.add_and_acquire(&ctx, "k1", factory.clone(), cap(3)).await.unwrap();
        let (h2, pre2) = cache.add_and_acquire(&ctx, "k1", factory.clone(), cap(3)).await.unwrap();
        let (h3, _pre3) = cache.add_and_acquire(&ctx, "k1", factory.clone(), cap(3)).await.unwrap();
        assert!(!pre1);
        assert!(pre2);
        assert_eq!(created.load(Ordering::SeqCst), 3);

        let cache2 = cache.clone();
        let factory2 = factory.clone();
        let ctx2 = ctx.clone();
        let fourth = tokio::spawn(async move {
            cache2.add_and_acquire(&ctx2, "k1", factory2, cap(3)).await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!fourth.is_finished());

        h1.release();
        let (h4, _) = fourth.await.unwrap().unwrap();
        assert!(h4.is_reused());
        assert_eq!(created.load(Ordering::SeqCst), 3);

        drop(h2);
        drop(h3);
        drop(h4);
    }

    #[tokio::test]
    async fn s2_cancellation_leaves_capacity_intact() {
        let cache: PoolCache<&'static str, Widget> = PoolCache::new(Config::new());
        let ctx = CancellationToken::new();
        let factory = Arc::new(CountingFactory {
            created: Arc::new(AtomicUsize::new(0)),
            closes: Arc::new(AtomicUsize::new(0)),
        });

        let (held, _) = cache.add_and_acquire(&ctx, "k1", factory.clone(), cap(1)).await.unwrap();

        let deadline_ctx = CancellationToken::new();
        let canceller = deadline_ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            canceller.cancel();
        });

        let err = cache
            .add_and_acquire(&deadline_ctx, "k1", factory.clone(), cap(1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));

        held.release();
        let (_second, pre_existed) = cache.add_and_acquire(&ctx, "k1", factory, cap(1)).await.unwrap();
        assert!(pre_existed);
    }

    #[tokio::test]
    async fn s3_factory_failure_leaves_entry_installed_for_retry() {
        let cache: PoolCache<&'static str, Widget> = PoolCache::new(Config::new());
        let ctx = CancellationToken::new();

        let err = cache
            .add_and_acquire(&ctx, "k1", Arc::new(FailingFactory), cap(2))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::FactoryFailed(_)));
        assert_eq!(cache.keys().await, vec!["k1"]);

        let working = Arc::new(CountingFactory {
            created: Arc::new(AtomicUsize::new(0)),
            closes: Arc::new(AtomicUsize::new(0)),
        });
        let (handle, pre_existed) = cache.add_and_acquire(&ctx, "k1", working, cap(2)).await.unwrap();
        assert!(pre_existed);
        drop(handle);
    }

    #[tokio::test]
    async fn s4_idle_eviction_removes_fully_idle_entry_on_sweep() {
        let config = Config::new()
            .sweep_interval(Duration::from_millis(1))
            .idle_ttl(Duration::from_millis(1));
        let cache: PoolCache<&'static str, Widget> = PoolCache::new(config);
        let ctx = CancellationToken::new();
        let closes = Arc::new(AtomicUsize::new(0));
        let factory = Arc::new(CountingFactory {
            created: Arc::new(AtomicUsize::new(0)),
            closes: closes.clone(),
        });

        let (handle, _) = cache.add_and_acquire(&ctx, "k1", factory.clone(), cap(2)).await.unwrap();
        handle.release();

        tokio::time::sleep(Duration::from_millis(5)).await;
        // Any acquire call re-checks the sweep schedule; use a second key so
        // the sweep fires without touching k1's own entry directly.
        let (other, _) = cache.add_and_acquire(&ctx, "k2", factory, cap(1)).await.unwrap();
        other.release();
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert!(!cache.keys().await.contains(&"k1"));
    }

    #[tokio::test]
    async fn s5_reconfigure_down_blocks_until_in_use_cells_drain() {
        let cache: PoolCache<&'static str, Widget> = PoolCache::new(Config::new());
        let ctx = CancellationToken::new();
        let factory = Arc::new(CountingFactory {
            created: Arc::new(AtomicUsize::new(0)),
            closes: Arc::new(AtomicUsize::new(0)),
        });

        let (h1, _) = cache.add_and_acquire(&ctx, "k1", factory.clone(), cap(4)).await.unwrap();
        let (h2, _) = cache.add_and_acquire(&ctx, "k1", factory.clone(), cap(4)).await.unwrap();
        let (h3, _) = cache.add_and_acquire(&ctx, "k1", factory.clone(), cap(4)).await.unwrap();
        let (h4, _) = cache.add_and_acquire(&ctx, "k1", factory.clone(), cap(4)).await.unwrap();
        h4.release();

        let new_factory = Arc::new(CountingFactory {
            created: Arc::new(AtomicUsize::new(0)),
            closes: Arc::new(AtomicUsize::new(0)),
        });
        let existed = cache.update_if_exists("k1", new_factory.clone(), cap(2)).await.unwrap();
        assert!(existed);

        let cache2 = cache.clone();
        let ctx2 = ctx.clone();
        let factory2 = new_factory.clone();
        let waiter = tokio::spawn(async move {
            cache2.add_and_acquire(&ctx2, "k1", factory2, cap(2)).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        h1.release();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        h2.release();

        let (h5, _) = waiter.await.unwrap().unwrap();
        assert_eq!(new_factory.created.load(Ordering::SeqCst), 1);
        drop(h5);
        drop(h3);
    }

    #[tokio::test]
    async fn round_trip_get_returns_same_cell() {
        let cache: PoolCache<&'static str, Widget> = PoolCache::new(Config::new());
        let ctx = CancellationToken::new();
        let factory = Arc::new(CountingFactory {
            created: Arc::new(AtomicUsize::new(0)),
            closes: Arc::new(AtomicUsize::new(0)),
        });

        let (handle, _) = cache.add_and_acquire(&ctx, "k1", factory, cap(2)).await.unwrap();
        let id = handle.id;
        drop(handle);

        let reacquired = cache.get(&ctx, &"k1").await.unwrap().expect("entry exists");
        assert!(reacquired.is_reused());
        assert_eq!(reacquired.id, id);
    }

    #[tokio::test]
    async fn get_returns_none_for_unknown_key_without_installing() {
        let cache: PoolCache<&'static str, Widget> = PoolCache::new(Config::new());
        let ctx = CancellationToken::new();
        assert!(cache.get(&ctx, &"missing").await.unwrap().is_none());
        assert!(cache.keys().await.is_empty());
    }

    #[tokio::test]
    async fn shutdown_closes_idle_cells_and_rejects_new_acquires() {
        let cache: PoolCache<&'static str, Widget> = PoolCache::new(Config::new());
        let ctx = CancellationToken::new();
        let closes = Arc::new(AtomicUsize::new(0));
        let factory = Arc::new(CountingFactory {
            created: Arc::new(AtomicUsize::new(0)),
            closes: closes.clone(),
        });

        let (handle, _) = cache.add_and_acquire(&ctx, "k1", factory.clone(), cap(1)).await.unwrap();
        handle.release();

        cache.shutdown().await;
        assert_eq!(closes.load(Ordering::SeqCst), 1);

        let err = cache.add_and_acquire(&ctx, "k2", factory, cap(1)).await.unwrap_err();
        assert!(matches!(err, Error::Shutdown));
    }
}
