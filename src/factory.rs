use std::future::Future;

use async_trait::async_trait;

use crate::error::BoxError;

/// A resource that can be checked into and out of a [`PoolCache`](crate::PoolCache).
///
/// The cache is oblivious to everything about `V` except that it can be closed;
/// closing must be safe to call even if the pool's own bookkeeping never reaches
/// it explicitly (see the `Cell` drop safety net), so implementations should treat
/// a second `close()` as a no-op rather than panicking.
pub trait Poolable: Send + 'static {
    /// Close the resource. Errors are logged at trace level and otherwise
    /// swallowed by the cache — the cell is discarded regardless of the outcome.
    fn close(&mut self) -> Result<(), BoxError>;
}

/// Builds fresh instances of `V` for a single key.
///
/// Analogous to the factory closures the original pool is handed per key, and to
/// the teacher pool's `MakeTransport`/`Service`-shaped connector, but expressed as
/// an object-safe async trait (via `async-trait`) so a per-key entry can hold a
/// swappable `Arc<dyn Factory<V>>` and hot-reconfiguration can replace it without
/// changing `V`'s type.
#[async_trait]
pub trait Factory<V>: Send + Sync + 'static {
    async fn create(&self) -> Result<V, BoxError>;
}

/// Adapts a plain async closure into a [`Factory`].
///
/// Lets callers write `Arc::new(factory_fn(|| async { ... }))` instead of a named
/// type when the factory has no state worth naming.
pub struct FactoryFn<F>(F);

impl<F> FactoryFn<F> {
    pub fn new(f: F) -> Self {
        FactoryFn(f)
    }
}

pub fn factory_fn<F>(f: F) -> FactoryFn<F> {
    FactoryFn(f)
}

#[async_trait]
impl<F, Fut, V> Factory<V> for FactoryFn<F>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<V, BoxError>> + Send,
    V: Send + 'static,
{
    async fn create(&self) -> Result<V, BoxError> {
        (self.0)().await
    }
}
