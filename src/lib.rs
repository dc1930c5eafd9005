//! A generic, concurrent, bounded, per-key pooling cache.
//!
//! `keypool` amortizes the cost of long-lived connection-like resources: each
//! caller presents a key, a [`Factory`] that builds a fresh resource, and a cap,
//! and gets back a [`Handle`] to an instance it can use exclusively until it is
//! dropped (or released explicitly). The cache multiplexes up to `cap` live
//! instances per key, lazily creating them on demand, reclaiming ones that sit
//! idle past [`config::IDLE_TTL`], and supporting live reconfiguration of the
//! factory and/or cap for a key without disturbing handles currently checked
//! out.
//!
//! The cache is oblivious to what a resource actually is — only that it can be
//! built ([`Factory::create`]) and closed ([`Poolable::close`]). Key derivation,
//! resource semantics, and retry policy are the caller's concern; this crate
//! owns only the pooling, capacity accounting, eviction, and hot-update
//! algorithm.
//!
//! ```no_run
//! use std::{num::NonZeroUsize, sync::Arc};
//! use keypool::{Config, PoolCache, factory::factory_fn};
//! use tokio_util::sync::CancellationToken;
//!
//! # struct Connection;
//! # impl keypool::Poolable for Connection {
//! #     fn close(&mut self) -> Result<(), keypool::error::BoxError> { Ok(()) }
//! # }
//! # async fn doc() -> Result<(), keypool::error::Error> {
//! let cache: PoolCache<&'static str, Connection> = PoolCache::new(Config::new());
//! let ctx = CancellationToken::new();
//! let factory = Arc::new(factory_fn(|| async { Ok(Connection) }));
//!
//! let (handle, _pre_existed) = cache
//!     .add_and_acquire(&ctx, "broker-a", factory, NonZeroUsize::new(4).unwrap())
//!     .await?;
//! // use `*handle`, then either drop it or call `handle.release()`.
//! # Ok(())
//! # }
//! ```

mod cache;
mod cell;
pub mod config;
mod entry;
pub mod error;
pub mod factory;

pub use cache::PoolCache;
pub use cell::Handle;
pub use config::Config;
pub use error::Error;
pub use factory::{Factory, Poolable};
