use std::{error::Error as StdError, fmt};

/// Type-erased error for factory and close failures.
///
/// Mirrors the `BoxError` convention used throughout the connection-pool code this
/// crate is descended from: callers supply factories and `Poolable::close`
/// implementations with whatever error type is convenient, and the pool only ever
/// needs to report *that* something failed, not decode *why*.
pub type BoxError = Box<dyn StdError + Send + Sync>;

/// Errors surfaced by [`crate::PoolCache`](crate::PoolCache) operations.
#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    /// The cancellation token fired before a cell could be acquired.
    Cancelled,
    /// The factory failed to produce a new value. A capacity ticket is always
    /// restored before this variant is returned.
    FactoryFailed(BoxError),
    /// Reconfiguration completed, but one or more idle cells could not be rebuilt
    /// with the new factory. The pool remains usable with whatever cells did
    /// survive.
    UpdatePartial(Vec<BoxError>),
    /// The cache has been shut down; no further acquisitions are possible.
    Shutdown,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Cancelled => f.write_str("acquire cancelled before a cell became available"),
            Error::FactoryFailed(cause) => write!(f, "factory failed to create value: {cause}"),
            Error::UpdatePartial(causes) => {
                write!(f, "reconfiguration partially failed ({} cell(s)):", causes.len())?;
                for cause in causes {
                    write!(f, " {cause};")?;
                }
                Ok(())
            }
            Error::Shutdown => f.write_str("pool cache has been shut down"),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Error::FactoryFailed(cause) => Some(cause.as_ref()),
            _ => None,
        }
    }
}
