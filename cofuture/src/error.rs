use crate::leak::LeakReport;
use std::fmt;
use std::panic::Location;
use std::sync::{Arc, Mutex, PoisonError};

#[derive(thiserror::Error, Debug, Clone)]
pub enum Error {
    #[error("Future resolved more than once")]
    AlreadyResolved,

    #[error("Must throw non-empty error")]
    InvalidError,

    #[error("Future must resolve before value is ready")]
    NotResolved,

    #[error("Can't wait without a coroutine")]
    NoCoroutineContext,

    #[error("Not a future - {0}")]
    NotAFuture(String),

    #[error("Unexpected resume of coroutine - {0}")]
    UnexpectedResume(String),

    /// Event loop ran out of work while a future it was driving was still pending
    #[error("Event loop went idle before the future settled")]
    Stalled,

    #[error("Resolver dropped without resolving its future")]
    ResolverDropped,

    #[error("{0}")]
    Aggregated(AggregateError),

    #[error("{0}")]
    OutstandingFutures(LeakReport),

    #[error("{0}")]
    Failed(#[from] Fault),

    #[error("IO Error - {0}")]
    IOError(Arc<std::io::Error>),
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::IOError(Arc::new(e))
    }
}

/// A failure raised by application code.
///
/// Clones share identity, so the exact failure thrown into a future can be
/// recognised again when it comes out of [crate::Future::get] or [crate::wait].
#[derive(Clone)]
pub struct Fault {
    inner: Arc<FaultInner>,
}

#[derive(Debug)]
struct FaultInner {
    message: String,
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
    sites: Mutex<Vec<&'static Location<'static>>>,
}

impl Fault {
    /// Create a new fault with given message
    pub fn new(message: impl Into<String>) -> Self {
        Self::build(message.into(), None)
    }

    /// Wrap an existing error as a fault
    pub fn from_error(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::build(err.to_string(), Some(Box::new(err)))
    }

    fn build(message: String, source: Option<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self {
            inner: Arc::new(FaultInner {
                message,
                source,
                sites: Mutex::new(vec![]),
            }),
        }
    }

    pub fn message(&self) -> &str {
        &self.inner.message
    }

    /// Whether fault carries no description at all
    pub fn is_empty(&self) -> bool {
        self.inner.message.is_empty() && self.inner.source.is_none()
    }

    /// Whether both handles refer to the same fault
    pub fn ptr_eq(&self, other: &Fault) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Call sites that re-raised this fault out of a future, oldest first
    pub fn sites(&self) -> Vec<&'static Location<'static>> {
        self.inner
            .sites
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn record_site(&self, site: &'static Location<'static>) {
        self.inner
            .sites
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(site);
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner.message)
    }
}

impl fmt::Debug for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fault")
            .field("message", &self.inner.message)
            .field("source", &self.inner.source)
            .field("sites", &self.sites())
            .finish()
    }
}

impl std::error::Error for Fault {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.inner
            .source
            .as_deref()
            .map(|e| e as &(dyn std::error::Error + 'static))
    }
}

/// Summary of every failure seen by a single [crate::wait] call
#[derive(Debug, Clone)]
pub struct AggregateError {
    errors: Vec<Error>,
}

impl AggregateError {
    pub(crate) fn new(errors: Vec<Error>) -> Self {
        Self { errors }
    }

    /// The underlying errors, in the order their futures were passed to `wait`
    pub fn inner_errors(&self) -> &[Error] {
        &self.errors
    }
}

impl fmt::Display for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Multiple exceptions were thrown:")?;
        for e in &self.errors {
            write!(f, "\n{e}")?;
        }
        Ok(())
    }
}

impl std::error::Error for AggregateError {}
