//! Lazily computed value that remembers failures for a cool-down period.
//!
//! The first successful computation is cached forever (until [`reset`]). A
//! failed computation is cached too: callers get the same error back without
//! re-running the factory until `retry_after` has passed.
//!
//! [`reset`]: LazyWithRetry::reset

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;

/// Cached initialization failure.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct LazyInitError {
    pub message: String,
    /// True when the error came from the cache rather than a fresh attempt.
    pub cached: bool,
}

enum Slot<T> {
    Empty,
    Ready(Arc<T>),
    Failed { at: Instant, message: String },
}

type Factory<T> = Box<dyn Fn() -> anyhow::Result<T> + Send + Sync>;

pub struct LazyWithRetry<T> {
    factory: Factory<T>,
    retry_after: Duration,
    slot: Mutex<Slot<T>>,
}

impl<T> LazyWithRetry<T> {
    pub const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(30);

    pub fn new<F>(factory: F) -> Self
    where
        F: Fn() -> anyhow::Result<T> + Send + Sync + 'static,
    {
        Self::with_retry_after(factory, Self::DEFAULT_RETRY_AFTER)
    }

    pub fn with_retry_after<F>(factory: F, retry_after: Duration) -> Self
    where
        F: Fn() -> anyhow::Result<T> + Send + Sync + 'static,
    {
        Self {
            factory: Box::new(factory),
            retry_after,
            slot: Mutex::new(Slot::Empty),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slot<T>> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_value_created(&self) -> bool {
        matches!(*self.lock(), Slot::Ready(_))
    }

    /// The cached value, computing it if needed.
    pub fn get(&self) -> Result<Arc<T>, LazyInitError> {
        let mut slot = self.lock();

        match &*slot {
            Slot::Ready(value) => return Ok(Arc::clone(value)),
            Slot::Failed { at, message } if at.elapsed() <= self.retry_after => {
                return Err(LazyInitError {
                    message: message.clone(),
                    cached: true,
                });
            }
            _ => {}
        }

        match (self.factory)() {
            Ok(value) => {
                let value = Arc::new(value);
                *slot = Slot::Ready(Arc::clone(&value));
                Ok(value)
            }
            Err(e) => {
                let message = format!("{e:#}");
                *slot = Slot::Failed {
                    at: Instant::now(),
                    message: message.clone(),
                };
                Err(LazyInitError {
                    message,
                    cached: false,
                })
            }
        }
    }

    /// Forget any cached value or failure.
    pub fn reset(&self) {
        *self.lock() = Slot::Empty;
    }
}
