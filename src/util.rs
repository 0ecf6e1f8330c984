use std::{future::Future, time::Duration};

use anyhow::{Context, Result};
use thiserror::Error;
use tokio::time::timeout;

/// Typed root cause for elapsed deadlines so callers can classify timeouts by
/// downcast instead of message matching.
#[derive(Debug, Error)]
#[error("operation timed out")]
pub struct TimedOut;

/// Wraps `tokio::time::timeout`, converting elapsed deadlines and inner errors into contextual
/// `anyhow::Error` values for consistent diagnostics.
pub async fn timeout_with_context<F, T, E>(
    duration: Duration,
    future: F,
    context: impl Into<String>,
) -> Result<T>
where
    F: Future<Output = Result<T, E>>,
    E: std::error::Error + Send + Sync + 'static,
{
    let context = context.into();
    timeout(duration, future)
        .await
        .map_err(|_| anyhow::Error::new(TimedOut).context(format!("timed out {context}")))?
        .with_context(|| format!("failed while {context}"))
}
