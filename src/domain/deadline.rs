//! Bounded external calls
//!
//! Every round-trip to the store runs under a deadline. An elapsed deadline
//! surfaces as [`Error::Timeout`], which callers treat as transient.

use crate::error::{Error, Result};
use std::future::Future;
use std::time::Duration;

/// Run `fut` with a deadline
pub async fn with_deadline<T, F>(after: Duration, operation: &str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(after, fut).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout {
            operation: operation.to_string(),
            after,
        }),
    }
}
