//! Shared utility functions.

use std::future::Future;
use std::time::Duration;

use tokio::time::timeout;

use crate::{Error, Result};

/// Await `fut`, failing with [`Error::Timeout`] if `limit` elapses first.
///
/// A `None` limit awaits without a deadline.
pub async fn with_optional_timeout<F, T>(limit: Option<Duration>, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match limit {
        Some(duration) => match timeout(duration, fut).await {
            Ok(inner) => inner,
            Err(_) => Err(Error::Timeout(duration)),
        },
        None => fut.await,
    }
}

/// Short display form of a UUID-backed id.
pub fn short_id(id: &uuid::Uuid) -> String {
    id.to_string()[..8].to_string()
}
