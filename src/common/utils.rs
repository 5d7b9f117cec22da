//! Utility functions for minishard

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Get current Unix timestamp (milliseconds)
pub fn timestamp_now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Calculate CRC32 checksum
pub fn crc32(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

/// Retry with exponential backoff
///
/// Only errors for which [`crate::Error::is_retryable`] holds are retried; the
/// delay doubles after each attempt and carries up to 20% random jitter.
pub async fn retry_with_backoff<F, Fut, T>(
    mut f: F,
    max_retries: usize,
    initial_delay: Duration,
) -> crate::Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = crate::Result<T>>,
{
    let mut delay = initial_delay;

    for attempt in 0..max_retries {
        match f().await {
            Ok(result) => return Ok(result),
            Err(e) if e.is_retryable() && attempt + 1 < max_retries => {
                let jitter = rand::random::<u64>() % (delay.as_millis() as u64 / 5 + 1);
                tracing::warn!(
                    "Retry attempt {} failed: {}, retrying in {:?}",
                    attempt + 1,
                    e,
                    delay
                );
                tokio::time::sleep(delay + Duration::from_millis(jitter)).await;
                delay *= 2;
            }
            Err(e) => return Err(e),
        }
    }

    Err(crate::Error::Internal("Max retries exceeded".into()))
}

/// Validate a collection, shard or property name
pub fn validate_name(kind: &str, name: &str) -> crate::Result<()> {
    if name.is_empty() {
        return Err(crate::Error::InvalidRequest(format!(
            "{} name cannot be empty",
            kind
        )));
    }

    if name.len() > 256 {
        return Err(crate::Error::InvalidRequest(format!(
            "{} name too long (max 256 bytes)",
            kind
        )));
    }

    let valid = name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.');
    if !valid || name.starts_with('-') {
        return Err(crate::Error::InvalidRequest(format!(
            "{} name '{}' contains invalid characters",
            kind, name
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_validate_name() {
        assert!(validate_name("collection", "passive_replica_add_docs").is_ok());
        assert!(validate_name("collection", "logs-2024.01").is_ok());
        assert!(validate_name("collection", "").is_err());
        assert!(validate_name("collection", "a/b").is_err());
        assert!(validate_name("collection", "-leading").is_err());
        assert!(validate_name("collection", &"x".repeat(300)).is_err());
    }

    #[tokio::test]
    async fn test_retry_recovers_from_retryable() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let result = retry_with_backoff(
            || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(crate::Error::ConnectionFailed("flaky".into()))
                    } else {
                        Ok(7)
                    }
                }
            },
            5,
            Duration::from_millis(1),
        )
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_stops_on_fatal() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let result: crate::Result<()> = retry_with_backoff(
            || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(crate::Error::CollectionNotFound("gone".into()))
                }
            },
            5,
            Duration::from_millis(1),
        )
        .await;
        assert!(matches!(result, Err(crate::Error::CollectionNotFound(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_gives_back_last_error() {
        let result: crate::Result<()> = retry_with_backoff(
            || async { Err(crate::Error::ConnectionFailed("down".into())) },
            3,
            Duration::from_millis(1),
        )
        .await;
        assert!(matches!(result, Err(crate::Error::ConnectionFailed(_))));
    }
}
