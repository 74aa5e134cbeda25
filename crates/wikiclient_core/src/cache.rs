use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::error::{Result, WikiError};

pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
struct CachedBody {
    body: String,
    fetched_at: Instant,
}

/// Page bodies keyed by page id. Entries expire on read; nothing sweeps them.
#[derive(Debug)]
pub struct ContentCache {
    ttl: Duration,
    entries: Mutex<HashMap<String, CachedBody>>,
}

impl Default for ContentCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_TTL)
    }
}

impl ContentCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Return the cached body for `page_id` if it is younger than the TTL, otherwise
    /// run `fetch`, store its result and return it. Failed fetches are not cached.
    pub async fn get_with_cache<F, Fut>(&self, page_id: &str, fetch: F) -> Result<String>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<String>>,
    {
        if let Some(body) = self.fresh(page_id)? {
            debug!(page_id, "content cache hit");
            return Ok(body);
        }

        let body = fetch().await?;
        self.lock()?.insert(
            page_id.to_string(),
            CachedBody {
                body: body.clone(),
                fetched_at: Instant::now(),
            },
        );
        Ok(body)
    }

    pub fn invalidate(&self, page_id: &str) -> Result<()> {
        self.lock()?.remove(page_id);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.lock().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn fresh(&self, page_id: &str) -> Result<Option<String>> {
        let entries = self.lock()?;
        Ok(entries
            .get(page_id)
            .filter(|entry| entry.fetched_at.elapsed() < self.ttl)
            .map(|entry| entry.body.clone()))
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, CachedBody>>> {
        self.entries
            .lock()
            .map_err(|_| WikiError::Store("content cache lock poisoned".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::ContentCache;
    use crate::error::WikiError;

    #[tokio::test(start_paused = true)]
    async fn repeated_reads_within_ttl_fetch_once() {
        let cache = ContentCache::new(Duration::from_secs(300));
        let counter = AtomicUsize::new(0);
        let fetches = &counter;
        let fetch = move || async move {
            fetches.fetch_add(1, Ordering::SeqCst);
            Ok("body".to_string())
        };

        assert_eq!(cache.get_with_cache("a", fetch).await.expect("first"), "body");
        tokio::time::advance(Duration::from_secs(299)).await;
        assert_eq!(cache.get_with_cache("a", fetch).await.expect("second"), "body");
        assert_eq!(fetches.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(2)).await;
        cache.get_with_cache("a", fetch).await.expect("third");
        assert_eq!(fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_fetches_are_not_cached() {
        let cache = ContentCache::new(Duration::from_secs(300));
        let error = cache
            .get_with_cache("a", || async {
                Err(WikiError::Transport {
                    method: "wiki.getPage".to_string(),
                    status: None,
                    message: "connection refused".to_string(),
                })
            })
            .await
            .expect_err("must fail");
        assert!(error.is_transport());
        assert!(cache.is_empty());

        cache
            .get_with_cache("a", || async { Ok("later".to_string()) })
            .await
            .expect("retry");
        assert_eq!(cache.len(), 1);
        cache.invalidate("a").expect("invalidate");
        assert!(cache.is_empty());
    }
}
