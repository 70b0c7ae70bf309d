//! Pagination cursors over page-parameterized fetchers.

use std::future::Future;
use std::sync::{Arc, Mutex};

use dash_fetch::FetchError;
use futures::future::FutureExt;
use serde_json::Value;

use crate::client::{FetchFuture, Fetcher, QueryClient};
use crate::error::QueryError;
use crate::options::QueryOptions;
use crate::QueryKey;

/// Fetcher taking a page parameter.
pub type PageFetcher = Arc<dyn Fn(Value) -> FetchFuture + Send + Sync>;

/// Derives the next page parameter from the last page and all pages so far;
/// `None` means no further pages.
pub type NextPageParam = Arc<dyn Fn(&Value, &[Value]) -> Option<Value> + Send + Sync>;

#[derive(Default)]
struct CursorState {
    pages: Vec<Value>,
    next_param: Option<Value>,
    fetching: bool,
}

/// Composes repeated single-page queries into a growable result list.
///
/// Each page is cached under `base_key` extended with its page parameter,
/// so individual pages share the client's dedup and freshness machinery.
/// [`PaginatedQuery::fetch_next_page`] is a no-op while a page fetch is in
/// flight or once `has_next_page` is false.
#[derive(Clone)]
pub struct PaginatedQuery {
    client: QueryClient,
    base_key: QueryKey,
    fetcher: PageFetcher,
    next_page_param: NextPageParam,
    options: QueryOptions,
    state: Arc<Mutex<CursorState>>,
}

impl PaginatedQuery {
    pub(crate) fn new(
        client: QueryClient,
        base_key: QueryKey,
        initial_param: Value,
        fetcher: PageFetcher,
        next_page_param: NextPageParam,
        options: QueryOptions,
    ) -> Self {
        Self {
            client,
            base_key,
            fetcher,
            next_page_param,
            options,
            state: Arc::new(Mutex::new(CursorState {
                pages: Vec::new(),
                next_param: Some(initial_param),
                fetching: false,
            })),
        }
    }

    /// Whether another page is available.
    pub fn has_next_page(&self) -> bool {
        self.lock().next_param.is_some()
    }

    /// Whether a page fetch is currently in flight.
    pub fn is_fetching(&self) -> bool {
        self.lock().fetching
    }

    /// Pages fetched so far, in order.
    pub fn pages(&self) -> Vec<Value> {
        self.lock().pages.clone()
    }

    /// Flattened concatenation of all fetched pages. Array pages contribute
    /// their items; a non-array page contributes itself.
    pub fn items(&self) -> Vec<Value> {
        let state = self.lock();
        let mut items = Vec::new();
        for page in &state.pages {
            match page {
                Value::Array(page_items) => items.extend(page_items.iter().cloned()),
                other => items.push(other.clone()),
            }
        }
        items
    }

    /// Fetch the next page.
    ///
    /// Returns `Ok(true)` when a page was fetched and appended, `Ok(false)`
    /// when the call was a no-op (fetch already in flight, or no next page).
    pub async fn fetch_next_page(&self) -> Result<bool, QueryError> {
        let param = {
            let mut state = self.lock();
            if state.fetching {
                tracing::trace!("page fetch already in flight, skipping");
                return Ok(false);
            }
            let Some(param) = state.next_param.clone() else {
                return Ok(false);
            };
            state.fetching = true;
            param
        };

        let page_key = self.base_key.clone().segment(param.clone());
        let page_fetcher = Arc::clone(&self.fetcher);
        let fetcher: Fetcher = Arc::new(move || page_fetcher(param.clone()));

        let response = self
            .client
            .query_raw(&page_key, fetcher, self.options.clone())
            .await;

        let mut state = self.lock();
        state.fetching = false;
        if let Some(err) = response.error {
            return Err(err);
        }
        let page = match response.data {
            Some(value) => (*value).clone(),
            None => return Err(QueryError::Fetch(FetchError::Protocol(
                "page fetch settled without data".into(),
            ))),
        };
        state.pages.push(page);
        let last = state.pages.last().cloned().unwrap_or(Value::Null);
        state.next_param = (self.next_page_param)(&last, &state.pages);
        Ok(true)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CursorState> {
        self.state.lock().expect("pagination lock poisoned")
    }
}

impl std::fmt::Debug for PaginatedQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("PaginatedQuery")
            .field("pages", &state.pages.len())
            .field("has_next_page", &state.next_param.is_some())
            .field("fetching", &state.fetching)
            .finish()
    }
}

impl QueryClient {
    /// Build a pagination cursor over a page-parameterized fetcher.
    pub fn paginated<F, Fut, N>(
        &self,
        base_key: &QueryKey,
        initial_param: Value,
        fetch_page: F,
        next_page_param: N,
        options: QueryOptions,
    ) -> PaginatedQuery
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, FetchError>> + Send + 'static,
        N: Fn(&Value, &[Value]) -> Option<Value> + Send + Sync + 'static,
    {
        PaginatedQuery::new(
            self.clone(),
            base_key.clone(),
            initial_param,
            Arc::new(move |param| fetch_page(param).boxed()),
            Arc::new(next_page_param),
            options,
        )
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use dash_cache::query_key;
    use serde_json::json;

    use super::*;

    /// Three pages of proposals, two items each.
    fn proposals_cursor(client: &QueryClient, calls: Arc<AtomicUsize>) -> PaginatedQuery {
        client.paginated(
            &query_key!["dao", "A", "proposals"],
            json!(0),
            move |param| {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    let page = param.as_u64().unwrap_or(0);
                    Ok(json!([
                        format!("prop-{}", page * 2),
                        format!("prop-{}", page * 2 + 1),
                    ]))
                }
            },
            |_, all| {
                if all.len() < 3 {
                    Some(json!(all.len()))
                } else {
                    None
                }
            },
            QueryOptions::new(),
        )
    }

    #[tokio::test]
    async fn test_accumulates_pages_in_order() {
        let client = QueryClient::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let cursor = proposals_cursor(&client, Arc::clone(&calls));

        assert!(cursor.has_next_page());
        assert!(cursor.fetch_next_page().await.unwrap());
        assert!(cursor.fetch_next_page().await.unwrap());

        assert_eq!(cursor.pages().len(), 2);
        assert_eq!(
            cursor.items(),
            vec![json!("prop-0"), json!("prop-1"), json!("prop-2"), json!("prop-3")]
        );
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_exhausted_cursor_is_noop() {
        let client = QueryClient::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let cursor = proposals_cursor(&client, Arc::clone(&calls));

        for _ in 0..3 {
            assert!(cursor.fetch_next_page().await.unwrap());
        }
        assert!(!cursor.has_next_page());

        assert!(!cursor.fetch_next_page().await.unwrap());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_fetch_next_page_is_noop() {
        let client = QueryClient::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let cursor = client.paginated(
            &query_key!["slow"],
            json!(0),
            move |_| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok(json!([1, 2]))
                }
            },
            |_, _| None,
            QueryOptions::new(),
        );

        let first = cursor.fetch_next_page();
        let second = async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            cursor.fetch_next_page().await
        };
        let (r1, r2) = tokio::join!(first, second);

        assert_eq!(r1.unwrap(), true);
        // The racing call was dropped, not deduplicated into a second page.
        assert_eq!(r2.unwrap(), false);
        assert_eq!(cursor.pages().len(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_page_fetch_keeps_cursor_usable() {
        let client = QueryClient::new();
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);
        let cursor = client.paginated(
            &query_key!["flaky"],
            json!(0),
            move |_| {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(FetchError::Http {
                            status: 500,
                            message: "boom".into(),
                        })
                    } else {
                        Ok(json!([1]))
                    }
                }
            },
            |_, _| None,
            QueryOptions::new().with_retry(crate::RetryConfig::none()),
        );

        assert!(cursor.fetch_next_page().await.is_err());
        assert!(!cursor.is_fetching());
        assert!(cursor.has_next_page());

        assert!(cursor.fetch_next_page().await.unwrap());
        assert_eq!(cursor.pages().len(), 1);
    }
}
