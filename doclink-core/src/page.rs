//! Feed pages returned by listing and query operations.
//!
//! The service returns listings in pages. A page carries an opaque continuation token when more
//! items remain, and the next page is requested by replaying the original request with that
//! token attached.

use serde::{Deserialize, Serialize};
use serde_json::{Value, from_value};

use crate::error::{AccessError, AccessResult};

/// Upper bound accepted for `x-ms-max-item-count`.
pub const MAX_PAGE_SIZE: u32 = 1000;

/// A single page of a feed.
///
/// # Example
///
/// ```ignore
/// use doclink::page::FeedPage;
///
/// let page: FeedPage<String> = FeedPage::builder(vec!["item1".to_string()])
///     .with_continuation(Some("token".into()))
///     .build();
///
/// assert_eq!(page.count, 1);
/// assert!(page.has_more());
/// ```
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct FeedPage<T> {
    /// The items contained in this page.
    pub items: Vec<T>,
    /// Number of items in this page.
    pub count: usize,
    /// Cursor for the next page, `None` on the last page.
    pub continuation: Option<String>,
    /// The page was assembled from the local cache because the service was unreachable.
    pub from_cache: bool,
}

impl<T> FeedPage<T> {
    pub fn builder(items: Vec<T>) -> FeedPageBuilder<T> {
        FeedPageBuilder::new(items)
    }

    /// Whether the service reported further pages.
    pub fn has_more(&self) -> bool {
        self.continuation.is_some()
    }
}

impl FeedPage<Value> {
    /// Deserializes every item into `T`.
    pub fn into_typed<T>(self) -> AccessResult<FeedPage<T>>
    where
        T: for<'de> Deserialize<'de>,
    {
        let items = self
            .items
            .into_iter()
            .map(from_value)
            .collect::<Result<Vec<T>, _>>()?;

        Ok(FeedPage {
            items,
            count: self.count,
            continuation: self.continuation,
            from_cache: self.from_cache,
        })
    }
}

impl<T> Default for FeedPage<T> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            count: 0,
            continuation: None,
            from_cache: false,
        }
    }
}

/// Builder for constructing [`FeedPage`] instances with fluent API.
pub struct FeedPageBuilder<T> {
    items: Vec<T>,
    continuation: Option<String>,
    from_cache: bool,
}

impl<T> FeedPageBuilder<T> {
    pub fn new(items: Vec<T>) -> Self {
        Self {
            items,
            continuation: None,
            from_cache: false,
        }
    }

    /// Sets the continuation token (or `None` if this is the last page).
    pub fn with_continuation(mut self, continuation: Option<String>) -> Self {
        self.continuation = continuation;
        self
    }

    pub fn with_from_cache(mut self, from_cache: bool) -> Self {
        self.from_cache = from_cache;
        self
    }

    /// Builds and returns the final [`FeedPage`] instance.
    pub fn build(self) -> FeedPage<T> {
        FeedPage {
            count: self.items.len(),
            items: self.items,
            continuation: self.continuation,
            from_cache: self.from_cache,
        }
    }
}

/// Validates a requested page size against the range the service accepts.
pub fn validate_page_size(size: u32) -> AccessResult<u32> {
    if (1..=MAX_PAGE_SIZE).contains(&size) {
        Ok(size)
    } else {
        Err(AccessError::InvalidArgument(format!(
            "max item count {size} is outside 1..={MAX_PAGE_SIZE}"
        )))
    }
}
