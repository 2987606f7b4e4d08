//! Drives a provider's list endpoint across as many requests as a limit
//! needs and merges the pages into one ordered stream.
//!
//! A [`Paginator`] is lazy: nothing is requested until its stream is
//! polled, and each call to [`Paginator::stream`] starts over from the
//! initial marker. With [`Limit::Unbounded`] the walk only ends when the
//! provider returns an empty or short page (or no next cursor); a
//! provider that never does so yields an endless stream, and collecting
//! it will grow memory without bound. That is the caller's risk.

use std::collections::HashSet;
use std::fmt;

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt, TryStreamExt};
use tracing::debug;

use crate::model::Entity;
use crate::{Error, Result};

/// How many items a listing should produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Limit {
    /// Whatever one request returns by default.
    #[default]
    Default,
    Finite(usize),
    Unbounded,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListOptions {
    pub limit: Limit,
    /// Resume after this provider key.
    pub marker: Option<String>,
}

impl ListOptions {
    pub fn limit(n: usize) -> Self {
        Self {
            limit: Limit::Finite(n),
            marker: None,
        }
    }

    pub fn unbounded() -> Self {
        Self {
            limit: Limit::Unbounded,
            marker: None,
        }
    }

    pub fn with_marker(mut self, marker: impl Into<String>) -> Self {
        self.marker = Some(marker.into());
        self
    }
}

/// Opaque position in a listing: a last-seen key, an offset, or a
/// provider continuation token.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Cursor(String);

impl Cursor {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One page of a listing. `next == None` means the provider has no more.
#[derive(Debug)]
pub struct Page {
    pub items: Vec<Entity>,
    pub next: Option<Cursor>,
}

/// A provider list endpoint.
#[async_trait]
pub trait PageSource: Send + Sync {
    /// Most items one request returns. `None` when the provider picks
    /// the page size itself and ignores requested sizes.
    fn max_page_size(&self) -> Option<usize>;

    /// Fetch the page after `cursor`. `page_size == None` asks for the
    /// provider's natural page.
    async fn fetch_page(&self, cursor: Option<&Cursor>, page_size: Option<usize>) -> Result<Page>;
}

/// Per-walk state. Owned by one stream, never shared.
struct Walk {
    cursor: Option<Cursor>,
    remaining: Option<usize>,
    single: bool,
    seen: HashSet<Cursor>,
    done: bool,
}

impl Walk {
    fn start(options: &ListOptions) -> Self {
        let cursor = options.marker.clone().map(Cursor::new);
        let seen = cursor.iter().cloned().collect();
        let remaining = match options.limit {
            Limit::Finite(n) => Some(n),
            Limit::Default | Limit::Unbounded => None,
        };

        Self {
            cursor,
            remaining,
            single: options.limit == Limit::Default,
            seen,
            done: remaining == Some(0),
        }
    }
}

/// A restartable listing over one [`PageSource`].
pub struct Paginator {
    source: Box<dyn PageSource>,
    options: ListOptions,
}

impl Paginator {
    pub fn new(source: Box<dyn PageSource>, options: ListOptions) -> Self {
        Self { source, options }
    }

    pub fn options(&self) -> &ListOptions {
        &self.options
    }

    /// A fresh stream over the listing, starting at the initial marker.
    pub fn stream(&self) -> BoxStream<'_, Result<Entity>> {
        let source = self.source.as_ref();
        stream::try_unfold(Walk::start(&self.options), move |walk| next_page(source, walk))
            .map_ok(|items| stream::iter(items.into_iter().map(Ok)))
            .try_flatten()
            .boxed()
    }

    /// Drain the whole listing into memory.
    pub async fn collect_all(&self) -> Result<Vec<Entity>> {
        self.stream().try_collect().await
    }
}

async fn next_page(source: &dyn PageSource, mut walk: Walk) -> Result<Option<(Vec<Entity>, Walk)>> {
    if walk.done {
        return Ok(None);
    }

    let natural = source.max_page_size();
    let page_size = match (walk.remaining, natural) {
        (Some(remaining), Some(max)) if remaining < max => Some(remaining),
        _ => None,
    };
    let requested = page_size.or(natural);

    debug!(cursor = ?walk.cursor, ?page_size, "requesting page");
    let page = source.fetch_page(walk.cursor.as_ref(), page_size).await?;

    let mut items = page.items;
    let received = items.len();
    if let Some(remaining) = walk.remaining {
        items.truncate(remaining);
        walk.remaining = Some(remaining - items.len());
    }

    let exhausted = walk.single
        || received == 0
        || walk.remaining == Some(0)
        || requested.is_some_and(|r| received < r);

    match page.next {
        Some(next) if !exhausted => {
            if !walk.seen.insert(next.clone()) {
                return Err(Error::CursorRepeated(next.0));
            }
            walk.cursor = Some(next);
        }
        _ => walk.done = true,
    }

    Ok(Some((items, walk)))
}
